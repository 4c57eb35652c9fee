use crate::SafeDisplay;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "FFRTMP__";
const ENV_NESTING: &str = "__";

pub trait ConfigLoaderConfig: DeserializeOwned + Serialize + Default + Clone {}

impl<T: DeserializeOwned + Serialize + Default + Clone> ConfigLoaderConfig for T {}

/// Layered configuration: compiled-in defaults, then the TOML file (if
/// present), then `FFRTMP__`-prefixed environment variables with `__`
/// as the nesting separator.
pub struct ConfigLoader<T: ConfigLoaderConfig> {
    pub config_file_name: PathBuf,
    phantom: PhantomData<T>,
}

impl<T: ConfigLoaderConfig> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> Self {
        Self {
            config_file_name: config_file_name.to_path_buf(),
            phantom: PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed(ENV_PREFIX).split(ENV_NESTING))
    }

    pub fn load(&self) -> figment::Result<T> {
        self.figment().extract()
    }

    /// Loads the config, or dumps the effective defaults as TOML and
    /// returns `None` when the process was started with `--dump-config`.
    pub fn load_or_dump_config(&self) -> Option<T> {
        if std::env::args().any(|arg| arg == "--dump-config") {
            let defaults =
                toml::to_string_pretty(&T::default()).expect("Failed to serialize default config");
            println!("{defaults}");
            None
        } else {
            match self.load() {
                Ok(config) => Some(config),
                Err(err) => {
                    eprintln!("Failed to load config: {err}");
                    None
                }
            }
        }
    }
}

/// Bounded exponential backoff policy for transport-level retries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the given attempt (1-based); `None` when the policy
    /// is exhausted.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.min_delay.as_secs_f64() * factor;
        Some(self.max_delay.min(Duration::from_secs_f64(delay)))
    }
}

impl SafeDisplay for RetryConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "max attempts: {}, min delay: {:?}, max delay: {:?}, multiplier: {}",
            self.max_attempts, self.min_delay, self.max_delay, self.multiplier
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "config")]
pub enum DbConfig {
    Sqlite(DbSqliteConfig),
    Postgres(DbPostgresConfig),
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig::Sqlite(DbSqliteConfig::default())
    }
}

impl DbConfig {
    pub fn connection_string(&self) -> String {
        match self {
            DbConfig::Sqlite(c) => format!("sqlite://{}?mode=rwc", c.database.display()),
            DbConfig::Postgres(c) => format!(
                "postgres://{}:{}@{}:{}/{}",
                c.username, c.password, c.host, c.port, c.database
            ),
        }
    }

    pub fn max_connections(&self) -> u32 {
        match self {
            DbConfig::Sqlite(c) => c.max_connections,
            DbConfig::Postgres(c) => c.max_connections,
        }
    }
}

impl SafeDisplay for DbConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        match self {
            DbConfig::Sqlite(c) => {
                let _ = writeln!(&mut result, "SQLite:");
                let _ = writeln!(&mut result, "{}", c.to_safe_string_indented());
            }
            DbConfig::Postgres(c) => {
                let _ = writeln!(&mut result, "Postgres:");
                let _ = writeln!(&mut result, "{}", c.to_safe_string_indented());
            }
        }
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbSqliteConfig {
    pub database: PathBuf,
    pub max_connections: u32,
}

impl Default for DbSqliteConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("ffrtmp.db"),
            max_connections: 4,
        }
    }
}

impl SafeDisplay for DbSqliteConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "database: {}, max connections: {}",
            self.database.display(),
            self.max_connections
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbPostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_connections: u32,
}

impl Default for DbPostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "ffrtmp".to_string(),
            username: "postgres".to_string(),
            password: "postgres".to_string(),
            max_connections: 10,
        }
    }
}

impl SafeDisplay for DbPostgresConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "host: {}, port: {}, database: {}, username: {}, password: ****, max connections: {}",
            self.host, self.port, self.database, self.username, self.max_connections
        )
    }
}
