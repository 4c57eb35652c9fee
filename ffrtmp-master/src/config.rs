use ffrtmp_common::config::{ConfigLoader, DbConfig};
use ffrtmp_common::tracing::TracingConfig;
use ffrtmp_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MasterServiceConfig {
    pub tracing: TracingConfig,
    pub http_port: u16,
    /// Shared secret for all control-plane requests; the
    /// `MASTER_API_KEY` environment variable overrides it.
    pub api_key: String,
    pub db: DbConfig,
    /// Use the in-memory store instead of the configured database.
    pub in_memory_store: bool,
    pub scheduler: SchedulerConfig,
    pub cleanup: CleanupConfig,
    pub tenants: TenantsConfig,
}

impl Default for MasterServiceConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::default(),
            http_port: 8080,
            api_key: "changeme".to_string(),
            db: DbConfig::default(),
            in_memory_store: false,
            scheduler: SchedulerConfig::default(),
            cleanup: CleanupConfig::default(),
            tenants: TenantsConfig::default(),
        }
    }
}

impl MasterServiceConfig {
    /// The effective API key, preferring the environment variable.
    pub fn effective_api_key(&self) -> String {
        std::env::var("MASTER_API_KEY").unwrap_or_else(|_| self.api_key.clone())
    }
}

impl SafeDisplay for MasterServiceConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "HTTP port: {}", self.http_port);
        let _ = writeln!(&mut result, "API key: ****");
        let _ = writeln!(&mut result, "DB:");
        let _ = writeln!(&mut result, "{}", self.db.to_safe_string_indented());
        let _ = writeln!(&mut result, "in-memory store: {}", self.in_memory_store);
        let _ = writeln!(&mut result, "scheduler:");
        let _ = writeln!(&mut result, "{}", self.scheduler.to_safe_string_indented());
        let _ = writeln!(&mut result, "cleanup:");
        let _ = writeln!(&mut result, "{}", self.cleanup.to_safe_string_indented());
        let _ = writeln!(&mut result, "tenants:");
        let _ = writeln!(&mut result, "{}", self.tenants.to_safe_string_indented());
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// A node with no heartbeat within this window is offline.
    #[serde(with = "humantime_serde")]
    pub node_timeout: Duration,
    /// Default per-job run limit when the job carries none.
    #[serde(with = "humantime_serde")]
    pub job_timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub admission_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub supervisor_interval: Duration,
    /// Per-tenant ceiling on jobs sitting in the queued state;
    /// 0 disables the limit.
    pub max_queued_jobs_per_tenant: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_timeout: Duration::from_secs(90),
            job_timeout: Duration::from_secs(600),
            max_retries: 3,
            admission_interval: Duration::from_secs(1),
            supervisor_interval: Duration::from_secs(10),
            max_queued_jobs_per_tenant: 0,
        }
    }
}

impl SafeDisplay for SchedulerConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "node timeout: {:?}, job timeout: {:?}, max retries: {}, admission interval: {:?}, supervisor interval: {:?}, max queued jobs per tenant: {}",
            self.node_timeout,
            self.job_timeout,
            self.max_retries,
            self.admission_interval,
            self.supervisor_interval,
            self.max_queued_jobs_per_tenant
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub vacuum_interval: Duration,
    pub retention_days: u32,
    /// Delay before the first cleanup pass after startup.
    #[serde(with = "humantime_serde")]
    pub startup_delay: Duration,
    pub batch_size: u32,
    #[serde(with = "humantime_serde")]
    pub batch_pause: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(24 * 60 * 60),
            vacuum_interval: Duration::from_secs(7 * 24 * 60 * 60),
            retention_days: 7,
            startup_delay: Duration::from_secs(5 * 60),
            batch_size: 100,
            batch_pause: Duration::from_millis(100),
        }
    }
}

impl SafeDisplay for CleanupConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "cleanup interval: {:?}, vacuum interval: {:?}, retention days: {}, startup delay: {:?}, batch size: {}, batch pause: {:?}",
            self.cleanup_interval,
            self.vacuum_interval,
            self.retention_days,
            self.startup_delay,
            self.batch_size,
            self.batch_pause
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TenantsConfig {
    /// Create unknown tenants on first use instead of rejecting them.
    pub auto_provision: bool,
    /// Requests without any tenant context fall back to `default`.
    pub allow_default_tenant: bool,
    #[serde(default)]
    pub tenants: HashMap<String, TenantConfig>,
}

impl Default for TenantsConfig {
    fn default() -> Self {
        let mut tenants = HashMap::new();
        tenants.insert(
            "default".to_string(),
            TenantConfig {
                name: "default".to_string(),
                display_name: "Default tenant".to_string(),
                is_active: true,
            },
        );
        Self {
            auto_provision: false,
            allow_default_tenant: true,
            tenants,
        }
    }
}

impl SafeDisplay for TenantsConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "auto provision: {}", self.auto_provision);
        let _ = writeln!(
            &mut result,
            "allow default tenant: {}",
            self.allow_default_tenant
        );
        for (id, tenant) in &self.tenants {
            let _ = writeln!(
                &mut result,
                "{id}: {} ({}), active: {}",
                tenant.name, tenant.display_name, tenant.is_active
            );
        }
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TenantConfig {
    pub name: String,
    pub display_name: String,
    pub is_active: bool,
}

pub fn make_config_loader() -> ConfigLoader<MasterServiceConfig> {
    ConfigLoader::new(&PathBuf::from("config/master.toml"))
}
