use clap::Parser;
use ffrtmp_common::config::RetryConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Worker agent command line. Every option can also come from the
/// environment (`FFRTMP_AGENT_*`).
#[derive(Debug, Clone, Parser)]
#[command(name = "ffrtmp-agent", about = "ffrtmp worker agent")]
pub struct AgentConfig {
    /// Master base URL, e.g. https://master.example.com:8080
    #[arg(long, env = "FFRTMP_AGENT_MASTER", default_value = "http://localhost:8080")]
    pub master: url::Url,

    /// Register with the master on startup
    #[arg(long, default_value_t = true)]
    pub register: bool,

    /// Seconds between claim polls
    #[arg(long, default_value_t = 10)]
    pub poll_interval: u64,

    /// Seconds between heartbeats
    #[arg(long, default_value_t = 30)]
    pub heartbeat_interval: u64,

    /// Shared API key; MASTER_API_KEY wins when set
    #[arg(long, env = "FFRTMP_AGENT_API_KEY", default_value = "changeme")]
    pub api_key: String,

    /// Tenant this worker serves
    #[arg(long, env = "FFRTMP_AGENT_TENANT")]
    pub tenant: Option<String>,

    /// Maximum concurrently executing jobs
    #[arg(long, default_value_t = 2)]
    pub max_concurrent: u32,

    /// Opt in to running the agent on the master host
    #[arg(long, default_value_t = false)]
    pub allow_master_as_worker: bool,

    /// Client certificate (PEM) for mutual TLS
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Client private key (PEM) for mutual TLS
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Extra CA certificate (PEM) to trust
    #[arg(long)]
    pub ca: Option<PathBuf>,

    /// Skip TLS server certificate verification (development only)
    #[arg(long, default_value_t = false)]
    pub insecure_skip_verify: bool,

    /// Port for the worker /metrics endpoint; 0 disables it
    #[arg(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// Directory for generated inputs and transcoder outputs
    #[arg(long, default_value = "/tmp")]
    pub work_dir: PathBuf,
}

impl AgentConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval.max(1))
    }

    /// The effective API key, preferring the shared environment secret.
    pub fn effective_api_key(&self) -> String {
        std::env::var("MASTER_API_KEY").unwrap_or_else(|_| self.api_key.clone())
    }

    pub fn result_retries(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: 8,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Retain generated input files after the job (default false).
pub fn persist_inputs() -> bool {
    env_flag("PERSIST_INPUTS", false)
}

/// Retain transcoder outputs after the job (default true).
pub fn persist_outputs() -> bool {
    env_flag("PERSIST_OUTPUTS", true)
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn defaults_parse() {
        let config = AgentConfig::parse_from(["ffrtmp-agent"]);
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.max_concurrent, 2);
        assert!(!config.allow_master_as_worker);
    }

    #[test]
    fn intervals_have_a_floor() {
        let config =
            AgentConfig::parse_from(["ffrtmp-agent", "--poll-interval", "0"]);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
    }
}
