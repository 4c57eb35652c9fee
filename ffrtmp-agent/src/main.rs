use clap::Parser;
use ffrtmp_agent::agent;
use ffrtmp_agent::config::AgentConfig;
use ffrtmp_common::tracing::{init_tracing, TracingConfig};
use std::io::Write;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = AgentConfig::parse();
    init_tracing(&TracingConfig::default(), "ffrtmp-agent");

    confirm_master_as_worker(&config)?;
    agent::run(config).await
}

/// Running a worker on the master host is a development convenience
/// only; it needs the explicit flag plus interactive confirmation.
fn confirm_master_as_worker(config: &AgentConfig) -> Result<(), anyhow::Error> {
    let Some(host) = config.master.host_str() else {
        return Ok(());
    };
    let local_hostname = gethostname::gethostname().to_string_lossy().into_owned();
    let is_local = matches!(host, "localhost" | "127.0.0.1" | "::1") || host == local_hostname;
    if !is_local {
        return Ok(());
    }

    if !config.allow_master_as_worker {
        anyhow::bail!(
            "master URL {} resolves to this host; pass --allow-master-as-worker to run a worker here",
            config.master
        );
    }

    eprint!(
        "The master at {} runs on this host; transcoding will compete with it for resources. Continue? [y/N] ",
        config.master
    );
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    if !matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") {
        anyhow::bail!("aborted");
    }
    Ok(())
}
