use crate::client::{MasterClient, RegisterNodeRequest};
use crate::config::AgentConfig;
use crate::encoders;
use crate::executor::{self, ExecutionContext};
use crate::metrics;
use anyhow::Context;
use ffrtmp_common::config::RetryConfig;
use ffrtmp_common::model::{NodeCapabilities, NodeId, NodeType};
use ffrtmp_common::retries::with_retries;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The long-running worker: registration, heartbeat loop, poll loop and
/// one execution task per in-flight job.
pub async fn run(config: AgentConfig) -> Result<(), anyhow::Error> {
    std::fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("creating work dir {}", config.work_dir.display()))?;

    let client = Arc::new(MasterClient::from_config(&config)?);

    let availability = encoders::probe().await;
    metrics::record_encoder_availability(availability);

    let node_id = register(&client, &config).await?;
    info!(node_id = %node_id, master = %config.master, "registered with master");

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, canceling in-flight work");
        signal_shutdown.cancel();
    });

    let metrics_shutdown = shutdown.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(err) = metrics::serve(metrics_port, metrics_shutdown).await {
            warn!("metrics server failed: {err}");
        }
    });

    let ctx = Arc::new(ExecutionContext {
        client: client.clone(),
        node_id,
        availability,
        work_dir: config.work_dir.clone(),
        shutdown: shutdown.clone(),
    });

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut poll = tokio::time::interval(config.poll_interval());
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut jobs: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = heartbeat.tick() => {
                // One attempt per tick; the next tick is the retry.
                match client.heartbeat(&node_id).await {
                    Ok(()) => metrics::record_heartbeat(),
                    Err(err) => warn!("heartbeat failed: {err}"),
                }
            }
            _ = poll.tick() => {
                if jobs.len() < config.max_concurrent as usize {
                    match client.claim_next(&node_id).await {
                        Ok(Some(job)) => {
                            info!(job_id = %job.id, scenario = %job.scenario, "claimed job");
                            let ctx = ctx.clone();
                            jobs.spawn(async move {
                                executor::execute_job(&ctx, job).await;
                            });
                        }
                        Ok(None) => {}
                        Err(err) => warn!("claim poll failed: {err}"),
                    }
                }
                metrics::set_active_jobs(jobs.len() as i64);
            }
            Some(result) = jobs.join_next(), if !jobs.is_empty() => {
                if let Err(err) = result {
                    warn!("job task panicked: {err}");
                }
                metrics::set_active_jobs(jobs.len() as i64);
            }
        }
    }

    // In-flight tasks saw the shutdown token: they terminate their
    // process groups and report best-effort before finishing.
    info!("waiting for {} in-flight jobs", jobs.len());
    while let Some(result) = jobs.join_next().await {
        if let Err(err) = result {
            warn!("job task panicked during shutdown: {err}");
        }
    }
    info!("agent stopped");
    Ok(())
}

async fn register(client: &MasterClient, config: &AgentConfig) -> Result<NodeId, anyhow::Error> {
    if !config.register {
        anyhow::bail!("running without --register is not supported; the master assigns node ids");
    }

    let request = RegisterNodeRequest {
        address: format!("{}:{}", hostname(), config.metrics_port),
        node_type: NodeType::Server,
        capabilities: detect_capabilities(),
        max_concurrent: Some(config.max_concurrent),
    };

    let retries = RetryConfig {
        max_attempts: 10,
        min_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        multiplier: 2.0,
    };
    let node_id = with_retries("register", &retries, |_| true, || async {
        client.register(&request).await
    })
    .await
    .context("registering with master")?;
    Ok(node_id)
}

fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

fn detect_capabilities() -> NodeCapabilities {
    let mut system = System::new();
    system.refresh_cpu();
    system.refresh_memory();

    let has_gpu = Path::new("/dev/nvidia0").exists() || Path::new("/dev/dri/renderD128").exists();
    let mut labels = HashMap::new();
    labels.insert("hostname".to_string(), hostname());

    NodeCapabilities {
        cpu_threads: system.cpus().len().max(1) as u32,
        cpu_model: system
            .cpus()
            .first()
            .map(|cpu| cpu.brand().to_string())
            .unwrap_or_default(),
        has_gpu,
        gpu_type: has_gpu.then(|| "unknown".to_string()),
        ram_bytes: system.total_memory(),
        labels,
    }
}

async fn shutdown_signal() {
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm => {}
    }
}
