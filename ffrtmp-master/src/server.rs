use ffrtmp_common::tracing::init_tracing;
use ffrtmp_common::SafeDisplay;
use ffrtmp_master::config::{make_config_loader, MasterServiceConfig};
use ffrtmp_master::MasterService;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

fn main() -> Result<(), anyhow::Error> {
    match make_config_loader().load_or_dump_config() {
        Some(config) => {
            init_tracing(&config.tracing, "ffrtmp-master");
            debug!("Master config: {}", config.to_safe_string());

            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(async_main(config))
        }
        None => Ok(()),
    }
}

async fn async_main(config: MasterServiceConfig) -> Result<(), anyhow::Error> {
    let service = MasterService::new(config).await?;

    let mut join_set = JoinSet::new();
    let shutdown = CancellationToken::new();
    service.run(&mut join_set, shutdown.clone()).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        _ = sigterm() => {
            info!("SIGTERM received, shutting down");
        }
    }
    shutdown.cancel();

    while let Some(result) = join_set.join_next().await {
        result??;
    }
    Ok(())
}

async fn sigterm() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut signal) => {
            signal.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}
