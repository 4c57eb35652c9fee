pub mod api;
pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod metrics;
pub mod model;
pub mod repo;
pub mod service;

use crate::bootstrap::Services;
use crate::config::MasterServiceConfig;
use anyhow::anyhow;
use poem::listener::{Acceptor, Listener};
use poem::EndpointExt;
use std::net::{Ipv4Addr, SocketAddrV4};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[cfg(test)]
test_r::enable!();

pub struct RunDetails {
    pub http_port: u16,
}

pub struct MasterService {
    config: MasterServiceConfig,
    services: Services,
}

impl MasterService {
    pub async fn new(config: MasterServiceConfig) -> Result<Self, anyhow::Error> {
        let services = Services::new(&config)
            .await
            .map_err(|err| anyhow!(err).context("Service initialization"))?;
        Ok(Self { config, services })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub async fn run(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
        shutdown: CancellationToken,
    ) -> Result<RunDetails, anyhow::Error> {
        metrics::seed();

        let app = api::make_app(&self.services).with(metrics::BandwidthMiddleware);

        let listener = poem::listener::TcpListener::bind(
            SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), self.config.http_port).to_string(),
        );
        let acceptor = listener.into_acceptor().await?;
        let http_port = acceptor.local_addr()[0]
            .as_socket_addr()
            .expect("socket address")
            .port();

        let server_shutdown = shutdown.clone();
        join_set.spawn(async move {
            poem::Server::new_with_acceptor(acceptor)
                .run_with_graceful_shutdown(app, server_shutdown.cancelled(), None)
                .await
                .map_err(|err| err.into())
        });

        service::background::spawn_background_loops(
            join_set,
            &self.services,
            &self.config,
            shutdown,
        );

        info!("Started master scheduler on http port {http_port}");

        Ok(RunDetails { http_port })
    }
}
