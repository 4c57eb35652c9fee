use crate::auth::{AuthService, AuthServiceDefault};
use crate::config::MasterServiceConfig;
use crate::repo::db::DbStore;
use crate::repo::memory::InMemoryStore;
use crate::repo::{JobRepo, NodeRepo, TenantRepo};
use crate::service::job::{JobService, JobServiceDefault};
use crate::service::node::{NodeService, NodeServiceDefault};
use crate::service::tenant::{TenantService, TenantServiceDefault};
use ffrtmp_common::SafeDisplay;
use std::sync::Arc;

#[derive(Clone)]
pub struct Services {
    pub auth_service: Arc<dyn AuthService>,
    pub tenant_service: Arc<dyn TenantService>,
    pub node_service: Arc<dyn NodeService>,
    pub job_service: Arc<dyn JobService>,
    pub node_repo: Arc<dyn NodeRepo>,
    pub job_repo: Arc<dyn JobRepo>,
}

impl Services {
    pub async fn new(config: &MasterServiceConfig) -> Result<Self, String> {
        let (tenant_repo, node_repo, job_repo): (
            Arc<dyn TenantRepo>,
            Arc<dyn NodeRepo>,
            Arc<dyn JobRepo>,
        ) = if config.in_memory_store {
            let store = InMemoryStore::new();
            (
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                Arc::new(store),
            )
        } else {
            let store = DbStore::connect(&config.db)
                .await
                .map_err(|err| err.to_safe_string())?;
            (
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                Arc::new(store),
            )
        };

        let tenant_service_impl =
            TenantServiceDefault::new(tenant_repo.clone(), config.tenants.auto_provision);
        tenant_service_impl
            .seed_from_config(&config.tenants)
            .await
            .map_err(|err| err.to_safe_string())?;
        let tenant_service: Arc<dyn TenantService> = Arc::new(tenant_service_impl);

        let auth_service: Arc<dyn AuthService> = Arc::new(AuthServiceDefault::new(
            config.effective_api_key(),
            tenant_service.clone(),
            config.tenants.allow_default_tenant,
        ));

        let node_service: Arc<dyn NodeService> =
            Arc::new(NodeServiceDefault::new(node_repo.clone(), job_repo.clone()));

        let job_service: Arc<dyn JobService> = Arc::new(JobServiceDefault::new(
            job_repo.clone(),
            node_repo.clone(),
            config.scheduler.clone(),
        ));

        Ok(Self {
            auth_service,
            tenant_service,
            node_service,
            job_service,
            node_repo,
            job_repo,
        })
    }
}
