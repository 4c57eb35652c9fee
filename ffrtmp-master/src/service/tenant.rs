use crate::config::TenantsConfig;
use crate::repo::{RepoError, TenantRepo};
use async_trait::async_trait;
use ffrtmp_common::model::{Tenant, TenantId};
use ffrtmp_common::SafeDisplay;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum TenantError {
    #[error("Unknown tenant: {0}")]
    Unknown(String),
    #[error("Tenant is not active: {0}")]
    Inactive(String),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for TenantError {
    fn to_safe_string(&self) -> String {
        match self {
            TenantError::Unknown(_) => self.to_string(),
            TenantError::Inactive(_) => self.to_string(),
            TenantError::InternalRepoError(inner) => inner.to_safe_string(),
        }
    }
}

#[async_trait]
pub trait TenantService: Send + Sync {
    /// Resolves a tenant id to an active tenant, provisioning it first
    /// when auto-provisioning is enabled.
    async fn resolve(&self, id: &TenantId) -> Result<Tenant, TenantError>;
}

pub struct TenantServiceDefault {
    tenant_repo: Arc<dyn TenantRepo>,
    auto_provision: bool,
}

impl TenantServiceDefault {
    pub fn new(tenant_repo: Arc<dyn TenantRepo>, auto_provision: bool) -> Self {
        Self {
            tenant_repo,
            auto_provision,
        }
    }

    /// Upserts the statically configured tenants at startup.
    pub async fn seed_from_config(&self, config: &TenantsConfig) -> Result<(), TenantError> {
        for (id, tenant_config) in &config.tenants {
            let id = TenantId::try_new(id.clone()).map_err(TenantError::Unknown)?;
            self.tenant_repo
                .upsert(&Tenant {
                    id: id.clone(),
                    name: tenant_config.name.clone(),
                    display_name: tenant_config.display_name.clone(),
                    is_active: tenant_config.is_active,
                    config: HashMap::new(),
                })
                .await?;
            info!("seeded tenant {id}");
        }
        Ok(())
    }
}

#[async_trait]
impl TenantService for TenantServiceDefault {
    async fn resolve(&self, id: &TenantId) -> Result<Tenant, TenantError> {
        let tenant = match self.tenant_repo.get(id).await? {
            Some(tenant) => tenant,
            None if self.auto_provision => {
                let tenant = Tenant {
                    id: id.clone(),
                    name: id.0.clone(),
                    display_name: id.0.clone(),
                    is_active: true,
                    config: HashMap::new(),
                };
                self.tenant_repo.upsert(&tenant).await?;
                info!("auto-provisioned tenant {id}");
                tenant
            }
            None => return Err(TenantError::Unknown(id.0.clone())),
        };

        if !tenant.is_active {
            return Err(TenantError::Inactive(id.0.clone()));
        }
        Ok(tenant)
    }
}
