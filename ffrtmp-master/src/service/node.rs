use crate::metrics;
use crate::model::RegisterNodeRequest;
use crate::repo::{JobRepo, NodeRepo, RepoError};
use async_trait::async_trait;
use chrono::Utc;
use ffrtmp_common::model::{Node, NodeId, NodeStatus, TenantId};
use ffrtmp_common::SafeDisplay;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Node not found: {0}")]
    NotFound(NodeId),
    #[error("Invalid node registration: {}", .0.join(", "))]
    ArgValidation(Vec<String>),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for NodeError {
    fn to_safe_string(&self) -> String {
        match self {
            NodeError::NotFound(_) => self.to_string(),
            NodeError::ArgValidation(_) => self.to_string(),
            NodeError::InternalRepoError(inner) => inner.to_safe_string(),
        }
    }
}

#[async_trait]
pub trait NodeService: Send + Sync {
    async fn register(
        &self,
        tenant: &TenantId,
        request: &RegisterNodeRequest,
    ) -> Result<Node, NodeError>;

    async fn heartbeat(&self, tenant: &TenantId, id: &NodeId) -> Result<(), NodeError>;

    /// Soft delete: marks the node offline and returns its in-flight
    /// jobs to the queue.
    async fn deregister(&self, tenant: &TenantId, id: &NodeId) -> Result<(), NodeError>;

    async fn get(&self, tenant: &TenantId, id: &NodeId) -> Result<Node, NodeError>;

    async fn list(&self, tenant: &TenantId) -> Result<Vec<Node>, NodeError>;
}

pub struct NodeServiceDefault {
    node_repo: Arc<dyn NodeRepo>,
    job_repo: Arc<dyn JobRepo>,
}

impl NodeServiceDefault {
    pub fn new(node_repo: Arc<dyn NodeRepo>, job_repo: Arc<dyn JobRepo>) -> Self {
        Self {
            node_repo,
            job_repo,
        }
    }

    async fn requeue_in_flight(&self, id: &NodeId) -> Result<(), RepoError> {
        let dispatched = self.job_repo.list_dispatched().await?;
        for job in dispatched
            .iter()
            .filter(|job| job.assigned_node_id == Some(*id))
        {
            match self.job_repo.requeue_or_fail(&job.id).await? {
                Some(updated) => {
                    metrics::record_job_state(updated.status);
                    info!(job_id = %job.id, status = %updated.status, "re-queued job of departed node");
                }
                None => {
                    warn!(job_id = %job.id, "job moved on before it could be re-queued");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl NodeService for NodeServiceDefault {
    async fn register(
        &self,
        tenant: &TenantId,
        request: &RegisterNodeRequest,
    ) -> Result<Node, NodeError> {
        let mut errors = Vec::new();
        if request.address.is_empty() {
            errors.push("address must not be empty".to_string());
        }
        if request.max_concurrent == Some(0) {
            errors.push("max_concurrent must be at least 1".to_string());
        }
        if request.capabilities.cpu_threads == 0 {
            errors.push("capabilities.cpu_threads must be at least 1".to_string());
        }
        if !errors.is_empty() {
            return Err(NodeError::ArgValidation(errors));
        }

        let now = Utc::now();
        let node = Node {
            id: NodeId::new_v4(),
            tenant_id: tenant.clone(),
            address: request.address.clone(),
            node_type: request.node_type,
            capabilities: request.capabilities.clone(),
            status: NodeStatus::Available,
            max_concurrent: request.max_concurrent.unwrap_or(1),
            last_seen: now,
            registered_at: now,
        };
        self.node_repo.create(&node).await?;
        info!(node_id = %node.id, address = %node.address, "registered node");
        Ok(node)
    }

    async fn heartbeat(&self, tenant: &TenantId, id: &NodeId) -> Result<(), NodeError> {
        if self.node_repo.heartbeat(tenant, id, Utc::now()).await? {
            Ok(())
        } else {
            Err(NodeError::NotFound(*id))
        }
    }

    async fn deregister(&self, tenant: &TenantId, id: &NodeId) -> Result<(), NodeError> {
        let node = self
            .node_repo
            .get(tenant, id)
            .await?
            .ok_or(NodeError::NotFound(*id))?;

        self.node_repo.mark_offline(&node.id).await?;
        self.requeue_in_flight(&node.id).await?;
        info!(node_id = %id, "deregistered node");
        Ok(())
    }

    async fn get(&self, tenant: &TenantId, id: &NodeId) -> Result<Node, NodeError> {
        self.node_repo
            .get(tenant, id)
            .await?
            .ok_or(NodeError::NotFound(*id))
    }

    async fn list(&self, tenant: &TenantId) -> Result<Vec<Node>, NodeError> {
        Ok(self.node_repo.list(tenant).await?)
    }
}
