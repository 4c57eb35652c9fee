use crate::model::JobFilter;
use crate::repo::{
    exhausted_result, CancelOutcome, JobRepo, NodeRepo, RepoError, ResultOutcome, StoreAggregates,
    TenantRepo,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ffrtmp_common::model::{
    Job, JobId, JobResult, JobStatus, Node, NodeId, NodeStatus, Tenant, TenantId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct MemoryState {
    tenants: HashMap<TenantId, Tenant>,
    nodes: HashMap<NodeId, Node>,
    jobs: HashMap<JobId, Job>,
}

impl MemoryState {
    fn assigned_count(&self, node_id: &NodeId) -> usize {
        self.jobs
            .values()
            .filter(|job| job.status.is_dispatched() && job.assigned_node_id == Some(*node_id))
            .count()
    }

    /// Recomputes the stored node status from its current load.
    fn refresh_node_status(&mut self, node_id: &NodeId) {
        let count = self.assigned_count(node_id);
        if let Some(node) = self.nodes.get_mut(node_id) {
            if node.status != NodeStatus::Offline {
                node.status = if count >= node.max_concurrent as usize {
                    NodeStatus::Busy
                } else {
                    NodeStatus::Available
                };
            }
        }
    }
}

/// Development store: every operation takes the single state lock, so
/// `claim_next_job` is trivially linearizable.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TenantRepo for InMemoryStore {
    async fn get(&self, id: &TenantId) -> Result<Option<Tenant>, RepoError> {
        Ok(self.state.lock().await.tenants.get(id).cloned())
    }

    async fn upsert(&self, tenant: &Tenant) -> Result<(), RepoError> {
        self.state
            .lock()
            .await
            .tenants
            .insert(tenant.id.clone(), tenant.clone());
        Ok(())
    }
}

#[async_trait]
impl NodeRepo for InMemoryStore {
    async fn create(&self, node: &Node) -> Result<(), RepoError> {
        self.state.lock().await.nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn get(&self, tenant: &TenantId, id: &NodeId) -> Result<Option<Node>, RepoError> {
        Ok(self
            .state
            .lock()
            .await
            .nodes
            .get(id)
            .filter(|node| node.tenant_id == *tenant)
            .cloned())
    }

    async fn list(&self, tenant: &TenantId) -> Result<Vec<Node>, RepoError> {
        let state = self.state.lock().await;
        let mut nodes: Vec<Node> = state
            .nodes
            .values()
            .filter(|node| node.tenant_id == *tenant)
            .cloned()
            .collect();
        nodes.sort_by_key(|node| node.registered_at);
        Ok(nodes)
    }

    async fn list_all(&self) -> Result<Vec<Node>, RepoError> {
        Ok(self.state.lock().await.nodes.values().cloned().collect())
    }

    async fn heartbeat(
        &self,
        tenant: &TenantId,
        id: &NodeId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let mut state = self.state.lock().await;
        match state.nodes.get_mut(id) {
            Some(node) if node.tenant_id == *tenant => {
                node.last_seen = now;
                if node.status == NodeStatus::Offline {
                    node.status = NodeStatus::Available;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_offline(&self, id: &NodeId) -> Result<(), RepoError> {
        let mut state = self.state.lock().await;
        if let Some(node) = state.nodes.get_mut(id) {
            node.status = NodeStatus::Offline;
        }
        Ok(())
    }
}

#[async_trait]
impl JobRepo for InMemoryStore {
    async fn create(&self, job: &Job) -> Result<(), RepoError> {
        self.state.lock().await.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, tenant: &TenantId, id: &JobId) -> Result<Option<Job>, RepoError> {
        Ok(self
            .state
            .lock()
            .await
            .jobs
            .get(id)
            .filter(|job| job.tenant_id == *tenant)
            .cloned())
    }

    async fn list(&self, tenant: &TenantId, filter: &JobFilter) -> Result<Vec<Job>, RepoError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.tenant_id == *tenant)
            .filter(|job| filter.status.is_none_or(|status| job.status == status))
            .filter(|job| filter.priority.is_none_or(|priority| job.priority == priority))
            .filter(|job| filter.queue.is_none_or(|queue| job.queue == queue))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit as usize);
        }
        Ok(jobs)
    }

    async fn claim_next_job(
        &self,
        tenant: &TenantId,
        node_id: &NodeId,
    ) -> Result<Option<Job>, RepoError> {
        let mut state = self.state.lock().await;

        let Some(node) = state
            .nodes
            .get(node_id)
            .filter(|node| node.tenant_id == *tenant && node.status != NodeStatus::Offline)
            .cloned()
        else {
            return Ok(None);
        };

        if state.assigned_count(node_id) >= node.max_concurrent as usize {
            return Ok(None);
        }

        let head = state
            .jobs
            .values()
            .filter(|job| {
                job.tenant_id == *tenant
                    && job.status == JobStatus::Queued
                    && job.matches_capabilities(&node.capabilities)
            })
            .min_by_key(|job| {
                (
                    job.priority.rank(),
                    job.queue.rank(),
                    job.created_at,
                    job.id.0,
                )
            })
            .map(|job| job.id);

        let Some(job_id) = head else {
            return Ok(None);
        };

        let now = Utc::now();
        let job = state.jobs.get_mut(&job_id).expect("job disappeared");
        job.status = JobStatus::Assigned;
        job.assigned_node_id = Some(*node_id);
        job.assigned_at = Some(now);
        let claimed = job.clone();

        state.refresh_node_status(node_id);
        Ok(Some(claimed))
    }

    async fn record_started(
        &self,
        tenant: &TenantId,
        id: &JobId,
        node_id: &NodeId,
    ) -> Result<Option<Job>, RepoError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(id) {
            Some(job)
                if job.tenant_id == *tenant
                    && job.status == JobStatus::Assigned
                    && job.assigned_node_id == Some(*node_id) =>
            {
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn record_result(
        &self,
        id: &JobId,
        node_id: &NodeId,
        result: &JobResult,
    ) -> Result<ResultOutcome, RepoError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get(id).cloned() else {
            return Ok(ResultOutcome::NotFound);
        };

        if job.status.is_terminal() {
            return Ok(ResultOutcome::AlreadyTerminal(job));
        }
        if !job.status.is_dispatched() || job.assigned_node_id != Some(*node_id) {
            return Ok(ResultOutcome::WrongNode(job));
        }

        let job = state.jobs.get_mut(id).expect("job disappeared");
        job.status = result.status;
        job.completed_at = Some(Utc::now());
        job.result = Some(result.clone());
        let updated = job.clone();

        state.refresh_node_status(node_id);
        Ok(ResultOutcome::Applied(updated))
    }

    async fn request_cancel(
        &self,
        tenant: &TenantId,
        id: &JobId,
    ) -> Result<CancelOutcome, RepoError> {
        let mut state = self.state.lock().await;
        let Some(job) = state
            .jobs
            .get_mut(id)
            .filter(|job| job.tenant_id == *tenant)
        else {
            return Ok(CancelOutcome::NotFound);
        };

        if job.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(job.clone()));
        }

        job.cancel_requested = true;
        if job.status.is_dispatched() {
            Ok(CancelOutcome::Flagged(job.clone()))
        } else {
            job.status = JobStatus::Canceled;
            job.completed_at = Some(Utc::now());
            Ok(CancelOutcome::Canceled(job.clone()))
        }
    }

    async fn list_pending(&self, limit: u32) -> Result<Vec<Job>, RepoError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs.truncate(limit as usize);
        Ok(jobs)
    }

    async fn count_queued(&self, tenant: &TenantId) -> Result<i64, RepoError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.tenant_id == *tenant && job.status == JobStatus::Queued)
            .count() as i64)
    }

    async fn mark_queued(&self, id: &JobId) -> Result<(), RepoError> {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(id) {
            if job.status == JobStatus::Pending {
                job.status = JobStatus::Queued;
            }
        }
        Ok(())
    }

    async fn list_dispatched(&self) -> Result<Vec<Job>, RepoError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.status.is_dispatched())
            .cloned()
            .collect())
    }

    async fn requeue_or_fail(&self, id: &JobId) -> Result<Option<Job>, RepoError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get(id).cloned() else {
            return Ok(None);
        };
        if !job.status.is_dispatched() {
            return Ok(None);
        }

        let node_id = job.assigned_node_id;
        let now = Utc::now();
        let job = state.jobs.get_mut(id).expect("job disappeared");

        if job.retry_count >= job.max_retries {
            job.status = JobStatus::Failed;
            job.completed_at = Some(now);
            job.result = Some(exhausted_result(job, now));
        } else {
            job.retry_count += 1;
            job.status = JobStatus::Queued;
            job.assigned_node_id = None;
            job.assigned_at = None;
            job.started_at = None;
        }
        let updated = job.clone();

        if let Some(node_id) = node_id {
            state.refresh_node_status(&node_id);
        }
        Ok(Some(updated))
    }

    async fn delete_terminal_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, RepoError> {
        let mut state = self.state.lock().await;
        let eligible: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| {
                job.status.is_terminal() && job.completed_at.unwrap_or(job.created_at) < cutoff
            })
            .take(limit as usize)
            .map(|job| job.id)
            .collect();
        for id in &eligible {
            state.jobs.remove(id);
        }
        Ok(eligible.len() as u64)
    }

    async fn aggregates(&self) -> Result<StoreAggregates, RepoError> {
        let state = self.state.lock().await;
        let mut aggregates = StoreAggregates::default();
        for job in state.jobs.values() {
            *aggregates.jobs_by_status.entry(job.status).or_insert(0) += 1;
            if job.status == JobStatus::Queued {
                *aggregates
                    .queued_by_priority
                    .entry(job.priority)
                    .or_insert(0) += 1;
                *aggregates.queued_by_queue.entry(job.queue).or_insert(0) += 1;
            }
        }
        for node in state.nodes.values() {
            *aggregates.nodes_by_status.entry(node.status).or_insert(0) += 1;
            aggregates.nodes_total += 1;
        }
        Ok(aggregates)
    }

    async fn vacuum(&self) -> Result<(), RepoError> {
        Ok(())
    }
}
