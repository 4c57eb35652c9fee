use crate::model::JobFilter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ffrtmp_common::model::{
    Job, JobId, JobPriority, JobResult, JobStatus, Node, NodeId, NodeStatus, QueueType, Tenant,
    TenantId,
};
use ffrtmp_common::SafeDisplay;
use std::collections::HashMap;

pub mod db;
pub mod memory;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("internal repository error: {0}")]
    Internal(String),
    /// The store is temporarily unable to serve the request; callers
    /// may retry with backoff.
    #[error("repository busy: {0}")]
    Busy(String),
}

impl From<sqlx::Error> for RepoError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                RepoError::Busy(error.to_string())
            }
            sqlx::Error::Database(db_error) if db_error.message().contains("locked") => {
                RepoError::Busy(error.to_string())
            }
            _ => RepoError::Internal(error.to_string()),
        }
    }
}

impl SafeDisplay for RepoError {
    fn to_safe_string(&self) -> String {
        match self {
            RepoError::Internal(_) => "Internal repository error".to_string(),
            RepoError::Busy(_) => "Store busy, retry later".to_string(),
        }
    }
}

/// Outcome of a terminal result report; duplicates are acknowledged
/// without mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultOutcome {
    Applied(Job),
    AlreadyTerminal(Job),
    WrongNode(Job),
    NotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The job never reached a worker; canceled immediately.
    Canceled(Job),
    /// A worker holds the job; the cancel flag is set for its poll.
    Flagged(Job),
    AlreadyTerminal(Job),
    NotFound,
}

/// Global counts backing the metrics endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreAggregates {
    pub jobs_by_status: HashMap<JobStatus, i64>,
    pub queued_by_priority: HashMap<JobPriority, i64>,
    pub queued_by_queue: HashMap<QueueType, i64>,
    pub nodes_by_status: HashMap<NodeStatus, i64>,
    pub nodes_total: i64,
}

#[async_trait]
pub trait TenantRepo: Send + Sync {
    async fn get(&self, id: &TenantId) -> Result<Option<Tenant>, RepoError>;

    async fn upsert(&self, tenant: &Tenant) -> Result<(), RepoError>;
}

#[async_trait]
pub trait NodeRepo: Send + Sync {
    async fn create(&self, node: &Node) -> Result<(), RepoError>;

    async fn get(&self, tenant: &TenantId, id: &NodeId) -> Result<Option<Node>, RepoError>;

    async fn list(&self, tenant: &TenantId) -> Result<Vec<Node>, RepoError>;

    /// All nodes across tenants; used by the timeout supervisor.
    async fn list_all(&self) -> Result<Vec<Node>, RepoError>;

    /// Refreshes `last_seen` and revives an offline node. Idempotent.
    /// Returns false when the node is unknown.
    async fn heartbeat(
        &self,
        tenant: &TenantId,
        id: &NodeId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError>;

    async fn mark_offline(&self, id: &NodeId) -> Result<(), RepoError>;
}

#[async_trait]
pub trait JobRepo: Send + Sync {
    async fn create(&self, job: &Job) -> Result<(), RepoError>;

    async fn get(&self, tenant: &TenantId, id: &JobId) -> Result<Option<Job>, RepoError>;

    async fn list(&self, tenant: &TenantId, filter: &JobFilter) -> Result<Vec<Job>, RepoError>;

    /// The linearizable claim: atomically selects the head of the
    /// eligible queued set for this node (priority, then queue class,
    /// then FIFO) and transitions it to assigned.
    async fn claim_next_job(
        &self,
        tenant: &TenantId,
        node_id: &NodeId,
    ) -> Result<Option<Job>, RepoError>;

    /// assigned → running, guarded by the assigned node.
    async fn record_started(
        &self,
        tenant: &TenantId,
        id: &JobId,
        node_id: &NodeId,
    ) -> Result<Option<Job>, RepoError>;

    /// Applies a terminal result exactly once.
    async fn record_result(
        &self,
        id: &JobId,
        node_id: &NodeId,
        result: &JobResult,
    ) -> Result<ResultOutcome, RepoError>;

    async fn request_cancel(
        &self,
        tenant: &TenantId,
        id: &JobId,
    ) -> Result<CancelOutcome, RepoError>;

    /// Oldest-first pending jobs, across tenants, for the admission loop.
    async fn list_pending(&self, limit: u32) -> Result<Vec<Job>, RepoError>;

    async fn count_queued(&self, tenant: &TenantId) -> Result<i64, RepoError>;

    /// pending → queued; no-op when the job moved on in the meantime.
    async fn mark_queued(&self, id: &JobId) -> Result<(), RepoError>;

    /// All assigned/running jobs, across tenants, for the supervisor.
    async fn list_dispatched(&self) -> Result<Vec<Job>, RepoError>;

    /// Returns a dispatched job to the queue with `retry_count + 1`, or
    /// fails it with `exhausted_retries` when retries are spent. No-op
    /// (returns `None`) when the job is no longer dispatched.
    async fn requeue_or_fail(&self, id: &JobId) -> Result<Option<Job>, RepoError>;

    /// Deletes terminal jobs whose completion (or creation, when the
    /// completion timestamp is missing) is older than the cutoff.
    async fn delete_terminal_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, RepoError>;

    async fn aggregates(&self) -> Result<StoreAggregates, RepoError>;

    async fn vacuum(&self) -> Result<(), RepoError>;
}

pub(crate) const EXHAUSTED_RETRIES: &str = "exhausted_retries";

/// Shared transition bookkeeping used by both store implementations.
pub(crate) fn exhausted_result(job: &Job, now: DateTime<Utc>) -> JobResult {
    let duration = job
        .started_at
        .map(|started| (now - started).num_milliseconds().max(0) as f64 / 1000.0)
        .unwrap_or(0.0);
    JobResult {
        status: JobStatus::Failed,
        exit_code: None,
        error: Some(EXHAUSTED_RETRIES.to_string()),
        stderr_tail: None,
        exit_reason: None,
        duration_seconds: duration,
        output_bytes: 0,
        bandwidth_mbps: 0.0,
        sla_met: None,
    }
}
