use crate::config::SchedulerConfig;
use crate::metrics;
use crate::model::{JobFilter, JobSpec};
use crate::repo::{CancelOutcome, JobRepo, NodeRepo, RepoError, ResultOutcome};
use async_trait::async_trait;
use chrono::Utc;
use ffrtmp_common::model::{Job, JobId, JobResult, JobStatus, NodeId, TenantId};
use ffrtmp_common::SafeDisplay;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(JobId),
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("Illegal job transition: {0}")]
    Conflict(String),
    #[error("Invalid job: {}", .0.join(", "))]
    ArgValidation(Vec<String>),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for JobError {
    fn to_safe_string(&self) -> String {
        match self {
            JobError::NotFound(_) => self.to_string(),
            JobError::NodeNotFound(_) => self.to_string(),
            JobError::Conflict(_) => self.to_string(),
            JobError::ArgValidation(_) => self.to_string(),
            JobError::InternalRepoError(inner) => inner.to_safe_string(),
        }
    }
}

#[async_trait]
pub trait JobService: Send + Sync {
    async fn submit(&self, tenant: &TenantId, spec: &JobSpec) -> Result<Job, JobError>;

    async fn list(&self, tenant: &TenantId, filter: &JobFilter) -> Result<Vec<Job>, JobError>;

    async fn get(&self, tenant: &TenantId, id: &JobId) -> Result<Job, JobError>;

    async fn cancel(&self, tenant: &TenantId, id: &JobId) -> Result<Job, JobError>;

    async fn claim_next(
        &self,
        tenant: &TenantId,
        node_id: &NodeId,
    ) -> Result<Option<Job>, JobError>;

    async fn report_started(
        &self,
        tenant: &TenantId,
        id: &JobId,
        node_id: &NodeId,
    ) -> Result<Job, JobError>;

    /// Applies a terminal result; the bool is false for a duplicate
    /// report that changed nothing.
    async fn report_result(
        &self,
        tenant: &TenantId,
        id: &JobId,
        node_id: &NodeId,
        result: &JobResult,
    ) -> Result<(Job, bool), JobError>;
}

pub struct JobServiceDefault {
    job_repo: Arc<dyn JobRepo>,
    node_repo: Arc<dyn NodeRepo>,
    scheduler_config: SchedulerConfig,
}

impl JobServiceDefault {
    pub fn new(
        job_repo: Arc<dyn JobRepo>,
        node_repo: Arc<dyn NodeRepo>,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        Self {
            job_repo,
            node_repo,
            scheduler_config,
        }
    }

    fn validate(spec: &JobSpec) -> Result<(), JobError> {
        let mut errors = Vec::new();
        if spec.scenario.is_empty() {
            errors.push("scenario must not be empty".to_string());
        }
        if spec.sla_target_seconds == Some(0) {
            errors.push("sla_target_seconds must be positive".to_string());
        }
        if let Some(constraints) = &spec.wrapper_constraints {
            if constraints
                .cpu_weight
                .is_some_and(|weight| weight == 0 || weight > 10_000)
            {
                errors.push("wrapper_constraints.cpu_weight must be in 1..=10000".to_string());
            }
            if constraints.io_max_percent.is_some_and(|io| io > 100) {
                errors.push("wrapper_constraints.io_max_percent must be in 0..=100".to_string());
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(JobError::ArgValidation(errors))
        }
    }
}

#[async_trait]
impl JobService for JobServiceDefault {
    async fn submit(&self, tenant: &TenantId, spec: &JobSpec) -> Result<Job, JobError> {
        Self::validate(spec)?;

        let job = Job {
            id: JobId::new_v4(),
            tenant_id: tenant.clone(),
            scenario: spec.scenario.clone(),
            parameters: spec.parameters.clone(),
            wrapper_constraints: spec.wrapper_constraints.clone(),
            priority: spec.priority.unwrap_or_default(),
            queue: spec.queue.unwrap_or_default(),
            engine: spec.engine.unwrap_or_default(),
            requires_gpu: spec.requires_gpu,
            status: JobStatus::Pending,
            cancel_requested: false,
            assigned_node_id: None,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(self.scheduler_config.max_retries),
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            sla_target_seconds: spec.sla_target_seconds,
            result: None,
        };
        self.job_repo.create(&job).await?;
        metrics::record_job_state(JobStatus::Pending);
        info!(job_id = %job.id, scenario = %job.scenario, priority = %job.priority, queue = %job.queue, "submitted job");
        Ok(job)
    }

    async fn list(&self, tenant: &TenantId, filter: &JobFilter) -> Result<Vec<Job>, JobError> {
        Ok(self.job_repo.list(tenant, filter).await?)
    }

    async fn get(&self, tenant: &TenantId, id: &JobId) -> Result<Job, JobError> {
        self.job_repo
            .get(tenant, id)
            .await?
            .ok_or(JobError::NotFound(*id))
    }

    async fn cancel(&self, tenant: &TenantId, id: &JobId) -> Result<Job, JobError> {
        match self.job_repo.request_cancel(tenant, id).await? {
            CancelOutcome::Canceled(job) => {
                metrics::record_job_state(JobStatus::Canceled);
                info!(job_id = %id, "canceled queued job");
                Ok(job)
            }
            CancelOutcome::Flagged(job) => {
                info!(job_id = %id, "flagged running job for cancellation");
                Ok(job)
            }
            CancelOutcome::AlreadyTerminal(job) => Ok(job),
            CancelOutcome::NotFound => Err(JobError::NotFound(*id)),
        }
    }

    async fn claim_next(
        &self,
        tenant: &TenantId,
        node_id: &NodeId,
    ) -> Result<Option<Job>, JobError> {
        if self.node_repo.get(tenant, node_id).await?.is_none() {
            metrics::record_schedule_attempt("error");
            return Err(JobError::NodeNotFound(*node_id));
        }

        match self.job_repo.claim_next_job(tenant, node_id).await {
            Ok(Some(job)) => {
                metrics::record_schedule_attempt("assigned");
                metrics::record_job_state(JobStatus::Assigned);
                debug!(job_id = %job.id, node_id = %node_id, "assigned job");
                Ok(Some(job))
            }
            Ok(None) => {
                metrics::record_schedule_attempt("no_job");
                Ok(None)
            }
            Err(error) => {
                metrics::record_schedule_attempt("error");
                Err(error.into())
            }
        }
    }

    async fn report_started(
        &self,
        tenant: &TenantId,
        id: &JobId,
        node_id: &NodeId,
    ) -> Result<Job, JobError> {
        match self.job_repo.record_started(tenant, id, node_id).await? {
            Some(job) => {
                metrics::record_job_state(JobStatus::Running);
                debug!(job_id = %id, node_id = %node_id, "job started");
                Ok(job)
            }
            None => match self.job_repo.get(tenant, id).await? {
                Some(job) => Err(JobError::Conflict(format!(
                    "job {id} is {} and not assigned to node {node_id}",
                    job.status
                ))),
                None => Err(JobError::NotFound(*id)),
            },
        }
    }

    async fn report_result(
        &self,
        tenant: &TenantId,
        id: &JobId,
        node_id: &NodeId,
        result: &JobResult,
    ) -> Result<(Job, bool), JobError> {
        if !result.status.is_terminal() {
            return Err(JobError::ArgValidation(vec![format!(
                "result status must be terminal, got {}",
                result.status
            )]));
        }
        // Tenancy guard before the cross-tenant repo operation.
        if self.job_repo.get(tenant, id).await?.is_none() {
            return Err(JobError::NotFound(*id));
        }

        match self.job_repo.record_result(id, node_id, result).await? {
            ResultOutcome::Applied(job) => {
                metrics::record_job_state(job.status);
                metrics::record_job_duration(result.duration_seconds);
                info!(job_id = %id, status = %job.status, "job finished");
                Ok((job, true))
            }
            ResultOutcome::AlreadyTerminal(job) => {
                debug!(job_id = %id, "duplicate result report ignored");
                Ok((job, false))
            }
            ResultOutcome::WrongNode(job) => Err(JobError::Conflict(format!(
                "job {id} is {} and not held by node {node_id}",
                job.status
            ))),
            ResultOutcome::NotFound => Err(JobError::NotFound(*id)),
        }
    }
}
