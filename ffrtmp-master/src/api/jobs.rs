use crate::api::{ApiResult, ApiTags};
use crate::auth::{ApiKeySecurity, AuthService};
use crate::model::{JobFilter, JobSpec, StartedReport, SubmitJobResponse};
use crate::service::job::JobService;
use ffrtmp_common::model::{Job, JobId, JobPriority, JobStatus, NodeId, QueueType};
use ffrtmp_common::recorded_http_api_request;
use poem::Request;
use poem_openapi::param::{Path, Query};
use poem_openapi::payload::Json;
use poem_openapi::OpenApi;
use std::sync::Arc;
use tracing::Instrument;

pub struct JobApi {
    pub auth_service: Arc<dyn AuthService>,
    pub job_service: Arc<dyn JobService>,
}

#[OpenApi(prefix_path = "/v1/jobs", tag = ApiTags::Job)]
impl JobApi {
    /// Submit a transcoding job
    ///
    /// The job starts out pending and becomes schedulable once the
    /// admission loop moves it to queued.
    #[oai(path = "/", method = "post", operation_id = "submit_job")]
    async fn submit_job(
        &self,
        request: &Request,
        data: Json<JobSpec>,
        token: ApiKeySecurity,
    ) -> ApiResult<Json<SubmitJobResponse>> {
        let record = recorded_http_api_request!("submit_job", scenario = data.scenario.clone());
        let response = {
            let auth = self
                .auth_service
                .authorize(token.key(), request)
                .instrument(record.span.clone())
                .await?;
            let job = self
                .job_service
                .submit(auth.tenant_id(), &data.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(SubmitJobResponse {
                job_id: job.id,
                status: job.status,
            }))
        };
        record.result(response)
    }

    /// List jobs of the calling tenant
    #[oai(path = "/", method = "get", operation_id = "list_jobs")]
    #[allow(clippy::too_many_arguments)]
    async fn list_jobs(
        &self,
        request: &Request,
        status: Query<Option<JobStatus>>,
        priority: Query<Option<JobPriority>>,
        queue: Query<Option<QueueType>>,
        limit: Query<Option<u32>>,
        token: ApiKeySecurity,
    ) -> ApiResult<Json<Vec<Job>>> {
        let record = recorded_http_api_request!("list_jobs");
        let response = {
            let auth = self
                .auth_service
                .authorize(token.key(), request)
                .instrument(record.span.clone())
                .await?;
            let filter = JobFilter {
                status: status.0,
                priority: priority.0,
                queue: queue.0,
                limit: limit.0,
            };
            let jobs = self
                .job_service
                .list(auth.tenant_id(), &filter)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(jobs))
        };
        record.result(response)
    }

    /// Atomically claim the next eligible job for a node
    ///
    /// Returns null when nothing is eligible. Two concurrent claims
    /// never receive the same job.
    #[oai(path = "/next", method = "get", operation_id = "claim_next_job")]
    async fn claim_next_job(
        &self,
        request: &Request,
        node_id: Query<NodeId>,
        token: ApiKeySecurity,
    ) -> ApiResult<Json<Option<Job>>> {
        let record =
            recorded_http_api_request!("claim_next_job", node_id = node_id.0.to_string());
        let response = {
            let auth = self
                .auth_service
                .authorize(token.key(), request)
                .instrument(record.span.clone())
                .await?;
            let job = self
                .job_service
                .claim_next(auth.tenant_id(), &node_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(job))
        };
        record.result(response)
    }

    /// Fetch one job
    #[oai(path = "/:job_id", method = "get", operation_id = "get_job")]
    async fn get_job(
        &self,
        request: &Request,
        job_id: Path<JobId>,
        token: ApiKeySecurity,
    ) -> ApiResult<Json<Job>> {
        let record = recorded_http_api_request!("get_job", job_id = job_id.0.to_string());
        let response = {
            let auth = self
                .auth_service
                .authorize(token.key(), request)
                .instrument(record.span.clone())
                .await?;
            let job = self
                .job_service
                .get(auth.tenant_id(), &job_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(job))
        };
        record.result(response)
    }

    /// Cancel a job
    ///
    /// A queued job is canceled immediately; a dispatched one is
    /// flagged and terminated by its worker within the next poll.
    #[oai(path = "/:job_id/cancel", method = "post", operation_id = "cancel_job")]
    async fn cancel_job(
        &self,
        request: &Request,
        job_id: Path<JobId>,
        token: ApiKeySecurity,
    ) -> ApiResult<Json<Job>> {
        let record = recorded_http_api_request!("cancel_job", job_id = job_id.0.to_string());
        let response = {
            let auth = self
                .auth_service
                .authorize(token.key(), request)
                .instrument(record.span.clone())
                .await?;
            let job = self
                .job_service
                .cancel(auth.tenant_id(), &job_id.0)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(job))
        };
        record.result(response)
    }

    /// Report that a claimed job began executing
    #[oai(path = "/:job_id/start", method = "post", operation_id = "report_started")]
    async fn report_started(
        &self,
        request: &Request,
        job_id: Path<JobId>,
        data: Json<StartedReport>,
        token: ApiKeySecurity,
    ) -> ApiResult<Json<Job>> {
        let record = recorded_http_api_request!("report_started", job_id = job_id.0.to_string());
        let response = {
            let auth = self
                .auth_service
                .authorize(token.key(), request)
                .instrument(record.span.clone())
                .await?;
            let job = self
                .job_service
                .report_started(auth.tenant_id(), &job_id.0, &data.node_id)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(job))
        };
        record.result(response)
    }
}
