use crate::api::{ApiResult, ApiTags};
use crate::auth::{ApiKeySecurity, AuthService};
use crate::model::{AckResponse, ResultReport};
use crate::service::job::JobService;
use ffrtmp_common::recorded_http_api_request;
use poem::Request;
use poem_openapi::payload::Json;
use poem_openapi::OpenApi;
use std::sync::Arc;
use tracing::Instrument;

pub struct ResultsApi {
    pub auth_service: Arc<dyn AuthService>,
    pub job_service: Arc<dyn JobService>,
}

#[OpenApi(prefix_path = "/v1/results", tag = ApiTags::Result)]
impl ResultsApi {
    /// Report a terminal job result
    ///
    /// The first report wins; a duplicate is acknowledged with
    /// `applied: false` and does not mutate state.
    #[oai(path = "/", method = "post", operation_id = "report_result")]
    async fn report_result(
        &self,
        request: &Request,
        data: Json<ResultReport>,
        token: ApiKeySecurity,
    ) -> ApiResult<Json<AckResponse>> {
        let record = recorded_http_api_request!(
            "report_result",
            job_id = data.job_id.to_string(),
            node_id = data.node_id.to_string()
        );
        let response = {
            let auth = self
                .auth_service
                .authorize(token.key(), request)
                .instrument(record.span.clone())
                .await?;
            let (_, applied) = self
                .job_service
                .report_result(auth.tenant_id(), &data.job_id, &data.node_id, &data.result)
                .instrument(record.span.clone())
                .await?;
            Ok(Json(AckResponse { applied }))
        };
        record.result(response)
    }
}
