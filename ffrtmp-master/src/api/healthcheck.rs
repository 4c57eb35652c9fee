use crate::api::ApiTags;
use crate::model::HealthcheckResponse;
use poem_openapi::payload::Json;
use poem_openapi::OpenApi;

/// Liveness probe; deliberately unauthenticated.
pub struct HealthcheckApi;

#[OpenApi(tag = ApiTags::Healthcheck)]
impl HealthcheckApi {
    #[oai(path = "/healthz", method = "get", operation_id = "healthz")]
    async fn healthz(&self) -> Json<HealthcheckResponse> {
        self.health_response()
    }

    /// Alias kept for older deployments.
    #[oai(path = "/health", method = "get", operation_id = "health")]
    async fn health(&self) -> Json<HealthcheckResponse> {
        self.health_response()
    }
}

impl HealthcheckApi {
    fn health_response(&self) -> Json<HealthcheckResponse> {
        Json(HealthcheckResponse {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}
