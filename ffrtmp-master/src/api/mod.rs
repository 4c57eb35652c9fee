use crate::auth::AuthError;
use crate::bootstrap::Services;
use crate::repo::RepoError;
use crate::service::job::JobError;
use crate::service::node::NodeError;
use crate::service::tenant::TenantError;
use ffrtmp_common::api::TraceErrorKind;
use ffrtmp_common::model::{ErrorBody, ErrorsBody};
use ffrtmp_common::SafeDisplay;
use poem::endpoint::PrometheusExporter;
use poem::Route;
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, OpenApiService, Tags};

mod healthcheck;
mod jobs;
mod nodes;
mod results;

pub use healthcheck::HealthcheckApi;
pub use jobs::JobApi;
pub use nodes::NodeApi;
pub use results::ResultsApi;

#[derive(Tags)]
pub enum ApiTags {
    Node,
    Job,
    Result,
    Healthcheck,
}

#[derive(ApiResponse, Debug, Clone)]
pub enum ApiError {
    /// Invalid request, returning with a list of issues detected in the request
    #[oai(status = 400)]
    BadRequest(Json<ErrorsBody>),
    /// Unauthorized request
    #[oai(status = 401)]
    Unauthorized(Json<ErrorBody>),
    /// Forbidden request
    #[oai(status = 403)]
    Forbidden(Json<ErrorBody>),
    /// Entity not found
    #[oai(status = 404)]
    NotFound(Json<ErrorBody>),
    /// State-machine conflict
    #[oai(status = 409)]
    Conflict(Json<ErrorBody>),
    /// The store is temporarily unavailable; retry with backoff
    #[oai(status = 503)]
    Unavailable(Json<ErrorBody>, #[oai(header = "Retry-After")] String),
    /// Internal server error
    #[oai(status = 500)]
    InternalError(Json<ErrorBody>),
}

impl ApiError {
    pub fn unauthorized(error: impl SafeDisplay) -> Self {
        ApiError::Unauthorized(Json(ErrorBody {
            error: error.to_safe_string(),
        }))
    }

    pub fn not_found(error: impl SafeDisplay) -> Self {
        ApiError::NotFound(Json(ErrorBody {
            error: error.to_safe_string(),
        }))
    }

    pub fn internal(error: impl SafeDisplay) -> Self {
        ApiError::InternalError(Json(ErrorBody {
            error: error.to_safe_string(),
        }))
    }

    fn from_repo(error: RepoError) -> Self {
        match &error {
            RepoError::Busy(_) => ApiError::Unavailable(
                Json(ErrorBody {
                    error: error.to_safe_string(),
                }),
                "1".to_string(),
            ),
            RepoError::Internal(_) => ApiError::internal(error),
        }
    }
}

impl TraceErrorKind for ApiError {
    fn trace_error_kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::Unauthorized(_) => "Unauthorized",
            ApiError::Forbidden(_) => "Forbidden",
            ApiError::NotFound(_) => "NotFound",
            ApiError::Conflict(_) => "Conflict",
            ApiError::Unavailable(_, _) => "Unavailable",
            ApiError::InternalError(_) => "InternalError",
        }
    }

    fn is_expected(&self) -> bool {
        !matches!(self, ApiError::InternalError(_))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<AuthError> for ApiError {
    fn from(value: AuthError) -> Self {
        match &value {
            AuthError::InvalidApiKey | AuthError::MissingTenant => ApiError::unauthorized(value),
            AuthError::InvalidTenant(_) => ApiError::Forbidden(Json(ErrorBody {
                error: value.to_safe_string(),
            })),
            AuthError::Tenant(TenantError::Unknown(_) | TenantError::Inactive(_)) => {
                ApiError::Forbidden(Json(ErrorBody {
                    error: value.to_safe_string(),
                }))
            }
            AuthError::Tenant(TenantError::InternalRepoError(_)) => ApiError::internal(value),
        }
    }
}

impl From<NodeError> for ApiError {
    fn from(value: NodeError) -> Self {
        match value {
            NodeError::NotFound(_) => ApiError::not_found(value),
            NodeError::ArgValidation(errors) => ApiError::BadRequest(Json(ErrorsBody { errors })),
            NodeError::InternalRepoError(inner) => ApiError::from_repo(inner),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(value: JobError) -> Self {
        match value {
            JobError::NotFound(_) | JobError::NodeNotFound(_) => ApiError::not_found(value),
            JobError::Conflict(_) => ApiError::Conflict(Json(ErrorBody {
                error: value.to_safe_string(),
            })),
            JobError::ArgValidation(errors) => ApiError::BadRequest(Json(ErrorsBody { errors })),
            JobError::InternalRepoError(inner) => ApiError::from_repo(inner),
        }
    }
}

pub type Apis = (NodeApi, JobApi, ResultsApi, HealthcheckApi);

pub fn make_open_api_service(services: &Services) -> OpenApiService<Apis, ()> {
    OpenApiService::new(
        (
            NodeApi {
                auth_service: services.auth_service.clone(),
                node_service: services.node_service.clone(),
            },
            JobApi {
                auth_service: services.auth_service.clone(),
                job_service: services.job_service.clone(),
            },
            ResultsApi {
                auth_service: services.auth_service.clone(),
                job_service: services.job_service.clone(),
            },
            HealthcheckApi,
        ),
        "FFRTMP Master API",
        "1.0",
    )
}

/// The full HTTP application: the OpenAPI surface plus the
/// unauthenticated Prometheus exporter.
pub fn make_app(services: &Services) -> Route {
    let api_service = make_open_api_service(services);
    Route::new()
        .nest("/", api_service)
        .nest(
            "/metrics",
            PrometheusExporter::new(prometheus::default_registry().clone()),
        )
}
