use crate::service::tenant::{TenantError, TenantService};
use async_trait::async_trait;
use ffrtmp_common::model::{Tenant, TenantId};
use ffrtmp_common::{constant_time_eq, SafeDisplay};
use poem::Request;
use poem_openapi::auth::{ApiKey, Bearer};
use poem_openapi::SecurityScheme;
use std::sync::Arc;

pub const TENANT_HEADER: &str = "X-Tenant-ID";
const TENANT_AUTH_PREFIX: &str = "ffrtmp_";

/// Control-plane requests authenticate with the shared API key, either
/// as `X-API-Key` or as a bearer token.
#[derive(SecurityScheme)]
pub enum ApiKeySecurity {
    Header(ApiKeyHeader),
    Bearer(ApiKeyBearer),
}

#[derive(SecurityScheme)]
#[oai(
    rename = "ApiKey",
    ty = "api_key",
    key_in = "header",
    key_name = "X-API-Key",
    checker = "api_key_checker"
)]
pub struct ApiKeyHeader(String);

#[derive(SecurityScheme)]
#[oai(rename = "Bearer", ty = "bearer", checker = "bearer_checker")]
pub struct ApiKeyBearer(String);

async fn api_key_checker(_: &Request, api_key: ApiKey) -> Option<String> {
    Some(api_key.key)
}

async fn bearer_checker(_: &Request, bearer: Bearer) -> Option<String> {
    Some(bearer.token)
}

impl ApiKeySecurity {
    pub fn key(&self) -> &str {
        match self {
            ApiKeySecurity::Header(header) => &header.0,
            ApiKeySecurity::Bearer(bearer) => &bearer.0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid API key")]
    InvalidApiKey,
    #[error("Invalid tenant id: {0}")]
    InvalidTenant(String),
    #[error("No tenant context in request")]
    MissingTenant,
    #[error(transparent)]
    Tenant(#[from] TenantError),
}

impl SafeDisplay for AuthError {
    fn to_safe_string(&self) -> String {
        match self {
            AuthError::InvalidApiKey => self.to_string(),
            AuthError::InvalidTenant(_) => self.to_string(),
            AuthError::MissingTenant => self.to_string(),
            AuthError::Tenant(inner) => inner.to_safe_string(),
        }
    }
}

/// The authenticated tenant context every handler operates in.
#[derive(Debug, Clone)]
pub struct AuthCtx {
    pub tenant: Tenant,
}

impl AuthCtx {
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant.id
    }
}

#[async_trait]
pub trait AuthService: Send + Sync {
    async fn authorize(&self, api_key: &str, request: &Request) -> Result<AuthCtx, AuthError>;
}

pub struct AuthServiceDefault {
    api_key: String,
    tenant_service: Arc<dyn TenantService>,
    allow_default_tenant: bool,
}

impl AuthServiceDefault {
    pub fn new(
        api_key: String,
        tenant_service: Arc<dyn TenantService>,
        allow_default_tenant: bool,
    ) -> Self {
        Self {
            api_key,
            tenant_service,
            allow_default_tenant,
        }
    }
}

#[async_trait]
impl AuthService for AuthServiceDefault {
    async fn authorize(&self, api_key: &str, request: &Request) -> Result<AuthCtx, AuthError> {
        if !constant_time_eq(api_key, &self.api_key) {
            return Err(AuthError::InvalidApiKey);
        }

        let tenant_id = extract_tenant_id(request, self.allow_default_tenant)?;
        let tenant = self.tenant_service.resolve(&tenant_id).await?;
        Ok(AuthCtx { tenant })
    }
}

/// Tenant context, in precedence order: `X-Tenant-ID` header, an
/// `Authorization` value of the form `ffrtmp_<tenant>_<secret>`, then
/// the `tenant_id` query parameter.
pub fn extract_tenant_id(request: &Request, allow_default: bool) -> Result<TenantId, AuthError> {
    if let Some(header) = request.headers().get(TENANT_HEADER) {
        let raw = header
            .to_str()
            .map_err(|_| AuthError::InvalidTenant("non-ascii header".to_string()))?;
        return TenantId::try_new(raw).map_err(AuthError::InvalidTenant);
    }

    if let Some(auth) = request
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        let token = auth.strip_prefix("Bearer ").unwrap_or(auth);
        if let Some(rest) = token.strip_prefix(TENANT_AUTH_PREFIX) {
            // The tenant id itself may contain underscores; the secret
            // is everything after the last one.
            if let Some((tenant, _secret)) = rest.rsplit_once('_') {
                return TenantId::try_new(tenant).map_err(AuthError::InvalidTenant);
            }
        }
    }

    if let Some(query) = request.uri().query() {
        for pair in query.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                if key == "tenant_id" {
                    return TenantId::try_new(value).map_err(AuthError::InvalidTenant);
                }
            }
        }
    }

    if allow_default {
        Ok(TenantId::default())
    } else {
        Err(AuthError::MissingTenant)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn request_with_header(name: &str, value: &str) -> Request {
        Request::builder().header(name, value).finish()
    }

    #[test]
    fn tenant_from_header_wins() {
        let request = Request::builder()
            .header(TENANT_HEADER, "acme")
            .header("Authorization", "Bearer ffrtmp_other_secret")
            .finish();
        assert_eq!(
            extract_tenant_id(&request, true).unwrap(),
            TenantId("acme".to_string())
        );
    }

    #[test]
    fn tenant_from_authorization_prefix() {
        let request = request_with_header("Authorization", "Bearer ffrtmp_acme_s3cret");
        assert_eq!(
            extract_tenant_id(&request, false).unwrap(),
            TenantId("acme".to_string())
        );

        // Underscores in the tenant id survive.
        let request = request_with_header("Authorization", "ffrtmp_ac_me_s3cret");
        assert_eq!(
            extract_tenant_id(&request, false).unwrap(),
            TenantId("ac_me".to_string())
        );
    }

    #[test]
    fn tenant_from_query_parameter() {
        let request = Request::builder()
            .uri("/jobs?tenant_id=acme".parse().unwrap())
            .finish();
        assert_eq!(
            extract_tenant_id(&request, false).unwrap(),
            TenantId("acme".to_string())
        );
    }

    #[test]
    fn default_tenant_requires_opt_in() {
        let request = Request::builder().finish();
        assert_eq!(
            extract_tenant_id(&request, true).unwrap(),
            TenantId::default()
        );
        assert!(matches!(
            extract_tenant_id(&request, false),
            Err(AuthError::MissingTenant)
        ));
    }

    #[test]
    fn invalid_tenant_ids_are_rejected() {
        let request = request_with_header(TENANT_HEADER, "bad tenant!");
        assert!(matches!(
            extract_tenant_id(&request, true),
            Err(AuthError::InvalidTenant(_))
        ));
    }
}
