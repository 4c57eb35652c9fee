use crate::config::AgentConfig;
use ffrtmp_common::config::RetryConfig;
use ffrtmp_common::model::{Job, JobId, JobResult, NodeCapabilities, NodeId, NodeType};
use ffrtmp_common::retries::with_retries;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("master returned {status}: {message}")]
    Api {
        status: reqwest::StatusCode,
        message: String,
    },
}

impl ClientError {
    /// Transport failures and 5xx responses are worth retrying;
    /// everything else is a caller mistake.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Api { status, .. } => status.is_server_error(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeRequest {
    pub address: String,
    pub node_type: NodeType,
    pub capabilities: NodeCapabilities,
    pub max_concurrent: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterNodeResponse {
    node_id: NodeId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartedReport {
    node_id: NodeId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultReport {
    pub job_id: JobId,
    pub node_id: NodeId,
    pub result: JobResult,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResponse {
    pub applied: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    errors: Option<Vec<String>>,
}

/// Typed HTTP client for the master control plane. Result reporting is
/// the only call with built-in (transport-level) retries.
pub struct MasterClient {
    base: Url,
    api_key: String,
    tenant: Option<String>,
    result_retries: RetryConfig,
    client: reqwest::Client,
}

impl MasterClient {
    pub fn from_config(config: &AgentConfig) -> Result<Self, anyhow::Error> {
        let mut builder = reqwest::Client::builder().use_rustls_tls();

        if let Some(ca) = &config.ca {
            let pem = std::fs::read(ca)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        if let (Some(cert), Some(key)) = (&config.cert, &config.key) {
            let mut pem = std::fs::read(cert)?;
            pem.extend_from_slice(&std::fs::read(key)?);
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
        }
        if config.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            base: config.master.clone(),
            api_key: config.effective_api_key(),
            tenant: config.tenant.clone(),
            result_retries: config.result_retries(),
            client: builder.build()?,
        })
    }

    fn url(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        url
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("X-API-Key", &self.api_key);
        match &self.tenant {
            Some(tenant) => builder.header("X-Tenant-ID", tenant),
            None => builder,
        }
    }

    async fn handle<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            Ok(response.json().await?)
        } else {
            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body
                    .error
                    .or_else(|| body.errors.map(|errors| errors.join(", ")))
                    .unwrap_or_else(|| "unknown error".to_string()),
                Err(_) => "unknown error".to_string(),
            };
            Err(ClientError::Api { status, message })
        }
    }

    pub async fn register(&self, request: &RegisterNodeRequest) -> Result<NodeId, ClientError> {
        let response = self
            .request(self.client.post(self.url("/v1/nodes/register")))
            .json(request)
            .send()
            .await?;
        let body: RegisterNodeResponse = Self::handle(response).await?;
        Ok(body.node_id)
    }

    pub async fn heartbeat(&self, node_id: &NodeId) -> Result<(), ClientError> {
        let response = self
            .request(
                self.client
                    .post(self.url(&format!("/v1/nodes/{node_id}/heartbeat"))),
            )
            .json(&HashMap::<String, String>::new())
            .send()
            .await?;
        let _: serde_json::Value = Self::handle(response).await?;
        Ok(())
    }

    pub async fn claim_next(&self, node_id: &NodeId) -> Result<Option<Job>, ClientError> {
        let mut url = self.url("/v1/jobs/next");
        url.query_pairs_mut()
            .append_pair("node_id", &node_id.to_string());
        let response = self.request(self.client.get(url)).send().await?;
        Self::handle(response).await
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<Job, ClientError> {
        let response = self
            .request(self.client.get(self.url(&format!("/v1/jobs/{job_id}"))))
            .send()
            .await?;
        Self::handle(response).await
    }

    pub async fn report_started(
        &self,
        job_id: &JobId,
        node_id: &NodeId,
    ) -> Result<(), ClientError> {
        let response = self
            .request(
                self.client
                    .post(self.url(&format!("/v1/jobs/{job_id}/start"))),
            )
            .json(&StartedReport { node_id: *node_id })
            .send()
            .await?;
        let _: serde_json::Value = Self::handle(response).await?;
        Ok(())
    }

    /// Posts the terminal result with bounded exponential backoff. This
    /// is a transport retry only; the workload never re-runs.
    pub async fn report_result(&self, report: &ResultReport) -> Result<AckResponse, ClientError> {
        with_retries(
            "report_result",
            &self.result_retries,
            ClientError::is_retryable,
            || async {
                let response = self
                    .request(self.client.post(self.url("/v1/results")))
                    .json(report)
                    .send()
                    .await?;
                Self::handle(response).await
            },
        )
        .await
    }
}
