use ffrtmp_common::model::{
    EnginePreference, JobId, JobPriority, JobResult, JobStatus, NodeCapabilities, NodeId, NodeType,
    QueueType, WrapperConstraints,
};
use poem_openapi::Object;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct RegisterNodeRequest {
    pub address: String,
    pub node_type: NodeType,
    pub capabilities: NodeCapabilities,
    /// Maximum concurrently executing jobs; defaults to 1.
    pub max_concurrent: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct RegisterNodeResponse {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct JobSpec {
    pub scenario: String,
    #[serde(default)]
    #[oai(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    pub wrapper_constraints: Option<WrapperConstraints>,
    pub priority: Option<JobPriority>,
    pub queue: Option<QueueType>,
    pub engine: Option<EnginePreference>,
    #[serde(default)]
    #[oai(default)]
    pub requires_gpu: bool,
    pub sla_target_seconds: Option<u64>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct StartedReport {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct ResultReport {
    pub job_id: JobId,
    pub node_id: NodeId,
    pub result: JobResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct AckResponse {
    /// False when the report was a duplicate and no state changed.
    pub applied: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub priority: Option<JobPriority>,
    pub queue: Option<QueueType>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct HealthcheckResponse {
    pub status: String,
    pub version: String,
}
