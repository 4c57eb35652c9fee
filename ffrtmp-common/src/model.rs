use chrono::{DateTime, Utc};
use poem_openapi::{Enum, NewType, Object};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

pub const TENANT_ID_MAX_LEN: usize = 64;

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, NewType,
)]
#[oai(rename = "TenantId")]
pub struct TenantId(pub String);

impl TenantId {
    /// Validates and wraps a tenant identifier (`[A-Za-z0-9_-]{1,64}`).
    pub fn try_new(value: impl Into<String>) -> Result<Self, String> {
        let value = value.into();
        if value.is_empty() || value.len() > TENANT_ID_MAX_LEN {
            return Err(format!(
                "Invalid tenant id: must be 1..{TENANT_ID_MAX_LEN} characters"
            ));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(format!("Invalid tenant id: {value}"));
        }
        Ok(Self(value))
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TenantId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_new(s)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, NewType,
)]
#[oai(rename = "NodeId")]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s)
            .map(Self)
            .map_err(|err| format!("Invalid node id: {err}"))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, NewType,
)]
#[oai(rename = "JobId")]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s)
            .map(Self)
            .map_err(|err| format!("Invalid job id: {err}"))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Enum,
)]
#[serde(rename_all = "lowercase")]
#[oai(rename_all = "lowercase")]
pub enum NodeType {
    Desktop,
    Server,
    Edge,
}

impl Display for NodeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Desktop => write!(f, "desktop"),
            NodeType::Server => write!(f, "server"),
            NodeType::Edge => write!(f, "edge"),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Enum,
)]
#[serde(rename_all = "lowercase")]
#[oai(rename_all = "lowercase")]
pub enum NodeStatus {
    Available,
    Busy,
    Offline,
}

impl NodeStatus {
    pub const ALL: [NodeStatus; 3] = [NodeStatus::Available, NodeStatus::Busy, NodeStatus::Offline];
}

impl Display for NodeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Available => write!(f, "available"),
            NodeStatus::Busy => write!(f, "busy"),
            NodeStatus::Offline => write!(f, "offline"),
        }
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(NodeStatus::Available),
            "busy" => Ok(NodeStatus::Busy),
            "offline" => Ok(NodeStatus::Offline),
            _ => Err(format!("Invalid node status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct NodeCapabilities {
    pub cpu_threads: u32,
    pub cpu_model: String,
    pub has_gpu: bool,
    pub gpu_type: Option<String>,
    pub ram_bytes: u64,
    #[serde(default)]
    #[oai(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub tenant_id: TenantId,
    pub address: String,
    pub node_type: NodeType,
    pub capabilities: NodeCapabilities,
    pub status: NodeStatus,
    pub max_concurrent: u32,
    pub last_seen: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// Ordering rank is ascending: a lower rank is served first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Enum,
)]
#[serde(rename_all = "lowercase")]
#[oai(rename_all = "lowercase")]
pub enum JobPriority {
    High,
    Medium,
    Low,
}

impl JobPriority {
    pub const ALL: [JobPriority; 3] = [JobPriority::High, JobPriority::Medium, JobPriority::Low];

    pub fn rank(&self) -> i64 {
        match self {
            JobPriority::High => 0,
            JobPriority::Medium => 1,
            JobPriority::Low => 2,
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Medium
    }
}

impl Display for JobPriority {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPriority::High => write!(f, "high"),
            JobPriority::Medium => write!(f, "medium"),
            JobPriority::Low => write!(f, "low"),
        }
    }
}

impl FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(JobPriority::High),
            "medium" => Ok(JobPriority::Medium),
            "low" => Ok(JobPriority::Low),
            _ => Err(format!("Invalid job priority: {s}")),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Enum,
)]
#[serde(rename_all = "lowercase")]
#[oai(rename_all = "lowercase")]
pub enum QueueType {
    Live,
    Default,
    Batch,
}

impl QueueType {
    pub const ALL: [QueueType; 3] = [QueueType::Live, QueueType::Default, QueueType::Batch];

    pub fn rank(&self) -> i64 {
        match self {
            QueueType::Live => 0,
            QueueType::Default => 1,
            QueueType::Batch => 2,
        }
    }
}

impl Default for QueueType {
    fn default() -> Self {
        QueueType::Default
    }
}

impl Display for QueueType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueType::Live => write!(f, "live"),
            QueueType::Default => write!(f, "default"),
            QueueType::Batch => write!(f, "batch"),
        }
    }
}

impl FromStr for QueueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(QueueType::Live),
            "default" => Ok(QueueType::Default),
            "batch" => Ok(QueueType::Batch),
            _ => Err(format!("Invalid queue type: {s}")),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Enum,
)]
#[serde(rename_all = "lowercase")]
#[oai(rename_all = "lowercase")]
pub enum EnginePreference {
    Ffmpeg,
    Gstreamer,
    Auto,
}

impl Default for EnginePreference {
    fn default() -> Self {
        EnginePreference::Auto
    }
}

impl Display for EnginePreference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EnginePreference::Ffmpeg => write!(f, "ffmpeg"),
            EnginePreference::Gstreamer => write!(f, "gstreamer"),
            EnginePreference::Auto => write!(f, "auto"),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Enum,
)]
#[serde(rename_all = "lowercase")]
#[oai(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Assigned,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Canceled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// In-flight on some worker: the job has an assigned node.
    pub fn is_dispatched(&self) -> bool {
        matches!(self, JobStatus::Assigned | JobStatus::Running)
    }

    /// The job lifecycle state machine. Re-queueing an assigned or
    /// running job (node timeout) is the only backward edge.
    pub fn may_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Queued) => true,
            (JobStatus::Pending, JobStatus::Canceled) => true,
            (JobStatus::Queued, JobStatus::Assigned) => true,
            (JobStatus::Queued, JobStatus::Canceled) => true,
            (JobStatus::Queued, JobStatus::Failed) => true,
            (JobStatus::Assigned, JobStatus::Running) => true,
            (JobStatus::Assigned, JobStatus::Queued) => true,
            (JobStatus::Assigned, JobStatus::Completed) => true,
            (JobStatus::Assigned, JobStatus::Failed) => true,
            (JobStatus::Assigned, JobStatus::Canceled) => true,
            (JobStatus::Running, JobStatus::Queued) => true,
            (JobStatus::Running, JobStatus::Completed) => true,
            (JobStatus::Running, JobStatus::Failed) => true,
            (JobStatus::Running, JobStatus::Canceled) => true,
            _ => false,
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Assigned => write!(f, "assigned"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Canceled => write!(f, "canceled"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "assigned" => Ok(JobStatus::Assigned),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            _ => Err(format!("Invalid job status: {s}")),
        }
    }
}

/// Classification of how a governed workload exited. Computed once by
/// the wrapper and carried through result reporting unchanged.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Enum,
)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum ExitReason {
    Success,
    Error,
    Signal,
    Timeout,
    Oom,
    CgroupLimit,
    PolicyViolation,
    Unknown,
}

impl ExitReason {
    /// Reasons that count against the platform rather than the workload.
    pub fn is_platform_attributable(&self) -> bool {
        matches!(
            self,
            ExitReason::Timeout
                | ExitReason::Oom
                | ExitReason::CgroupLimit
                | ExitReason::PolicyViolation
        )
    }
}

impl Display for ExitReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Success => write!(f, "success"),
            ExitReason::Error => write!(f, "error"),
            ExitReason::Signal => write!(f, "signal"),
            ExitReason::Timeout => write!(f, "timeout"),
            ExitReason::Oom => write!(f, "oom"),
            ExitReason::CgroupLimit => write!(f, "cgroup_limit"),
            ExitReason::PolicyViolation => write!(f, "policy_violation"),
            ExitReason::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for ExitReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ExitReason::Success),
            "error" => Ok(ExitReason::Error),
            "signal" => Ok(ExitReason::Signal),
            "timeout" => Ok(ExitReason::Timeout),
            "oom" => Ok(ExitReason::Oom),
            "cgroup_limit" => Ok(ExitReason::CgroupLimit),
            "policy_violation" => Ok(ExitReason::PolicyViolation),
            "unknown" => Ok(ExitReason::Unknown),
            _ => Err(format!("Invalid exit reason: {s}")),
        }
    }
}

/// Resource governance limits attached to a job. The resource knobs are
/// applied by the wrapper on the worker; `timeout_sec` is a run limit
/// enforced by the master's timeout supervisor, never by the wrapper.
/// All fields optional; `None` means unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct WrapperConstraints {
    pub cpu_max_percent: Option<u32>,
    pub cpu_weight: Option<u32>,
    pub memory_max_mb: Option<u64>,
    pub io_max_percent: Option<u32>,
    pub timeout_sec: Option<u64>,
}

impl WrapperConstraints {
    pub fn is_empty(&self) -> bool {
        self.cpu_max_percent.is_none()
            && self.cpu_weight.is_none()
            && self.memory_max_mb.is_none()
            && self.io_max_percent.is_none()
            && self.timeout_sec.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct JobResult {
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub stderr_tail: Option<String>,
    pub exit_reason: Option<ExitReason>,
    pub duration_seconds: f64,
    pub output_bytes: u64,
    pub bandwidth_mbps: f64,
    pub sla_met: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub scenario: String,
    #[serde(default)]
    #[oai(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    pub wrapper_constraints: Option<WrapperConstraints>,
    pub priority: JobPriority,
    pub queue: QueueType,
    pub engine: EnginePreference,
    pub requires_gpu: bool,
    pub status: JobStatus,
    pub cancel_requested: bool,
    pub assigned_node_id: Option<NodeId>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub sla_target_seconds: Option<u64>,
    pub result: Option<JobResult>,
}

impl Job {
    /// Capability predicate used by `claim_next_job`.
    pub fn matches_capabilities(&self, capabilities: &NodeCapabilities) -> bool {
        !self.requires_gpu || capabilities.has_gpu
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub display_name: String,
    pub is_active: bool,
    #[serde(default)]
    #[oai(default)]
    pub config: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
pub struct ErrorsBody {
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Object)]
pub struct Empty {}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn tenant_id_validation() {
        assert!(TenantId::try_new("default").is_ok());
        assert!(TenantId::try_new("tenant-1_A").is_ok());
        assert!(TenantId::try_new("").is_err());
        assert!(TenantId::try_new("bad tenant").is_err());
        assert!(TenantId::try_new("a".repeat(65)).is_err());
        assert!(TenantId::try_new("a".repeat(64)).is_ok());
    }

    #[test]
    fn priority_and_queue_ordering() {
        assert!(JobPriority::High.rank() < JobPriority::Medium.rank());
        assert!(JobPriority::Medium.rank() < JobPriority::Low.rank());
        assert!(QueueType::Live.rank() < QueueType::Default.rank());
        assert!(QueueType::Default.rank() < QueueType::Batch.rank());
    }

    #[test]
    fn job_status_transitions() {
        use JobStatus::*;

        assert!(Pending.may_transition_to(Queued));
        assert!(Queued.may_transition_to(Assigned));
        assert!(Assigned.may_transition_to(Running));
        assert!(Running.may_transition_to(Completed));
        assert!(Running.may_transition_to(Queued));
        assert!(Assigned.may_transition_to(Queued));
        assert!(Pending.may_transition_to(Canceled));

        assert!(!Completed.may_transition_to(Running));
        assert!(!Canceled.may_transition_to(Queued));
        assert!(!Pending.may_transition_to(Running));
        assert!(!Queued.may_transition_to(Running));
    }

    #[test]
    fn exit_reason_round_trip() {
        for reason in [
            ExitReason::Success,
            ExitReason::CgroupLimit,
            ExitReason::PolicyViolation,
        ] {
            let text = reason.to_string();
            assert_eq!(text.parse::<ExitReason>().unwrap(), reason);
        }
        assert!(ExitReason::Oom.is_platform_attributable());
        assert!(ExitReason::Timeout.is_platform_attributable());
        assert!(!ExitReason::Error.is_platform_attributable());
        assert!(!ExitReason::Signal.is_platform_attributable());
    }
}
