use chrono::{DateTime, Utc};
use ffrtmp_common::model::ExitReason;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

/// Workload classification used for SLA accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadIntent {
    Production,
    Test,
    Experiment,
    Soak,
}

impl Default for WorkloadIntent {
    fn default() -> Self {
        WorkloadIntent::Production
    }
}

impl Display for WorkloadIntent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadIntent::Production => write!(f, "production"),
            WorkloadIntent::Test => write!(f, "test"),
            WorkloadIntent::Experiment => write!(f, "experiment"),
            WorkloadIntent::Soak => write!(f, "soak"),
        }
    }
}

impl FromStr for WorkloadIntent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "production" => Ok(WorkloadIntent::Production),
            "test" => Ok(WorkloadIntent::Test),
            "experiment" => Ok(WorkloadIntent::Experiment),
            "soak" => Ok(WorkloadIntent::Soak),
            _ => Err(format!("Invalid workload intent: {s}")),
        }
    }
}

/// Frozen at spawn or attach; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadMetadata {
    pub job_id: String,
    pub sla_eligible: bool,
    pub intent: WorkloadIntent,
    pub started_at: DateTime<Utc>,
}

impl WorkloadMetadata {
    pub fn new(job_id: impl Into<String>, sla_eligible: bool, intent: WorkloadIntent) -> Self {
        Self {
            job_id: job_id.into(),
            sla_eligible,
            intent,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Unknown,
    Starting,
    Running,
    Completed,
    Failed,
    Killed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub pid: u32,
    pub state: LifecycleState,
    pub timestamp: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub exit_reason: Option<ExitReason>,
}

impl LifecycleEvent {
    pub fn now(pid: u32, state: LifecycleState) -> Self {
        Self {
            pid,
            state,
            timestamp: Utc::now(),
            exit_code: None,
            exit_reason: None,
        }
    }
}

/// Immutable summary produced exactly once when the workload terminates
/// (or observation of it stops).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleReport {
    pub metadata: WorkloadMetadata,
    pub pid: u32,
    pub events: Vec<LifecycleEvent>,
    pub exit_code: Option<i32>,
    pub exit_reason: ExitReason,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Computed once at report construction; never recomputed.
    pub platform_sla_compliant: bool,
}

impl LifecycleReport {
    pub fn new(
        metadata: WorkloadMetadata,
        pid: u32,
        events: Vec<LifecycleEvent>,
        exit_code: Option<i32>,
        exit_reason: ExitReason,
        duration: Duration,
    ) -> Self {
        let platform_sla_compliant =
            metadata.sla_eligible && !exit_reason.is_platform_attributable();
        Self {
            metadata,
            pid,
            events,
            exit_code,
            exit_reason,
            duration,
            platform_sla_compliant,
        }
    }

    pub fn workload_succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn metadata(sla_eligible: bool) -> WorkloadMetadata {
        WorkloadMetadata::new("job-1", sla_eligible, WorkloadIntent::Production)
    }

    #[test]
    fn sla_compliance_excludes_platform_reasons() {
        let report = LifecycleReport::new(
            metadata(true),
            42,
            vec![],
            None,
            ExitReason::Oom,
            Duration::from_secs(1),
        );
        assert!(!report.platform_sla_compliant);

        let report = LifecycleReport::new(
            metadata(true),
            42,
            vec![],
            Some(1),
            ExitReason::Error,
            Duration::from_secs(1),
        );
        // A workload error does not count against the platform.
        assert!(report.platform_sla_compliant);
    }

    #[test]
    fn sla_ineligible_is_never_compliant() {
        let report = LifecycleReport::new(
            metadata(false),
            42,
            vec![],
            Some(0),
            ExitReason::Success,
            Duration::from_secs(1),
        );
        assert!(!report.platform_sla_compliant);
    }
}
