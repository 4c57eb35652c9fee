use ffrtmp_common::model::WrapperConstraints;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CPU_WEIGHT: u32 = 100;

/// The complete set of knobs the wrapper is allowed to touch. Every
/// field is reversible and degrades to a no-op when unavailable. The
/// job-level `timeout_sec` deliberately does not appear here: run
/// timeouts are enforced by the master scheduler, never by the wrapper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// CPU quota as a percentage of one core; 0 or `None` = unlimited,
    /// values above 100 span multiple cores.
    pub cpu_quota_percent: Option<u32>,
    /// Relative CPU weight, 1..=10000 (cgroup v2 `cpu.weight` scale).
    pub cpu_weight: Option<u32>,
    /// Memory ceiling in MiB; 0 or `None` = unlimited.
    pub memory_limit_mb: Option<u64>,
    /// Best-effort IO weight percentage, 0..=100 (cgroup v2 only).
    pub io_weight_percent: Option<u32>,
    /// Niceness fallback when no cgroup hierarchy is writable.
    pub nice: Option<i32>,
    /// `/proc/<pid>/oom_score_adj`, -1000..=1000.
    pub oom_score_adj: Option<i32>,
}

impl Constraints {
    pub fn is_empty(&self) -> bool {
        self.cpu_quota_percent.is_none()
            && self.cpu_weight.is_none()
            && self.memory_limit_mb.is_none()
            && self.io_weight_percent.is_none()
            && self.nice.is_none()
            && self.oom_score_adj.is_none()
    }

    /// Whether any constraint needs a cgroup (vs. per-pid knobs only).
    pub fn needs_cgroup(&self) -> bool {
        self.cpu_quota_percent.is_some_and(|v| v > 0)
            || self.cpu_weight.is_some()
            || self.memory_limit_mb.is_some_and(|v| v > 0)
            || self.io_weight_percent.is_some()
    }

    /// Clamps every knob into its documented range.
    pub fn normalized(mut self) -> Self {
        self.cpu_weight = self.cpu_weight.map(|w| w.clamp(1, 10_000));
        self.io_weight_percent = self.io_weight_percent.map(|w| w.min(100));
        self.nice = self.nice.map(|n| n.clamp(-20, 19));
        self.oom_score_adj = self.oom_score_adj.map(|adj| adj.clamp(-1000, 1000));
        self
    }
}

impl From<&WrapperConstraints> for Constraints {
    fn from(value: &WrapperConstraints) -> Self {
        Constraints {
            cpu_quota_percent: value.cpu_max_percent,
            cpu_weight: value.cpu_weight,
            memory_limit_mb: value.memory_max_mb,
            io_weight_percent: value.io_max_percent,
            nice: None,
            oom_score_adj: None,
        }
        .normalized()
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn normalization_clamps_ranges() {
        let constraints = Constraints {
            cpu_weight: Some(20_000),
            io_weight_percent: Some(250),
            nice: Some(-100),
            oom_score_adj: Some(5000),
            ..Constraints::default()
        }
        .normalized();

        assert_eq!(constraints.cpu_weight, Some(10_000));
        assert_eq!(constraints.io_weight_percent, Some(100));
        assert_eq!(constraints.nice, Some(-20));
        assert_eq!(constraints.oom_score_adj, Some(1000));
    }

    #[test]
    fn cgroup_need_detection() {
        assert!(!Constraints::default().needs_cgroup());
        assert!(!Constraints {
            nice: Some(5),
            oom_score_adj: Some(100),
            ..Constraints::default()
        }
        .needs_cgroup());
        assert!(Constraints {
            memory_limit_mb: Some(512),
            ..Constraints::default()
        }
        .needs_cgroup());
        // Zero means unlimited, not "create a cgroup for nothing".
        assert!(!Constraints {
            cpu_quota_percent: Some(0),
            memory_limit_mb: Some(0),
            ..Constraints::default()
        }
        .needs_cgroup());
    }
}
