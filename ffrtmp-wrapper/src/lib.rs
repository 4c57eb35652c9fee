//! Process governance for transcoding workloads.
//!
//! The wrapper is a *weak* supervisor: it applies reversible OS-level
//! constraints (cgroups, nice, oom_score_adj) to a spawned or already
//! running process and observes its lifecycle. It never owns the
//! workload; destroying the wrapper leaves the workload running.

pub mod cgroup;
pub mod constraints;
pub mod model;
pub mod supervisor;

pub use constraints::Constraints;
pub use model::{
    LifecycleEvent, LifecycleReport, LifecycleState, WorkloadIntent, WorkloadMetadata,
};
pub use supervisor::{OutputMode, RunningWorkload, Supervisor, WorkloadSpec, WrapperError};

#[cfg(test)]
test_r::enable!();
