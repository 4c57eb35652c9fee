use crate::cgroup::{CgroupBinding, DEFAULT_CGROUP_ROOT};
use crate::constraints::Constraints;
use crate::model::{LifecycleEvent, LifecycleReport, LifecycleState, WorkloadMetadata};
use ffrtmp_common::model::ExitReason;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ATTACH_PROBE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum WrapperError {
    #[error("workload command is empty")]
    EmptyCommand,
    #[error("failed to spawn workload: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("no such process: {0}")]
    NoSuchProcess(u32),
}

/// Where a forwarded stream goes. The CLI inherits both; the agent
/// captures stderr to a file for the failure tail.
#[derive(Debug, Clone)]
pub enum OutputMode {
    Inherit,
    Null,
    Append(PathBuf),
}

impl OutputMode {
    fn to_stdio(&self) -> std::io::Result<Stdio> {
        match self {
            OutputMode::Inherit => Ok(Stdio::inherit()),
            OutputMode::Null => Ok(Stdio::null()),
            OutputMode::Append(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                Ok(Stdio::from(file))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub command: String,
    pub args: Vec<String>,
    pub stdout: OutputMode,
    pub stderr: OutputMode,
}

impl WorkloadSpec {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            stdout: OutputMode::Inherit,
            stderr: OutputMode::Inherit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    pub namespace: String,
    pub cgroup_root: PathBuf,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new("ffrtmp")
    }
}

impl Supervisor {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
        }
    }

    pub fn with_cgroup_root(mut self, root: &Path) -> Self {
        self.cgroup_root = root.to_path_buf();
        self
    }

    /// Spawns the command as its own process-group leader, applies
    /// constraints after exec, and hands back a waitable handle. The
    /// child is never killed implicitly: dropping the handle (or the
    /// whole wrapper process dying) leaves the workload running.
    pub async fn run(
        &self,
        metadata: WorkloadMetadata,
        constraints: Constraints,
        spec: WorkloadSpec,
    ) -> Result<RunningWorkload, WrapperError> {
        if spec.command.is_empty() {
            return Err(WrapperError::EmptyCommand);
        }
        let constraints = constraints.normalized();

        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(spec.stdout.to_stdio()?)
            .stderr(spec.stderr.to_stdio()?)
            .kill_on_drop(false);
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
            });
        }

        let child = command.spawn()?;
        let pid = child.id().ok_or_else(|| {
            WrapperError::Spawn(std::io::Error::other(
                "child exited before pid could be read",
            ))
        })?;

        let mut events = vec![LifecycleEvent::now(pid, LifecycleState::Starting)];
        let binding = self.apply_governance(&metadata.job_id, pid, &constraints);
        events.push(LifecycleEvent::now(pid, LifecycleState::Running));

        info!(job_id = %metadata.job_id, pid, "workload started");

        Ok(RunningWorkload {
            metadata,
            pid,
            child,
            binding,
            events,
            started: Instant::now(),
        })
    }

    /// Governs an already-running pid: existence probe, cgroup join,
    /// reversible constraints, then passive observation until the
    /// process exits or `cancel` fires (which only stops observing).
    pub async fn attach(
        &self,
        metadata: WorkloadMetadata,
        constraints: Constraints,
        pid: u32,
        cancel: CancellationToken,
    ) -> Result<LifecycleReport, WrapperError> {
        if !process_exists(pid) {
            return Err(WrapperError::NoSuchProcess(pid));
        }
        let constraints = constraints.normalized();

        let mut events = vec![LifecycleEvent::now(pid, LifecycleState::Running)];
        let binding = self.apply_governance(&metadata.job_id, pid, &constraints);
        let started = Instant::now();

        info!(job_id = %metadata.job_id, pid, "attached to workload");

        let mut exited = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(pid, "attach observation canceled, workload left running");
                    break;
                }
                _ = tokio::time::sleep(ATTACH_PROBE_INTERVAL) => {
                    if !process_exists(pid) {
                        exited = true;
                        break;
                    }
                }
            }
        }

        // The exit status of a process we did not spawn is not
        // observable; only the cgroup can tell us more.
        let oom_killed = binding
            .as_ref()
            .is_some_and(|binding| binding.oom_kill_count() > 0);
        let exit_reason = if exited && oom_killed {
            ExitReason::Oom
        } else {
            ExitReason::Unknown
        };

        let mut event = LifecycleEvent::now(pid, LifecycleState::Completed);
        event.exit_reason = Some(exit_reason);
        events.push(event);

        if let Some(binding) = &binding {
            binding.remove();
        }

        Ok(LifecycleReport::new(
            metadata,
            pid,
            events,
            None,
            exit_reason,
            started.elapsed(),
        ))
    }

    /// Degradation ladder: cgroup (v2 then v1) → nice only → nothing.
    /// Every downgrade logs; none of them fails the workload.
    fn apply_governance(
        &self,
        job_id: &str,
        pid: u32,
        constraints: &Constraints,
    ) -> Option<CgroupBinding> {
        let binding = if constraints.needs_cgroup() {
            match CgroupBinding::create(&self.cgroup_root, &self.namespace, job_id) {
                Some(binding) => {
                    binding.apply(constraints);
                    binding.add_pid(pid);
                    Some(binding)
                }
                None => {
                    warn!(pid, "no writable cgroup hierarchy, degrading to nice priority");
                    None
                }
            }
        } else {
            None
        };

        let nice = constraints.nice.or_else(|| {
            // CPU governance was requested but no cgroup took it.
            (constraints.needs_cgroup() && binding.is_none()).then_some(10)
        });
        if let Some(nice) = nice {
            apply_nice(pid, nice);
        }

        if let Some(adj) = constraints.oom_score_adj {
            let path = format!("/proc/{pid}/oom_score_adj");
            if let Err(err) = std::fs::write(&path, adj.to_string()) {
                warn!(pid, "could not write {path} = {adj}: {err}");
            }
        }

        binding
    }
}

/// A spawned workload that can be waited on. Holds the pid (= pgid, the
/// child is its group leader) so callers can signal the whole group.
pub struct RunningWorkload {
    metadata: WorkloadMetadata,
    pid: u32,
    child: Child,
    binding: Option<CgroupBinding>,
    events: Vec<LifecycleEvent>,
    started: Instant,
}

impl RunningWorkload {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The process group id; equal to the pid by construction.
    pub fn pgid(&self) -> u32 {
        self.pid
    }

    pub fn signal_group(&self, signal: Signal) -> Result<(), Errno> {
        signal::killpg(Pid::from_raw(self.pid as i32), signal)
    }

    /// Waits for the workload to exit of its own accord (or by someone
    /// else's signal) and produces the immutable report. The wrapper
    /// itself never terminates the workload.
    pub async fn wait(mut self) -> LifecycleReport {
        let status = self.child.wait().await;

        let oom_killed = self
            .binding
            .as_ref()
            .is_some_and(|binding| binding.oom_kill_count() > 0);

        let (exit_code, exit_reason) = match status {
            Ok(status) => analyze_exit(status, oom_killed),
            Err(err) => {
                warn!(pid = self.pid, "waiting for workload failed: {err}");
                (None, ExitReason::Unknown)
            }
        };

        let state = match exit_reason {
            ExitReason::Success => LifecycleState::Completed,
            ExitReason::Signal => LifecycleState::Killed,
            _ => LifecycleState::Failed,
        };
        let mut event = LifecycleEvent::now(self.pid, state);
        event.exit_code = exit_code;
        event.exit_reason = Some(exit_reason);
        self.events.push(event);

        if let Some(binding) = &self.binding {
            binding.remove();
        }

        LifecycleReport::new(
            self.metadata,
            self.pid,
            self.events,
            exit_code,
            exit_reason,
            self.started.elapsed(),
        )
    }
}

/// Signal-0 probe.
pub fn process_exists(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

fn apply_nice(pid: u32, nice: i32) {
    let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid, nice) };
    if result != 0 {
        warn!(pid, "could not set nice value {nice}: {}", std::io::Error::last_os_error());
    }
}

/// Maps a wait status to the terminal exit classification. Exit codes
/// 137 and 143 are treated as OOM kills (the usual shell encodings of
/// SIGKILL/SIGTERM delivered by the kernel OOM path); a real cgroup OOM
/// event overrides any other classification.
fn analyze_exit(status: ExitStatus, oom_killed: bool) -> (Option<i32>, ExitReason) {
    if let Some(raw_signal) = status.signal() {
        let reason = match Signal::try_from(raw_signal) {
            Ok(Signal::SIGXCPU) => ExitReason::CgroupLimit,
            Ok(Signal::SIGKILL) if oom_killed => ExitReason::Oom,
            _ => ExitReason::Signal,
        };
        return (None, reason);
    }

    match status.code() {
        Some(0) => (Some(0), ExitReason::Success),
        Some(code @ (137 | 143)) => (Some(code), ExitReason::Oom),
        Some(code) if oom_killed => (Some(code), ExitReason::Oom),
        Some(code) => (Some(code), ExitReason::Error),
        None => (None, ExitReason::Unknown),
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::model::WorkloadIntent;

    fn exited(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    fn signaled(signal: i32) -> ExitStatus {
        ExitStatus::from_raw(signal)
    }

    fn metadata() -> WorkloadMetadata {
        WorkloadMetadata::new("test-job", true, WorkloadIntent::Test)
    }

    #[test]
    fn exit_analysis_classification() {
        assert_eq!(
            analyze_exit(exited(0), false),
            (Some(0), ExitReason::Success)
        );
        assert_eq!(analyze_exit(exited(1), false), (Some(1), ExitReason::Error));
        assert_eq!(
            analyze_exit(exited(137), false),
            (Some(137), ExitReason::Oom)
        );
        assert_eq!(
            analyze_exit(exited(143), false),
            (Some(143), ExitReason::Oom)
        );
        assert_eq!(
            analyze_exit(signaled(libc::SIGXCPU), false),
            (None, ExitReason::CgroupLimit)
        );
        assert_eq!(
            analyze_exit(signaled(libc::SIGKILL), true),
            (None, ExitReason::Oom)
        );
        assert_eq!(
            analyze_exit(signaled(libc::SIGKILL), false),
            (None, ExitReason::Signal)
        );
        assert_eq!(
            analyze_exit(signaled(libc::SIGTERM), false),
            (None, ExitReason::Signal)
        );
    }

    #[test]
    async fn run_reports_workload_exit_code() {
        let supervisor = Supervisor::default();
        let workload = supervisor
            .run(
                metadata(),
                Constraints::default(),
                WorkloadSpec::new("/bin/sh", vec!["-c".to_string(), "exit 3".to_string()]),
            )
            .await
            .unwrap();
        let report = workload.wait().await;

        assert_eq!(report.exit_code, Some(3));
        assert_eq!(report.exit_reason, ExitReason::Error);
        assert!(!report.workload_succeeded());
        assert!(report.platform_sla_compliant);
    }

    #[test]
    async fn run_success_is_compliant() {
        let supervisor = Supervisor::default();
        let workload = supervisor
            .run(
                metadata(),
                Constraints::default(),
                WorkloadSpec::new("/bin/true", vec![]),
            )
            .await
            .unwrap();
        let report = workload.wait().await;

        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.exit_reason, ExitReason::Success);
        assert!(report.workload_succeeded());
    }

    #[test]
    async fn dropping_the_handle_leaves_the_workload_running() {
        let supervisor = Supervisor::default();
        let workload = supervisor
            .run(
                metadata(),
                Constraints::default(),
                WorkloadSpec::new("/bin/sleep", vec!["30".to_string()]),
            )
            .await
            .unwrap();
        let pid = workload.pid();

        drop(workload);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(process_exists(pid));

        // Reap manually so the test leaves nothing behind.
        let _ = signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }

    #[test]
    async fn canceled_group_reports_signal() {
        let supervisor = Supervisor::default();
        let workload = supervisor
            .run(
                metadata(),
                Constraints::default(),
                WorkloadSpec::new("/bin/sleep", vec!["30".to_string()]),
            )
            .await
            .unwrap();

        workload.signal_group(Signal::SIGTERM).unwrap();
        let report = workload.wait().await;
        assert_eq!(report.exit_code, None);
        assert_eq!(report.exit_reason, ExitReason::Signal);
    }

    #[test]
    async fn attach_rejects_missing_pid() {
        let supervisor = Supervisor::default();
        let result = supervisor
            .attach(
                metadata(),
                Constraints::default(),
                u32::MAX - 1,
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(WrapperError::NoSuchProcess(_))));
    }

    #[test]
    async fn attach_observes_until_exit() {
        let supervisor = Supervisor::default();
        // Spawn an unrelated short-lived process to attach to; reap it
        // in the background so the existence probe sees it disappear.
        let mut child = tokio::process::Command::new("/bin/sleep")
            .arg("1")
            .kill_on_drop(false)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        let report = supervisor
            .attach(
                metadata(),
                Constraints::default(),
                pid,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.exit_code, None);
        assert_eq!(report.exit_reason, ExitReason::Unknown);
    }
}
