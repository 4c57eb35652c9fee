use crate::client::{MasterClient, ResultReport};
use crate::config;
use crate::encoders::{self, EncoderAvailability};
use crate::metrics;
use ffrtmp_common::model::{ExitReason, Job, JobResult, JobStatus, NodeId, WrapperConstraints};
use ffrtmp_wrapper::supervisor::process_exists;
use ffrtmp_wrapper::{
    Constraints, LifecycleReport, OutputMode, RunningWorkload, Supervisor, WorkloadIntent,
    WorkloadMetadata, WorkloadSpec,
};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::Disks;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(5);
const CANCEL_KILL_GRACE: Duration = Duration::from_secs(30);
const STDERR_TAIL_BYTES: usize = 2048;
const MIN_FREE_DISK_FRACTION: f64 = 0.05;

pub struct ExecutionContext {
    pub client: Arc<MasterClient>,
    pub node_id: NodeId,
    pub availability: EncoderAvailability,
    pub work_dir: PathBuf,
    pub shutdown: CancellationToken,
}

/// Runs one claimed job to completion and reports the result. Every
/// internal failure becomes a failed job result; nothing here can crash
/// the agent.
pub async fn execute_job(ctx: &ExecutionContext, job: Job) {
    if let Err(err) = ctx.client.report_started(&job.id, &ctx.node_id).await {
        // The master re-queued or canceled the job in the meantime; do
        // not run it.
        warn!(job_id = %job.id, "could not report start, dropping claim: {err}");
        return;
    }

    let (result, generated_input) = run_workload(ctx, &job).await;

    metrics::record_job_finished(result.status, result.bandwidth_mbps, result.sla_met);

    let report = ResultReport {
        job_id: job.id,
        node_id: ctx.node_id,
        result: result.clone(),
    };
    if let Err(err) = ctx.client.report_result(&report).await {
        // The job already finished locally; it is only unreported. The
        // master's timeout supervisor will reconcile.
        warn!(job_id = %job.id, "result report failed permanently: {err}");
    }

    cleanup_files(
        &ctx.work_dir,
        &job,
        generated_input.as_deref(),
        result.status == JobStatus::Canceled,
    );
}

async fn run_workload(ctx: &ExecutionContext, job: &Job) -> (JobResult, Option<PathBuf>) {
    match try_run_workload(ctx, job).await {
        Ok((result, generated)) => (result, generated),
        Err(reason) => {
            warn!(job_id = %job.id, "job failed before execution: {reason}");
            (failed_result(&reason), None)
        }
    }
}

async fn try_run_workload(
    ctx: &ExecutionContext,
    job: &Job,
) -> Result<(JobResult, Option<PathBuf>), String> {
    if let Some(fraction) = free_disk_fraction(&ctx.work_dir) {
        if fraction < MIN_FREE_DISK_FRACTION {
            return Err("insufficient_disk".to_string());
        }
    }

    let (input, generated) = prepare_input(ctx, job).await?;
    let engine = encoders::select_engine(job.engine, ctx.availability)?;

    let constraints = build_constraints(job);
    let output = ctx.work_dir.join(format!("job_{}_output.mp4", job.id));
    let stderr_path = ctx.work_dir.join(format!("job_{}_stderr.log", job.id));
    let _ = std::fs::remove_file(&stderr_path);

    let (command, args) =
        encoders::transcode_command(engine, &job.scenario, &input, &output, &job.parameters);
    let mut spec = WorkloadSpec::new(command, args);
    spec.stdout = OutputMode::Null;
    spec.stderr = OutputMode::Append(stderr_path.clone());

    let metadata = WorkloadMetadata::new(
        job.id.to_string(),
        job.sla_target_seconds.is_some(),
        WorkloadIntent::Production,
    );

    let supervisor = Supervisor::default();
    let workload = supervisor
        .run(metadata, constraints, spec)
        .await
        .map_err(|err| format!("spawn failed: {err}"))?;

    info!(job_id = %job.id, pid = workload.pid(), engine = engine.as_str(), "transcoding started");

    let client = ctx.client.clone();
    let job_id = job.id;
    let (report, canceled, forceful) = supervise_with_cancellation(
        workload,
        move || {
            let client = client.clone();
            async move {
                match client.get_job(&job_id).await {
                    Ok(latest) => {
                        latest.cancel_requested || latest.status == JobStatus::Canceled
                    }
                    Err(err) => {
                        debug!(job_id = %job_id, "cancellation poll failed: {err}");
                        false
                    }
                }
            }
        },
        ctx.shutdown.clone(),
    )
    .await;

    if canceled {
        metrics::record_cancellation(forceful);
    }

    let bytes_in = file_size(&input);
    let bytes_out = file_size(&output);
    let duration = report.duration.as_secs_f64();

    let status = if canceled {
        JobStatus::Canceled
    } else if report.workload_succeeded() {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    };

    let result = JobResult {
        status,
        exit_code: report.exit_code,
        error: match status {
            JobStatus::Completed => None,
            JobStatus::Canceled => Some(if forceful {
                "canceled_forceful".to_string()
            } else {
                "canceled_graceful".to_string()
            }),
            _ => Some(format!("transcoder exited with {}", report.exit_reason)),
        },
        stderr_tail: stderr_tail(&stderr_path),
        exit_reason: Some(report.exit_reason),
        duration_seconds: duration,
        output_bytes: bytes_out,
        bandwidth_mbps: bandwidth_mbps(bytes_in, bytes_out, duration),
        sla_met: job
            .sla_target_seconds
            .map(|target| duration <= target as f64),
    };

    Ok((result, generated))
}

/// Waits for the workload while polling for cancellation every 5s;
/// cancellation (or agent shutdown) SIGTERMs the process group and
/// escalates to SIGKILL after the grace window.
pub async fn supervise_with_cancellation<F, Fut>(
    workload: RunningWorkload,
    poll_canceled: F,
    shutdown: CancellationToken,
) -> (LifecycleReport, bool, bool)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let pgid = workload.pgid();
    let wait_fut = workload.wait();
    tokio::pin!(wait_fut);

    let mut poll = tokio::time::interval(CANCEL_POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    poll.tick().await;

    let forceful = Arc::new(AtomicBool::new(false));
    let mut canceled = false;
    let mut escalation: Option<tokio::task::JoinHandle<()>> = None;

    let report = loop {
        tokio::select! {
            report = &mut wait_fut => break report,
            _ = poll.tick(), if !canceled => {
                if poll_canceled().await {
                    info!(pgid, "cancellation observed, terminating process group");
                    canceled = true;
                    escalation = Some(terminate_group(pgid, forceful.clone()));
                }
            }
            _ = shutdown.cancelled(), if !canceled => {
                info!(pgid, "agent shutdown, terminating process group");
                canceled = true;
                escalation = Some(terminate_group(pgid, forceful.clone()));
            }
        }
    };

    if let Some(handle) = escalation {
        handle.abort();
    }

    (report, canceled, forceful.load(Ordering::SeqCst))
}

fn terminate_group(pgid: u32, forceful: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    let _ = killpg(Pid::from_raw(pgid as i32), Signal::SIGTERM);
    tokio::spawn(async move {
        tokio::time::sleep(CANCEL_KILL_GRACE).await;
        if process_exists(pgid) {
            forceful.store(true, Ordering::SeqCst);
            let _ = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL);
        }
    })
}

async fn prepare_input(
    ctx: &ExecutionContext,
    job: &Job,
) -> Result<(PathBuf, Option<PathBuf>), String> {
    if let Some(path) = job
        .parameters
        .get("input_path")
        .and_then(|value| value.as_str())
    {
        let path = PathBuf::from(path);
        if !path.is_file() {
            return Err(format!("input not found: {}", path.display()));
        }
        return Ok((path, None));
    }

    let duration = job
        .parameters
        .get("duration_sec")
        .and_then(|value| value.as_u64())
        .unwrap_or(10);
    let input = ctx.work_dir.join(format!("job_{}_input.mp4", job.id));
    let (command, args) = encoders::input_generation_command(&input, duration);

    let status = tokio::process::Command::new(&command)
        .args(&args)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map_err(|err| format!("input generation failed: {err}"))?;
    if !status.success() {
        return Err(format!("input generation failed: {status}"));
    }
    Ok((input.clone(), Some(input)))
}

/// Constraints come from the job's wrapper_constraints, falling back to
/// the legacy `resource_limits` parameter mapping.
pub fn build_constraints(job: &Job) -> Constraints {
    let from_job = job
        .wrapper_constraints
        .clone()
        .or_else(|| legacy_constraints(&job.parameters));
    match &from_job {
        Some(constraints) => Constraints::from(constraints),
        None => Constraints::default(),
    }
}

fn legacy_constraints(
    parameters: &HashMap<String, serde_json::Value>,
) -> Option<WrapperConstraints> {
    let limits = parameters.get("resource_limits")?.as_object()?;
    let as_u64 = |key: &str| limits.get(key).and_then(|value| value.as_u64());
    Some(WrapperConstraints {
        cpu_max_percent: as_u64("max_cpu_percent").map(|value| value as u32),
        cpu_weight: None,
        memory_max_mb: as_u64("max_memory_mb"),
        io_max_percent: None,
        timeout_sec: as_u64("timeout_sec"),
    })
}

fn failed_result(reason: &str) -> JobResult {
    JobResult {
        status: JobStatus::Failed,
        exit_code: None,
        error: Some(reason.to_string()),
        stderr_tail: None,
        exit_reason: Some(ExitReason::Error),
        duration_seconds: 0.0,
        output_bytes: 0,
        bandwidth_mbps: 0.0,
        sla_met: None,
    }
}

/// `(bytes_in + bytes_out) * 8 / duration / 2^20` — megabits per second
/// moved through the transcoder.
pub fn bandwidth_mbps(bytes_in: u64, bytes_out: u64, duration_seconds: f64) -> f64 {
    if duration_seconds <= 0.0 {
        return 0.0;
    }
    (bytes_in + bytes_out) as f64 * 8.0 / duration_seconds / (1024.0 * 1024.0)
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

fn stderr_tail(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    if bytes.is_empty() {
        return None;
    }
    let start = bytes.len().saturating_sub(STDERR_TAIL_BYTES);
    Some(String::from_utf8_lossy(&bytes[start..]).into_owned())
}

/// Fraction of free space on the filesystem holding `path`, when the
/// host exposes it.
fn free_disk_fraction(path: &Path) -> Option<f64> {
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())?;
    if disk.total_space() == 0 {
        return None;
    }
    Some(disk.available_space() as f64 / disk.total_space() as f64)
}

/// Post-job file policy: generated inputs are removed unless
/// `PERSIST_INPUTS`, outputs are kept unless `PERSIST_OUTPUTS=false`,
/// and canceled jobs never leave partial outputs behind.
fn cleanup_files(work_dir: &Path, job: &Job, generated_input: Option<&Path>, canceled: bool) {
    if let Some(input) = generated_input {
        if !config::persist_inputs() {
            let _ = std::fs::remove_file(input);
        }
    }

    if canceled || !config::persist_outputs() {
        remove_outputs(work_dir, &job.id.to_string());
    }
}

/// Deletes files matching `job_<id>_output.*` in the work directory.
pub fn remove_outputs(work_dir: &Path, job_id: &str) {
    let prefix = format!("job_{job_id}_output.");
    let Ok(entries) = std::fs::read_dir(work_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(&prefix) {
            if let Err(err) = std::fs::remove_file(entry.path()) {
                warn!("could not remove partial output {:?}: {err}", entry.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use ffrtmp_common::model::{EnginePreference, JobId, JobPriority, QueueType, TenantId};
    use std::time::Instant;
    use tempfile::TempDir;

    fn job_with_parameters(parameters: HashMap<String, serde_json::Value>) -> Job {
        Job {
            id: JobId::new_v4(),
            tenant_id: TenantId::default(),
            scenario: "h264-720p".to_string(),
            parameters,
            wrapper_constraints: None,
            priority: JobPriority::Medium,
            queue: QueueType::Default,
            engine: EnginePreference::Auto,
            requires_gpu: false,
            status: JobStatus::Assigned,
            cancel_requested: false,
            assigned_node_id: None,
            retry_count: 0,
            max_retries: 3,
            created_at: chrono::Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            sla_target_seconds: None,
            result: None,
        }
    }

    #[test]
    fn bandwidth_formula() {
        // 1 MiB in + 1 MiB out over 2 seconds = 8 Mbit / 2 s.
        let mbps = bandwidth_mbps(1024 * 1024, 1024 * 1024, 2.0);
        assert!((mbps - 8.0).abs() < 1e-9);
        assert_eq!(bandwidth_mbps(1, 1, 0.0), 0.0);
    }

    #[test]
    fn legacy_resource_limits_mapping() {
        let mut parameters = HashMap::new();
        parameters.insert(
            "resource_limits".to_string(),
            serde_json::json!({
                "max_cpu_percent": 150,
                "max_memory_mb": 512,
                "timeout_sec": 30
            }),
        );
        let job = job_with_parameters(parameters);

        let constraints = build_constraints(&job);
        assert_eq!(constraints.cpu_quota_percent, Some(150));
        assert_eq!(constraints.memory_limit_mb, Some(512));
    }

    #[test]
    fn explicit_constraints_win_over_legacy() {
        let mut parameters = HashMap::new();
        parameters.insert(
            "resource_limits".to_string(),
            serde_json::json!({"max_cpu_percent": 10}),
        );
        let mut job = job_with_parameters(parameters);
        job.wrapper_constraints = Some(WrapperConstraints {
            cpu_max_percent: Some(80),
            ..WrapperConstraints::default()
        });

        let constraints = build_constraints(&job);
        assert_eq!(constraints.cpu_quota_percent, Some(80));
    }

    #[test]
    fn output_pattern_cleanup_is_scoped_to_the_job() {
        let dir = TempDir::new().unwrap();
        let keep = dir.path().join("job_other_output.mp4");
        let remove_a = dir.path().join("job_abc_output.mp4");
        let remove_b = dir.path().join("job_abc_output.partial");
        for path in [&keep, &remove_a, &remove_b] {
            std::fs::write(path, b"x").unwrap();
        }

        remove_outputs(dir.path(), "abc");
        assert!(keep.exists());
        assert!(!remove_a.exists());
        assert!(!remove_b.exists());
    }

    #[test]
    fn stderr_tail_is_bounded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stderr.log");
        std::fs::write(&path, vec![b'a'; 10_000]).unwrap();

        let tail = stderr_tail(&path).unwrap();
        assert_eq!(tail.len(), STDERR_TAIL_BYTES);

        assert_eq!(stderr_tail(&dir.path().join("missing.log")), None);
    }

    #[test]
    async fn graceful_cancellation_terminates_the_group() {
        let supervisor = Supervisor::default();
        let workload = supervisor
            .run(
                WorkloadMetadata::new("cancel-test", false, WorkloadIntent::Test),
                Constraints::default(),
                WorkloadSpec::new("/bin/sleep", vec!["60".to_string()]),
            )
            .await
            .unwrap();

        let polls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let polls_in_probe = polls.clone();
        let start = Instant::now();
        let (report, canceled, forceful) = supervise_with_cancellation(
            workload,
            move || {
                let polls = polls_in_probe.clone();
                async move {
                    polls.fetch_add(1, Ordering::SeqCst);
                    true
                }
            },
            CancellationToken::new(),
        )
        .await;

        assert!(canceled);
        assert!(polls.load(Ordering::SeqCst) >= 1);
        // sleep exits on SIGTERM, no SIGKILL escalation.
        assert!(!forceful);
        assert_eq!(report.exit_reason, ExitReason::Signal);
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[test]
    async fn shutdown_token_cancels_in_flight_work() {
        let supervisor = Supervisor::default();
        let workload = supervisor
            .run(
                WorkloadMetadata::new("shutdown-test", false, WorkloadIntent::Test),
                Constraints::default(),
                WorkloadSpec::new("/bin/sleep", vec!["60".to_string()]),
            )
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let (report, canceled, _) =
            supervise_with_cancellation(workload, || async { false }, shutdown).await;

        assert!(canceled);
        assert_eq!(report.exit_reason, ExitReason::Signal);
    }
}
