use clap::{Args, Parser, Subcommand};
use ffrtmp_common::tracing::{init_tracing, TracingConfig};
use ffrtmp_wrapper::{
    Constraints, LifecycleReport, OutputMode, Supervisor, WorkloadIntent, WorkloadMetadata,
    WorkloadSpec,
};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::error;

#[derive(Parser)]
#[command(
    name = "ffrtmp-wrapper",
    about = "Applies reversible OS resource constraints to a spawned or running workload"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Spawn a workload in its own process group and govern it
    Run {
        #[command(flatten)]
        common: CommonArgs,

        /// The workload command line, after `--`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Govern an already-running process without restarting it
    Attach {
        #[command(flatten)]
        common: CommonArgs,

        /// Pid of the workload to attach to
        #[arg(long)]
        pid: u32,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Job identifier used for the cgroup name and the report
    #[arg(long, default_value = "adhoc")]
    job_id: String,

    /// Count this workload against the platform SLA
    #[arg(long)]
    sla_eligible: bool,

    /// Workload intent: production, test, experiment or soak
    #[arg(long, default_value = "production")]
    intent: WorkloadIntent,

    /// Cgroup namespace prefix
    #[arg(long, default_value = "ffrtmp")]
    namespace: String,

    /// Print the lifecycle report as JSON on stdout
    #[arg(long)]
    json: bool,

    /// CPU quota as percent of one core (0 = unlimited, >100 spans cores)
    #[arg(long)]
    cpu_max: Option<u32>,

    /// Relative CPU weight, 1..=10000
    #[arg(long)]
    cpu_weight: Option<u32>,

    /// Memory ceiling in MiB (0 = unlimited)
    #[arg(long)]
    memory_max_mb: Option<u64>,

    /// Best-effort IO weight percent, 0..=100 (cgroup v2 only)
    #[arg(long)]
    io_weight: Option<u32>,

    /// Niceness fallback, -20..=19
    #[arg(long)]
    nice: Option<i32>,

    /// OOM score adjustment, -1000..=1000
    #[arg(long)]
    oom_score_adj: Option<i32>,
}

impl CommonArgs {
    fn constraints(&self) -> Constraints {
        Constraints {
            cpu_quota_percent: self.cpu_max,
            cpu_weight: self.cpu_weight,
            memory_limit_mb: self.memory_max_mb,
            io_weight_percent: self.io_weight,
            nice: self.nice,
            oom_score_adj: self.oom_score_adj,
        }
        .normalized()
    }

    fn metadata(&self) -> WorkloadMetadata {
        WorkloadMetadata::new(&self.job_id, self.sla_eligible, self.intent)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing(&TracingConfig::default(), "ffrtmp-wrapper");

    let cli = Cli::parse();
    match run(cli).await {
        Ok(report) => {
            if report.workload_succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(report.exit_code.unwrap_or(1).clamp(1, 255) as u8)
            }
        }
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<LifecycleReport> {
    let report = match cli.command {
        Command::Run { common, command } => {
            let supervisor = Supervisor::new(&common.namespace);
            let mut spec = WorkloadSpec::new(command[0].clone(), command[1..].to_vec());
            spec.stdout = OutputMode::Inherit;
            spec.stderr = OutputMode::Inherit;

            let workload = supervisor
                .run(common.metadata(), common.constraints(), spec)
                .await?;
            let report = workload.wait().await;
            emit(&common, &report)?;
            report
        }
        Command::Attach { common, pid } => {
            let supervisor = Supervisor::new(&common.namespace);
            let cancel = CancellationToken::new();

            let ctrl_c_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c_cancel.cancel();
                }
            });

            let report = supervisor
                .attach(common.metadata(), common.constraints(), pid, cancel)
                .await?;
            emit(&common, &report)?;
            report
        }
    };
    Ok(report)
}

fn emit(common: &CommonArgs, report: &LifecycleReport) -> anyhow::Result<()> {
    if common.json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!(
            "job {}: pid {} exited with {:?} ({}) after {:?}, platform SLA compliant: {}",
            report.metadata.job_id,
            report.pid,
            report.exit_code,
            report.exit_reason,
            report.duration,
            report.platform_sla_compliant
        );
    }
    Ok(())
}
