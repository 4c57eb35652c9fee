use crate::encoders::EncoderAvailability;
use ffrtmp_common::metrics::seed_int_counter_vec;
use ffrtmp_common::model::JobStatus;
use poem::endpoint::PrometheusExporter;
use poem::listener::Listener;
use poem::Route;
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::sync::LazyLock;
use std::time::Duration;
use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const RESOURCE_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

static CPU_PERCENT: LazyLock<Gauge> = LazyLock::new(|| {
    register_gauge!("ffrtmp_worker_cpu_percent", "Host CPU utilization").unwrap()
});

static MEMORY_BYTES: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("ffrtmp_worker_memory_bytes", "Host memory in use").unwrap()
});

static ACTIVE_JOBS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("ffrtmp_worker_active_jobs", "Jobs executing on this worker").unwrap()
});

static HEARTBEATS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "ffrtmp_worker_heartbeats_total",
        "Heartbeats sent to the master"
    )
    .unwrap()
});

static JOBS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ffrtmp_worker_jobs_total",
        "Jobs finished on this worker by terminal status",
        &["status"]
    )
    .unwrap()
});

static JOB_BANDWIDTH: LazyLock<Gauge> = LazyLock::new(|| {
    register_gauge!(
        "ffrtmp_worker_job_bandwidth_mbps",
        "Bandwidth of the most recently finished job"
    )
    .unwrap()
});

static SLA_JOBS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ffrtmp_worker_sla_jobs_total",
        "SLA-tracked jobs by outcome",
        &["met"]
    )
    .unwrap()
});

static CANCELLATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ffrtmp_worker_cancellations_total",
        "Job cancellations by termination kind",
        &["kind"]
    )
    .unwrap()
});

static ENCODER_AVAILABLE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "ffrtmp_worker_encoder_available",
        "Installed transcoder engines",
        &["engine"]
    )
    .unwrap()
});

pub fn seed() {
    for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::Canceled] {
        seed_int_counter_vec(&JOBS_TOTAL, &[&[&status.to_string()]]);
    }
    seed_int_counter_vec(&SLA_JOBS, &[&["true"], &["false"]]);
    seed_int_counter_vec(&CANCELLATIONS, &[&["graceful"], &["forceful"]]);
}

pub fn record_encoder_availability(availability: EncoderAvailability) {
    ENCODER_AVAILABLE
        .with_label_values(&["ffmpeg"])
        .set(availability.ffmpeg as i64);
    ENCODER_AVAILABLE
        .with_label_values(&["gstreamer"])
        .set(availability.gstreamer as i64);
}

pub fn record_heartbeat() {
    HEARTBEATS.inc();
}

pub fn set_active_jobs(count: i64) {
    ACTIVE_JOBS.set(count);
}

pub fn record_job_finished(status: JobStatus, bandwidth_mbps: f64, sla_met: Option<bool>) {
    JOBS_TOTAL.with_label_values(&[&status.to_string()]).inc();
    JOB_BANDWIDTH.set(bandwidth_mbps);
    if let Some(met) = sla_met {
        SLA_JOBS
            .with_label_values(&[if met { "true" } else { "false" }])
            .inc();
    }
}

pub fn record_cancellation(forceful: bool) {
    CANCELLATIONS
        .with_label_values(&[if forceful { "forceful" } else { "graceful" }])
        .inc();
}

/// Serves `/metrics` (and a trivial `/healthz`) on the configured port
/// and keeps host resource gauges fresh until shutdown.
pub async fn serve(port: u16, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
    seed();

    let sampler_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut system = System::new();
        loop {
            tokio::select! {
                _ = sampler_shutdown.cancelled() => break,
                _ = tokio::time::sleep(RESOURCE_SAMPLE_INTERVAL) => {
                    system.refresh_cpu();
                    system.refresh_memory();
                    CPU_PERCENT.set(system.global_cpu_info().cpu_usage() as f64);
                    MEMORY_BYTES.set(system.used_memory() as i64);
                }
            }
        }
    });

    if port == 0 {
        info!("worker metrics endpoint disabled");
        shutdown.cancelled().await;
        return Ok(());
    }

    let app = Route::new()
        .nest(
            "/metrics",
            PrometheusExporter::new(prometheus::default_registry().clone()),
        )
        .at("/healthz", poem::endpoint::make_sync(|_| "ok"));

    let listener = poem::listener::TcpListener::bind(format!("0.0.0.0:{port}"));
    let acceptor = listener.into_acceptor().await?;
    info!("worker metrics on port {port}");

    if let Err(err) = poem::Server::new_with_acceptor(acceptor)
        .run_with_graceful_shutdown(app, shutdown.cancelled(), None)
        .await
    {
        warn!("metrics server failed: {err}");
    }
    Ok(())
}
