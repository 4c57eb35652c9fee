use crate::repo::StoreAggregates;
use ffrtmp_common::metrics::{seed_int_counter_vec, seed_int_gauge_vec, DEFAULT_TIME_BUCKETS};
use ffrtmp_common::model::{JobPriority, JobStatus, NodeStatus, QueueType};
use poem::http::header::CONTENT_LENGTH;
use poem::{Endpoint, IntoResponse, Middleware, Request, Response, Result};
use prometheus::{
    register_gauge, register_histogram, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Gauge, Histogram, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::sync::LazyLock;
use std::time::Instant;

static START: LazyLock<Instant> = LazyLock::new(Instant::now);

static JOBS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ffrtmp_jobs_total",
        "Number of job state transitions",
        &["state"]
    )
    .unwrap()
});

static ACTIVE_JOBS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("ffrtmp_active_jobs", "Jobs currently assigned or running").unwrap()
});

static QUEUE_LENGTH: LazyLock<IntGauge> =
    LazyLock::new(|| register_int_gauge!("ffrtmp_queue_length", "Jobs in the queued state").unwrap());

static QUEUE_BY_PRIORITY: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "ffrtmp_queue_by_priority",
        "Queued jobs by priority",
        &["priority"]
    )
    .unwrap()
});

static QUEUE_BY_TYPE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "ffrtmp_queue_by_type",
        "Queued jobs by queue class",
        &["queue"]
    )
    .unwrap()
});

static NODES_BY_STATUS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "ffrtmp_nodes_by_status",
        "Registered nodes by status",
        &["status"]
    )
    .unwrap()
});

static NODES_TOTAL: LazyLock<IntGauge> =
    LazyLock::new(|| register_int_gauge!("ffrtmp_nodes_total", "Registered nodes").unwrap());

static JOB_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "ffrtmp_job_duration_seconds",
        "Wall-clock duration of completed jobs",
        DEFAULT_TIME_BUCKETS.to_vec()
    )
    .unwrap()
});

static SCHEDULE_ATTEMPTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ffrtmp_schedule_attempts_total",
        "Outcomes of claim_next_job calls",
        &["result"]
    )
    .unwrap()
});

static UPTIME: LazyLock<Gauge> = LazyLock::new(|| {
    register_gauge!(
        "ffrtmp_master_uptime_seconds",
        "Seconds since master startup"
    )
    .unwrap()
});

static HTTP_BYTES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ffrtmp_http_bytes_total",
        "HTTP payload bytes by direction",
        &["direction"]
    )
    .unwrap()
});

/// Emits zero values for every enumerated label so dashboards never see
/// gaps.
pub fn seed() {
    let _ = *START;

    for status in JobStatus::ALL {
        seed_int_counter_vec(&JOBS_TOTAL, &[&[&status.to_string()]]);
    }
    for priority in JobPriority::ALL {
        seed_int_gauge_vec(&QUEUE_BY_PRIORITY, &[&[&priority.to_string()]]);
    }
    for queue in QueueType::ALL {
        seed_int_gauge_vec(&QUEUE_BY_TYPE, &[&[&queue.to_string()]]);
    }
    for status in NodeStatus::ALL {
        seed_int_gauge_vec(&NODES_BY_STATUS, &[&[&status.to_string()]]);
    }
    seed_int_counter_vec(
        &SCHEDULE_ATTEMPTS,
        &[&["assigned"], &["no_job"], &["error"]],
    );
    seed_int_counter_vec(&HTTP_BYTES, &[&["in"], &["out"]]);
}

pub fn record_job_state(status: JobStatus) {
    JOBS_TOTAL.with_label_values(&[&status.to_string()]).inc();
}

pub fn record_job_duration(seconds: f64) {
    JOB_DURATION.observe(seconds);
}

pub fn record_schedule_attempt(result: &str) {
    SCHEDULE_ATTEMPTS.with_label_values(&[result]).inc();
}

pub fn record_uptime() {
    UPTIME.set(START.elapsed().as_secs_f64());
}

/// Pushes fresh store aggregates into the gauges; absent labels are
/// explicitly zeroed.
pub fn update_aggregates(aggregates: &StoreAggregates) {
    let count = |map: &std::collections::HashMap<JobStatus, i64>, status: JobStatus| {
        map.get(&status).copied().unwrap_or(0)
    };

    ACTIVE_JOBS.set(
        count(&aggregates.jobs_by_status, JobStatus::Assigned)
            + count(&aggregates.jobs_by_status, JobStatus::Running),
    );
    QUEUE_LENGTH.set(count(&aggregates.jobs_by_status, JobStatus::Queued));

    for priority in JobPriority::ALL {
        QUEUE_BY_PRIORITY
            .with_label_values(&[&priority.to_string()])
            .set(
                aggregates
                    .queued_by_priority
                    .get(&priority)
                    .copied()
                    .unwrap_or(0),
            );
    }
    for queue in QueueType::ALL {
        QUEUE_BY_TYPE.with_label_values(&[&queue.to_string()]).set(
            aggregates
                .queued_by_queue
                .get(&queue)
                .copied()
                .unwrap_or(0),
        );
    }
    for status in NodeStatus::ALL {
        NODES_BY_STATUS
            .with_label_values(&[&status.to_string()])
            .set(
                aggregates
                    .nodes_by_status
                    .get(&status)
                    .copied()
                    .unwrap_or(0),
            );
    }
    NODES_TOTAL.set(aggregates.nodes_total);
}

/// Counts request and response payload bytes into
/// `ffrtmp_http_bytes_total{direction}`.
pub struct BandwidthMiddleware;

impl<E: Endpoint> Middleware<E> for BandwidthMiddleware {
    type Output = BandwidthMiddlewareImpl<E>;

    fn transform(&self, ep: E) -> Self::Output {
        BandwidthMiddlewareImpl(ep)
    }
}

pub struct BandwidthMiddlewareImpl<E>(E);

fn content_length(headers: &poem::http::HeaderMap) -> u64 {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

impl<E: Endpoint> Endpoint for BandwidthMiddlewareImpl<E> {
    type Output = Response;

    async fn call(&self, req: Request) -> Result<Self::Output> {
        HTTP_BYTES
            .with_label_values(&["in"])
            .inc_by(content_length(req.headers()));

        let response = self.0.call(req).await?.into_response();

        HTTP_BYTES
            .with_label_values(&["out"])
            .inc_by(content_length(response.headers()));
        Ok(response)
    }
}
