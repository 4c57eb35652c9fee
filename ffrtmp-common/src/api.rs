use crate::metrics::DEFAULT_TIME_BUCKETS;
use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};
use std::sync::LazyLock;
use std::time::Instant;
use tracing::Span;

/// Classifies API error responses for metrics and request logs.
pub trait TraceErrorKind {
    fn trace_error_kind(&self) -> &'static str;

    /// Expected errors (client mistakes) are logged at `info`,
    /// unexpected ones at `error`.
    fn is_expected(&self) -> bool;
}

static HTTP_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ffrtmp_http_requests_total",
        "Number of HTTP API requests",
        &["api", "result"]
    )
    .unwrap()
});

static HTTP_REQUEST_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "ffrtmp_http_request_duration_seconds",
        "HTTP API request duration",
        &["api"],
        DEFAULT_TIME_BUCKETS.to_vec()
    )
    .unwrap()
});

/// A single recorded API request: a span for the handler body plus
/// outcome accounting when the handler finishes.
pub struct RecordedHttpApiRequest {
    pub span: Span,
    api_name: &'static str,
    start: Instant,
}

impl RecordedHttpApiRequest {
    pub fn new(api_name: &'static str, span: Span) -> Self {
        Self {
            span,
            api_name,
            start: Instant::now(),
        }
    }

    pub fn result<T, E: TraceErrorKind>(self, result: Result<T, E>) -> Result<T, E> {
        let elapsed = self.start.elapsed();
        HTTP_REQUEST_DURATION
            .with_label_values(&[self.api_name])
            .observe(elapsed.as_secs_f64());

        match &result {
            Ok(_) => {
                HTTP_REQUESTS_TOTAL
                    .with_label_values(&[self.api_name, "ok"])
                    .inc();
                self.span
                    .in_scope(|| tracing::info!(duration_ms = elapsed.as_millis() as u64, "ok"));
            }
            Err(error) => {
                let kind = error.trace_error_kind();
                HTTP_REQUESTS_TOTAL
                    .with_label_values(&[self.api_name, kind])
                    .inc();
                if error.is_expected() {
                    self.span.in_scope(|| {
                        tracing::info!(duration_ms = elapsed.as_millis() as u64, error = kind, "failed")
                    });
                } else {
                    self.span.in_scope(|| {
                        tracing::error!(duration_ms = elapsed.as_millis() as u64, error = kind, "failed")
                    });
                }
            }
        }

        result
    }
}

#[macro_export]
macro_rules! recorded_http_api_request {
    ($api_name:expr $(, $($tail:tt)*)?) => {
        $crate::api::RecordedHttpApiRequest::new(
            $api_name,
            tracing::info_span!("http_api", api = $api_name $(, $($tail)*)?),
        )
    };
}
