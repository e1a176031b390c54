use std::time::Duration;
use tracing::field::Empty;
use tracing::Span;

/// Opens and closes the per-request span.
pub trait RequestTracer: Send + Sync {
    fn start_span(&self, method: &str, path: &str) -> Span;
    fn end_span(&self, span: &Span, status: u16, duration: Duration);
}

/// [`RequestTracer`] on top of `tracing`. The span is named `request` and
/// carries `otel.name = "METHOD path"` for exporters that honour it.
#[derive(Debug, Clone, Default)]
pub struct SpanTracer;

impl RequestTracer for SpanTracer {
    fn start_span(&self, method: &str, path: &str) -> Span {
        tracing::info_span!(
            "request",
            otel.name = %format_args!("{} {}", method, path),
            otel.kind = "server",
            otel.status_code = Empty,
            http.method = %method,
            http.route = %path,
            http.status_code = Empty,
            http.duration_seconds = Empty,
        )
    }

    fn end_span(&self, span: &Span, status: u16, duration: Duration) {
        span.record("http.status_code", status);
        span.record("http.duration_seconds", duration.as_secs_f64());
        span.record("otel.status_code", if status >= 500 { "ERROR" } else { "OK" });
    }
}
