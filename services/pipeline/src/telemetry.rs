//! Trace propagation, span helpers and telemetry setup.
//!
//! One storage notification produces a single connected trace across the
//! router, the tier stream and the worker. The trace context travels in
//! message headers using the W3C `traceparent`/`tracestate` encoding and is
//! held in a task-local while an operation runs.
//!
//! [`with_span`] wraps an operation in exactly one `tracing` span, tags it
//! with `status = "success"` or `status = "error"` and records the error on
//! the span before returning it.

use crate::config::TelemetryConfig;
use crate::transport::Headers;
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::fmt::Display;
use std::future::Future;
use tracing::{field, Instrument};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";

tokio::task_local! {
    static CURRENT: TraceContext;
}

/// W3C trace context of the operation currently running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// 32 lowercase hex characters
    pub trace_id: String,
    /// 16 lowercase hex characters
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub sampled: bool,
    pub trace_state: Option<String>,
}

fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn new_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

fn is_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_hexdigit())
}

impl TraceContext {
    /// Start a new trace
    pub fn new_root() -> Self {
        Self {
            trace_id: new_trace_id(),
            span_id: new_span_id(),
            parent_span_id: None,
            sampled: true,
            trace_state: None,
        }
    }

    /// A new span in the same trace, parented on this one
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            parent_span_id: Some(self.span_id.clone()),
            sampled: self.sampled,
            trace_state: self.trace_state.clone(),
        }
    }

    pub fn to_traceparent(&self) -> String {
        format!(
            "00-{}-{}-{}",
            self.trace_id,
            self.span_id,
            if self.sampled { "01" } else { "00" }
        )
    }

    /// Parse a `traceparent` header. All-zero ids are invalid.
    pub fn from_traceparent(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let (version, trace_id, span_id, flags) =
            (parts.next()?, parts.next()?, parts.next()?, parts.next()?);

        if !is_hex(version, 2) || version == "ff" || !is_hex(flags, 2) {
            return None;
        }
        if version == "00" && parts.next().is_some() {
            return None;
        }
        if !is_hex(trace_id, 32) || trace_id.bytes().all(|b| b == b'0') {
            return None;
        }
        if !is_hex(span_id, 16) || span_id.bytes().all(|b| b == b'0') {
            return None;
        }
        let flags = u8::from_str_radix(flags, 16).ok()?;

        Some(Self {
            trace_id: trace_id.to_ascii_lowercase(),
            span_id: span_id.to_ascii_lowercase(),
            parent_span_id: None,
            sampled: flags & 0x01 == 0x01,
            trace_state: None,
        })
    }

    /// The context of the operation running on this task, if any
    pub fn current() -> Option<Self> {
        CURRENT.try_with(|ctx| ctx.clone()).ok()
    }
}

/// Write the current trace context into `headers`. Returns false when no
/// operation is in progress on this task.
pub fn inject_trace_context(headers: &mut Headers) -> bool {
    let Some(ctx) = TraceContext::current() else {
        return false;
    };
    headers.insert(TRACEPARENT_HEADER.to_string(), ctx.to_traceparent());
    if let Some(state) = ctx.trace_state {
        headers.insert(TRACESTATE_HEADER.to_string(), state);
    }
    true
}

/// Read a propagated trace context from message headers
pub fn extract_trace_context(headers: &Headers) -> Option<TraceContext> {
    let mut ctx = TraceContext::from_traceparent(headers.get(TRACEPARENT_HEADER)?)?;
    ctx.trace_state = headers
        .get(TRACESTATE_HEADER)
        .filter(|s| !s.is_empty())
        .cloned();
    Some(ctx)
}

fn format_attributes(attributes: &[(&str, String)]) -> String {
    attributes
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Run `operation` inside one span.
///
/// The span is a child of `parent` when given, else of the task's current
/// context, else the root of a new trace.
pub async fn with_span<T, E, F>(
    name: &'static str,
    parent: Option<TraceContext>,
    attributes: &[(&str, String)],
    operation: F,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    let ctx = match parent.or_else(TraceContext::current) {
        Some(parent) => parent.child(),
        None => TraceContext::new_root(),
    };

    let span = tracing::info_span!(
        "operation",
        otel.name = name,
        trace_id = %ctx.trace_id,
        span_id = %ctx.span_id,
        parent_span_id = ctx.parent_span_id.as_deref().unwrap_or(""),
        attributes = %format_attributes(attributes),
        status = field::Empty,
        error = field::Empty,
    );

    let result = CURRENT
        .scope(ctx, operation.instrument(span.clone()))
        .await;

    match &result {
        Ok(_) => {
            span.record("status", "success");
        }
        Err(e) => {
            span.record("status", "error");
            span.record("error", field::display(e));
            span.in_scope(|| tracing::warn!(operation = name, error = %e, "Operation failed"));
        }
    }
    result
}

/// Resume the trace carried in `headers` and run `operation` in a child span
pub async fn continue_trace<T, E, F>(
    headers: &Headers,
    name: &'static str,
    attributes: &[(&str, String)],
    operation: F,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    with_span(name, extract_trace_context(headers), attributes, operation).await
}

/// Initialize the global tracing subscriber
pub fn init_tracing(config: &TelemetryConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.log_format.eq_ignore_ascii_case("pretty") {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Install the Prometheus exporter and describe the pipeline metrics
pub fn init_metrics(port: u16) -> Result<(), metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()?;

    describe_metrics();
    tracing::info!(port = port, "Prometheus metrics exporter started");
    Ok(())
}

fn describe_metrics() {
    describe_counter!("router.messages.routed", "Events published to a tier subject");
    describe_counter!("router.messages.rejected", "Events acknowledged without routing");
    describe_counter!("router.errors", "Unexpected failures in the routing loop");
    describe_histogram!(
        "router.routing.duration",
        Unit::Seconds,
        "Time to parse, classify and republish one event"
    );
    describe_gauge!("router.consecutive_errors", "Consecutive routing loop failures");

    describe_counter!("worker.files.processed", "Events processed by tier workers");
    describe_counter!("worker.processing.errors", "Failed processing attempts");
    describe_counter!("worker.dead_letter", "Events that exhausted their deliveries");
    describe_counter!("worker.events.skipped", "Events acknowledged without side effects");
    describe_counter!(
        "worker.events.foreign_tenant",
        "Events processed by a worker scoped to another tenant"
    );
    describe_histogram!(
        "worker.processing.duration",
        Unit::Seconds,
        "Time to process one event"
    );
    describe_histogram!(
        "worker.file_size.processed",
        Unit::Bytes,
        "Size of processed files"
    );
    describe_gauge!("worker.running", "Whether the tier worker loop is running");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traceparent_roundtrip() {
        let ctx = TraceContext::new_root();
        assert_eq!(ctx.trace_id.len(), 32);
        assert_eq!(ctx.span_id.len(), 16);

        let parsed = TraceContext::from_traceparent(&ctx.to_traceparent()).unwrap();
        assert_eq!(parsed.trace_id, ctx.trace_id);
        assert_eq!(parsed.span_id, ctx.span_id);
        assert!(parsed.sampled);
    }

    #[test]
    fn test_invalid_traceparent() {
        for value in [
            "",
            "00-abc-def-01",
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01",
            "ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra",
        ] {
            assert!(TraceContext::from_traceparent(value).is_none(), "{}", value);
        }
    }

    #[test]
    fn test_extract_with_tracestate() {
        let headers = Headers::from([
            (
                TRACEPARENT_HEADER.to_string(),
                "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00".to_string(),
            ),
            (TRACESTATE_HEADER.to_string(), "vendor=value".to_string()),
        ]);
        let ctx = extract_trace_context(&headers).unwrap();
        assert_eq!(ctx.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert!(!ctx.sampled);
        assert_eq!(ctx.trace_state.as_deref(), Some("vendor=value"));
    }

    #[test]
    fn test_inject_outside_operation() {
        let mut headers = Headers::new();
        assert!(!inject_trace_context(&mut headers));
        assert!(headers.is_empty());
    }

    #[tokio::test]
    async fn test_with_span_propagates_across_hops() {
        let mut headers = Headers::new();
        let outer: Result<TraceContext, String> = with_span("route", None, &[], async {
            inject_trace_context(&mut headers);
            TraceContext::current().ok_or_else(|| "no context".to_string())
        })
        .await;
        let outer = outer.unwrap();
        assert!(headers.contains_key(TRACEPARENT_HEADER));

        let inner: Result<TraceContext, String> =
            continue_trace(&headers, "process", &[("queue", "small".to_string())], async {
                TraceContext::current().ok_or_else(|| "no context".to_string())
            })
            .await;
        let inner = inner.unwrap();

        assert_eq!(inner.trace_id, outer.trace_id);
        assert_eq!(inner.parent_span_id.as_deref(), Some(outer.span_id.as_str()));
        assert_ne!(inner.span_id, outer.span_id);
    }

    #[tokio::test]
    async fn test_with_span_returns_error() {
        let result: Result<(), String> =
            with_span("fail", None, &[], async { Err("boom".to_string()) }).await;
        assert_eq!(result, Err("boom".to_string()));
        assert!(TraceContext::current().is_none());
    }
}
