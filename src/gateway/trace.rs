use uuid::Uuid;

/// Trace and span id stamped on usage records and responses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
}

impl TraceContext {
    /// Continues the caller's W3C `traceparent` when it is well formed,
    /// otherwise starts a new trace. The span id is always fresh.
    pub fn from_traceparent(traceparent: Option<&str>) -> Self {
        let trace_id = traceparent
            .and_then(parse_trace_id)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        Self {
            trace_id,
            span_id: new_span_id(),
        }
    }

    /// Ids of the active OpenTelemetry span when one is recording (with
    /// the `otel` feature), otherwise [`Self::from_traceparent`].
    pub fn for_request(traceparent: Option<&str>) -> Self {
        #[cfg(feature = "otel")]
        if let Some(current) = Self::from_current_span() {
            return current;
        }
        Self::from_traceparent(traceparent)
    }

    #[cfg(feature = "otel")]
    fn from_current_span() -> Option<Self> {
        use opentelemetry::trace::TraceContextExt as _;
        use tracing_opentelemetry::OpenTelemetrySpanExt as _;

        let context = tracing::Span::current().context();
        let span = context.span();
        let span_context = span.span_context();
        span_context.is_valid().then(|| Self {
            trace_id: span_context.trace_id().to_string(),
            span_id: span_context.span_id().to_string(),
        })
    }

    pub fn generate() -> Self {
        Self::from_traceparent(None)
    }

    pub fn traceparent(&self) -> String {
        format!("00-{}-{}-01", self.trace_id, self.span_id)
    }
}

fn new_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

fn parse_trace_id(traceparent: &str) -> Option<String> {
    parse_traceparent(traceparent).map(|(trace_id, _)| trace_id)
}

/// `(trace_id, parent_span_id)` of a well-formed W3C `traceparent`.
pub(crate) fn parse_traceparent(traceparent: &str) -> Option<(String, String)> {
    let mut parts = traceparent.trim().split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let parent_id = parts.next()?;
    let flags = parts.next()?;

    let is_hex = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit());
    if !is_hex(version, 2) || version == "ff" || !is_hex(parent_id, 16) || !is_hex(flags, 2) {
        return None;
    }
    if !is_hex(trace_id, 32) || trace_id.bytes().all(|b| b == b'0') {
        return None;
    }
    Some((trace_id.to_ascii_lowercase(), parent_id.to_ascii_lowercase()))
}

/// Span wrapping one gateway request. With the `otel` feature a valid
/// `traceparent` becomes its remote parent.
pub(crate) fn request_span(request_id: &str, traceparent: Option<&str>) -> tracing::Span {
    let span = tracing::info_span!("gateway.request", request_id = %request_id);
    #[cfg(feature = "otel")]
    if let Some((trace_id, parent_id)) = traceparent.and_then(parse_traceparent) {
        use opentelemetry::trace::{
            SpanContext, SpanId, TraceContextExt as _, TraceFlags, TraceId, TraceState,
        };
        use tracing_opentelemetry::OpenTelemetrySpanExt as _;

        if let (Ok(trace_id), Ok(span_id)) =
            (TraceId::from_hex(&trace_id), SpanId::from_hex(&parent_id))
        {
            let remote = SpanContext::new(
                trace_id,
                span_id,
                TraceFlags::SAMPLED,
                true,
                TraceState::default(),
            );
            let _ = span.set_parent(opentelemetry::Context::new().with_remote_span_context(remote));
        }
    }
    #[cfg(not(feature = "otel"))]
    let _ = traceparent;
    span
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continues_valid_traceparent() {
        let ctx = TraceContext::from_traceparent(Some(
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        ));
        assert_eq!(ctx.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(ctx.span_id.len(), 16);
        assert_ne!(ctx.span_id, "00f067aa0ba902b7");
    }

    #[test]
    fn malformed_traceparent_starts_a_new_trace() {
        for raw in [
            "garbage",
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e473-00f067aa0ba902b7-01",
        ] {
            let ctx = TraceContext::from_traceparent(Some(raw));
            assert_eq!(ctx.trace_id.len(), 32);
            assert_ne!(ctx.trace_id, "00000000000000000000000000000000");
        }
        assert!(TraceContext::generate().traceparent().starts_with("00-"));
    }

    #[test]
    fn request_context_without_span_uses_traceparent() {
        let ctx = TraceContext::for_request(Some(
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        ));
        assert_eq!(ctx.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(
            parse_traceparent("00-4BF92F3577B34DA6A3CE929D0E0E4736-00F067AA0BA902B7-01"),
            Some((
                "4bf92f3577b34da6a3ce929d0e0e4736".to_string(),
                "00f067aa0ba902b7".to_string()
            ))
        );
    }

    #[cfg(feature = "otel")]
    #[test]
    fn active_otel_span_supplies_ids() {
        use opentelemetry::trace::{TraceContextExt as _, TracerProvider as _};
        use tracing_opentelemetry::OpenTelemetrySpanExt as _;
        use tracing_subscriber::layer::SubscriberExt as _;

        let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder().build();
        let subscriber = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("test")));

        tracing::subscriber::with_default(subscriber, || {
            let span = request_span(
                "req-1",
                Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"),
            );
            let _entered = span.enter();

            let ctx = TraceContext::for_request(None);
            let context = tracing::Span::current().context();
            let otel_span = context.span();
            let expected = otel_span.span_context();
            assert_eq!(ctx.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
            assert_eq!(ctx.trace_id, expected.trace_id().to_string());
            assert_eq!(ctx.span_id, expected.span_id().to_string());
            assert_ne!(ctx.span_id, "00f067aa0ba902b7");
        });
    }
}
