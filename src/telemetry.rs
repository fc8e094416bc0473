//! Trace-context lookup.
//!
//! The recorder only needs four things from a tracing system: is there a
//! current span, is it recording, what are its ids, and mark it as errored.
//! [`TraceHook`] is that capability. The default implementation reads the
//! current OpenTelemetry context.
//!
//! Scenario tasks open their spans through [`child_context`] on the global
//! tracer. [`init_from_env`] installs an always-sampling SDK provider so
//! those spans record and their ids land on outcome records; exporters are
//! not configured here.

use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::{self as sdktrace, Sampler, TracerProvider};
use opentelemetry_sdk::Resource;
use parking_lot::RwLock;
use std::borrow::Cow;
use std::error::Error;
use std::sync::Arc;

/// Instrumentation scope and `service.name` of every span opened here
pub const TRACER_NAME: &str = "tcp-harness";

/// Trace and span ids as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceIds {
    pub trace_id: String,
    pub span_id: String,
}

/// A handle on the span that is current when a record is finished.
pub trait SpanProbe {
    fn is_recording(&self) -> bool;

    fn ids(&self) -> TraceIds;

    fn mark_error(&self, error: &(dyn Error + 'static));
}

/// Looks up the current span, if any.
pub trait TraceHook: Send + Sync {
    fn current_span(&self) -> Option<Box<dyn SpanProbe>>;
}

/// Never reports a span.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTraceHook;

impl TraceHook for NoopTraceHook {
    fn current_span(&self) -> Option<Box<dyn SpanProbe>> {
        None
    }
}

/// Reads `opentelemetry::Context::current()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OtelTraceHook;

impl TraceHook for OtelTraceHook {
    fn current_span(&self) -> Option<Box<dyn SpanProbe>> {
        let cx = Context::current();
        if !cx.has_active_span() {
            return None;
        }
        Some(Box::new(OtelSpan(cx)))
    }
}

struct OtelSpan(Context);

impl SpanProbe for OtelSpan {
    fn is_recording(&self) -> bool {
        self.0.span().is_recording()
    }

    fn ids(&self) -> TraceIds {
        let span = self.0.span();
        let sc = span.span_context();
        TraceIds {
            trace_id: sc.trace_id().to_string(),
            span_id: sc.span_id().to_string(),
        }
    }

    fn mark_error(&self, error: &(dyn Error + 'static)) {
        let span = self.0.span();
        span.record_error(error);
        span.set_status(Status::error(error.to_string()));
    }
}

static HOOK: RwLock<Option<Arc<dyn TraceHook>>> = parking_lot::const_rwlock(None);

/// Install the process-wide hook used by recorders that were not given one.
pub fn install(hook: Arc<dyn TraceHook>) {
    *HOOK.write() = Some(hook);
}

/// Drop the installed hook and fall back to [`OtelTraceHook`].
pub fn reset() {
    *HOOK.write() = None;
}

/// The process-wide hook.
pub fn current() -> Arc<dyn TraceHook> {
    HOOK.read()
        .clone()
        .unwrap_or_else(|| Arc::new(OtelTraceHook))
}

/// The tracer task and step spans are started from.
pub fn tracer() -> BoxedTracer {
    global::tracer(TRACER_NAME)
}

/// Start a span called `name` under `parent` and return the context
/// carrying it. The caller ends the span.
pub fn child_context(parent: &Context, name: impl Into<Cow<'static, str>>) -> Context {
    let span = tracer().start_with_context(name, parent);
    parent.with_span(span)
}

/// Set up tracing from the environment.
///
/// `OTEL_SDK_DISABLED=true` turns trace lookup off entirely and leaves the
/// global tracer a no-op.
pub fn init_from_env() {
    let disabled = std::env::var("OTEL_SDK_DISABLED")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if disabled {
        install(Arc::new(NoopTraceHook));
        return;
    }

    global::set_tracer_provider(build_tracer_provider());
    install(Arc::new(OtelTraceHook));
}

/// Flush and drop the global provider.
pub fn shutdown() {
    global::shutdown_tracer_provider();
}

fn build_tracer_provider() -> TracerProvider {
    TracerProvider::builder()
        .with_config(
            sdktrace::config()
                .with_sampler(Sampler::AlwaysOn)
                .with_resource(Resource::new([KeyValue::new("service.name", TRACER_NAME)])),
        )
        .build()
}


#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::TracerProvider as _;
    use std::io;

    #[test]
    fn test_otel_without_span() {
        // No provider, no span: nothing to attach.
        assert!(OtelTraceHook.current_span().is_none());
        assert!(NoopTraceHook.current_span().is_none());
    }

    #[test]
    fn test_remote_span_context_is_not_recording() {
        use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};

        let sc = SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        let _guard = Context::new().with_remote_span_context(sc).attach();

        let span = OtelTraceHook.current_span().expect("span context attached");
        assert!(!span.is_recording());
        let ids = span.ids();
        assert_eq!(ids.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(ids.span_id, "00f067aa0ba902b7");
    }

    #[test]
    fn test_live_span_is_recording_and_marked() {
        let (provider, exporter) = testing::capturing_provider();
        let cx = Context::new().with_span(provider.tracer("telemetry-test").start("step"));
        let expected = cx.span().span_context().clone();

        {
            let _guard = cx.clone().attach();
            let span = OtelTraceHook.current_span().expect("live span attached");
            assert!(span.is_recording());

            let ids = span.ids();
            assert_eq!(ids.trace_id, expected.trace_id().to_string());
            assert_eq!(ids.span_id, expected.span_id().to_string());
            assert_eq!(ids.trace_id.len(), 32);
            assert_eq!(ids.span_id.len(), 16);

            span.mark_error(&io::Error::new(io::ErrorKind::Other, "boom"));
        }
        cx.span().end();
        provider.force_flush();

        let spans = exporter.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "step");
        match &spans[0].status {
            Status::Error { description } => assert!(description.contains("boom")),
            other => panic!("unexpected status: {other:?}"),
        }
    }
}
