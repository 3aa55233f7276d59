//! Span linkage engine.
//!
//! There is no ambient, thread-local "current span". Callers hand the active
//! [`Context`] to [`Tracer::start`] explicitly; the span found there becomes the
//! parent of the new span. Historical contexts, such as one decoded from a
//! stored record, are attached as links. Parent and links are kept apart: a
//! span has at most one parent and any number of links, and a link into the
//! span's own trace is recorded like any other.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::ids::{SpanId, TraceId};
use crate::model::span::{LinkRecord, SpanRecord};
use crate::sink::SpanSink;
use crate::traceparent::TraceContext;

/// The active trace context, passed by value through every call chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    span: Option<TraceContext>,
}

impl Context {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Context whose active span lives in another process.
    pub fn remote(span: Option<TraceContext>) -> Self {
        Self { span }
    }

    pub fn span_context(&self) -> Option<&TraceContext> {
        self.span.as_ref()
    }

    pub fn with_span(&self, span: TraceContext) -> Self {
        Self { span: Some(span) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpanKind {
    #[default]
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "INTERNAL",
            Self::Server => "SERVER",
            Self::Client => "CLIENT",
            Self::Producer => "PRODUCER",
            Self::Consumer => "CONSUMER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error {
        message: String,
    },
}

impl SpanStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "UNSET",
            Self::Ok => "OK",
            Self::Error { .. } => "ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpanLink {
    context: TraceContext,
    attributes: BTreeMap<String, Value>,
}

impl SpanLink {
    pub fn new(context: TraceContext) -> Self {
        Self {
            context,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn context(&self) -> &TraceContext {
        &self.context
    }

    fn into_record(self) -> LinkRecord {
        LinkRecord {
            trace_id: self.context.trace_id().to_string(),
            span_id: self.context.span_id().to_string(),
            trace_state: self.context.trace_state().map(|s| s.as_str().to_string()),
            sampled: self.context.is_sampled(),
            attrs_json: to_json(&self.attributes, "{}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct SpanEvent {
    name: String,
    ts: DateTime<Utc>,
    attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct SpanBuilder {
    name: String,
    kind: SpanKind,
    links: Vec<SpanLink>,
    attributes: BTreeMap<String, Value>,
}

impl SpanBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SpanKind::Internal,
            links: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_link(mut self, link: SpanLink) -> Self {
        self.links.push(link);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone)]
pub struct Tracer {
    service: Arc<str>,
    sink: Arc<dyn SpanSink>,
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl Tracer {
    pub fn new(service: impl Into<String>, sink: Arc<dyn SpanSink>) -> Self {
        Self {
            service: Arc::from(service.into()),
            sink,
        }
    }

    /// Starts a span as a child of whatever span `parent` carries.
    pub fn start(&self, parent: &Context, builder: SpanBuilder) -> SpanHandle {
        let (trace_id, parent_span_id, sampled, trace_state) = match parent.span_context() {
            Some(p) => (
                p.trace_id(),
                Some(p.span_id()),
                p.is_sampled(),
                p.trace_state().cloned(),
            ),
            None => (TraceId::random(), None, true, None),
        };

        let context =
            TraceContext::new(trace_id, SpanId::random(), sampled).with_trace_state(trace_state);

        tracing::trace!(
            trace_id = %trace_id,
            span_id = %context.span_id(),
            span_name = %builder.name,
            links = builder.links.len(),
            "span started"
        );

        SpanHandle {
            inner: Some(ActiveSpan {
                context,
                parent_span_id,
                name: builder.name,
                kind: builder.kind,
                start_ts: Utc::now(),
                status: SpanStatus::Unset,
                attributes: builder.attributes,
                events: Vec::new(),
                links: builder.links,
            }),
            service: self.service.clone(),
            sink: self.sink.clone(),
        }
    }
}

struct ActiveSpan {
    context: TraceContext,
    parent_span_id: Option<SpanId>,
    name: String,
    kind: SpanKind,
    start_ts: DateTime<Utc>,
    status: SpanStatus,
    attributes: BTreeMap<String, Value>,
    events: Vec<SpanEvent>,
    links: Vec<SpanLink>,
}

/// A started span. Ending it (explicitly or by drop) exports it exactly once.
pub struct SpanHandle {
    inner: Option<ActiveSpan>,
    service: Arc<str>,
    sink: Arc<dyn SpanSink>,
}

impl SpanHandle {
    pub fn span_context(&self) -> Option<&TraceContext> {
        self.inner.as_ref().map(|s| &s.context)
    }

    /// Context to pass to work nested under this span.
    pub fn context(&self) -> Context {
        Context::remote(self.span_context().cloned())
    }

    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.inner.as_ref().and_then(|s| s.parent_span_id)
    }

    pub fn links(&self) -> &[SpanLink] {
        self.inner.as_ref().map(|s| s.links.as_slice()).unwrap_or(&[])
    }

    pub fn is_recording(&self) -> bool {
        self.inner.as_ref().is_some_and(|s| s.context.is_sampled())
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        if let Some(span) = self.inner.as_mut() {
            span.attributes.insert(key.into(), value.into());
        }
    }

    pub fn add_event(&mut self, name: impl Into<String>, attributes: BTreeMap<String, Value>) {
        if let Some(span) = self.inner.as_mut() {
            span.events.push(SpanEvent {
                name: name.into(),
                ts: Utc::now(),
                attributes,
            });
        }
    }

    pub fn set_status(&mut self, status: SpanStatus) {
        if let Some(span) = self.inner.as_mut() {
            span.status = status;
        }
    }

    /// Records an `exception` event and marks the span as failed.
    pub fn record_error<E>(&mut self, err: &E)
    where
        E: std::error::Error + ?Sized,
    {
        let message = err.to_string();
        let mut attributes = BTreeMap::new();
        attributes.insert(
            "exception.type".to_string(),
            Value::from(std::any::type_name::<E>()),
        );
        attributes.insert("exception.message".to_string(), Value::from(message.clone()));
        self.add_event("exception", attributes);
        self.set_status(SpanStatus::Error { message });
    }

    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        let Some(span) = self.inner.take() else {
            return;
        };
        if !span.context.is_sampled() {
            return;
        }

        let link_count = span.links.len();
        let record = SpanRecord {
            trace_id: span.context.trace_id().to_string(),
            span_id: span.context.span_id().to_string(),
            parent_span_id: span.parent_span_id.map(|id| id.to_string()),
            service: self.service.to_string(),
            name: span.name,
            kind: span.kind.as_str().to_string(),
            start_ts: span.start_ts,
            end_ts: Utc::now(),
            status: span.status.as_str().to_string(),
            status_message: match span.status {
                SpanStatus::Error { message } => Some(message),
                _ => None,
            },
            attrs_json: to_json(&span.attributes, "{}"),
            events_json: to_json(&span.events, "[]"),
            links: span.links.into_iter().map(SpanLink::into_record).collect(),
        };

        tracing::trace!(
            trace_id = %record.trace_id,
            span_id = %record.span_id,
            span_name = %record.name,
            links = link_count,
            duration_ms = record.duration_ms(),
            "span finished"
        );
        self.sink.export(record);
    }
}

impl Drop for SpanHandle {
    fn drop(&mut self) {
        self.finish();
    }
}

fn to_json<T: Serialize>(value: &T, fallback: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::traceparent::decode;

    fn tracer() -> (Tracer, MemorySink) {
        let sink = MemorySink::new();
        (Tracer::new("test", Arc::new(sink.clone())), sink)
    }

    fn stored_context() -> TraceContext {
        decode("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01", None).unwrap()
    }

    #[test]
    fn root_span_starts_new_trace() {
        let (tracer, sink) = tracer();
        let span = tracer.start(&Context::empty(), SpanBuilder::new("root"));
        assert!(span.parent_span_id().is_none());
        assert!(span.is_recording());
        span.end();

        let spans = sink.finished_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].parent_span_id, None);
        assert_eq!(spans[0].kind, "INTERNAL");
        assert!(spans[0].links.is_empty());
    }

    #[test]
    fn child_inherits_trace_from_context() {
        let (tracer, sink) = tracer();
        let root = tracer.start(&Context::empty(), SpanBuilder::new("root"));
        let root_ctx = root.span_context().cloned().unwrap();
        let child = tracer.start(&root.context(), SpanBuilder::new("child"));
        child.end();
        root.end();

        let child = &sink.spans_named("child")[0];
        assert_eq!(child.trace_id, root_ctx.trace_id().to_string());
        assert_eq!(child.parent_span_id, Some(root_ctx.span_id().to_string()));
    }

    #[test]
    fn parent_and_link_are_kept_apart() {
        let (tracer, sink) = tracer();
        let parent = TraceContext::new(TraceId::random(), SpanId::random(), true);
        let cx = Context::empty().with_span(parent.clone());

        let span = tracer.start(
            &cx,
            SpanBuilder::new("settle_trade")
                .with_kind(SpanKind::Consumer)
                .with_link(
                    SpanLink::new(stored_context()).with_attribute("link.reason", "trade.created"),
                ),
        );
        assert_eq!(span.parent_span_id(), Some(parent.span_id()));
        assert_eq!(span.links().len(), 1);
        span.end();

        let record = &sink.spans_named("settle_trade")[0];
        assert_eq!(record.trace_id, parent.trace_id().to_string());
        assert_eq!(record.parent_span_id, Some(parent.span_id().to_string()));
        assert_eq!(record.links.len(), 1);
        assert_eq!(record.links[0].trace_id, "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(record.links[0].span_id, "b7ad6b7169203331");
        assert_ne!(record.links[0].span_id, parent.span_id().to_string());
        assert!(record.links[0].attrs_json.contains("trade.created"));
    }

    #[test]
    fn self_link_is_recorded() {
        let (tracer, sink) = tracer();
        let stored = stored_context();
        let cx = Context::empty().with_span(stored.clone());
        tracer
            .start(&cx, SpanBuilder::new("reread").with_link(SpanLink::new(stored.clone())))
            .end();

        let record = &sink.finished_spans()[0];
        assert_eq!(record.trace_id, stored.trace_id().to_string());
        assert_eq!(record.links.len(), 1);
        assert_eq!(record.links[0].trace_id, record.trace_id);
    }

    #[test]
    fn errors_mark_status_and_add_event() {
        let (tracer, sink) = tracer();
        let mut span = tracer.start(&Context::empty(), SpanBuilder::new("failing"));
        let err = std::io::Error::other("database unreachable");
        span.record_error(&err);
        span.end();

        let record = &sink.finished_spans()[0];
        assert_eq!(record.status, "ERROR");
        assert_eq!(record.status_message.as_deref(), Some("database unreachable"));
        assert!(record.events_json.contains("exception"));
    }

    #[test]
    fn drop_ends_span_once() {
        let (tracer, sink) = tracer();
        {
            let mut span = tracer.start(&Context::empty(), SpanBuilder::new("scoped"));
            span.set_status(SpanStatus::Ok);
        }
        assert_eq!(sink.finished_spans().len(), 1);
        assert_eq!(sink.finished_spans()[0].status, "OK");
    }

    #[test]
    fn unsampled_spans_are_not_exported() {
        let (tracer, sink) = tracer();
        let parent = TraceContext::new(TraceId::random(), SpanId::random(), false);
        let span = tracer.start(&Context::empty().with_span(parent), SpanBuilder::new("quiet"));
        assert!(!span.is_recording());
        span.end();
        assert!(sink.finished_spans().is_empty());
    }
}
