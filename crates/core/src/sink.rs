use std::sync::{Arc, Mutex};

use crate::model::span::SpanRecord;

/// Destination for finished spans.
pub trait SpanSink: Send + Sync {
    fn export(&self, span: SpanRecord);
}

/// Hands every span to each of its sinks, in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn SpanSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn SpanSink>>) -> Self {
        Self { sinks }
    }
}

impl SpanSink for FanoutSink {
    fn export(&self, span: SpanRecord) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.export(span.clone());
            }
            last.export(span);
        }
    }
}

/// Keeps finished spans in memory, in completion order.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    spans: Arc<Mutex<Vec<SpanRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finished_spans(&self) -> Vec<SpanRecord> {
        self.spans.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn spans_named(&self, name: &str) -> Vec<SpanRecord> {
        self.finished_spans()
            .into_iter()
            .filter(|s| s.name == name)
            .collect()
    }
}

impl SpanSink for MemorySink {
    fn export(&self, span: SpanRecord) {
        if let Ok(mut spans) = self.spans.lock() {
            spans.push(span);
        }
    }
}
