use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;
use tradetrace_core::model::span::SpanRecord;
use tradetrace_core::sink::SpanSink;
use tradetrace_store::Store;

/// Span sink that batches finished spans into the store on a background task.
///
/// The writer task ends, after a final flush, once every clone of the pipeline
/// has been dropped.
#[derive(Clone)]
pub struct SpanPipeline {
    spans_tx: mpsc::Sender<SpanRecord>,
}

pub struct PipelineConfig {
    pub channel_capacity: usize,
    pub flush_interval: Duration,
    pub batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            flush_interval: Duration::from_millis(200),
            batch_size: 256,
        }
    }
}

impl SpanPipeline {
    pub fn spawn(store: Store, cfg: PipelineConfig) -> (Self, JoinHandle<()>) {
        let (spans_tx, spans_rx) = mpsc::channel(cfg.channel_capacity.max(1));
        let writer = tokio::spawn(run_span_writer(
            store,
            spans_rx,
            cfg.batch_size.max(1),
            cfg.flush_interval,
        ));
        (Self { spans_tx }, writer)
    }
}

impl SpanSink for SpanPipeline {
    fn export(&self, span: SpanRecord) {
        if let Err(e) = self.spans_tx.try_send(span) {
            warn!(error = %e, "span pipeline dropped span");
        }
    }
}

async fn run_span_writer(
    store: Store,
    mut rx: mpsc::Receiver<SpanRecord>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    let mut buffer = Vec::new();
    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(span) => {
                    buffer.push(span);
                    if buffer.len() >= batch_size {
                        flush_spans(&store, &mut buffer);
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_spans(&store, &mut buffer);
                }
            }
        }
    }
    if !buffer.is_empty() {
        flush_spans(&store, &mut buffer);
    }
    tracing::debug!("span writer stopped");
}

fn flush_spans(store: &Store, buffer: &mut Vec<SpanRecord>) {
    if let Err(e) = store.insert_spans(buffer) {
        warn!(error = ?e, count = buffer.len(), "failed to write span batch");
    }
    buffer.clear();
}
