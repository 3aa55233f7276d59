use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tradetrace_core::Tracer;
use tradetrace_core::config::Config;
use tradetrace_core::error::{Result, TradeTraceError};
use tradetrace_core::sink::{FanoutSink, SpanSink};
use tradetrace_store::{ContextStore, Store};

use crate::broker::Broker;
use crate::consumer::spawn_consumer;
use crate::http::{self, AppState};
use crate::pipeline::{PipelineConfig, SpanPipeline};
use crate::resolver::CausalityResolver;

/// Runs the HTTP surface, the queue consumer, the span writer and span
/// retention until `shutdown` becomes `true`. Finished spans also go to
/// `export` when one is given.
pub async fn run_services(
    cfg: &Config,
    store: Store,
    export: Option<Arc<dyn SpanSink>>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(&cfg.http_addr)
        .await
        .map_err(|e| TradeTraceError::Io(format!("bind {} failed: {e}", cfg.http_addr)))?;
    serve(cfg, store, listener, export, shutdown).await
}

pub async fn serve(
    cfg: &Config,
    store: Store,
    listener: TcpListener,
    export: Option<Arc<dyn SpanSink>>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr: SocketAddr = listener
        .local_addr()
        .map_err(|e| TradeTraceError::Io(format!("listener address unavailable: {e}")))?;

    let (pipeline, writer) = SpanPipeline::spawn(
        store.clone(),
        PipelineConfig {
            flush_interval: Duration::from_millis(cfg.span_flush_ms),
            batch_size: cfg.span_batch_size,
            ..PipelineConfig::default()
        },
    );
    let sink: Arc<dyn SpanSink> = match export {
        Some(export) => Arc::new(FanoutSink::new(vec![Arc::new(pipeline), export])),
        None => Arc::new(pipeline),
    };
    let tracer = Tracer::new(cfg.service_name.clone(), sink);
    let broker = Broker::new(cfg.max_delivery_count);
    let resolver = CausalityResolver::new(
        ContextStore::new(store.clone()),
        tracer,
        broker.clone(),
        cfg.queue_name.clone(),
    );

    let consumer = spawn_consumer(
        broker.receiver(cfg.queue_name.clone()),
        resolver.clone(),
        shutdown.clone(),
    );
    let retention = tokio::spawn(run_retention(
        store.clone(),
        cfg.span_retention_ttl,
        shutdown.clone(),
    ));
    let app = http::router(AppState { resolver, store });

    tracing::info!(
        %addr,
        queue = %cfg.queue_name,
        service = %cfg.service_name,
        "tradetrace listening"
    );
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown))
        .await;
    if let Err(e) = served {
        consumer.abort();
        retention.abort();
        return Err(TradeTraceError::Io(format!("HTTP server failed: {e}")));
    }

    tracing::info!("http server stopped; draining background tasks");
    let grace = cfg.shutdown_grace;
    join_within("consumer", consumer, grace).await;
    join_within("retention", retention, grace).await;
    join_within("span writer", writer, grace).await;
    Ok(())
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn join_within(task: &str, handle: JoinHandle<()>, grace: Duration) {
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(())) => tracing::debug!(task, "task stopped"),
        Ok(Err(e)) => tracing::warn!(task, error = %e, "task ended abnormally"),
        Err(_) => tracing::warn!(task, grace = ?grace, "task did not stop within grace period"),
    }
}

async fn run_retention(store: Store, ttl: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(retention_interval(ttl));
    loop {
        tokio::select! {
            _ = ticker.tick() => match store.prune_spans(ttl) {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "pruned expired spans"),
                Err(e) => tracing::warn!(error = ?e, "span retention failed"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn retention_interval(ttl: Duration) -> Duration {
    (ttl / 4).clamp(Duration::from_secs(60), Duration::from_secs(3600))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_interval_is_clamped() {
        assert_eq!(retention_interval(Duration::from_secs(10)), Duration::from_secs(60));
        assert_eq!(
            retention_interval(Duration::from_secs(24 * 3600)),
            Duration::from_secs(3600)
        );
        assert_eq!(
            retention_interval(Duration::from_secs(3600)),
            Duration::from_secs(900)
        );
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown_signal() {
        let store = Store::open_in_memory().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cfg = Config {
            shutdown_grace: Duration::from_secs(2),
            ..Config::default()
        };
        let (tx, rx) = watch::channel(false);
        let cfg_owned = cfg.clone();
        let task = tokio::spawn(async move { serve(&cfg_owned, store, listener, None, rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
