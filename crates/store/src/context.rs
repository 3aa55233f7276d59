//! Trade persistence with an attached trace-context snapshot.
//!
//! The snapshot is written once, with the trade, and only read afterwards.
//! Anything wrong with the stored value degrades to "no context"; it never
//! turns a successful business read into a failure.

use chrono::{DateTime, Utc};
use tradetrace_core::error::Result;
use tradetrace_core::model::trade::{SettleOutcome, Trade};
use tradetrace_core::traceparent::{self, TraceContext};

use crate::repository::TradeRepository;

/// A trade together with the decoded context it was created under.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTrade {
    pub trade: Trade,
    pub context: Option<TraceContext>,
}

#[derive(Clone)]
pub struct ContextStore<R> {
    repo: R,
}

impl<R: TradeRepository> ContextStore<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Persists `trade` with the encoded form of `active`, or null trace fields
    /// when no context is active. Any trace fields already on `trade` are
    /// replaced.
    pub async fn write_with_context(
        &self,
        mut trade: Trade,
        active: Option<&TraceContext>,
    ) -> Result<Trade> {
        trade.trace_parent = active.map(traceparent::encode);
        trade.trace_state = active
            .and_then(TraceContext::trace_state)
            .map(|s| s.as_str().to_string());

        self.repo.insert(&trade).await?;
        tracing::debug!(
            trade_id = %trade.trade_id,
            trace_parent = trade.trace_parent.as_deref().unwrap_or("-"),
            "trade written with context"
        );
        Ok(trade)
    }

    /// `Ok(None)` means the trade does not exist.
    pub async fn read_with_context(&self, trade_id: &str) -> Result<Option<StoredTrade>> {
        let Some(trade) = self.repo.fetch(trade_id).await? else {
            return Ok(None);
        };
        let context = restore_context(&trade);
        Ok(Some(StoredTrade { trade, context }))
    }

    pub async fn list(&self) -> Result<Vec<Trade>> {
        self.repo.list().await
    }

    pub async fn mark_submitted(&self, trade_id: &str) -> Result<Option<Trade>> {
        self.repo.mark_submitted(trade_id).await
    }

    pub async fn mark_failed(&self, trade_id: &str) -> Result<Option<Trade>> {
        self.repo.mark_failed(trade_id).await
    }

    pub async fn settle(&self, trade_id: &str, at: DateTime<Utc>) -> Result<Option<SettleOutcome>> {
        self.repo.settle(trade_id, at).await
    }
}

/// Decodes the snapshot stored on `trade`, logging and discarding a corrupt one.
pub fn restore_context(trade: &Trade) -> Option<TraceContext> {
    let raw = trade.trace_parent.as_deref()?;
    match traceparent::decode(raw, trade.trace_state.as_deref()) {
        Ok(ctx) => Some(ctx),
        Err(err) => {
            tracing::warn!(
                trade_id = %trade.trade_id,
                trace_parent = raw,
                error = %err,
                "stored trace context is invalid; continuing without it"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use testkit::{SAMPLE_SPAN_ID, SAMPLE_TRACE_ID, sample_context, sample_trade};
    use tradetrace_core::ids::{SpanId, TraceId};
    use tradetrace_core::traceparent::TraceState;

    use super::*;
    use crate::Store;
    use crate::memory::MemoryStore;

    async fn write_then_read<R: TradeRepository>(repo: R) {
        let store = ContextStore::new(repo);
        let ctx = sample_context();
        let written = store
            .write_with_context(sample_trade(), Some(&ctx))
            .await
            .unwrap();
        assert_eq!(
            written.trace_parent.as_deref(),
            Some("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01")
        );

        let stored = store
            .read_with_context(&written.trade_id)
            .await
            .unwrap()
            .unwrap();
        let decoded = stored.context.unwrap();
        assert_eq!(decoded.trace_id().to_string(), SAMPLE_TRACE_ID);
        assert_eq!(decoded.span_id().to_string(), SAMPLE_SPAN_ID);
        assert!(decoded.is_sampled());
    }

    #[tokio::test]
    async fn round_trips_context_in_duckdb() {
        write_then_read(Store::open_in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn round_trips_context_in_memory() {
        write_then_read(MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn absent_context_stores_nulls() {
        let store = ContextStore::new(Store::open_in_memory().unwrap());
        let written = store.write_with_context(sample_trade(), None).await.unwrap();
        assert!(written.trace_parent.is_none());
        assert!(written.trace_state.is_none());

        let stored = store
            .read_with_context(&written.trade_id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.trade.trace_parent.is_none());
        assert!(stored.trade.trace_state.is_none());
        assert!(stored.context.is_none());
    }

    #[tokio::test]
    async fn vendor_state_is_kept() {
        let store = ContextStore::new(MemoryStore::new());
        let ctx = TraceContext::new(TraceId::random(), SpanId::random(), true)
            .with_trace_state(TraceState::new("congo=t61rcWkgMzE"));
        let written = store.write_with_context(sample_trade(), Some(&ctx)).await.unwrap();
        assert_eq!(written.trace_state.as_deref(), Some("congo=t61rcWkgMzE"));

        let stored = store
            .read_with_context(&written.trade_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.context, Some(ctx));
    }

    #[tokio::test]
    async fn corrupt_snapshot_reads_as_no_context() {
        let repo = Store::open_in_memory().unwrap();
        let mut trade = sample_trade();
        trade.trace_parent = Some("00-0af7651916cd43dd8448eb21".to_string());
        repo.insert_trade(&trade).unwrap();

        let store = ContextStore::new(repo);
        let stored = store.read_with_context(&trade.trade_id).await.unwrap().unwrap();
        assert_eq!(stored.trade.trade_id, trade.trade_id);
        assert!(stored.context.is_none());
    }

    #[tokio::test]
    async fn missing_trade_is_not_an_error() {
        let store = ContextStore::new(MemoryStore::new());
        assert!(store.read_with_context("missing").await.unwrap().is_none());
    }
}
