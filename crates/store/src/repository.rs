use std::future::Future;

use chrono::{DateTime, Utc};
use tradetrace_core::error::Result;
use tradetrace_core::model::trade::{SettleOutcome, Trade};

use crate::Store;

/// Persistence operations for trades, independent of the backing engine.
///
/// Trace fields travel as opaque encoded strings here; encoding and decoding
/// belong to [`crate::context::ContextStore`].
pub trait TradeRepository: Clone + Send + Sync + 'static {
    fn insert(&self, trade: &Trade) -> impl Future<Output = Result<()>> + Send;

    fn fetch(&self, trade_id: &str) -> impl Future<Output = Result<Option<Trade>>> + Send;

    fn list(&self) -> impl Future<Output = Result<Vec<Trade>>> + Send;

    fn mark_submitted(&self, trade_id: &str)
    -> impl Future<Output = Result<Option<Trade>>> + Send;

    fn mark_failed(&self, trade_id: &str) -> impl Future<Output = Result<Option<Trade>>> + Send;

    fn settle(
        &self,
        trade_id: &str,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<SettleOutcome>>> + Send;
}

impl TradeRepository for Store {
    async fn insert(&self, trade: &Trade) -> Result<()> {
        self.insert_trade(trade)
    }

    async fn fetch(&self, trade_id: &str) -> Result<Option<Trade>> {
        self.get_trade(trade_id)
    }

    async fn list(&self) -> Result<Vec<Trade>> {
        self.list_trades()
    }

    async fn mark_submitted(&self, trade_id: &str) -> Result<Option<Trade>> {
        self.mark_trade_submitted(trade_id)
    }

    async fn mark_failed(&self, trade_id: &str) -> Result<Option<Trade>> {
        self.mark_trade_failed(trade_id)
    }

    async fn settle(&self, trade_id: &str, at: DateTime<Utc>) -> Result<Option<SettleOutcome>> {
        self.settle_trade(trade_id, at)
    }
}
