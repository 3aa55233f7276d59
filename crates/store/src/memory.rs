use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tradetrace_core::error::{Result, TradeTraceError};
use tradetrace_core::model::trade::{SettleOutcome, Trade, TradeStatus};

use crate::repository::TradeRepository;

/// In-process trade repository with the same semantics as the DuckDB store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    trades: Arc<Mutex<HashMap<String, Trade>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn trades(&self) -> Result<MutexGuard<'_, HashMap<String, Trade>>> {
        self.trades
            .lock()
            .map_err(|_| TradeTraceError::Internal("memory store mutex poisoned".to_string()))
    }

    fn transition(
        &self,
        trade_id: &str,
        from: &[TradeStatus],
        to: TradeStatus,
    ) -> Result<Option<Trade>> {
        let mut trades = self.trades()?;
        let Some(trade) = trades.get_mut(trade_id) else {
            return Ok(None);
        };
        if from.contains(&trade.status) {
            trade.status = to;
        }
        Ok(Some(trade.clone()))
    }
}

impl TradeRepository for MemoryStore {
    async fn insert(&self, trade: &Trade) -> Result<()> {
        let mut trades = self.trades()?;
        if trades.contains_key(&trade.trade_id) {
            return Err(TradeTraceError::Store(format!(
                "duplicate trade id: {}",
                trade.trade_id
            )));
        }
        trades.insert(trade.trade_id.clone(), trade.clone());
        Ok(())
    }

    async fn fetch(&self, trade_id: &str) -> Result<Option<Trade>> {
        Ok(self.trades()?.get(trade_id).cloned())
    }

    async fn list(&self) -> Result<Vec<Trade>> {
        let mut all = self.trades()?.values().cloned().collect::<Vec<_>>();
        all.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.trade_id.cmp(&a.trade_id))
        });
        Ok(all)
    }

    async fn mark_submitted(&self, trade_id: &str) -> Result<Option<Trade>> {
        self.transition(trade_id, &[TradeStatus::Pending], TradeStatus::Submitted)
    }

    async fn mark_failed(&self, trade_id: &str) -> Result<Option<Trade>> {
        self.transition(
            trade_id,
            &[TradeStatus::Pending, TradeStatus::Submitted],
            TradeStatus::Failed,
        )
    }

    async fn settle(&self, trade_id: &str, at: DateTime<Utc>) -> Result<Option<SettleOutcome>> {
        let mut trades = self.trades()?;
        let Some(trade) = trades.get_mut(trade_id) else {
            return Ok(None);
        };
        let outcome = match trade.status {
            TradeStatus::Settled => SettleOutcome::AlreadySettled(trade.clone()),
            TradeStatus::Failed => SettleOutcome::NotSettleable(trade.clone()),
            TradeStatus::Pending | TradeStatus::Submitted => {
                trade.status = TradeStatus::Settled;
                trade.settled_at = Some(at);
                SettleOutcome::Settled(trade.clone())
            }
        };
        Ok(Some(outcome))
    }
}
