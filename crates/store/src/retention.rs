use std::time::Duration;

use chrono::Utc;
use duckdb::params;
use tradetrace_core::error::{Result, TradeTraceError};

use crate::Store;

impl Store {
    /// Drops recorded spans (and their links) that ended before `now - ttl`.
    /// Trades are never pruned.
    pub fn prune_spans(&self, ttl: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl)
                .map_err(|e| TradeTraceError::Internal(format!("ttl conversion failed: {e}")))?;
        let cutoff = cutoff.to_rfc3339();

        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| TradeTraceError::Store(format!("begin tx failed: {e}")))?;
        tx.execute(
            "DELETE FROM span_links WHERE EXISTS (
               SELECT 1 FROM spans s
               WHERE s.trace_id = span_links.trace_id
                 AND s.span_id = span_links.span_id
                 AND s.end_ts < ?
             )",
            params![cutoff.clone()],
        )
        .map_err(|e| TradeTraceError::Store(format!("retention links delete failed: {e}")))?;
        let removed = tx
            .execute("DELETE FROM spans WHERE end_ts < ?", params![cutoff])
            .map_err(|e| TradeTraceError::Store(format!("retention spans delete failed: {e}")))?;
        tx.commit()
            .map_err(|e| TradeTraceError::Store(format!("commit retention failed: {e}")))?;

        Ok(removed)
    }
}
