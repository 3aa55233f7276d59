use chrono::{DateTime, NaiveDateTime, Utc};
use duckdb::{Connection, Row, params};
use tradetrace_core::error::{Result, TradeTraceError};
use tradetrace_core::model::trade::{SettleOutcome, Trade, TradeStatus};

use crate::Store;
use crate::db::naive_to_utc;

const TRADE_COLUMNS: &str = "trade_id, instrument, CAST(quantity AS DOUBLE), CAST(price AS DOUBLE),
     counterparty, trade_date, status, created_at, settled_at, trace_parent, trace_state";

impl Store {
    /// Inserts business and trace fields in one transaction.
    pub fn insert_trade(&self, trade: &Trade) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| TradeTraceError::Store(format!("begin tx failed: {e}")))?;

        tx.execute(
            "INSERT INTO trades
             (trade_id, instrument, quantity, price, counterparty, trade_date, status,
              created_at, settled_at, trace_parent, trace_state)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                trade.trade_id,
                trade.instrument,
                trade.quantity,
                trade.price,
                trade.counterparty,
                trade.trade_date.to_rfc3339(),
                trade.status.as_str(),
                trade.created_at.to_rfc3339(),
                trade.settled_at.map(|ts| ts.to_rfc3339()),
                trade.trace_parent,
                trade.trace_state,
            ],
        )
        .map_err(|e| TradeTraceError::Store(format!("insert trade failed: {e}")))?;

        tx.commit()
            .map_err(|e| TradeTraceError::Store(format!("commit trade failed: {e}")))
    }

    pub fn get_trade(&self, trade_id: &str) -> Result<Option<Trade>> {
        let conn = self.conn()?;
        fetch_trade(&conn, trade_id)
    }

    /// All trades, most recent first.
    pub fn list_trades(&self) -> Result<Vec<Trade>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TRADE_COLUMNS} FROM trades ORDER BY created_at DESC, trade_id DESC"
            ))
            .map_err(|e| TradeTraceError::Store(format!("prepare list trades failed: {e}")))?;

        let rows = stmt
            .query_map([], map_trade_row)
            .map_err(|e| TradeTraceError::Store(format!("query trades failed: {e}")))?;

        let mut out = Vec::new();
        for row in rows {
            let raw =
                row.map_err(|e| TradeTraceError::Store(format!("map trade row failed: {e}")))?;
            out.push(raw.into_trade()?);
        }
        Ok(out)
    }

    /// Moves a pending trade to `Submitted`. Later statuses are left alone.
    pub fn mark_trade_submitted(&self, trade_id: &str) -> Result<Option<Trade>> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE trades SET status = 'Submitted' WHERE trade_id = ? AND status = 'Pending'",
            params![trade_id],
        )
        .map_err(|e| TradeTraceError::Store(format!("update trade status failed: {e}")))?;
        fetch_trade(&conn, trade_id)
    }

    /// Moves an open trade to `Failed`. Settled trades stay settled.
    pub fn mark_trade_failed(&self, trade_id: &str) -> Result<Option<Trade>> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE trades SET status = 'Failed'
             WHERE trade_id = ? AND status IN ('Pending', 'Submitted')",
            params![trade_id],
        )
        .map_err(|e| TradeTraceError::Store(format!("update trade status failed: {e}")))?;
        fetch_trade(&conn, trade_id)
    }

    /// Settles an open trade at `at`. Repeating the call is a no-op that
    /// reports the first settlement.
    pub fn settle_trade(&self, trade_id: &str, at: DateTime<Utc>) -> Result<Option<SettleOutcome>> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| TradeTraceError::Store(format!("begin tx failed: {e}")))?;

        let Some(current) = fetch_trade(&tx, trade_id)? else {
            return Ok(None);
        };

        let outcome = match current.status {
            TradeStatus::Settled => SettleOutcome::AlreadySettled(current),
            TradeStatus::Failed => SettleOutcome::NotSettleable(current),
            TradeStatus::Pending | TradeStatus::Submitted => {
                tx.execute(
                    "UPDATE trades SET status = 'Settled', settled_at = ?
                     WHERE trade_id = ? AND status IN ('Pending', 'Submitted')",
                    params![at.to_rfc3339(), trade_id],
                )
                .map_err(|e| TradeTraceError::Store(format!("settle trade failed: {e}")))?;
                let settled = fetch_trade(&tx, trade_id)?.ok_or_else(|| {
                    TradeTraceError::Store(format!("trade vanished during settlement: {trade_id}"))
                })?;
                SettleOutcome::Settled(settled)
            }
        };

        tx.commit()
            .map_err(|e| TradeTraceError::Store(format!("commit settlement failed: {e}")))?;
        Ok(Some(outcome))
    }
}

fn fetch_trade(conn: &Connection, trade_id: &str) -> Result<Option<Trade>> {
    let raw = match conn.query_row(
        &format!("SELECT {TRADE_COLUMNS} FROM trades WHERE trade_id = ?"),
        params![trade_id],
        map_trade_row,
    ) {
        Ok(raw) => raw,
        Err(duckdb::Error::QueryReturnedNoRows) => return Ok(None),
        Err(e) => return Err(TradeTraceError::Store(format!("query trade failed: {e}"))),
    };
    raw.into_trade().map(Some)
}

struct RawTrade {
    trade_id: String,
    instrument: String,
    quantity: f64,
    price: f64,
    counterparty: String,
    trade_date: NaiveDateTime,
    status: String,
    created_at: NaiveDateTime,
    settled_at: Option<NaiveDateTime>,
    trace_parent: Option<String>,
    trace_state: Option<String>,
}

impl RawTrade {
    fn into_trade(self) -> Result<Trade> {
        Ok(Trade {
            status: self.status.parse()?,
            trade_id: self.trade_id,
            instrument: self.instrument,
            quantity: self.quantity,
            price: self.price,
            counterparty: self.counterparty,
            trade_date: naive_to_utc(self.trade_date),
            created_at: naive_to_utc(self.created_at),
            settled_at: self.settled_at.map(naive_to_utc),
            trace_parent: self.trace_parent,
            trace_state: self.trace_state,
        })
    }
}

fn map_trade_row(row: &Row<'_>) -> duckdb::Result<RawTrade> {
    Ok(RawTrade {
        trade_id: row.get(0)?,
        instrument: row.get(1)?,
        quantity: row.get(2)?,
        price: row.get(3)?,
        counterparty: row.get(4)?,
        trade_date: row.get(5)?,
        status: row.get(6)?,
        created_at: row.get(7)?,
        settled_at: row.get(8)?,
        trace_parent: row.get(9)?,
        trace_state: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use testkit::sample_trade;
    use tradetrace_core::time;

    use super::*;

    #[test]
    fn insert_and_fetch_preserves_fields() {
        let store = Store::open_in_memory().unwrap();
        let mut trade = sample_trade();
        trade.trace_parent =
            Some("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string());
        trade.trace_state = Some("rojo=00f067aa0ba902b7".to_string());
        store.insert_trade(&trade).unwrap();

        let back = store.get_trade(&trade.trade_id).unwrap().unwrap();
        assert_eq!(back, trade);
    }

    #[test]
    fn largest_accepted_amount_fits_the_column() {
        let store = Store::open_in_memory().unwrap();
        let mut trade = sample_trade();
        trade.quantity = 99_999_999_999_999.0;
        store.insert_trade(&trade).unwrap();
        let back = store.get_trade(&trade.trade_id).unwrap().unwrap();
        assert_eq!(back.quantity, trade.quantity);
    }

    #[test]
    fn missing_trade_is_none() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_trade("nope").unwrap().is_none());
        assert!(store.settle_trade("nope", time::now()).unwrap().is_none());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let store = Store::open_in_memory().unwrap();
        let trade = sample_trade();
        store.insert_trade(&trade).unwrap();
        assert!(store.insert_trade(&trade).is_err());
    }

    #[test]
    fn lists_most_recent_first() {
        let store = Store::open_in_memory().unwrap();
        let older = sample_trade();
        let mut newer = sample_trade();
        newer.created_at = older.created_at + Duration::seconds(5);
        store.insert_trade(&older).unwrap();
        store.insert_trade(&newer).unwrap();

        let ids = store
            .list_trades()
            .unwrap()
            .into_iter()
            .map(|t| t.trade_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![newer.trade_id, older.trade_id]);
    }

    #[test]
    fn settle_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let trade = sample_trade();
        store.insert_trade(&trade).unwrap();

        let first_at = time::now();
        let first = store.settle_trade(&trade.trade_id, first_at).unwrap().unwrap();
        assert!(matches!(first, SettleOutcome::Settled(_)));
        assert_eq!(first.trade().settled_at, Some(first_at));

        let second = store
            .settle_trade(&trade.trade_id, first_at + Duration::seconds(30))
            .unwrap()
            .unwrap();
        assert!(matches!(second, SettleOutcome::AlreadySettled(_)));
        assert_eq!(second.trade().status, TradeStatus::Settled);
        assert_eq!(second.trade().settled_at, Some(first_at));
    }

    #[test]
    fn status_updates_leave_trace_fields_alone() {
        let store = Store::open_in_memory().unwrap();
        let mut trade = sample_trade();
        trade.trace_parent =
            Some("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string());
        store.insert_trade(&trade).unwrap();

        let submitted = store.mark_trade_submitted(&trade.trade_id).unwrap().unwrap();
        assert_eq!(submitted.status, TradeStatus::Submitted);
        let settled = store
            .settle_trade(&trade.trade_id, time::now())
            .unwrap()
            .unwrap();
        assert_eq!(settled.trade().trace_parent, trade.trace_parent);

        // a late submit or failure cannot regress a settled trade
        let after = store.mark_trade_submitted(&trade.trade_id).unwrap().unwrap();
        assert_eq!(after.status, TradeStatus::Settled);
        let after = store.mark_trade_failed(&trade.trade_id).unwrap().unwrap();
        assert_eq!(after.status, TradeStatus::Settled);
    }

    #[test]
    fn failed_trades_cannot_settle() {
        let store = Store::open_in_memory().unwrap();
        let trade = sample_trade();
        store.insert_trade(&trade).unwrap();
        store.mark_trade_failed(&trade.trade_id).unwrap();

        let outcome = store
            .settle_trade(&trade.trade_id, time::now())
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, SettleOutcome::NotSettleable(_)));
        assert!(outcome.trade().settled_at.is_none());
    }
}
