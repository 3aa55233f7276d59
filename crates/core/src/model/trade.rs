use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TradeTraceError};
use crate::time;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TradeStatus {
    Pending,
    Submitted,
    Settled,
    Failed,
}

impl TradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Submitted => "Submitted",
            Self::Settled => "Settled",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeStatus {
    type Err = TradeTraceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Submitted" => Ok(Self::Submitted),
            "Settled" => Ok(Self::Settled),
            "Failed" => Ok(Self::Failed),
            _ => Err(TradeTraceError::Parse(format!("unknown trade status: {s}"))),
        }
    }
}

/// A trade as persisted. `trace_parent`/`trace_state` are the encoded
/// snapshot of the context active when the trade was created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub trade_id: String,
    pub instrument: String,
    pub quantity: f64,
    pub price: f64,
    pub counterparty: String,
    pub trade_date: DateTime<Utc>,
    pub status: TradeStatus,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub trace_parent: Option<String>,
    pub trace_state: Option<String>,
}

impl Trade {
    pub fn notional(&self) -> f64 {
        self.quantity * self.price
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewTrade {
    pub instrument: String,
    pub quantity: f64,
    pub price: f64,
    pub counterparty: String,
    #[serde(default)]
    pub trade_date: Option<DateTime<Utc>>,
}

/// Exclusive upper bound for `quantity` and `price`: the largest magnitude a
/// `DECIMAL(18, 4)` column holds.
pub const MAX_AMOUNT: f64 = 1e14;

impl NewTrade {
    pub fn validate(&self) -> Result<()> {
        if self.instrument.trim().is_empty() {
            return Err(TradeTraceError::InvalidArgument(
                "instrument is required".to_string(),
            ));
        }
        if self.counterparty.trim().is_empty() {
            return Err(TradeTraceError::InvalidArgument(
                "counterparty is required".to_string(),
            ));
        }
        check_amount("quantity", self.quantity)?;
        check_amount("price", self.price)
    }

    /// Builds the pending trade; trace fields are filled in by the store adapter.
    pub fn into_pending(self) -> Trade {
        let created_at = time::now();
        Trade {
            trade_id: Uuid::new_v4().to_string(),
            instrument: self.instrument.trim().to_string(),
            quantity: self.quantity,
            price: self.price,
            counterparty: self.counterparty.trim().to_string(),
            trade_date: self.trade_date.unwrap_or(created_at),
            status: TradeStatus::Pending,
            created_at,
            settled_at: None,
            trace_parent: None,
            trace_state: None,
        }
    }
}

/// Outcome of a settlement attempt against a stored trade.
#[derive(Debug, Clone, PartialEq)]
pub enum SettleOutcome {
    Settled(Trade),
    AlreadySettled(Trade),
    /// The trade is in a terminal state other than settled.
    NotSettleable(Trade),
}

impl SettleOutcome {
    pub fn trade(&self) -> &Trade {
        match self {
            Self::Settled(t) | Self::AlreadySettled(t) | Self::NotSettleable(t) => t,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Settled(_) => "settled",
            Self::AlreadySettled(_) => "already_settled",
            Self::NotSettleable(_) => "not_settleable",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SettlementView {
    pub trade_id: String,
    pub status: TradeStatus,
    pub is_settled: bool,
    pub settled_at: Option<DateTime<Utc>>,
    pub trace_parent: Option<String>,
    pub linked_trace_id: Option<String>,
}

fn check_amount(field: &str, value: f64) -> Result<()> {
    if !(value.is_finite() && value > 0.0) {
        return Err(TradeTraceError::InvalidArgument(format!(
            "{field} must be positive, got {value}"
        )));
    }
    // DECIMAL(18, 4) rounds to four places on insert.
    let stored = (value * 10_000.0).round() / 10_000.0;
    if stored >= MAX_AMOUNT {
        return Err(TradeTraceError::InvalidArgument(format!(
            "{field} must be below {MAX_AMOUNT:e}, got {value}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> NewTrade {
        NewTrade {
            instrument: "CRUDE-OIL".into(),
            quantity: 1000.0,
            price: 75.50,
            counterparty: "ACME".into(),
            trade_date: None,
        }
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            TradeStatus::Pending,
            TradeStatus::Submitted,
            TradeStatus::Settled,
            TradeStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TradeStatus>().unwrap(), status);
        }
        assert!("Cancelled".parse::<TradeStatus>().is_err());
    }

    #[test]
    fn pending_trade_has_no_trace_snapshot() {
        let trade = request().into_pending();
        assert_eq!(trade.status, TradeStatus::Pending);
        assert_eq!(trade.trade_date, trade.created_at);
        assert!(trade.trace_parent.is_none());
        assert!(trade.settled_at.is_none());
        assert_eq!(trade.notional(), 75_500.0);
    }

    #[test]
    fn validation_rejects_non_positive_amounts() {
        assert!(request().validate().is_ok());
        let bad = NewTrade {
            quantity: 0.0,
            ..request()
        };
        assert!(matches!(
            bad.validate(),
            Err(TradeTraceError::InvalidArgument(_))
        ));
        let bad = NewTrade {
            counterparty: " ".into(),
            ..request()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn validation_rejects_amounts_beyond_decimal_range() {
        let huge = NewTrade {
            quantity: 1e15,
            ..request()
        };
        assert!(matches!(
            huge.validate(),
            Err(TradeTraceError::InvalidArgument(_))
        ));
        let huge = NewTrade {
            price: MAX_AMOUNT,
            ..request()
        };
        assert!(huge.validate().is_err());
        let largest = NewTrade {
            quantity: 99_999_999_999_999.0,
            ..request()
        };
        assert!(largest.validate().is_ok());
        let rounds_up = NewTrade {
            price: 99_999_999_999_999.99999,
            ..request()
        };
        assert!(rounds_up.validate().is_err());
        let just_below = NewTrade {
            price: 99_999_999_999_999.98,
            ..request()
        };
        assert!(just_below.validate().is_ok());
    }

    #[test]
    fn request_body_uses_camel_case() {
        let parsed: NewTrade = serde_json::from_str(
            r#"{"instrument":"CRUDE-OIL","quantity":1000,"price":75.5,"counterparty":"ACME","tradeDate":"2026-02-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(parsed.trade_date.unwrap().to_rfc3339(), "2026-02-01T00:00:00+00:00");
    }
}
