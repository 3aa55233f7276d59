use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TradeTraceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    TradeSubmitted,
    TradeSettled,
    TradeFailed,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TradeSubmitted => "TradeSubmitted",
            Self::TradeSettled => "TradeSettled",
            Self::TradeFailed => "TradeFailed",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = TradeTraceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TradeSubmitted" => Ok(Self::TradeSubmitted),
            "TradeSettled" => Ok(Self::TradeSettled),
            "TradeFailed" => Ok(Self::TradeFailed),
            _ => Err(TradeTraceError::Parse(format!("unknown message type: {s}"))),
        }
    }
}

/// Application payload carried inside the broker envelope.
///
/// `message_type` stays a string on the wire so that a payload with a type this
/// build does not know still deserializes and can be acknowledged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TradeMessage {
    pub trade_id: String,
    pub message_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl TradeMessage {
    pub fn new(trade_id: impl Into<String>, message_type: MessageType) -> Self {
        Self {
            trade_id: trade_id.into(),
            message_type: message_type.as_str().to_string(),
            timestamp: Utc::now(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> Result<MessageType> {
        self.message_type.parse()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| TradeTraceError::Internal(format!("encode message failed: {e}")))
    }

    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| TradeTraceError::Parse(format!("decode message failed: {e}")))
    }
}
