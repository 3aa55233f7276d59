use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{Result, TradeTraceError};

/// 128-bit trace identifier. Never all-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId([u8; 16]);

/// 64-bit span identifier. Never all-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId([u8; 8]);

impl TraceId {
    pub fn from_bytes(bytes: [u8; 16]) -> Result<Self> {
        if bytes == [0; 16] {
            return Err(TradeTraceError::Parse("trace id is all zeros".to_string()));
        }
        Ok(Self(bytes))
    }

    pub fn parse(input: &str) -> Result<Self> {
        let bytes = decode_hex::<16>(input)
            .ok_or_else(|| TradeTraceError::Parse(format!("invalid trace id: {input}")))?;
        Self::from_bytes(bytes)
    }

    pub fn random() -> Self {
        // v4 uuids carry fixed version bits, so the bytes are never all zero.
        Self(*Uuid::new_v4().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl SpanId {
    pub fn from_bytes(bytes: [u8; 8]) -> Result<Self> {
        if bytes == [0; 8] {
            return Err(TradeTraceError::Parse("span id is all zeros".to_string()));
        }
        Ok(Self(bytes))
    }

    pub fn parse(input: &str) -> Result<Self> {
        let bytes = decode_hex::<8>(input)
            .ok_or_else(|| TradeTraceError::Parse(format!("invalid span id: {input}")))?;
        Self::from_bytes(bytes)
    }

    pub fn random() -> Self {
        let uuid = Uuid::new_v4();
        let mut bytes = [0u8; 8];
        // byte 6 holds the uuid version nibble, keeping the id non-zero
        bytes.copy_from_slice(&uuid.as_bytes()[..8]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl Serialize for TraceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TraceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl Serialize for SpanId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SpanId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

/// Decodes exactly `N` bytes from `2 * N` hex characters of either case.
pub(crate) fn decode_hex<const N: usize>(input: &str) -> Option<[u8; N]> {
    let raw = input.as_bytes();
    if raw.len() != N * 2 {
        return None;
    }
    let mut out = [0u8; N];
    for (i, pair) in raw.chunks_exact(2).enumerate() {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Some(out)
}
