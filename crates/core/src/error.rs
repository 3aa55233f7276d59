use thiserror::Error;

#[derive(Debug, Error)]
pub enum TradeTraceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Store(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TradeTraceError {
    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Broker(_) | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, TradeTraceError>;
