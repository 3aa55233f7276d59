pub mod message;
pub mod span;
pub mod trade;
