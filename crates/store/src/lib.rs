pub mod context;
pub mod db;
pub mod memory;
pub mod repository;
pub mod retention;
pub mod schema;
pub mod spans;
pub mod trades;

pub use context::{ContextStore, StoredTrade};
pub use db::Store;
pub use memory::MemoryStore;
pub use repository::TradeRepository;
