pub mod clock;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod redis;
pub mod schema;
pub mod store;
pub mod types;

pub use clock::{ClaimWindow, SchedulingClock};
pub use config::Config;
pub use context::BlastContext;
pub use db::DbPool;
pub use error::{StoreError, StoreResult};
pub use redis::RedisPool;
pub use store::{ClaimRequest, InsertOutcome, MemoryStore, PgStore, Store};
