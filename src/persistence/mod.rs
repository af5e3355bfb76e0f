//! Durable storage for inbound audit records and outbound orders (§3, §6).

pub mod migrations;
pub mod models;
pub mod store;

pub use models::{MessageKind, OrderMessage, OrderStatus, OrderStoreStats, ServerMessage, ServerMessageStatus};
pub use store::{PersistenceError, PersistenceStore, SqliteStore};
