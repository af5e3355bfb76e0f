//! TCP acceptance and per-session ownership: §4.3, §4.4.

pub mod acceptor;
pub mod handler;

pub use acceptor::Acceptor;
pub use handler::{ConnectionHandler, ConnectionHealth};
