//! Inbound and outbound message pipelines: §4.7, §4.8.

pub mod inbound;
pub mod outbound;

pub use inbound::{process as process_inbound, InboundContext};
pub use outbound::OrderDispatcher;
