//! LIS message bus abstraction: §6.

pub mod in_memory;
pub mod lapin_broker;
pub mod traits;

pub use in_memory::InMemoryBroker;
pub use lapin_broker::LapinBroker;
pub use traits::{Broker, BrokerError, Delivery};
