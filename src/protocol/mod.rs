//! ASTM E1381/E1394 protocol engine: frame codec, record model, message
//! assembly, classification, the framing state machine monitor, and the
//! vendor driver abstraction (§4).

pub mod classifier;
pub mod constants;
pub mod error;
pub mod frame;
pub mod message;
pub mod ortho_vision;
pub mod record;
pub mod state_machine;
pub mod vendor;

pub use classifier::{classify, MessageType};
pub use error::{ProtocolError, Result};
pub use message::AstmMessage;
pub use state_machine::{FramingStateMachine, State};
pub use vendor::VendorDriver;
