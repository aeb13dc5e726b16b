//! FlightVars wire protocol: message model, binary codec and the byte
//! buffers the codec runs on.

pub mod codec;
mod error;
pub mod message;
pub mod ring;
mod var;

pub use error::{BufferError, CodecError, ParseError};
pub use message::{
    Message, MessageType, SubscriptionId, SubscriptionStatus, VariableValue, PROTOCOL_VERSION,
};
pub use ring::{FixedBuffer, RingBuffer};
pub use var::VariableId;
