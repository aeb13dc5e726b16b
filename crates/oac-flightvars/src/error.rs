use std::io;
use std::sync::Arc;
use std::time::Duration;

use oac_proto::{CodecError, MessageType, SubscriptionId, SubscriptionStatus, VariableId};
use thiserror::Error;

/// Bookkeeping violations in a [`crate::SubscriptionRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("variable {0} is already registered")]
    VariableAlreadyExists(VariableId),

    #[error("subscription {0} is already registered")]
    SubscriptionAlreadyExists(SubscriptionId),

    #[error("no such variable {0}")]
    NoSuchVariable(VariableId),

    #[error("no such subscription {0}")]
    NoSuchSubscription(SubscriptionId),
}

/// The byte stream violated the wire contract. Always fatal to the connection.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Codec(Arc<CodecError>),

    #[error("unexpected {0:?} message")]
    UnexpectedMessage(MessageType),

    #[error("incomplete message fills the whole {0}-byte receive buffer")]
    ReceiveBufferOverflow(usize),
}

impl From<CodecError> for ProtocolError {
    fn from(e: CodecError) -> Self {
        ProtocolError::Codec(Arc::new(e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("request timed out after {timeout:?}")]
pub struct RequestTimeoutError {
    pub timeout: Duration,
}

#[derive(Debug, Clone, Error)]
pub enum CommunicationError {
    #[error(transparent)]
    Timeout(#[from] RequestTimeoutError),

    #[error("cannot connect to {addr}: {source}")]
    Connect { addr: String, source: Arc<io::Error> },

    #[error("transport failure: {0}")]
    Transport(Arc<io::Error>),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("session is closed")]
    Closed,
}

impl From<io::Error> for CommunicationError {
    fn from(e: io::Error) -> Self {
        CommunicationError::Transport(Arc::new(e))
    }
}

impl CommunicationError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CommunicationError::Timeout(_))
    }
}

/// Errors surfaced by the client facade.
#[derive(Debug, Clone, Error)]
pub enum FlightVarsError {
    #[error("no such variable {0}")]
    NoSuchVariable(VariableId),

    #[error("no such subscription {0}")]
    NoSuchSubscription(SubscriptionId),

    #[error("illegal value: {0}")]
    IllegalValue(String),

    #[error("variable {0} is already subscribed")]
    AlreadySubscribed(VariableId),

    #[error("request rejected by peer with status {status:?}: {cause}")]
    Rejected { status: SubscriptionStatus, cause: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Communication(#[from] CommunicationError),
}

impl FlightVarsError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FlightVarsError::Communication(c) if c.is_timeout())
    }
}

/// How a session ended: `Ok(())` for a graceful `EndSession`, the cause otherwise.
pub type Disconnection = Result<(), CommunicationError>;
