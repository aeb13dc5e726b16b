//! FlightVars pub/sub over TCP: the client facade with its session reactor,
//! the subscription registry both sides keep, and a server serving an
//! in-memory variable table.

pub mod backend;
pub mod client;
pub mod config;
pub mod doctor;
mod error;
pub mod registry;
pub mod server;
mod session;
mod wire;

pub use backend::{BackendError, MemoryBackend, VarChange, VariableBackend};
pub use client::FlightVarsClient;
pub use config::{load_config, ClientConfig, FlightVarsConfig, ServerConfig, VarEntry};
pub use error::{
    CommunicationError, Disconnection, FlightVarsError, ProtocolError, RegistryError, RequestTimeoutError,
};
pub use registry::SubscriptionRegistry;
pub use server::{FlightVarsServer, SubscriptionIdGenerator};
pub use session::{ConnectionState, UpdateHandler};

pub use oac_proto::{SubscriptionId, SubscriptionStatus, VariableId, VariableValue};
