use std::io;

use thiserror::Error;

/// Failure while encoding or decoding a FlightVars message.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid message type code 0x{0:04x}")]
    InvalidMessageType(u16),

    #[error("invalid variable type code {0}")]
    InvalidVariableType(u8),

    #[error("invalid termination mark 0x{0:04x} (expected 0x0d0a)")]
    InvalidTerminationMark(u16),

    #[error("string field is not valid UTF-8")]
    InvalidString(#[from] std::string::FromUtf8Error),

    #[error("string field of {0} bytes does not fit a 16-bit length prefix")]
    StringTooLong(usize),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// True when the stream ended before a whole message was available.
    ///
    /// Callers reading from a ring buffer treat this as "wait for more bytes"
    /// and rewind to their mark instead of failing the connection.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, CodecError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }

    /// True for violations of the wire contract (as opposed to transport failures).
    pub fn is_protocol(&self) -> bool {
        !matches!(self, CodecError::Io(_))
    }
}

/// Malformed `<group>-><name>` variable identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot parse variable id {input:?}: {reason}")]
pub struct ParseError {
    pub input: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("buffer capacity exhausted ({requested} bytes requested, {available} available)")]
    CapacityExhausted { requested: usize, available: usize },
}
