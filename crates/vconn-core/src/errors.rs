//! Error types for the virtual connection layer
//!
//! Transport failures, handshake decoding failures, and the `VconnError` type
//! that unifies them for the public API.

use crate::types::EntityInstance;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failures reported by a physical connection
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection {connection_id} is closed")]
    ConnectionClosed { connection_id: u64 },
    #[error("Send failed on connection {connection_id}: {reason}")]
    SendFailed { connection_id: u64, reason: String },
    #[error("Peer address unreachable: {addr}")]
    Unreachable { addr: String },
    #[error("Transport shutdown: {reason}")]
    Shutdown { reason: String },
}

/// Failures while decoding or validating handshake bodies
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Malformed {kind} body: {source}")]
    MalformedBody {
        kind: &'static str,
        #[source]
        source: bincode::Error,
    },
    #[error("Handshake message {kind} is missing a sequence id")]
    MissingSequence { kind: &'static str },
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Unified error type for the virtual connection layer
#[derive(Debug, thiserror::Error)]
pub enum VconnError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("No connection from {src} to {dst} and policy forbids creating one")]
    NoConnection { src: String, dst: String },

    #[error("Messenger is stopped")]
    Stopped,

    #[error("Timed out after {duration_ms}ms waiting for {what}")]
    Timeout { what: String, duration_ms: u64 },

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl VconnError {
    /// The destination role requires an existing connection and none was found
    pub fn no_connection(src: &EntityInstance, dst: &EntityInstance) -> Self {
        Self::NoConnection {
            src: src.to_string(),
            dst: dst.to_string(),
        }
    }

    /// Create a timeout error
    pub fn timeout(what: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            what: what.into(),
            duration_ms,
        }
    }

    /// Create a runtime error
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Create a configuration error
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

pub type Result<T> = core::result::Result<T, VconnError>;
pub type VconnResult<T> = Result<T>;

// ----------------------------------------------------------------------------
// Invariant Violations
// ----------------------------------------------------------------------------

/// Abort on a broken structural invariant.
///
/// Registry indices disagreeing means a message could be routed to the wrong
/// peer, so there is no recovery path.
#[track_caller]
pub fn invariant_violation(what: &str) -> ! {
    tracing::error!(invariant = what, "structural invariant violated");
    panic!("virtual connection invariant violated: {what}");
}
