//! Virtual Connection Core
//!
//! Stable API for the virtual connection layer: entity types, the message
//! envelope and handshake bodies, sequence allocation, the physical transport
//! interfaces, configuration, diagnostics, and errors. The engine that ties
//! them together lives in `vconn-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod errors;
pub mod message;
pub mod monitoring;
pub mod sequence;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::MessengerConfig;
pub use errors::{
    invariant_violation, HandshakeError, Result, TransportError, VconnError, VconnResult,
};
pub use message::{AcceptBody, ConnectBody, Message, MessageHeader, MessageKind, MessageStamps, Route};
pub use monitoring::{
    current_timestamp, ConnectionStateCounts, DiagnosticsReport, DispatchMonitor, DispatchTier,
    LatencyStats, SlowMessageSample, SlowSampleRing, TierStats,
};
pub use sequence::{compose_message_id, split_message_id, SequenceAllocator};
pub use transport::{
    deliver_inbound, same_connection, AuthVerdict, Authorizer, ConnectionId, PhysicalConnection,
    PhysicalTransport, Policy, TransportHandler,
};
pub use types::{EntityAddr, EntityInstance, EntityName, EntityType, OwnerKey};
