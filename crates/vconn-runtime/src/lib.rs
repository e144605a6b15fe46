//! Virtual Connection Runtime
//!
//! This crate contains the engine of the virtual connection layer:
//! - `VirtualMessenger`: the façade subsystems send and register through
//! - `ConnectionRegistry`: the indexed table of live virtual connections
//! - `DispatcherRegistry`: per-owner ordered handler lists
//! - `ResetDelivery`: the single async reset notification worker
//!
//! `vconn-core` provides the stable types and transport interfaces.

pub mod builder;
pub mod connection;
pub mod dispatch;
pub mod messenger;
pub mod registry;
pub mod reset;

#[cfg(test)]
mod test_support;

pub use builder::MessengerBuilder;
pub use connection::{
    ConnectionSnapshot, ConnectionState, Direction, MarkDownOutcome, SendOutcome,
    VirtualConnection,
};
pub use dispatch::{Dispatcher, DispatcherRegistry, HandlerList, Position};
pub use messenger::VirtualMessenger;
pub use registry::{ConnectDecision, ConnectionRegistry, Lookup, Migration};
pub use reset::{ResetDelivery, ResetEvent, ResetKind, ResetSink};

// Re-export core types for convenience
pub use vconn_core::{
    AcceptBody, AuthVerdict, Authorizer, ConnectBody, DiagnosticsReport, DispatchTier, EntityAddr,
    EntityInstance, EntityName, EntityType, Message, MessageKind, MessengerConfig, OwnerKey,
    PhysicalConnection, PhysicalTransport, TransportHandler, VconnError, VconnResult,
};
