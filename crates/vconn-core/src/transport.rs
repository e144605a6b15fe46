//! Physical transport interfaces
//!
//! The virtual layer does not open sockets. It consumes a `PhysicalTransport`
//! that hands out `PhysicalConnection`s, and it implements
//! `TransportHandler` so the transport can call back on connection events
//! and inbound messages.

use crate::errors::TransportError;
use crate::message::Message;
use crate::types::{EntityAddr, EntityInstance, EntityType};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Instant;

// ----------------------------------------------------------------------------
// Physical Connection
// ----------------------------------------------------------------------------

/// Transport-assigned identity of a physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "con#{}", self.0)
    }
}

/// One physical connection owned by the transport
pub trait PhysicalConnection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Address of the remote end
    fn peer_addr(&self) -> EntityAddr;

    /// Role of the remote end
    fn peer_type(&self) -> EntityType;

    fn is_connected(&self) -> bool;

    /// Queue a message for transmission. Must not call back into the
    /// handler on the calling thread.
    fn send_message(&self, msg: Message) -> Result<(), TransportError>;

    /// Close the connection
    fn mark_down(&self);
}

/// Identity comparison for shared physical connections
pub fn same_connection(a: &Arc<dyn PhysicalConnection>, b: &Arc<dyn PhysicalConnection>) -> bool {
    a.id() == b.id()
}

// ----------------------------------------------------------------------------
// Transport Policy
// ----------------------------------------------------------------------------

/// Per-role connection policy of the transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Never initiate connections toward this role; only reuse existing ones
    pub server: bool,
    /// Connections to this role may drop messages on reset
    pub lossy: bool,
}

impl Policy {
    pub fn lossless_peer() -> Self {
        Self {
            server: false,
            lossy: false,
        }
    }

    pub fn stateless_server() -> Self {
        Self {
            server: true,
            lossy: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Physical Transport
// ----------------------------------------------------------------------------

/// The underlying messenger that owns sockets and framing
pub trait PhysicalTransport: Send + Sync {
    /// Local instance; the address stays blank until it has been learned
    fn my_instance(&self) -> EntityInstance;

    /// Establish or reuse a physical connection toward `dst`
    fn get_connection(&self, dst: &EntityInstance) -> Option<Arc<dyn PhysicalConnection>>;

    /// Close the physical connection toward an address
    fn mark_down(&self, addr: &EntityAddr);

    fn mark_down_all(&self);

    fn policy(&self, peer_type: EntityType) -> Policy;

    /// Register the callback surface. The transport keeps only a weak reference.
    fn attach_handler(&self, handler: Weak<dyn TransportHandler>);

    fn shutdown(&self);
}

// ----------------------------------------------------------------------------
// Authorization
// ----------------------------------------------------------------------------

/// Credentials offered in a Connect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authorizer {
    pub protocol: u32,
    pub payload: Bytes,
}

/// Outcome of verifying an offered authorizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthVerdict {
    pub valid: bool,
    pub reply: Bytes,
}

impl AuthVerdict {
    pub fn accept() -> Self {
        Self {
            valid: true,
            reply: Bytes::new(),
        }
    }

    pub fn reject() -> Self {
        Self {
            valid: false,
            reply: Bytes::new(),
        }
    }
}

// ----------------------------------------------------------------------------
// Transport Handler
// ----------------------------------------------------------------------------

/// Callback surface the transport drives
pub trait TransportHandler: Send + Sync {
    /// Outbound connection established; the local address is now known
    fn on_connect(&self, conn: &Arc<dyn PhysicalConnection>);

    /// Inbound connection accepted
    fn on_accept(&self, conn: &Arc<dyn PhysicalConnection>);

    /// Connection failed locally
    fn on_reset(&self, conn: &Arc<dyn PhysicalConnection>) -> bool;

    /// Peer reset the connection
    fn on_remote_reset(&self, conn: &Arc<dyn PhysicalConnection>);

    /// Runs before ordering guarantees are established
    fn fast_preprocess(&self, msg: &mut Message);

    fn can_fast_dispatch(&self, msg: &Message) -> bool;

    fn fast_dispatch(&self, msg: Message);

    fn dispatch(&self, msg: Message) -> bool;

    /// Transport-level authorizer for an outgoing physical connection
    fn get_authorizer(&self, peer_type: EntityType) -> Option<Authorizer>;

    /// Verify a transport-level authorizer presented on an incoming connection
    fn verify_authorizer(
        &self,
        conn: &Arc<dyn PhysicalConnection>,
        peer_type: EntityType,
        authorizer: &Authorizer,
    ) -> AuthVerdict;
}

/// Run one inbound message through the handler pipeline.
///
/// Transports call this from their receive path: stamp, preprocess, then
/// either fast dispatch or full dispatch. Returns whether a handler took it.
pub fn deliver_inbound(handler: &dyn TransportHandler, mut msg: Message) -> bool {
    let now = Instant::now();
    msg.stamps.recv.get_or_insert(now);
    msg.stamps.throttle.get_or_insert(now);
    msg.stamps.recv_complete = Some(Instant::now());

    handler.fast_preprocess(&mut msg);
    msg.stamps.preprocess_end = Some(Instant::now());

    if handler.can_fast_dispatch(&msg) {
        handler.fast_dispatch(msg);
        true
    } else {
        handler.dispatch(msg)
    }
}
