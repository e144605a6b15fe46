//! Message envelope and handshake bodies
//!
//! Every message carries a header naming its logical source and destination
//! plus the virtual connection sequence ids used for routing. Handshake
//! bodies are bincode encoded into the payload.

use crate::errors::HandshakeError;
use crate::transport::PhysicalConnection;
use crate::types::{EntityAddr, EntityInstance, EntityName};
use bytes::Bytes;
use core::fmt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Number of payload bytes rendered in message summaries
const SUMMARY_PREVIEW_BYTES: usize = 16;

// ----------------------------------------------------------------------------
// Message Kind
// ----------------------------------------------------------------------------

/// Handshake kinds plus opaque application message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Connect,
    Accept,
    Remove,
    RemoveAck,
    User(u16),
}

impl MessageKind {
    /// Handshake kinds are handled by the virtual layer itself
    pub fn is_handshake(&self) -> bool {
        !matches!(self, MessageKind::User(_))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            MessageKind::Connect => "connect",
            MessageKind::Accept => "accept",
            MessageKind::Remove => "remove",
            MessageKind::RemoveAck => "remove_ack",
            MessageKind::User(_) => "user",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::User(t) => write!(f, "user({})", t),
            other => f.write_str(other.kind_name()),
        }
    }
}

// ----------------------------------------------------------------------------
// Header
// ----------------------------------------------------------------------------

/// Routing header stamped when a message leaves a virtual connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub src: EntityInstance,
    pub dst: EntityInstance,
    pub kind: MessageKind,
    /// Sender's local sequence id for the virtual connection
    pub vconn_seq: u64,
    /// Receiver's local sequence id, 0 when the sender has not learned it
    pub dst_vconn_seq: u64,
    /// Tagged message id
    pub msg_seq: u64,
}

impl MessageHeader {
    fn unstamped(kind: MessageKind) -> Self {
        let blank = EntityInstance::new(
            EntityName::client(EntityName::UNSET_NUM),
            EntityAddr::blank(),
        );
        Self {
            src: blank,
            dst: blank,
            kind,
            vconn_seq: 0,
            dst_vconn_seq: 0,
            msg_seq: 0,
        }
    }
}

// ----------------------------------------------------------------------------
// Pipeline Stamps
// ----------------------------------------------------------------------------

/// Receive-side pipeline timestamps, used for slow-message diagnostics
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageStamps {
    pub recv: Option<Instant>,
    pub throttle: Option<Instant>,
    pub recv_complete: Option<Instant>,
    pub preprocess_end: Option<Instant>,
}

/// Resolution of an inbound message to a local virtual connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Route {
    #[default]
    Unresolved,
    /// Resolved to the connection with this local sequence id
    Resolved(u64),
    /// Preprocessing decided the message must be dropped
    Rejected,
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// A message travelling through the virtual layer
#[derive(Clone)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Bytes,
    pub stamps: MessageStamps,
    connection: Option<Arc<dyn PhysicalConnection>>,
    route: Route,
}

impl Message {
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            header: MessageHeader::unstamped(kind),
            payload: payload.into(),
            stamps: MessageStamps::default(),
            connection: None,
            route: Route::Unresolved,
        }
    }

    /// Application message of the given type
    pub fn user(type_id: u16, payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::User(type_id), payload)
    }

    pub fn connect(body: &ConnectBody) -> Result<Self, HandshakeError> {
        Ok(Self::new(MessageKind::Connect, encode_body("connect", body)?))
    }

    pub fn accept(body: &AcceptBody) -> Result<Self, HandshakeError> {
        Ok(Self::new(MessageKind::Accept, encode_body("accept", body)?))
    }

    pub fn remove() -> Self {
        Self::new(MessageKind::Remove, Bytes::new())
    }

    pub fn remove_ack() -> Self {
        Self::new(MessageKind::RemoveAck, Bytes::new())
    }

    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    pub fn src(&self) -> &EntityInstance {
        &self.header.src
    }

    pub fn dst(&self) -> &EntityInstance {
        &self.header.dst
    }

    pub fn connect_body(&self) -> Result<ConnectBody, HandshakeError> {
        decode_body("connect", &self.payload)
    }

    pub fn accept_body(&self) -> Result<AcceptBody, HandshakeError> {
        decode_body("accept", &self.payload)
    }

    /// Physical connection the message arrived on
    pub fn connection(&self) -> Option<&Arc<dyn PhysicalConnection>> {
        self.connection.as_ref()
    }

    pub fn set_connection(&mut self, connection: Arc<dyn PhysicalConnection>) {
        self.connection = Some(connection);
    }

    pub fn route(&self) -> Route {
        self.route
    }

    pub fn set_route(&mut self, route: Route) {
        self.route = route;
    }

    /// One-line description used in logs and slow-message samples
    pub fn summary(&self) -> String {
        let preview = &self.payload[..self.payload.len().min(SUMMARY_PREVIEW_BYTES)];
        format!(
            "{} vseq={} dseq={} id={:#x} len={} data={}",
            self.header.kind,
            self.header.vconn_seq,
            self.header.dst_vconn_seq,
            self.header.msg_seq,
            self.payload.len(),
            hex::encode(preview)
        )
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .field("connection", &self.connection.as_ref().map(|c| c.id()))
            .field("route", &self.route)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Handshake Bodies
// ----------------------------------------------------------------------------

/// Payload of a Connect message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectBody {
    pub authorizer_protocol: u32,
    pub authorizer: Vec<u8>,
}

/// Payload of an Accept message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptBody {
    pub authorizer_reply: Vec<u8>,
    /// Set when the server refused the authorizer
    pub rejected: bool,
}

fn encode_body<T: Serialize>(kind: &'static str, body: &T) -> Result<Bytes, HandshakeError> {
    bincode::serialize(body)
        .map(Bytes::from)
        .map_err(|source| HandshakeError::MalformedBody { kind, source })
}

fn decode_body<T: for<'de> Deserialize<'de>>(
    kind: &'static str,
    payload: &[u8],
) -> Result<T, HandshakeError> {
    bincode::deserialize(payload).map_err(|source| HandshakeError::MalformedBody { kind, source })
}
