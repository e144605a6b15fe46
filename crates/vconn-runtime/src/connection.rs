//! Virtual Connection
//!
//! One logical channel between two entity instances. The connection owns its
//! pending queue and its handshake state. The physical connection it rides is
//! owned by the transport and only referenced here.
//!
//! Everything mutable sits behind one mutex, and the mutex is held while a
//! message is handed to the physical connection. That keeps per-connection
//! ordering: the queue drain at Connecting→Connected and any concurrent
//! sender are serialized.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use vconn_core::{
    Authorizer, ConnectionId, EntityInstance, Message, PhysicalConnection, SequenceAllocator,
};

// ----------------------------------------------------------------------------
// State
// ----------------------------------------------------------------------------

/// Lifecycle state of a virtual connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Local teardown in progress; waiting for RemoveAck
    MarkDowning,
    /// Administrative stop; no peer notification
    Stopped,
}

impl ConnectionState {
    pub fn state_name(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::MarkDowning => "mark_downing",
            ConnectionState::Stopped => "stopped",
        }
    }

    /// Live connections may be reused by lookups
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// Which side started the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Init,
    Client,
    Server,
}

/// Result of handing a message to a connection
#[derive(Debug)]
pub enum SendOutcome {
    Sent,
    /// Buffered until the handshake completes
    Queued,
    /// The connection is being torn down; resolve a fresh one and retry
    Redirect(Message),
    Dropped,
}

/// Result of a local mark-down request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkDownOutcome {
    RemoveSent,
    AlreadyMarkingDown,
    NoPhysical,
}

// ----------------------------------------------------------------------------
// Virtual Connection
// ----------------------------------------------------------------------------

struct ConnectionInner {
    src: EntityInstance,
    state: ConnectionState,
    physical: Option<Arc<dyn PhysicalConnection>>,
    remote_seq: u64,
    direction: Direction,
    pending: VecDeque<Message>,
    auth_context: Option<Authorizer>,
    connect_sent: bool,
}

/// A logical channel `(src, dst)` multiplexed over a physical connection
pub struct VirtualConnection {
    dst: EntityInstance,
    local_seq: u64,
    created_at: Instant,
    inner: Mutex<ConnectionInner>,
    bound: watch::Sender<bool>,
    reset_claimed: AtomicBool,
}

impl VirtualConnection {
    pub(crate) fn new(
        src: EntityInstance,
        dst: EntityInstance,
        local_seq: u64,
        direction: Direction,
    ) -> Arc<Self> {
        let (bound, _) = watch::channel(false);
        Arc::new(Self {
            dst,
            local_seq,
            created_at: Instant::now(),
            inner: Mutex::new(ConnectionInner {
                src,
                state: ConnectionState::Connecting,
                physical: None,
                remote_seq: 0,
                direction,
                pending: VecDeque::new(),
                auth_context: None,
                connect_sent: false,
            }),
            bound,
            reset_claimed: AtomicBool::new(false),
        })
    }

    pub fn src(&self) -> EntityInstance {
        self.inner.lock().src
    }

    pub fn dst(&self) -> EntityInstance {
        self.dst
    }

    pub fn local_seq(&self) -> u64 {
        self.local_seq
    }

    pub fn remote_seq(&self) -> u64 {
        self.inner.lock().remote_seq
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn direction(&self) -> Direction {
        self.inner.lock().direction
    }

    pub fn physical(&self) -> Option<Arc<dyn PhysicalConnection>> {
        self.inner.lock().physical.clone()
    }

    pub fn is_bound(&self) -> bool {
        self.inner.lock().physical.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn auth_context(&self) -> Option<Authorizer> {
        self.inner.lock().auth_context.clone()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether the handshake sequence `seq` is not newer than what we know
    pub fn is_stale(&self, seq: u64) -> bool {
        let remote = self.remote_seq();
        remote != 0 && remote >= seq
    }

    // ------------------------------------------------------------------------
    // Registry-side mutation
    // ------------------------------------------------------------------------

    pub(crate) fn set_src(&self, src: EntityInstance) {
        self.inner.lock().src = src;
    }

    pub(crate) fn bind_physical(&self, physical: Arc<dyn PhysicalConnection>) {
        self.inner.lock().physical = Some(physical);
        self.bound.send_replace(true);
    }

    /// Claim the single reset notification for this connection
    pub(crate) fn claim_reset(&self) -> bool {
        !self.reset_claimed.swap(true, Ordering::AcqRel)
    }

    /// Claim the right to send the initial Connect
    pub(crate) fn claim_connect(&self, auth: Option<Authorizer>) -> bool {
        let mut inner = self.inner.lock();
        if inner.connect_sent || inner.state != ConnectionState::Connecting {
            return false;
        }
        inner.connect_sent = true;
        inner.auth_context = auth;
        true
    }

    /// Hard stop. Queued messages are discarded.
    pub(crate) fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.state = ConnectionState::Stopped;
        inner.pending.clear();
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Send an application message through this connection
    pub fn send(&self, mut msg: Message, sequences: &SequenceAllocator) -> SendOutcome {
        let mut inner = self.inner.lock();
        match inner.state {
            ConnectionState::Stopped => {
                debug!(dst = %self.dst, local_seq = self.local_seq, "connection stopped, dropping message");
                SendOutcome::Dropped
            }
            ConnectionState::MarkDowning => SendOutcome::Redirect(msg),
            ConnectionState::Connecting => {
                trace!(dst = %self.dst, local_seq = self.local_seq, "handshake pending, queueing message");
                inner.pending.push_back(msg);
                SendOutcome::Queued
            }
            ConnectionState::Connected => {
                self.flush_locked(&mut inner, sequences);
                self.stamp_locked(&inner, &mut msg, sequences);
                if self.transmit_locked(&inner, msg) {
                    SendOutcome::Sent
                } else {
                    SendOutcome::Dropped
                }
            }
        }
    }

    /// Send a handshake message regardless of state, bypassing the queue
    pub(crate) fn send_control(&self, mut msg: Message, sequences: &SequenceAllocator) -> bool {
        let inner = self.inner.lock();
        self.stamp_locked(&inner, &mut msg, sequences);
        self.transmit_locked(&inner, msg)
    }

    /// Connecting→Connected. Learns the peer sequence, optionally sends the
    /// Accept first, then drains the queue in order.
    pub(crate) fn complete_handshake(
        &self,
        remote_seq: u64,
        accept: Option<Message>,
        sequences: &SequenceAllocator,
    ) -> bool {
        let mut inner = self.inner.lock();
        if remote_seq > inner.remote_seq {
            inner.remote_seq = remote_seq;
        }
        if let Some(mut accept) = accept {
            self.stamp_locked(&inner, &mut accept, sequences);
            self.transmit_locked(&inner, accept);
        }
        if inner.state != ConnectionState::Connecting {
            return false;
        }
        inner.state = ConnectionState::Connected;
        self.flush_locked(&mut inner, sequences);
        true
    }

    /// Connected→MarkDowning, sending Remove once
    pub(crate) fn begin_mark_down(&self, sequences: &SequenceAllocator) -> MarkDownOutcome {
        let mut inner = self.inner.lock();
        if matches!(
            inner.state,
            ConnectionState::MarkDowning | ConnectionState::Stopped
        ) {
            return MarkDownOutcome::AlreadyMarkingDown;
        }
        if inner.physical.is_none() {
            return MarkDownOutcome::NoPhysical;
        }
        inner.state = ConnectionState::MarkDowning;
        inner.pending.clear();
        let mut remove = Message::remove();
        self.stamp_locked(&inner, &mut remove, sequences);
        self.transmit_locked(&inner, remove);
        MarkDownOutcome::RemoveSent
    }

    fn flush_locked(&self, inner: &mut ConnectionInner, sequences: &SequenceAllocator) {
        while let Some(mut queued) = inner.pending.pop_front() {
            self.stamp_locked(inner, &mut queued, sequences);
            self.transmit_locked(inner, queued);
        }
    }

    fn stamp_locked(&self, inner: &ConnectionInner, msg: &mut Message, sequences: &SequenceAllocator) {
        msg.header.src = inner.src;
        msg.header.dst = self.dst;
        msg.header.vconn_seq = self.local_seq;
        msg.header.dst_vconn_seq = inner.remote_seq;
        msg.header.msg_seq = sequences.next_message_id(&inner.src.name);
    }

    fn transmit_locked(&self, inner: &ConnectionInner, msg: Message) -> bool {
        let Some(physical) = inner.physical.as_ref() else {
            debug!(dst = %self.dst, kind = %msg.kind(), "no physical connection, dropping message");
            return false;
        };
        let msg_seq = msg.header.msg_seq;
        match physical.send_message(msg) {
            Ok(()) => true,
            Err(err) => {
                warn!(dst = %self.dst, msg_seq = %format!("{:#x}", msg_seq), error = %err, "physical send failed");
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Waiting
    // ------------------------------------------------------------------------

    /// Wait until a physical connection is bound, up to `timeout`
    pub async fn wait_bound(&self, timeout: Duration) -> bool {
        let mut rx = self.bound.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|bound| *bound)).await;
        matches!(waited, Ok(Ok(_)))
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let inner = self.inner.lock();
        ConnectionSnapshot {
            src: inner.src.to_string(),
            dst: self.dst.to_string(),
            state: inner.state,
            direction: inner.direction,
            local_seq: self.local_seq,
            remote_seq: inner.remote_seq,
            pending: inner.pending.len(),
            physical: inner.physical.as_ref().map(|p| p.id()),
            age_ms: self.created_at.elapsed().as_millis() as u64,
        }
    }
}

impl core::fmt::Debug for VirtualConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("VirtualConnection")
            .field("src", &inner.src)
            .field("dst", &self.dst)
            .field("state", &inner.state)
            .field("local_seq", &self.local_seq)
            .field("remote_seq", &inner.remote_seq)
            .finish()
    }
}

/// Serializable view of one connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub src: String,
    pub dst: String,
    pub state: ConnectionState,
    pub direction: Direction,
    pub local_seq: u64,
    pub remote_seq: u64,
    pub pending: usize,
    pub physical: Option<ConnectionId>,
    pub age_ms: u64,
}
