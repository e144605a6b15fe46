//! Shared fixtures for unit tests

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vconn_core::{
    ConnectionId, EntityAddr, EntityInstance, EntityName, EntityType, Message, PhysicalConnection,
    TransportError,
};

pub fn addr(port: u16) -> EntityAddr {
    EntityAddr::new(SocketAddr::from(([127, 0, 0, 1], port)), 1)
}

pub fn instance(name: EntityName, port: u16) -> EntityInstance {
    EntityInstance::new(name, addr(port))
}

/// Physical connection that records what was sent
pub struct RecordingConnection {
    id: u64,
    peer: EntityAddr,
    connected: AtomicBool,
    sent: Mutex<Vec<Message>>,
}

impl RecordingConnection {
    pub fn new(id: u64) -> Arc<Self> {
        Self::with_peer(id, addr(7000 + id as u16))
    }

    pub fn with_peer(id: u64, peer: EntityAddr) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer,
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }
}

impl PhysicalConnection for RecordingConnection {
    fn id(&self) -> ConnectionId {
        ConnectionId(self.id)
    }

    fn peer_addr(&self) -> EntityAddr {
        self.peer
    }

    fn peer_type(&self) -> EntityType {
        EntityType::Storage
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn send_message(&self, msg: Message) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed {
                connection_id: self.id,
            });
        }
        self.sent.lock().push(msg);
        Ok(())
    }

    fn mark_down(&self) {
        self.connected.store(false, Ordering::Release);
    }
}
