//! In-Memory Network
//!
//! Address book shared by every `MemoryTransport` in a test. Endpoints are
//! keyed by their network address and held weakly, so dropping a transport
//! makes its address unreachable.

use crate::config::MemoryTransportConfig;
use crate::transport::MemoryTransport;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};
use vconn_core::{ConnectionId, EntityAddr, EntityName};

/// First port handed out by `bind`
pub const BASE_PORT: u16 = 6800;

/// Simulated network of in-memory transports
pub struct MemoryNetwork {
    endpoints: DashMap<EntityAddr, Weak<MemoryTransport>>,
    next_port: AtomicU16,
    next_nonce: AtomicU32,
    next_connection: AtomicU64,
    /// Serializes physical connection setup across all endpoints
    dial_lock: Mutex<()>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
            next_port: AtomicU16::new(BASE_PORT),
            next_nonce: AtomicU32::new(1),
            next_connection: AtomicU64::new(1),
            dial_lock: Mutex::new(()),
        })
    }

    /// Attach a new endpoint for `name` at a fresh address.
    ///
    /// Must be called inside a tokio runtime; the endpoint's inbox runs as a
    /// spawned task.
    pub fn bind(self: &Arc<Self>, name: EntityName, config: MemoryTransportConfig) -> Arc<MemoryTransport> {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let addr = EntityAddr::new(SocketAddr::from(([127, 0, 0, 1], port)), nonce);
        let transport = MemoryTransport::spawn(self.clone(), name, addr, config);
        self.endpoints.insert(addr, Arc::downgrade(&transport));
        info!(name = %name, addr = %addr, "memory endpoint bound");
        transport
    }

    pub fn lookup(&self, addr: &EntityAddr) -> Option<Arc<MemoryTransport>> {
        self.endpoints.get(addr).and_then(|w| w.upgrade())
    }

    pub(crate) fn unregister(&self, addr: &EntityAddr) {
        self.endpoints.remove(addr);
    }

    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn dial_guard(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.dial_lock.lock()
    }

    /// Fail the physical connection between two endpoints. Both sides see a
    /// local reset.
    pub fn sever(&self, a: &EntityAddr, b: &EntityAddr) -> bool {
        let Some(transport) = self.lookup(a) else {
            return false;
        };
        match transport.connection_to(b) {
            Some(conn) => {
                debug!(a = %a, b = %b, "severing physical connection");
                conn.sever();
                true
            }
            None => false,
        }
    }

    /// Number of reachable endpoints
    pub fn endpoints(&self) -> usize {
        self.endpoints.iter().filter(|e| e.value().strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_assigns_distinct_addresses() {
        let network = MemoryNetwork::new();
        let a = network.bind(EntityName::storage(0), MemoryTransportConfig::default());
        let b = network.bind(EntityName::storage(1), MemoryTransportConfig::default());

        assert_ne!(a.addr(), b.addr());
        assert_eq!(network.endpoints(), 2);
        assert!(network.lookup(&a.addr()).is_some());

        drop(b);
        assert_eq!(network.endpoints(), 1);
    }
}
