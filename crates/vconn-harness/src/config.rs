//! Memory Transport Configuration

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use vconn_core::{EntityType, Policy};

/// Behavior of one in-memory transport endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryTransportConfig {
    /// Per-role policies; roles not listed use `default_policy`
    pub policies: Vec<(EntityType, Policy)>,
    pub default_policy: Policy,
    /// Report a blank local address until the first outbound connection
    pub start_unaddressed: bool,
    /// Refuse outbound connections, as if every peer were unreachable
    pub refuse_outbound: bool,
}

impl Default for MemoryTransportConfig {
    fn default() -> Self {
        Self {
            policies: Vec::new(),
            default_policy: Policy::lossless_peer(),
            start_unaddressed: false,
            refuse_outbound: false,
        }
    }
}

impl MemoryTransportConfig {
    /// Cluster member talking to peers and serving clients
    pub fn member() -> Self {
        Self {
            policies: vec![(EntityType::Client, Policy::stateless_server())],
            ..Self::default()
        }
    }

    /// Client process that learns its address on first connect
    pub fn client() -> Self {
        Self {
            start_unaddressed: true,
            ..Self::default()
        }
    }

    /// Endpoint that can be reached but never dials out
    pub fn isolated() -> Self {
        Self {
            refuse_outbound: true,
            ..Self::default()
        }
    }

    pub fn with_policy(mut self, peer_type: EntityType, policy: Policy) -> Self {
        self.policies.retain(|(t, _)| *t != peer_type);
        self.policies.push((peer_type, policy));
        self
    }

    pub fn policy(&self, peer_type: EntityType) -> Policy {
        self.policies
            .iter()
            .find(|(t, _)| *t == peer_type)
            .map(|(_, p)| *p)
            .unwrap_or(self.default_policy)
    }
}

/// Counters for one transport endpoint
#[derive(Debug, Default)]
pub struct MemoryTransportStats {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub connections_established: AtomicU64,
    pub connections_accepted: AtomicU64,
    pub connections_lost: AtomicU64,
}

impl MemoryTransportStats {
    pub fn sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    pub fn established(&self) -> u64 {
        self.connections_established.load(Ordering::Relaxed)
    }

    pub fn accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    pub fn lost(&self) -> u64 {
        self.connections_lost.load(Ordering::Relaxed)
    }
}
