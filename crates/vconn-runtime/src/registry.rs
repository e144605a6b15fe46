//! Connection Registry
//!
//! Authoritative map from `(src, dst)` to a virtual connection, with three
//! auxiliary indices:
//!
//! - pending-source: connections created while the local address was blank
//! - sequence: `local_seq` → connection
//! - physical address: remote address → set of `local_seq` riding it
//!
//! One reader/writer lock guards all of them so insertion and removal are a
//! single step. Lock order is registry, then connection mutex; the registry
//! never calls out to dispatchers while the lock is held.

use crate::connection::{ConnectionState, Direction, VirtualConnection};
use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, trace};
use vconn_core::{
    invariant_violation, same_connection, ConnectionStateCounts, EntityAddr, EntityInstance,
    OwnerKey, PhysicalConnection, SequenceAllocator,
};

type DestinationMap = HashMap<EntityInstance, Arc<VirtualConnection>>;
type OwnerMap = HashMap<OwnerKey, DestinationMap>;

#[derive(Default)]
struct Indices {
    primary: OwnerMap,
    pending: OwnerMap,
    by_seq: HashMap<u64, Arc<VirtualConnection>>,
    by_physical: HashMap<EntityAddr, HashSet<u64>>,
}

impl Indices {
    fn table(&self, src: &EntityInstance) -> &OwnerMap {
        if src.has_blank_addr() {
            &self.pending
        } else {
            &self.primary
        }
    }

    fn table_mut(&mut self, src: &EntityInstance) -> &mut OwnerMap {
        if src.has_blank_addr() {
            &mut self.pending
        } else {
            &mut self.primary
        }
    }

    fn find(&self, src: &EntityInstance, dst: &EntityInstance) -> Option<&Arc<VirtualConnection>> {
        self.table(src).get(&src.owner_key())?.get(dst)
    }

    fn insert(&mut self, conn: &Arc<VirtualConnection>) {
        let src = conn.src();
        let previous = self
            .table_mut(&src)
            .entry(src.owner_key())
            .or_default()
            .insert(conn.dst(), conn.clone());
        if previous.is_some() {
            invariant_violation("registry insert over an existing entry");
        }
        if self.by_seq.insert(conn.local_seq(), conn.clone()).is_some() {
            invariant_violation("sequence id issued twice");
        }
        self.index_physical(conn, &src);
    }

    fn index_physical(&mut self, conn: &Arc<VirtualConnection>, src: &EntityInstance) {
        if src.has_blank_addr() {
            return;
        }
        if let Some(physical) = conn.physical() {
            self.by_physical
                .entry(physical.peer_addr())
                .or_default()
                .insert(conn.local_seq());
        }
    }

    fn unindex_physical(&mut self, conn: &VirtualConnection) {
        let Some(physical) = conn.physical() else {
            return;
        };
        let addr = physical.peer_addr();
        if let Some(seqs) = self.by_physical.get_mut(&addr) {
            seqs.remove(&conn.local_seq());
            if seqs.is_empty() {
                self.by_physical.remove(&addr);
            }
        }
    }

    /// Remove `conn` from every index; false if it was already gone
    fn remove(&mut self, conn: &Arc<VirtualConnection>) -> bool {
        let src = conn.src();
        let key = src.owner_key();
        let table = self.table_mut(&src);
        let in_table = match table.get_mut(&key) {
            Some(dsts) => {
                let matches = dsts
                    .get(&conn.dst())
                    .is_some_and(|existing| Arc::ptr_eq(existing, conn));
                if matches {
                    dsts.remove(&conn.dst());
                    if dsts.is_empty() {
                        table.remove(&key);
                    }
                }
                matches
            }
            None => false,
        };

        let in_seq = self
            .by_seq
            .get(&conn.local_seq())
            .is_some_and(|existing| Arc::ptr_eq(existing, conn));

        if in_table != in_seq {
            invariant_violation("sequence index disagrees with connection table");
        }
        if in_seq {
            self.by_seq.remove(&conn.local_seq());
            self.unindex_physical(conn);
        }
        in_table
    }

    fn create(
        &mut self,
        sequences: &SequenceAllocator,
        src: EntityInstance,
        dst: EntityInstance,
        direction: Direction,
        physical: Option<Arc<dyn PhysicalConnection>>,
    ) -> Arc<VirtualConnection> {
        let conn = VirtualConnection::new(src, dst, sequences.next(), direction);
        if let Some(physical) = physical {
            conn.bind_physical(physical);
        }
        self.insert(&conn);
        conn
    }
}

// ----------------------------------------------------------------------------
// Lookup Results
// ----------------------------------------------------------------------------

/// Result of `find_or_create`
#[derive(Debug)]
pub struct Lookup {
    pub conn: Arc<VirtualConnection>,
    pub created: bool,
    /// A mark-downing or stopped entry that was torn down to make room
    pub evicted: Option<Arc<VirtualConnection>>,
}

/// Server-side decision for an inbound Connect
#[derive(Debug)]
pub enum ConnectDecision {
    Created(Arc<VirtualConnection>),
    /// A newer peer instance replaced `old`, which is no longer registered
    Superseded {
        new: Arc<VirtualConnection>,
        old: Arc<VirtualConnection>,
    },
    Existing(Arc<VirtualConnection>),
    /// Not newer than what the existing connection already knows
    Stale(Arc<VirtualConnection>),
}

/// Result of re-keying pending-source entries
#[derive(Debug, Default)]
pub struct Migration {
    pub migrated: Vec<Arc<VirtualConnection>>,
    /// Pending entries that collided with an addressed one and were removed
    pub evicted: Vec<Arc<VirtualConnection>>,
}

// ----------------------------------------------------------------------------
// Connection Registry
// ----------------------------------------------------------------------------

/// Registry of live virtual connections
pub struct ConnectionRegistry {
    indices: RwLock<Indices>,
    sequences: Arc<SequenceAllocator>,
}

impl ConnectionRegistry {
    pub fn new(sequences: Arc<SequenceAllocator>) -> Self {
        Self {
            indices: RwLock::new(Indices::default()),
            sequences,
        }
    }

    pub fn sequences(&self) -> &Arc<SequenceAllocator> {
        &self.sequences
    }

    pub fn find(&self, src: &EntityInstance, dst: &EntityInstance) -> Option<Arc<VirtualConnection>> {
        self.indices.read().find(src, dst).cloned()
    }

    /// Find the live connection for a pair or create one.
    ///
    /// A mark-downing or stopped entry is torn down and replaced.
    pub fn find_or_create(
        &self,
        src: &EntityInstance,
        dst: &EntityInstance,
        direction: Direction,
    ) -> Lookup {
        if let Some(conn) = self.find(src, dst) {
            if conn.state().is_live() {
                return Lookup {
                    conn,
                    created: false,
                    evicted: None,
                };
            }
        }

        let mut indices = self.indices.write();
        let mut evicted = None;
        if let Some(existing) = indices.find(src, dst).cloned() {
            if existing.state().is_live() {
                return Lookup {
                    conn: existing,
                    created: false,
                    evicted: None,
                };
            }
            debug!(
                src = %src, dst = %dst, local_seq = existing.local_seq(),
                state = existing.state().state_name(),
                "replacing connection that is going down"
            );
            if indices.remove(&existing) {
                evicted = Some(existing);
            }
        }

        let conn = indices.create(&self.sequences, *src, *dst, direction, None);
        trace!(src = %src, dst = %dst, local_seq = conn.local_seq(), "created virtual connection");
        Lookup {
            conn,
            created: true,
            evicted,
        }
    }

    /// Record the physical connection a virtual connection rides
    pub fn bind_physical(&self, conn: &Arc<VirtualConnection>, physical: Arc<dyn PhysicalConnection>) {
        let mut indices = self.indices.write();
        if let Some(current) = conn.physical() {
            if same_connection(&current, &physical) {
                return;
            }
            indices.unindex_physical(conn);
        }
        conn.bind_physical(physical);
        let registered = indices
            .by_seq
            .get(&conn.local_seq())
            .is_some_and(|existing| Arc::ptr_eq(existing, conn));
        if registered {
            let src = conn.src();
            indices.index_physical(conn, &src);
        }
    }

    /// Remove from every index. Returns true only for the call that removed it.
    pub fn remove(&self, conn: &Arc<VirtualConnection>) -> bool {
        let removed = self.indices.write().remove(conn);
        if removed {
            debug!(src = %conn.src(), dst = %conn.dst(), local_seq = conn.local_seq(), "removed virtual connection");
        }
        removed
    }

    pub fn get_by_seq(&self, seq: u64) -> Option<Arc<VirtualConnection>> {
        self.indices.read().by_seq.get(&seq).cloned()
    }

    /// Sequence ids bound to a remote physical address
    pub fn resolve_by_physical(&self, addr: &EntityAddr) -> HashSet<u64> {
        self.indices
            .read()
            .by_physical
            .get(addr)
            .cloned()
            .unwrap_or_default()
    }

    /// Decide what an inbound Connect does to the `(local, remote)` entry
    pub fn accept_connect(
        &self,
        local: &EntityInstance,
        remote: &EntityInstance,
        incoming_seq: u64,
        physical: Arc<dyn PhysicalConnection>,
    ) -> ConnectDecision {
        let mut indices = self.indices.write();
        let Some(existing) = indices.find(local, remote).cloned() else {
            let conn = indices.create(
                &self.sequences,
                *local,
                *remote,
                Direction::Server,
                Some(physical),
            );
            return ConnectDecision::Created(conn);
        };

        let remote_seq = existing.remote_seq();
        let newer_peer = remote_seq != 0 && remote_seq < incoming_seq;
        if newer_peer || !existing.state().is_live() {
            indices.remove(&existing);
            let new = indices.create(
                &self.sequences,
                *local,
                *remote,
                Direction::Server,
                Some(physical),
            );
            info!(
                local = %local, remote = %remote, old_seq = existing.local_seq(),
                new_seq = new.local_seq(), incoming_seq, "connection superseded by peer"
            );
            return ConnectDecision::Superseded { new, old: existing };
        }

        if existing.is_stale(incoming_seq) {
            return ConnectDecision::Stale(existing);
        }

        if existing.physical().is_none() {
            existing.bind_physical(physical);
            indices.index_physical(&existing, local);
        }
        ConnectDecision::Existing(existing)
    }

    /// Move pending-source entries to the primary index under `local`
    pub fn migrate_pending(&self, local: &EntityInstance) -> Migration {
        let mut migration = Migration::default();
        if local.has_blank_addr() {
            return migration;
        }
        let mut indices = self.indices.write();
        let key = local.owner_key();
        let Some(pending) = indices.pending.remove(&key) else {
            return migration;
        };

        for (dst, conn) in pending {
            if indices.primary.get(&key).is_some_and(|m| m.contains_key(&dst)) {
                // Already connected under the real address; drop the stand-in
                indices.by_seq.remove(&conn.local_seq());
                migration.evicted.push(conn);
                continue;
            }
            conn.set_src(conn.src().with_addr(local.addr));
            indices
                .primary
                .entry(key)
                .or_default()
                .insert(dst, conn.clone());
            indices.index_physical(&conn, local);
            migration.migrated.push(conn);
        }
        if !migration.migrated.is_empty() {
            info!(local = %local, migrated = migration.migrated.len(), "pending connections learned local address");
        }
        migration
    }

    /// Remove every connection riding `physical`
    pub fn remove_physical(&self, physical: &Arc<dyn PhysicalConnection>) -> Vec<Arc<VirtualConnection>> {
        self.remove_at(&physical.peer_addr(), Some(physical))
    }

    /// Remove every connection bound to a remote address
    pub fn remove_by_addr(&self, addr: &EntityAddr) -> Vec<Arc<VirtualConnection>> {
        self.remove_at(addr, None)
    }

    fn remove_at(
        &self,
        addr: &EntityAddr,
        only: Option<&Arc<dyn PhysicalConnection>>,
    ) -> Vec<Arc<VirtualConnection>> {
        let mut indices = self.indices.write();
        let seqs: Vec<u64> = match indices.by_physical.get(addr) {
            Some(seqs) => seqs.iter().copied().collect(),
            None => return Vec::new(),
        };
        let mut removed = Vec::with_capacity(seqs.len());
        for seq in seqs {
            let Some(conn) = indices.by_seq.get(&seq).cloned() else {
                invariant_violation("physical index names an unknown sequence id");
            };
            let rides_it = match (only, conn.physical()) {
                (Some(target), Some(bound)) => same_connection(target, &bound),
                (None, _) => true,
                (Some(_), None) => false,
            };
            if rides_it && indices.remove(&conn) {
                removed.push(conn);
            }
        }
        removed
    }

    /// Remove every connection whose local side is filed under `owner`
    pub fn drain_owner(&self, owner: OwnerKey) -> Vec<Arc<VirtualConnection>> {
        let mut indices = self.indices.write();
        let conns: Vec<_> = indices
            .primary
            .get(&owner)
            .into_iter()
            .chain(indices.pending.get(&owner))
            .flat_map(|m| m.values().cloned())
            .collect();
        conns.into_iter().filter(|c| indices.remove(c)).collect()
    }

    pub fn drain_all(&self) -> Vec<Arc<VirtualConnection>> {
        let mut indices = self.indices.write();
        let conns: Vec<_> = indices.by_seq.values().cloned().collect();
        conns.into_iter().filter(|c| indices.remove(c)).collect()
    }

    pub fn connections_of(&self, owner: OwnerKey) -> Vec<Arc<VirtualConnection>> {
        let indices = self.indices.read();
        indices
            .primary
            .get(&owner)
            .into_iter()
            .chain(indices.pending.get(&owner))
            .flat_map(|m| m.values().cloned())
            .collect()
    }

    pub fn all_connections(&self) -> Vec<Arc<VirtualConnection>> {
        let mut conns: Vec<_> = self.indices.read().by_seq.values().cloned().collect();
        conns.sort_by_key(|c| c.local_seq());
        conns
    }

    pub fn len(&self) -> usize {
        self.indices.read().by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state_counts(&self) -> ConnectionStateCounts {
        let indices = self.indices.read();
        let mut counts = ConnectionStateCounts {
            pending_source: indices.pending.values().map(|m| m.len()).sum(),
            physically_bound: indices.by_physical.values().map(|s| s.len()).sum(),
            ..Default::default()
        };
        for conn in indices.by_seq.values() {
            match conn.state() {
                ConnectionState::Connecting => counts.connecting += 1,
                ConnectionState::Connected => counts.connected += 1,
                ConnectionState::MarkDowning => counts.mark_downing += 1,
                ConnectionState::Stopped => counts.stopped += 1,
            }
        }
        counts
    }

    /// Wait for in-flight lock holders to finish
    pub fn quiesce(&self) {
        drop(self.indices.write());
    }
}
