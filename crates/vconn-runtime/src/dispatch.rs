//! Dispatcher Registry
//!
//! Subsystems register `Dispatcher`s under the numeric id of the local entity
//! they serve. Each owner has an ordered "all" list and an ordered
//! "fast" list holding the fast-capable subset.
//!
//! Lists are snapshotted under the read lock and handlers run with no lock
//! held, so a handler may register or remove dispatchers without deadlock.

use crate::connection::VirtualConnection;
use hashbrown::HashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::debug;
use vconn_core::{AuthVerdict, Authorizer, EntityType, Message, OwnerKey};

// ----------------------------------------------------------------------------
// Dispatcher Trait
// ----------------------------------------------------------------------------

/// Capability set of a subsystem message handler.
///
/// Everything except `dispatch` has a default, so a handler only implements
/// the tiers and hooks it cares about. Dispatch methods return `true` to
/// consume the message; the rest of the list is then skipped.
pub trait Dispatcher: Send + Sync {
    fn name(&self) -> &str {
        "dispatcher"
    }

    /// Whether this handler belongs on the fast list at all
    fn can_fast_dispatch_any(&self) -> bool {
        false
    }

    fn can_fast_dispatch(&self, _msg: &Message) -> bool {
        false
    }

    /// Runs before ordering guarantees; must not block
    fn fast_preprocess(&self, _conn: &Arc<VirtualConnection>, _msg: &Message) {}

    fn fast_dispatch(&self, _conn: &Arc<VirtualConnection>, _msg: &Message) -> bool {
        false
    }

    fn dispatch(&self, conn: &Arc<VirtualConnection>, msg: &Message) -> bool;

    /// Client handshake completed
    fn handle_connect(&self, _conn: &Arc<VirtualConnection>) {}

    fn handle_fast_connect(&self, _conn: &Arc<VirtualConnection>) {}

    /// Server accepted a handshake
    fn handle_accept(&self, _conn: &Arc<VirtualConnection>) {}

    fn handle_fast_accept(&self, _conn: &Arc<VirtualConnection>) {}

    /// Connection torn down locally; first handler returning true wins
    fn handle_reset(&self, _conn: &Arc<VirtualConnection>) -> bool {
        false
    }

    /// Connection torn down by the peer; every handler is told
    fn handle_remote_reset(&self, _conn: &Arc<VirtualConnection>) {}

    /// Credentials to offer in a Connect toward `peer_type`
    fn get_authorizer(&self, _peer_type: EntityType) -> Option<Authorizer> {
        None
    }

    /// `None` means this handler has no opinion
    fn verify_authorizer(
        &self,
        _conn: &Arc<VirtualConnection>,
        _peer_type: EntityType,
        _authorizer: &Authorizer,
    ) -> Option<AuthVerdict> {
        None
    }

    fn verify_authorizer_reply(&self, _conn: &Arc<VirtualConnection>, _reply: &[u8]) -> Option<bool> {
        None
    }
}

/// Snapshot of a handler list
pub type HandlerList = SmallVec<[Arc<dyn Dispatcher>; 4]>;

/// Where to insert a new dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Head,
    Tail,
}

// ----------------------------------------------------------------------------
// Dispatcher Registry
// ----------------------------------------------------------------------------

#[derive(Default, Clone)]
struct DispatcherChain {
    all: Vec<Arc<dyn Dispatcher>>,
    fast: Vec<Arc<dyn Dispatcher>>,
}

/// Per-owner ordered handler lists
#[derive(Default)]
pub struct DispatcherRegistry {
    chains: RwLock<HashMap<OwnerKey, DispatcherChain>>,
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, owner: OwnerKey, handler: Arc<dyn Dispatcher>, position: Position) {
        let fast = handler.can_fast_dispatch_any();
        debug!(owner = %owner, name = handler.name(), fast, ?position, "adding dispatcher");
        let mut chains = self.chains.write();
        let chain = chains.entry(owner).or_default();
        if fast {
            insert_at(&mut chain.fast, handler.clone(), position);
        }
        insert_at(&mut chain.all, handler, position);
    }

    /// Drop every handler of an owner; returns how many were registered
    pub fn remove_all(&self, owner: OwnerKey) -> usize {
        self.chains
            .write()
            .remove(&owner)
            .map(|chain| chain.all.len())
            .unwrap_or(0)
    }

    pub fn handlers(&self, owner: OwnerKey) -> HandlerList {
        self.chains
            .read()
            .get(&owner)
            .map(|chain| chain.all.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn fast_handlers(&self, owner: OwnerKey) -> HandlerList {
        self.chains
            .read()
            .get(&owner)
            .map(|chain| chain.fast.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_fast(&self, owner: OwnerKey) -> bool {
        self.chains
            .read()
            .get(&owner)
            .is_some_and(|chain| !chain.fast.is_empty())
    }

    pub fn owners(&self) -> usize {
        self.chains.read().len()
    }

    pub fn quiesce(&self) {
        drop(self.chains.write());
    }
}

fn insert_at(list: &mut Vec<Arc<dyn Dispatcher>>, handler: Arc<dyn Dispatcher>, position: Position) {
    match position {
        Position::Head => list.insert(0, handler),
        Position::Tail => list.push(handler),
    }
}
