//! Memory Transport
//!
//! A `PhysicalTransport` whose connections are channel pairs between
//! endpoints of one `MemoryNetwork`. Every endpoint drains an inbox on its own
//! task, so delivery is asynchronous and a send never re-enters the sender's
//! handler. Messages on one physical connection arrive in send order.

use crate::config::{MemoryTransportConfig, MemoryTransportStats};
use crate::network::MemoryNetwork;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};
use vconn_core::{
    deliver_inbound, ConnectionId, EntityAddr, EntityInstance, EntityName, EntityType, Message,
    PhysicalConnection, PhysicalTransport, Policy, TransportError, TransportHandler,
};

/// Work item for an endpoint's inbox task
enum Inbound {
    Message(Message),
    Connected(Arc<MemoryConnection>),
    Accepted(Arc<MemoryConnection>),
    Reset(Arc<MemoryConnection>),
    RemoteReset(Arc<MemoryConnection>),
    Stop,
}

// ----------------------------------------------------------------------------
// Memory Connection
// ----------------------------------------------------------------------------

/// One half of an in-memory physical connection
pub struct MemoryConnection {
    id: ConnectionId,
    local_addr: EntityAddr,
    peer_addr: EntityAddr,
    peer_type: EntityType,
    connected: AtomicBool,
    local_inbox: mpsc::UnboundedSender<Inbound>,
    peer_inbox: mpsc::UnboundedSender<Inbound>,
    /// The other half; points at itself for a loopback connection
    reverse: Mutex<Weak<MemoryConnection>>,
    owner: Weak<MemoryTransport>,
}

impl MemoryConnection {
    pub fn local_addr(&self) -> EntityAddr {
        self.local_addr
    }

    fn reverse(&self) -> Option<Arc<MemoryConnection>> {
        self.reverse.lock().upgrade()
    }

    fn forget(&self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.conns.remove_if(&self.peer_addr, |_, c| c.id == self.id);
            owner.stats.connections_lost.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Fail both halves; each endpoint sees a local reset
    pub fn sever(self: &Arc<Self>) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.forget();
            let _ = self.local_inbox.send(Inbound::Reset(self.clone()));
        }
        if let Some(peer) = self.reverse() {
            if peer.connected.swap(false, Ordering::AcqRel) {
                peer.forget();
                let _ = peer.local_inbox.send(Inbound::Reset(peer.clone()));
            }
        }
    }
}

impl PhysicalConnection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer_addr(&self) -> EntityAddr {
        self.peer_addr
    }

    fn peer_type(&self) -> EntityType {
        self.peer_type
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn send_message(&self, mut msg: Message) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed {
                connection_id: self.id.0,
            });
        }
        let Some(reverse) = self.reverse() else {
            return Err(TransportError::ConnectionClosed {
                connection_id: self.id.0,
            });
        };
        let arrival: Arc<dyn PhysicalConnection> = reverse;
        msg.set_connection(arrival);
        trace!(id = %self.id, peer = %self.peer_addr, kind = %msg.kind(), "memory send");
        self.peer_inbox
            .send(Inbound::Message(msg))
            .map_err(|_| TransportError::SendFailed {
                connection_id: self.id.0,
                reason: "peer endpoint stopped".to_string(),
            })?;
        if let Some(owner) = self.owner.upgrade() {
            owner.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Close this connection; the peer sees a remote reset
    fn mark_down(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        self.forget();
        if let Some(peer) = self.reverse() {
            if peer.connected.swap(false, Ordering::AcqRel) {
                peer.forget();
                let _ = self.peer_inbox.send(Inbound::RemoteReset(peer));
            }
        }
    }
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Memory Transport
// ----------------------------------------------------------------------------

/// In-memory endpoint implementing `PhysicalTransport`
pub struct MemoryTransport {
    me: Weak<MemoryTransport>,
    name: EntityName,
    addr: EntityAddr,
    addressed: AtomicBool,
    config: MemoryTransportConfig,
    network: Arc<MemoryNetwork>,
    conns: DashMap<EntityAddr, Arc<MemoryConnection>>,
    inbox: mpsc::UnboundedSender<Inbound>,
    handler: RwLock<Option<Weak<dyn TransportHandler>>>,
    stats: MemoryTransportStats,
    stopped: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryTransport {
    pub(crate) fn spawn(
        network: Arc<MemoryNetwork>,
        name: EntityName,
        addr: EntityAddr,
        config: MemoryTransportConfig,
    ) -> Arc<Self> {
        let (inbox, mut rx) = mpsc::unbounded_channel();
        let transport = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name,
            addr,
            addressed: AtomicBool::new(!config.start_unaddressed),
            config,
            network,
            conns: DashMap::new(),
            inbox,
            handler: RwLock::new(None),
            stats: MemoryTransportStats::default(),
            stopped: AtomicBool::new(false),
            worker: Mutex::new(None),
        });

        let weak = Arc::downgrade(&transport);
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(transport) = weak.upgrade() else {
                    break;
                };
                if !transport.handle_inbound(event) {
                    break;
                }
            }
            trace!("memory inbox exiting");
        });
        *transport.worker.lock() = Some(worker);
        transport
    }

    /// The endpoint's real address, even before it is reported
    pub fn addr(&self) -> EntityAddr {
        self.addr
    }

    pub fn name(&self) -> EntityName {
        self.name
    }

    pub fn is_addressed(&self) -> bool {
        self.addressed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &MemoryTransportStats {
        &self.stats
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    /// Current physical connection toward an address
    pub fn connection_to(&self, addr: &EntityAddr) -> Option<Arc<MemoryConnection>> {
        self.conns.get(addr).map(|c| c.value().clone())
    }

    /// Number of open physical connections
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    fn handler(&self) -> Option<Arc<dyn TransportHandler>> {
        self.handler.read().as_ref().and_then(Weak::upgrade)
    }

    fn handle_inbound(&self, event: Inbound) -> bool {
        if let Inbound::Stop = event {
            return false;
        }
        let Some(handler) = self.handler() else {
            if let Inbound::Message(_) = event {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
            return true;
        };
        match event {
            Inbound::Message(msg) => {
                self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                deliver_inbound(handler.as_ref(), msg);
            }
            Inbound::Connected(conn) => {
                let conn: Arc<dyn PhysicalConnection> = conn;
                handler.on_connect(&conn);
            }
            Inbound::Accepted(conn) => {
                let conn: Arc<dyn PhysicalConnection> = conn;
                handler.on_accept(&conn);
            }
            Inbound::Reset(conn) => {
                let conn: Arc<dyn PhysicalConnection> = conn;
                handler.on_reset(&conn);
            }
            Inbound::RemoteReset(conn) => {
                let conn: Arc<dyn PhysicalConnection> = conn;
                handler.on_remote_reset(&conn);
            }
            Inbound::Stop => return false,
        }
        true
    }

    fn new_half(
        &self,
        owner: &MemoryTransport,
        peer_addr: EntityAddr,
        peer_type: EntityType,
        peer_inbox: mpsc::UnboundedSender<Inbound>,
    ) -> Arc<MemoryConnection> {
        Arc::new(MemoryConnection {
            id: self.network.next_connection_id(),
            local_addr: owner.addr,
            peer_addr,
            peer_type,
            connected: AtomicBool::new(true),
            local_inbox: owner.inbox.clone(),
            peer_inbox,
            reverse: Mutex::new(Weak::new()),
            owner: owner.me.clone(),
        })
    }

    fn loopback(&self) -> Arc<MemoryConnection> {
        let conn = self
            .conns
            .entry(self.addr)
            .or_insert_with(|| {
                let conn = self.new_half(self, self.addr, self.name.entity_type, self.inbox.clone());
                *conn.reverse.lock() = Arc::downgrade(&conn);
                debug!(addr = %self.addr, id = %conn.id, "loopback connection created");
                conn
            })
            .clone();
        conn
    }

    fn dial(&self, dst: &EntityInstance) -> Option<Arc<MemoryConnection>> {
        if self.stopped.load(Ordering::Acquire) || dst.has_blank_addr() {
            return None;
        }
        if dst.addr == self.addr {
            return Some(self.loopback());
        }

        let _guard = self.network.dial_guard();
        if let Some(existing) = self.connection_to(&dst.addr) {
            if existing.is_connected() {
                return Some(existing);
            }
        }
        if self.config.refuse_outbound {
            debug!(dst = %dst, "outbound connections refused");
            return None;
        }
        let Some(remote) = self.network.lookup(&dst.addr) else {
            debug!(dst = %dst, "no endpoint at address");
            return None;
        };
        if remote.stopped.load(Ordering::Acquire) {
            return None;
        }

        if !self.addressed.swap(true, Ordering::AcqRel) {
            info!(name = %self.name, addr = %self.addr, "learned local address");
        }

        let local_half = self.new_half(self, dst.addr, dst.entity_type(), remote.inbox.clone());
        let remote_half = self.new_half(&remote, self.addr, self.name.entity_type, self.inbox.clone());
        *local_half.reverse.lock() = Arc::downgrade(&remote_half);
        *remote_half.reverse.lock() = Arc::downgrade(&local_half);

        remote.conns.insert(self.addr, remote_half.clone());
        self.conns.insert(dst.addr, local_half.clone());
        self.stats
            .connections_established
            .fetch_add(1, Ordering::Relaxed);
        remote
            .stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        debug!(local = %self.addr, peer = %dst.addr, id = %local_half.id, "physical connection opened");

        let _ = remote.inbox.send(Inbound::Accepted(remote_half));
        let _ = self.inbox.send(Inbound::Connected(local_half.clone()));
        Some(local_half)
    }

    fn close_all(&self) {
        let conns: Vec<_> = self.conns.iter().map(|c| c.value().clone()).collect();
        for conn in conns {
            conn.mark_down();
        }
    }
}

impl PhysicalTransport for MemoryTransport {
    fn my_instance(&self) -> EntityInstance {
        let addr = if self.is_addressed() {
            self.addr
        } else {
            EntityAddr::blank()
        };
        EntityInstance::new(self.name, addr)
    }

    fn get_connection(&self, dst: &EntityInstance) -> Option<Arc<dyn PhysicalConnection>> {
        self.dial(dst).map(|c| c as Arc<dyn PhysicalConnection>)
    }

    fn mark_down(&self, addr: &EntityAddr) {
        if let Some(conn) = self.connection_to(addr) {
            conn.mark_down();
        }
    }

    fn mark_down_all(&self) {
        self.close_all();
    }

    fn policy(&self, peer_type: EntityType) -> Policy {
        self.config.policy(peer_type)
    }

    fn attach_handler(&self, handler: Weak<dyn TransportHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(name = %self.name, addr = %self.addr, "memory endpoint shutting down");
        self.close_all();
        self.network.unregister(&self.addr);
        let _ = self.inbox.send(Inbound::Stop);
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use vconn_core::{AuthVerdict, Authorizer};

    #[derive(Default)]
    struct Events {
        log: Mutex<Vec<String>>,
    }

    impl TransportHandler for Events {
        fn on_connect(&self, conn: &Arc<dyn PhysicalConnection>) {
            self.log.lock().push(format!("connect {}", conn.peer_addr()));
        }
        fn on_accept(&self, conn: &Arc<dyn PhysicalConnection>) {
            self.log.lock().push(format!("accept {}", conn.peer_addr()));
        }
        fn on_reset(&self, _conn: &Arc<dyn PhysicalConnection>) -> bool {
            self.log.lock().push("reset".into());
            true
        }
        fn on_remote_reset(&self, _conn: &Arc<dyn PhysicalConnection>) {
            self.log.lock().push("remote_reset".into());
        }
        fn fast_preprocess(&self, _msg: &mut Message) {}
        fn can_fast_dispatch(&self, _msg: &Message) -> bool {
            false
        }
        fn fast_dispatch(&self, _msg: Message) {}
        fn dispatch(&self, msg: Message) -> bool {
            assert!(msg.connection().is_some());
            self.log.lock().push(format!("msg {}", msg.payload.len()));
            true
        }
        fn get_authorizer(&self, _peer_type: EntityType) -> Option<Authorizer> {
            None
        }
        fn verify_authorizer(
            &self,
            _conn: &Arc<dyn PhysicalConnection>,
            _peer_type: EntityType,
            _authorizer: &Authorizer,
        ) -> AuthVerdict {
            AuthVerdict::accept()
        }
    }

    fn attach(transport: &Arc<MemoryTransport>) -> Arc<Events> {
        let events = Arc::new(Events::default());
        let handler: Arc<dyn TransportHandler> = events.clone();
        transport.attach_handler(Arc::downgrade(&handler));
        events
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_dial_delivers_in_order() {
        let network = MemoryNetwork::new();
        let a = network.bind(EntityName::storage(0), MemoryTransportConfig::default());
        let b = network.bind(EntityName::storage(1), MemoryTransportConfig::default());
        let _ea = attach(&a);
        let eb = attach(&b);

        let conn = a.get_connection(&b.my_instance()).unwrap();
        for len in 1..=3 {
            conn.send_message(Message::user(1, Bytes::from(vec![0u8; len])))
                .unwrap();
        }
        settle().await;

        let log = eb.log.lock().clone();
        assert_eq!(log[0], format!("accept {}", a.addr()));
        assert_eq!(&log[1..], &["msg 1", "msg 2", "msg 3"]);
        assert_eq!(b.stats().received(), 3);
    }

    #[tokio::test]
    async fn test_dial_reuses_connection_in_both_directions() {
        let network = MemoryNetwork::new();
        let a = network.bind(EntityName::storage(0), MemoryTransportConfig::default());
        let b = network.bind(EntityName::storage(1), MemoryTransportConfig::default());

        let ab = a.get_connection(&b.my_instance()).unwrap();
        let again = a.get_connection(&b.my_instance()).unwrap();
        assert_eq!(ab.id(), again.id());

        let ba = b.get_connection(&a.my_instance()).unwrap();
        assert_eq!(a.connection_count(), 1);
        assert_eq!(b.connection_count(), 1);
        assert_eq!(ba.peer_addr(), a.addr());
    }

    #[tokio::test]
    async fn test_unaddressed_endpoint_learns_address() {
        let network = MemoryNetwork::new();
        let client = network.bind(EntityName::client(9), MemoryTransportConfig::client());
        let server = network.bind(EntityName::storage(0), MemoryTransportConfig::member());

        assert!(client.my_instance().has_blank_addr());
        client.get_connection(&server.my_instance()).unwrap();
        assert_eq!(client.my_instance().addr, client.addr());
    }

    #[tokio::test]
    async fn test_mark_down_notifies_peer() {
        let network = MemoryNetwork::new();
        let a = network.bind(EntityName::storage(0), MemoryTransportConfig::default());
        let b = network.bind(EntityName::storage(1), MemoryTransportConfig::default());
        let ea = attach(&a);
        let eb = attach(&b);

        let conn = a.get_connection(&b.my_instance()).unwrap();
        a.mark_down(&b.addr());
        settle().await;

        assert!(!conn.is_connected());
        assert!(conn.send_message(Message::user(1, Bytes::new())).is_err());
        assert!(eb.log.lock().contains(&"remote_reset".to_string()));
        assert!(!ea.log.lock().contains(&"reset".to_string()));
        assert_eq!(a.connection_count(), 0);
        assert_eq!(b.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_sever_resets_both_sides() {
        let network = MemoryNetwork::new();
        let a = network.bind(EntityName::storage(0), MemoryTransportConfig::default());
        let b = network.bind(EntityName::storage(1), MemoryTransportConfig::default());
        let ea = attach(&a);
        let eb = attach(&b);

        a.get_connection(&b.my_instance()).unwrap();
        assert!(network.sever(&a.addr(), &b.addr()));
        settle().await;

        assert!(ea.log.lock().contains(&"reset".to_string()));
        assert!(eb.log.lock().contains(&"reset".to_string()));
        assert!(!network.sever(&a.addr(), &b.addr()));
    }

    #[tokio::test]
    async fn test_loopback_delivers_to_self() {
        let network = MemoryNetwork::new();
        let a = network.bind(EntityName::storage(0), MemoryTransportConfig::default());
        let ea = attach(&a);

        let conn = a.get_connection(&a.my_instance()).unwrap();
        conn.send_message(Message::user(1, Bytes::from_static(b"hi")))
            .unwrap();
        settle().await;
        assert_eq!(*ea.log.lock(), vec!["msg 2".to_string()]);
    }

    #[tokio::test]
    async fn test_refused_and_unknown_destinations() {
        let network = MemoryNetwork::new();
        let a = network.bind(EntityName::storage(0), MemoryTransportConfig::isolated());
        let b = network.bind(EntityName::storage(1), MemoryTransportConfig::default());

        assert!(a.get_connection(&b.my_instance()).is_none());
        b.shutdown();
        let c = network.bind(EntityName::storage(2), MemoryTransportConfig::default());
        assert!(c.get_connection(&b.my_instance()).is_none());
    }
}
