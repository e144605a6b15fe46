//! Virtual Messenger
//!
//! The façade over the registry, dispatcher lists and reset worker. It is the
//! transport's callback surface (`TransportHandler`) and the API subsystems
//! send through.
//!
//! Inbound pipeline per message: `fast_preprocess` resolves the connection
//! and records it on the message, then the transport calls either
//! `fast_dispatch` or `dispatch`. Handshake kinds always go to `dispatch`.

use crate::connection::{
    ConnectionSnapshot, ConnectionState, Direction, MarkDownOutcome, SendOutcome, VirtualConnection,
};
use crate::dispatch::{Dispatcher, DispatcherRegistry, HandlerList, Position};
use crate::registry::{ConnectDecision, ConnectionRegistry};
use crate::reset::{ResetDelivery, ResetEvent, ResetKind, ResetSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use vconn_core::{
    current_timestamp, AcceptBody, AuthVerdict, Authorizer, ConnectBody, DiagnosticsReport,
    DispatchMonitor, DispatchTier, EntityAddr, EntityInstance, EntityType, Message, MessageKind,
    MessengerConfig, OwnerKey, PhysicalConnection, PhysicalTransport, Route, SequenceAllocator,
    TransportHandler, VconnError, VconnResult,
};

// ----------------------------------------------------------------------------
// Messenger State
// ----------------------------------------------------------------------------

pub(crate) struct MessengerInner {
    id: Uuid,
    config: MessengerConfig,
    transport: Arc<dyn PhysicalTransport>,
    sequences: Arc<SequenceAllocator>,
    registry: ConnectionRegistry,
    dispatchers: DispatcherRegistry,
    resets: ResetDelivery,
    monitor: DispatchMonitor,
    stopped: AtomicBool,
}

/// Handle to a virtual messenger. Cheap to clone.
#[derive(Clone)]
pub struct VirtualMessenger {
    inner: Arc<MessengerInner>,
}

impl VirtualMessenger {
    /// Create a messenger over `transport` and register as its handler
    pub fn new(transport: Arc<dyn PhysicalTransport>, config: MessengerConfig) -> VconnResult<Self> {
        config.validate()?;
        let sequences = Arc::new(SequenceAllocator::new());
        let inner = Arc::new(MessengerInner {
            id: Uuid::new_v4(),
            monitor: DispatchMonitor::new(
                config.slow_dispatch_threshold(),
                config.slow_sample_capacity,
            ),
            config,
            transport,
            registry: ConnectionRegistry::new(sequences.clone()),
            sequences,
            dispatchers: DispatcherRegistry::new(),
            resets: ResetDelivery::new(),
            stopped: AtomicBool::new(false),
        });
        let handler: Arc<dyn TransportHandler> = inner.clone();
        inner.transport.attach_handler(Arc::downgrade(&handler));
        info!(name = %inner.config.name, id = %inner.id, local = %inner.transport.my_instance(), "virtual messenger created");
        Ok(Self { inner })
    }

    /// Start the reset worker on the current tokio runtime
    pub fn start(&self) -> VconnResult<()> {
        let handle = Handle::try_current()
            .map_err(|e| VconnError::runtime(format!("no tokio runtime: {e}")))?;
        let sink: Arc<dyn ResetSink> = self.inner.clone();
        if !self.inner.resets.start(Arc::downgrade(&sink), &handle) {
            return Err(VconnError::runtime("messenger already started"));
        }
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.inner.config
    }

    pub fn my_instance(&self) -> EntityInstance {
        self.inner.transport.my_instance()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Registry access for inspection
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Send from the local instance to `dst`
    pub fn send(&self, msg: Message, dst: &EntityInstance) -> VconnResult<()> {
        let src = self.my_instance();
        self.send_from(msg, &src, dst)
    }

    /// Send on behalf of `src`. Fails only when the destination role may not
    /// be connected to on demand and no connection exists.
    pub fn send_from(&self, msg: Message, src: &EntityInstance, dst: &EntityInstance) -> VconnResult<()> {
        self.inner.send_from(msg, src, dst)
    }

    /// Find or create the connection for a pair without waiting
    pub fn get_vconnection(&self, src: &EntityInstance, dst: &EntityInstance) -> Arc<VirtualConnection> {
        self.inner.get_vconnection(src, dst)
    }

    /// Find or create the connection for a pair and wait until it is bound
    /// to a physical connection
    pub async fn get_connection(
        &self,
        src: &EntityInstance,
        dst: &EntityInstance,
    ) -> VconnResult<Arc<VirtualConnection>> {
        if self.is_stopped() {
            return Err(VconnError::Stopped);
        }
        let conn = self.inner.get_vconnection(src, dst);
        if !conn.is_bound() {
            self.inner.ensure_bound(&conn);
        }
        let timeout = self.inner.config.connect_timeout();
        if conn.wait_bound(timeout).await {
            Ok(conn)
        } else {
            Err(VconnError::timeout(
                format!("physical connection to {dst}"),
                timeout.as_millis() as u64,
            ))
        }
    }

    /// Connection from `inst` to itself, connected immediately
    pub fn get_loopback_connection(&self, inst: &EntityInstance) -> VconnResult<Arc<VirtualConnection>> {
        self.inner.get_loopback_connection(inst)
    }

    // ------------------------------------------------------------------------
    // Dispatchers
    // ------------------------------------------------------------------------

    pub fn add_dispatcher(&self, handler: Arc<dyn Dispatcher>, owner: OwnerKey, position: Position) {
        self.inner.dispatchers.add(owner, handler, position);
    }

    pub fn add_dispatcher_head(&self, handler: Arc<dyn Dispatcher>, owner: OwnerKey) {
        self.add_dispatcher(handler, owner, Position::Head);
    }

    pub fn add_dispatcher_tail(&self, handler: Arc<dyn Dispatcher>, owner: OwnerKey) {
        self.add_dispatcher(handler, owner, Position::Tail);
    }

    /// Stop every connection of `owner` without notifying peers, then drop
    /// its dispatchers
    pub fn remove_all_dispatchers(&self, owner: OwnerKey) {
        self.inner.remove_owner(owner);
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    pub fn mark_down(&self, conn: &Arc<VirtualConnection>) {
        self.inner.mark_down(conn);
    }

    /// Mark down the connection for a pair, if there is one
    pub fn mark_down_peer(&self, src: &EntityInstance, dst: &EntityInstance) -> bool {
        match self.inner.registry.find(src, dst) {
            Some(conn) => {
                self.inner.mark_down(&conn);
                true
            }
            None => false,
        }
    }

    /// Tear down every connection bound to a remote address and close it
    pub fn mark_down_physical(&self, addr: &EntityAddr) {
        let removed = self.inner.registry.remove_by_addr(addr);
        info!(addr = %addr, removed = removed.len(), "marking down physical address");
        for conn in removed {
            conn.stop();
            self.inner.resets.enqueue(conn, ResetKind::Local);
        }
        self.inner.transport.mark_down(addr);
    }

    /// Tear down everything and close all physical connections
    pub fn mark_down_all(&self) {
        let drained = self.inner.registry.drain_all();
        info!(removed = drained.len(), "marking down all connections");
        for conn in drained {
            conn.stop();
            self.inner.resets.enqueue(conn, ResetKind::Local);
        }
        self.inner.transport.mark_down_all();
    }

    /// Gracefully mark down every connection of `owner`
    pub fn mark_down_all_owner(&self, owner: OwnerKey) {
        for conn in self.inner.registry.connections_of(owner) {
            self.inner.mark_down(&conn);
        }
    }

    // ------------------------------------------------------------------------
    // Diagnostics and lifecycle
    // ------------------------------------------------------------------------

    pub fn diagnostics(&self) -> DiagnosticsReport {
        let inner = &self.inner;
        DiagnosticsReport {
            messenger_id: inner.id,
            name: inner.config.name.clone(),
            local: inner.transport.my_instance().to_string(),
            generated_at: current_timestamp(),
            connections: inner.registry.state_counts(),
            dispatcher_owners: inner.dispatchers.owners(),
            reset_queue_depth: inner.resets.pending(),
            resets_delivered: inner.resets.delivered(),
            tiers: inner.monitor.tier_stats(),
            slow_samples: inner.monitor.slow_samples(),
        }
    }

    pub fn connections(&self) -> Vec<ConnectionSnapshot> {
        self.inner
            .registry
            .all_connections()
            .iter()
            .map(|c| c.snapshot())
            .collect()
    }

    pub fn clear_diagnostics(&self) {
        self.inner.monitor.clear();
    }

    /// Wait for queued reset notifications to be delivered
    pub async fn wait_reset_idle(&self, timeout: Duration) -> bool {
        self.inner.resets.wait_idle(timeout).await
    }

    /// Stop the messenger. Pending resets are discarded and later inbound
    /// messages are dropped.
    pub fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(name = %self.inner.config.name, "shutting down virtual messenger");
        self.inner.resets.shutdown();
        self.inner.registry.quiesce();
        self.inner.dispatchers.quiesce();
        self.inner.transport.shutdown();
    }
}

// ----------------------------------------------------------------------------
// Outbound Path
// ----------------------------------------------------------------------------

impl MessengerInner {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn send_from(&self, msg: Message, src: &EntityInstance, dst: &EntityInstance) -> VconnResult<()> {
        if self.is_stopped() {
            return Err(VconnError::Stopped);
        }
        let conn = if self.transport.policy(dst.entity_type()).server {
            match self.registry.find(src, dst) {
                Some(conn) if conn.state().is_live() => conn,
                _ => {
                    debug!(src = %src, dst = %dst, kind = %msg.kind(), "no connection to server-policy peer, dropping");
                    return Err(VconnError::no_connection(src, dst));
                }
            }
        } else {
            self.get_vconnection(src, dst)
        };

        match conn.send(msg, &self.sequences) {
            SendOutcome::Redirect(msg) => {
                let fresh = self.get_vconnection(src, dst);
                if let SendOutcome::Redirect(msg) = fresh.send(msg, &self.sequences) {
                    debug!(src = %src, dst = %dst, kind = %msg.kind(), "replacement connection also going down, dropping");
                }
            }
            SendOutcome::Sent | SendOutcome::Queued | SendOutcome::Dropped => {}
        }
        Ok(())
    }

    fn get_vconnection(&self, src: &EntityInstance, dst: &EntityInstance) -> Arc<VirtualConnection> {
        if src == dst {
            if let Ok(conn) = self.get_loopback_connection(src) {
                return conn;
            }
        }
        let lookup = self.registry.find_or_create(src, dst, Direction::Client);
        if let Some(evicted) = lookup.evicted {
            self.resets.enqueue(evicted, ResetKind::Local);
        }
        if lookup.created {
            self.ensure_bound(&lookup.conn);
        }
        lookup.conn
    }

    /// Bind a physical connection if the transport has one, then start the
    /// handshake once the source is addressed
    fn ensure_bound(&self, conn: &Arc<VirtualConnection>) {
        if !conn.is_bound() {
            match self.transport.get_connection(&conn.dst()) {
                Some(physical) => self.registry.bind_physical(conn, physical),
                None => {
                    debug!(dst = %conn.dst(), "transport has no physical connection yet");
                    return;
                }
            }
        }
        if conn.src().has_blank_addr() {
            // The dial may have taught the transport its address
            if !self.transport.my_instance().has_blank_addr() {
                self.adopt_local_addr();
            }
            return;
        }
        self.send_connect(conn);
    }

    /// Move pending-source connections under the learned local address and
    /// start their handshakes
    fn adopt_local_addr(&self) {
        let local = self.transport.my_instance();
        let migration = self.registry.migrate_pending(&local);
        for evicted in migration.evicted {
            self.resets.enqueue(evicted, ResetKind::Local);
        }
        for migrated in migration.migrated {
            self.ensure_bound(&migrated);
        }
    }

    fn send_connect(&self, conn: &Arc<VirtualConnection>) {
        let handlers = self.dispatchers.handlers(conn.src().owner_key());
        let auth = handlers
            .iter()
            .find_map(|d| d.get_authorizer(conn.dst().entity_type()));
        if !conn.claim_connect(auth.clone()) {
            return;
        }
        let body = auth
            .map(|a| ConnectBody {
                authorizer_protocol: a.protocol,
                authorizer: a.payload.to_vec(),
            })
            .unwrap_or_default();
        match Message::connect(&body) {
            Ok(msg) => {
                debug!(src = %conn.src(), dst = %conn.dst(), local_seq = conn.local_seq(), "sending connect");
                conn.send_control(msg, &self.sequences);
            }
            Err(err) => warn!(error = %err, "failed to encode connect"),
        }
    }

    fn get_loopback_connection(&self, inst: &EntityInstance) -> VconnResult<Arc<VirtualConnection>> {
        if self.is_stopped() {
            return Err(VconnError::Stopped);
        }
        let lookup = self.registry.find_or_create(inst, inst, Direction::Init);
        if let Some(evicted) = lookup.evicted {
            self.resets.enqueue(evicted, ResetKind::Local);
        }
        let conn = lookup.conn;
        if lookup.created {
            if let Some(physical) = self.transport.get_connection(inst) {
                self.registry.bind_physical(&conn, physical);
            }
            conn.complete_handshake(conn.local_seq(), None, &self.sequences);
            for d in self.dispatchers.fast_handlers(inst.owner_key()) {
                d.handle_fast_connect(&conn);
            }
            debug!(inst = %inst, local_seq = conn.local_seq(), "loopback connection ready");
        }
        Ok(conn)
    }

    // ------------------------------------------------------------------------
    // Teardown helpers
    // ------------------------------------------------------------------------

    fn remove_and_reset(&self, conn: &Arc<VirtualConnection>, kind: ResetKind) -> bool {
        if self.registry.remove(conn) {
            self.resets.enqueue(conn.clone(), kind);
            true
        } else {
            false
        }
    }

    fn mark_down(&self, conn: &Arc<VirtualConnection>) {
        if conn.src().is_member() || conn.dst().is_member() {
            match conn.begin_mark_down(&self.sequences) {
                MarkDownOutcome::RemoveSent => {
                    debug!(src = %conn.src(), dst = %conn.dst(), local_seq = conn.local_seq(), "mark down, remove sent");
                }
                MarkDownOutcome::AlreadyMarkingDown => {
                    trace!(local_seq = conn.local_seq(), "already marking down");
                }
                MarkDownOutcome::NoPhysical => {
                    conn.stop();
                    self.remove_and_reset(conn, ResetKind::Local);
                }
            }
        } else {
            conn.stop();
            if let Some(physical) = conn.physical() {
                physical.mark_down();
                self.teardown_physical(&physical, ResetKind::Local);
            }
            self.remove_and_reset(conn, ResetKind::Local);
        }
    }

    fn teardown_physical(&self, physical: &Arc<dyn PhysicalConnection>, kind: ResetKind) -> usize {
        let removed = self.registry.remove_physical(physical);
        let count = removed.len();
        for conn in removed {
            conn.stop();
            self.resets.enqueue(conn, kind);
        }
        count
    }

    fn remove_owner(&self, owner: OwnerKey) {
        let drained = self.registry.drain_owner(owner);
        for conn in &drained {
            conn.stop();
            self.resets.enqueue(conn.clone(), ResetKind::Local);
        }
        let removed = self.dispatchers.remove_all(owner);
        info!(owner = %owner, connections = drained.len(), dispatchers = removed, "removed owner");
    }

    fn owner_of(msg: &Message) -> OwnerKey {
        msg.dst().owner_key()
    }

    // ------------------------------------------------------------------------
    // Inbound resolution
    // ------------------------------------------------------------------------

    /// Find the local connection an inbound message belongs to. A message
    /// naming a local sequence id only ever resolves through that id.
    fn resolve(&self, msg: &Message) -> Option<Arc<VirtualConnection>> {
        let seq = msg.header.dst_vconn_seq;
        if seq != 0 {
            return self
                .registry
                .get_by_seq(seq)
                .filter(|conn| conn.dst().name == msg.src().name);
        }
        self.registry.find(msg.dst(), msg.src())
    }

    fn routed(&self, msg: &Message) -> Option<Arc<VirtualConnection>> {
        match msg.route() {
            Route::Resolved(seq) => self.registry.get_by_seq(seq),
            Route::Unresolved => self.resolve(msg),
            Route::Rejected => None,
        }
    }

    fn preprocess_connect(&self, msg: &mut Message) {
        let Some(physical) = msg.connection().cloned() else {
            debug!(src = %msg.src(), "connect without physical connection, dropping");
            msg.set_route(Route::Rejected);
            return;
        };
        let decision = self
            .registry
            .accept_connect(msg.dst(), msg.src(), msg.header.vconn_seq, physical);
        let route = match decision {
            ConnectDecision::Created(conn) | ConnectDecision::Existing(conn) => {
                Route::Resolved(conn.local_seq())
            }
            ConnectDecision::Superseded { new, old } => {
                old.stop();
                self.resets.enqueue(old, ResetKind::Local);
                Route::Resolved(new.local_seq())
            }
            ConnectDecision::Stale(conn) => {
                debug!(
                    src = %msg.src(), incoming = msg.header.vconn_seq,
                    remote_seq = conn.remote_seq(), "stale connect, dropping"
                );
                Route::Rejected
            }
        };
        msg.set_route(route);
    }

    // ------------------------------------------------------------------------
    // Handshake handlers
    // ------------------------------------------------------------------------

    fn handle_connect_msg(&self, conn: &Arc<VirtualConnection>, msg: &Message) -> bool {
        let incoming = msg.header.vconn_seq;
        if conn.is_stale(incoming) {
            debug!(src = %msg.src(), incoming, remote_seq = conn.remote_seq(), "stale connect, dropping");
            return false;
        }
        let body = match msg.connect_body() {
            Ok(body) => body,
            Err(err) => {
                warn!(src = %msg.src(), error = %err, "dropping connect");
                return false;
            }
        };

        let owner = conn.src().owner_key();
        let handlers = self.dispatchers.handlers(owner);
        let authorizer = Authorizer {
            protocol: body.authorizer_protocol,
            payload: body.authorizer.into(),
        };
        let verdict = handlers
            .iter()
            .find_map(|d| d.verify_authorizer(conn, msg.src().entity_type(), &authorizer))
            .unwrap_or_else(AuthVerdict::accept);

        if !verdict.valid {
            warn!(src = %msg.src(), protocol = authorizer.protocol, "authorizer verification failed");
            if self.config.reject_invalid_authorizers {
                let reject = AcceptBody {
                    authorizer_reply: verdict.reply.to_vec(),
                    rejected: true,
                };
                if let Ok(reply) = Message::accept(&reject) {
                    conn.send_control(reply, &self.sequences);
                }
                return true;
            }
        }

        for d in self.dispatchers.fast_handlers(owner) {
            d.handle_fast_accept(conn);
        }
        for d in &handlers {
            d.handle_accept(conn);
        }

        let accept = AcceptBody {
            authorizer_reply: verdict.reply.to_vec(),
            rejected: false,
        };
        match Message::accept(&accept) {
            Ok(reply) => {
                conn.complete_handshake(incoming, Some(reply), &self.sequences);
                debug!(
                    local = %conn.src(), remote = %conn.dst(), local_seq = conn.local_seq(),
                    remote_seq = incoming, "accepted connection"
                );
            }
            Err(err) => warn!(error = %err, "failed to encode accept"),
        }
        true
    }

    fn handle_accept_msg(&self, conn: &Arc<VirtualConnection>, msg: &Message) -> bool {
        let incoming = msg.header.vconn_seq;
        if conn.is_stale(incoming) {
            debug!(src = %msg.src(), incoming, remote_seq = conn.remote_seq(), "stale accept, dropping");
            return false;
        }
        let body = match msg.accept_body() {
            Ok(body) => body,
            Err(err) => {
                warn!(src = %msg.src(), error = %err, "dropping accept");
                return false;
            }
        };
        if body.rejected {
            warn!(src = %msg.src(), local_seq = conn.local_seq(), "peer rejected our authorizer");
            return true;
        }

        let owner = conn.src().owner_key();
        let handlers = self.dispatchers.handlers(owner);
        if let Some(false) = handlers
            .iter()
            .find_map(|d| d.verify_authorizer_reply(conn, &body.authorizer_reply))
        {
            warn!(src = %msg.src(), "authorizer reply verification failed");
        }

        if conn.complete_handshake(incoming, None, &self.sequences) {
            debug!(
                local = %conn.src(), remote = %conn.dst(), local_seq = conn.local_seq(),
                remote_seq = incoming, "connection established"
            );
        }
        for d in self.dispatchers.fast_handlers(owner) {
            d.handle_fast_connect(conn);
        }
        for d in &handlers {
            d.handle_connect(conn);
        }
        true
    }

    fn handle_remove_msg(&self, conn: &Arc<VirtualConnection>) -> bool {
        debug!(local = %conn.src(), remote = %conn.dst(), local_seq = conn.local_seq(), "peer removed connection");
        conn.stop();
        self.remove_and_reset(conn, ResetKind::Local);
        conn.send_control(Message::remove_ack(), &self.sequences)
    }

    fn handle_remove_ack_msg(&self, conn: &Arc<VirtualConnection>) -> bool {
        if conn.state() != ConnectionState::MarkDowning {
            trace!(local_seq = conn.local_seq(), "remove ack for live connection, ignoring");
            return false;
        }
        self.remove_and_reset(conn, ResetKind::Local)
    }

    fn first_dispatch(
        &self,
        handlers: &HandlerList,
        conn: &Arc<VirtualConnection>,
        msg: &Message,
    ) -> bool {
        handlers.iter().any(|d| d.dispatch(conn, msg))
    }
}

// ----------------------------------------------------------------------------
// Transport Callbacks
// ----------------------------------------------------------------------------

impl TransportHandler for MessengerInner {
    fn on_connect(&self, conn: &Arc<dyn PhysicalConnection>) {
        debug!(local = %self.transport.my_instance(), peer = %conn.peer_addr(), "physical connection established");
        self.adopt_local_addr();
    }

    fn on_accept(&self, conn: &Arc<dyn PhysicalConnection>) {
        debug!(peer = %conn.peer_addr(), id = %conn.id(), "physical connection accepted");
    }

    fn on_reset(&self, conn: &Arc<dyn PhysicalConnection>) -> bool {
        let count = self.teardown_physical(conn, ResetKind::Local);
        debug!(peer = %conn.peer_addr(), id = %conn.id(), count, "physical reset");
        count > 0
    }

    fn on_remote_reset(&self, conn: &Arc<dyn PhysicalConnection>) {
        let count = self.teardown_physical(conn, ResetKind::Remote);
        debug!(peer = %conn.peer_addr(), id = %conn.id(), count, "physical remote reset");
    }

    fn fast_preprocess(&self, msg: &mut Message) {
        if self.is_stopped() {
            msg.set_route(Route::Rejected);
            return;
        }
        if msg.kind() == MessageKind::Connect {
            self.preprocess_connect(msg);
            return;
        }

        let begin = Instant::now();
        let Some(conn) = self.resolve(msg) else {
            debug!(src = %msg.src(), dst = %msg.dst(), kind = %msg.kind(), "no virtual connection, dropping");
            msg.set_route(Route::Rejected);
            return;
        };
        if !conn.is_bound() {
            debug!(local_seq = conn.local_seq(), kind = %msg.kind(), "connection not bound, dropping");
            msg.set_route(Route::Rejected);
            return;
        }
        let remote_seq = conn.remote_seq();
        if msg.kind() != MessageKind::Accept && remote_seq != 0 && msg.header.vconn_seq != remote_seq {
            debug!(
                local_seq = conn.local_seq(), remote_seq, vconn_seq = msg.header.vconn_seq,
                kind = %msg.kind(), "message from superseded connection, dropping"
            );
            msg.set_route(Route::Rejected);
            return;
        }
        msg.set_route(Route::Resolved(conn.local_seq()));
        if msg.kind().is_handshake() {
            return;
        }

        let handlers = self.dispatchers.fast_handlers(Self::owner_of(msg));
        let handler_begin = Instant::now();
        for d in &handlers {
            d.fast_preprocess(&conn, msg);
        }
        let end = Instant::now();
        self.monitor.record(
            DispatchTier::FastPreprocess,
            end - begin,
            end - handler_begin,
        );
        self.monitor
            .observe(DispatchTier::FastPreprocess, msg, handler_begin, end);
    }

    fn can_fast_dispatch(&self, msg: &Message) -> bool {
        if self.is_stopped() {
            return true;
        }
        if msg.kind().is_handshake() {
            return false;
        }
        let handlers = self.dispatchers.fast_handlers(Self::owner_of(msg));
        if handlers.is_empty() && msg.dst().is_member() {
            return false;
        }
        handlers.iter().any(|d| d.can_fast_dispatch(msg))
    }

    fn fast_dispatch(&self, msg: Message) {
        if self.is_stopped() {
            return;
        }
        let begin = Instant::now();
        let Some(conn) = self.routed(&msg) else {
            debug!(src = %msg.src(), kind = %msg.kind(), "unroutable fast message, dropping");
            return;
        };
        let handlers = self.dispatchers.fast_handlers(Self::owner_of(&msg));
        if handlers.is_empty() && msg.dst().is_member() {
            warn!(dst = %msg.dst(), kind = %msg.kind(), "no fast dispatcher, dropping");
            return;
        }
        let handler_begin = Instant::now();
        let consumed = handlers
            .iter()
            .any(|d| d.can_fast_dispatch(&msg) && d.fast_dispatch(&conn, &msg));
        let end = Instant::now();
        self.monitor
            .record(DispatchTier::FastDispatch, end - begin, end - handler_begin);
        self.monitor
            .observe(DispatchTier::FastDispatch, &msg, handler_begin, end);
        if !consumed {
            warn!(src = %msg.src(), dst = %msg.dst(), msg = %msg.summary(), "fast message not handled");
        }
    }

    fn dispatch(&self, msg: Message) -> bool {
        if self.is_stopped() {
            return false;
        }
        let Some(conn) = self.routed(&msg) else {
            debug!(src = %msg.src(), kind = %msg.kind(), "unroutable message, dropping");
            return false;
        };
        match msg.kind() {
            MessageKind::Connect => self.handle_connect_msg(&conn, &msg),
            MessageKind::Accept => self.handle_accept_msg(&conn, &msg),
            MessageKind::Remove => self.handle_remove_msg(&conn),
            MessageKind::RemoveAck => self.handle_remove_ack_msg(&conn),
            MessageKind::User(_) => {
                if conn.state() == ConnectionState::Stopped {
                    debug!(local_seq = conn.local_seq(), "connection stopped, dropping");
                    return false;
                }
                let begin = Instant::now();
                let handlers = self.dispatchers.handlers(Self::owner_of(&msg));
                let handler_begin = Instant::now();
                let handled = self.first_dispatch(&handlers, &conn, &msg);
                let end = Instant::now();
                self.monitor
                    .record(DispatchTier::Dispatch, end - begin, end - handler_begin);
                self.monitor
                    .observe(DispatchTier::Dispatch, &msg, handler_begin, end);
                if !handled {
                    warn!(src = %msg.src(), dst = %msg.dst(), msg = %msg.summary(), "message not handled");
                }
                handled
            }
        }
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
        // Virtual connections authenticate in their own Connect
        AuthVerdict::accept()
    }
}

impl ResetSink for MessengerInner {
    fn deliver_reset(&self, event: ResetEvent) {
        let conn = &event.conn;
        let handlers = self.dispatchers.handlers(conn.src().owner_key());
        match event.kind {
            ResetKind::Local => {
                if !handlers.iter().any(|d| d.handle_reset(conn)) {
                    trace!(local_seq = conn.local_seq(), "reset not claimed by any dispatcher");
                }
            }
            ResetKind::Remote => {
                for d in &handlers {
                    d.handle_remote_reset(conn);
                }
            }
        }
    }
}
