//! In-memory mesh simulation
//!
//! Members talk to each other, clients talk to every member and members
//! answer each client that reached them. Every node is a full messenger over
//! a `vconn-harness` memory transport, so the report shows exactly what the
//! runtime did.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use vconn_core::{DiagnosticsReport, EntityInstance, EntityName, Message, MessengerConfig};
use vconn_harness::{MemoryNetwork, MemoryTransport, MemoryTransportConfig};
use vconn_runtime::{Dispatcher, MessengerBuilder, VirtualConnection, VirtualMessenger};

use crate::config::SimulationConfig;
use crate::error::{CliError, Result};

const SIM_MESSAGE_TYPE: u16 = 0x51;

// ----------------------------------------------------------------------------
// Counting Dispatcher
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Counter {
    delivered: AtomicU64,
    resets: AtomicU64,
    remote_resets: AtomicU64,
    senders: Mutex<Vec<EntityInstance>>,
}

impl Counter {
    fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Distinct senders in arrival order
    fn senders(&self) -> Vec<EntityInstance> {
        self.senders.lock().clone()
    }
}

impl Dispatcher for Counter {
    fn name(&self) -> &str {
        "sim-counter"
    }

    fn dispatch(&self, _conn: &Arc<VirtualConnection>, msg: &Message) -> bool {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        let mut senders = self.senders.lock();
        if !senders.contains(msg.src()) {
            senders.push(*msg.src());
        }
        true
    }

    fn handle_reset(&self, _conn: &Arc<VirtualConnection>) -> bool {
        self.resets.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn handle_remote_reset(&self, _conn: &Arc<VirtualConnection>) {
        self.remote_resets.fetch_add(1, Ordering::Relaxed);
    }
}

// ----------------------------------------------------------------------------
// Nodes
// ----------------------------------------------------------------------------

struct SimNode {
    transport: Arc<MemoryTransport>,
    messenger: VirtualMessenger,
    counter: Arc<Counter>,
}

impl SimNode {
    fn start(
        network: &Arc<MemoryNetwork>,
        name: EntityName,
        transport_config: MemoryTransportConfig,
        config: &MessengerConfig,
    ) -> Result<Self> {
        let transport = network.bind(name, transport_config);
        let counter = Arc::new(Counter::default());
        let owner = EntityInstance::new(name, transport.addr()).owner_key();
        let messenger = MessengerBuilder::new(transport.clone())
            .with_config(config.clone().with_name(name.to_string()))
            .dispatcher(owner, counter.clone())
            .build_and_start()?;
        Ok(Self {
            transport,
            messenger,
            counter,
        })
    }

    fn me(&self) -> EntityInstance {
        self.messenger.my_instance()
    }

    fn send_burst(&self, dst: &EntityInstance, count: usize) -> Result<()> {
        for i in 0..count {
            let payload = Bytes::from(format!("{} -> {} #{}", self.me().name, dst.name, i));
            self.messenger
                .send(Message::user(SIM_MESSAGE_TYPE, payload), dst)?;
        }
        Ok(())
    }

    fn report(&self) -> NodeReport {
        let stats = self.transport.stats();
        NodeReport {
            entity: self.me().to_string(),
            delivered: self.counter.delivered(),
            resets: self.counter.resets.load(Ordering::Relaxed),
            remote_resets: self.counter.remote_resets.load(Ordering::Relaxed),
            transport: TransportCounters {
                sent: stats.sent(),
                received: stats.received(),
                dropped: stats.dropped(),
                established: stats.established(),
                accepted: stats.accepted(),
                lost: stats.lost(),
            },
            diagnostics: self.messenger.diagnostics(),
        }
    }
}

// ----------------------------------------------------------------------------
// Report
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportCounters {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    pub established: u64,
    pub accepted: u64,
    pub lost: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub entity: String,
    pub delivered: u64,
    pub resets: u64,
    pub remote_resets: u64,
    pub transport: TransportCounters,
    pub diagnostics: DiagnosticsReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub members: usize,
    pub clients: usize,
    pub messages_per_peer: usize,
    pub expected_deliveries: u64,
    pub delivered: u64,
    pub severed: bool,
    pub nodes: Vec<NodeReport>,
}

impl SimulationReport {
    pub fn is_complete(&self) -> bool {
        self.delivered == self.expected_deliveries
    }
}

// ----------------------------------------------------------------------------
// Simulation
// ----------------------------------------------------------------------------

/// Run one simulation to completion and shut every messenger down
pub async fn run_simulation(
    sim: &SimulationConfig,
    messenger_config: &MessengerConfig,
    sever: bool,
) -> Result<SimulationReport> {
    sim.validate()?;
    let network = MemoryNetwork::new();
    let per_peer = sim.messages_per_peer as u64;
    let timeout = Duration::from_millis(sim.settle_timeout_ms);

    let members = (0..sim.members)
        .map(|i| {
            SimNode::start(
                &network,
                EntityName::storage(i as i64),
                MemoryTransportConfig::member(),
                messenger_config,
            )
        })
        .collect::<Result<Vec<_>>>()?;
    let clients = (0..sim.clients)
        .map(|i| {
            SimNode::start(
                &network,
                EntityName::client(i as i64),
                MemoryTransportConfig::client(),
                messenger_config,
            )
        })
        .collect::<Result<Vec<_>>>()?;
    info!(
        members = members.len(),
        clients = clients.len(),
        "simulation nodes started"
    );

    // Peer traffic and client requests
    for (i, member) in members.iter().enumerate() {
        for (j, peer) in members.iter().enumerate() {
            if i != j {
                member.send_burst(&peer.me(), sim.messages_per_peer)?;
            }
        }
    }
    for client in &clients {
        for member in &members {
            client.send_burst(&member.me(), sim.messages_per_peer)?;
        }
    }
    let member_expected = ((sim.members - 1) + sim.clients) as u64 * per_peer;
    if !wait_for(timeout, || {
        members.iter().all(|m| m.counter.delivered() >= member_expected)
    })
    .await
    {
        warn!(expected = member_expected, "members did not receive every request in time");
    }

    // Members answer the clients over the sessions the clients opened
    for member in &members {
        for sender in member.counter.senders() {
            if !sender.is_member() {
                member.send_burst(&sender, sim.messages_per_peer)?;
            }
        }
    }
    let client_expected = sim.members as u64 * per_peer;
    if !wait_for(timeout, || {
        clients.iter().all(|c| c.counter.delivered() >= client_expected)
    })
    .await
    {
        warn!(expected = client_expected, "clients did not receive every reply in time");
    }

    let severed = if sever && members.len() >= 2 {
        let (a, b) = (&members[0], &members[1]);
        if !network.sever(&a.transport.addr(), &b.transport.addr()) {
            return Err(CliError::Simulation(
                "no physical connection between the first two members".to_string(),
            ));
        }
        let reset = |n: &SimNode| n.counter.resets.load(Ordering::Relaxed) > 0;
        if !wait_for(timeout, || reset(a) && reset(b)).await {
            warn!("severed members were not reset in time");
        }
        a.messenger.wait_reset_idle(timeout).await;
        b.messenger.wait_reset_idle(timeout).await;
        true
    } else {
        false
    };

    let nodes: Vec<NodeReport> = members.iter().chain(clients.iter()).map(SimNode::report).collect();
    let report = SimulationReport {
        members: sim.members,
        clients: sim.clients,
        messages_per_peer: sim.messages_per_peer,
        expected_deliveries: member_expected * sim.members as u64
            + client_expected * sim.clients as u64,
        delivered: nodes.iter().map(|n| n.delivered).sum(),
        severed,
        nodes,
    };

    for node in members.iter().chain(clients.iter()) {
        node.messenger.shutdown();
    }
    info!(
        delivered = report.delivered,
        expected = report.expected_deliveries,
        "simulation finished"
    );
    Ok(report)
}

/// Poll `check` until it holds or `timeout` passes
async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    check()
}
