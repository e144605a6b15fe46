//! Teardown integration tests
//!
//! Graceful mark-down, physical failure fan-out, owner removal and shutdown.
//! Every removed connection must produce exactly one reset notification.


use std::time::Duration;
use test_utils::{eventually, payloads, settle, user, Node, Recorder};
use vconn_harness::{MemoryNetwork, MemoryTransportConfig};
use vconn_runtime::{
    ConnectionState, EntityInstance, EntityName, MessengerConfig, OwnerKey, VconnError,
};

fn sorted(mut seqs: Vec<u64>) -> Vec<u64> {
    seqs.sort_unstable();
    seqs
}

#[tokio::test]
async fn test_member_mark_down_exchanges_remove_and_ack() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);
    let b = Node::member(&network, 1);

    a.send(&b.me(), b"hello");
    assert!(eventually(|| b.recorder.payloads().len() == 1).await);
    let conn = a.messenger.registry().find(&a.me(), &b.me()).unwrap();
    let server = b.messenger.registry().find(&b.me(), &a.me()).unwrap();

    a.messenger.mark_down(&conn);
    assert_eq!(conn.state(), ConnectionState::MarkDowning);
    // A second mark-down sends nothing
    a.messenger.mark_down(&conn);

    assert!(eventually(|| b.recorder.resets() == vec![server.local_seq()]).await);
    assert!(eventually(|| a.recorder.resets() == vec![conn.local_seq()]).await);
    assert!(a.messenger.registry().is_empty());
    assert!(b.messenger.registry().is_empty());
    assert_eq!(server.state(), ConnectionState::Stopped);

    // The physical connection survives for the next session
    assert_eq!(a.transport.connection_count(), 1);
    a.send(&b.me(), b"again");
    assert!(eventually(|| b.recorder.payloads() == payloads(&[b"hello", b"again"])).await);

    settle().await;
    assert_eq!(a.recorder.resets().len(), 1);
    assert_eq!(b.recorder.resets().len(), 1);
}

#[tokio::test]
async fn test_send_during_mark_down_uses_fresh_connection() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);
    let b = Node::member(&network, 1);

    a.send(&b.me(), b"first");
    assert!(eventually(|| b.recorder.payloads().len() == 1).await);
    let conn = a.messenger.registry().find(&a.me(), &b.me()).unwrap();

    a.messenger.mark_down(&conn);
    a.send(&b.me(), b"second");

    let fresh = a.messenger.registry().find(&a.me(), &b.me()).unwrap();
    assert_ne!(fresh.local_seq(), conn.local_seq());
    assert!(eventually(|| b.recorder.payloads() == payloads(&[b"first", b"second"])).await);
    assert!(eventually(|| a.recorder.resets() == vec![conn.local_seq()]).await);

    settle().await;
    assert_eq!(fresh.state(), ConnectionState::Connected);
    assert_eq!(a.messenger.registry().len(), 1);
}

#[tokio::test]
async fn test_physical_failure_resets_every_rider_once() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);
    let b = Node::member(&network, 2);
    let a_peer = Recorder::new();
    let b_peer = Recorder::new();
    let osd1 = a.host(1, a_peer.clone());
    let osd3 = b.host(3, b_peer.clone());

    let (osd0, osd2) = (a.me(), b.me());
    a.messenger.send_from(user(b"0->2"), &osd0, &osd2).unwrap();
    a.messenger.send_from(user(b"1->2"), &osd1, &osd2).unwrap();
    a.messenger.send_from(user(b"0->3"), &osd0, &osd3).unwrap();
    assert!(eventually(|| b.recorder.payloads().len() == 2 && b_peer.payloads().len() == 1).await);
    assert_eq!(a.transport.connection_count(), 1);
    assert_eq!(a.messenger.diagnostics().connections.physically_bound, 3);

    let riders_a = sorted(
        a.messenger
            .connections()
            .iter()
            .map(|c| c.local_seq)
            .collect(),
    );
    assert!(network.sever(&a.transport.addr(), &b.transport.addr()));

    assert!(eventually(|| a.recorder.resets().len() + a_peer.resets().len() == 3).await);
    assert!(eventually(|| b.recorder.resets().len() + b_peer.resets().len() == 3).await);
    assert!(a.messenger.wait_reset_idle(Duration::from_secs(1)).await);
    settle().await;

    let mut seen = a.recorder.resets();
    seen.extend(a_peer.resets());
    assert_eq!(sorted(seen), riders_a);
    assert_eq!(a_peer.resets().len(), 1);
    assert!(a.messenger.registry().is_empty());
    assert!(b.messenger.registry().is_empty());
    assert!(a.recorder.remote_resets().is_empty());
    assert_eq!(a.messenger.diagnostics().resets_delivered, 3);
}

#[tokio::test]
async fn test_non_member_mark_down_closes_physical() {
    let network = MemoryNetwork::new();
    let monitor = Node::start(
        &network,
        EntityName::monitor(0),
        MemoryTransportConfig::default(),
        MessengerConfig::testing(),
        Recorder::new(),
    );
    let client = Node::client(&network, 4);

    client.send(&monitor.me(), b"subscribe");
    assert!(eventually(|| monitor.recorder.payloads().len() == 1).await);
    let conn = client
        .messenger
        .registry()
        .find(&client.me(), &monitor.me())
        .unwrap();

    client.messenger.mark_down(&conn);
    assert_eq!(conn.state(), ConnectionState::Stopped);
    assert_eq!(client.transport.connection_count(), 0);
    assert!(client.messenger.registry().is_empty());
    assert!(eventually(|| client.recorder.resets() == vec![conn.local_seq()]).await);

    // The monitor sees the physical close as a remote reset
    assert!(eventually(|| monitor.recorder.remote_resets().len() == 1).await);
    assert!(monitor.messenger.registry().is_empty());
}

#[tokio::test]
async fn test_mark_down_peer_and_physical() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);
    let b = Node::member(&network, 1);
    let c = Node::member(&network, 2);

    a.send(&b.me(), b"b");
    a.send(&c.me(), b"c");
    assert!(eventually(|| b.recorder.payloads().len() == 1 && c.recorder.payloads().len() == 1).await);

    let unknown = EntityInstance::new(EntityName::storage(9), b.transport.addr());
    assert!(!a.messenger.mark_down_peer(&a.me(), &unknown));
    assert!(a.messenger.mark_down_peer(&a.me(), &b.me()));
    assert!(eventually(|| a.recorder.resets().len() == 1).await);

    a.messenger.mark_down_physical(&c.transport.addr());
    assert!(eventually(|| a.recorder.resets().len() == 2).await);
    assert!(a.messenger.registry().is_empty());
    assert!(a.transport.connection_to(&c.transport.addr()).is_none());
    assert!(eventually(|| c.recorder.remote_resets().len() == 1).await);
}

#[tokio::test]
async fn test_mark_down_all_owner_only_touches_owner() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);
    let b = Node::member(&network, 2);
    let a_peer = Recorder::new();
    let osd1 = a.host(1, a_peer.clone());

    a.messenger.send_from(user(b"x"), &a.me(), &b.me()).unwrap();
    a.messenger.send_from(user(b"y"), &osd1, &b.me()).unwrap();
    assert!(eventually(|| b.recorder.payloads().len() == 2).await);

    a.messenger.mark_down_all_owner(OwnerKey::member(1));
    assert!(eventually(|| a_peer.resets().len() == 1).await);
    settle().await;

    assert!(a.recorder.resets().is_empty());
    assert_eq!(a.messenger.registry().connections_of(OwnerKey::member(0)).len(), 1);
    assert!(a.messenger.registry().connections_of(OwnerKey::member(1)).is_empty());
}

#[tokio::test]
async fn test_remove_all_dispatchers_stops_connections_silently() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);
    let b = Node::member(&network, 1);

    a.send(&b.me(), b"hello");
    assert!(eventually(|| b.recorder.payloads().len() == 1).await);
    let conn = a.messenger.registry().find(&a.me(), &b.me()).unwrap();

    a.messenger.remove_all_dispatchers(OwnerKey::member(0));
    assert_eq!(conn.state(), ConnectionState::Stopped);
    assert!(a.messenger.registry().is_empty());
    assert_eq!(a.messenger.diagnostics().dispatcher_owners, 0);

    // The peer is not told and keeps its side
    settle().await;
    assert_eq!(b.messenger.registry().len(), 1);
    assert!(b.recorder.resets().is_empty());

    // Traffic for the removed owner is no longer dispatched
    b.send(&a.me(), b"orphan");
    settle().await;
    assert!(a.recorder.payloads().is_empty());
}

#[tokio::test]
async fn test_mark_down_all_tears_down_everything() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);
    let b = Node::member(&network, 1);
    let c = Node::member(&network, 2);

    a.send(&b.me(), b"b");
    a.send(&c.me(), b"c");
    assert!(eventually(|| b.recorder.payloads().len() == 1 && c.recorder.payloads().len() == 1).await);

    a.messenger.mark_down_all();
    assert!(a.messenger.registry().is_empty());
    assert_eq!(a.transport.connection_count(), 0);
    assert!(eventually(|| a.recorder.resets().len() == 2).await);
    assert!(eventually(|| b.recorder.remote_resets().len() == 1 && c.recorder.remote_resets().len() == 1).await);
}

#[tokio::test]
async fn test_shutdown_stops_messenger_and_notifies_peers() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);
    let b = Node::member(&network, 1);

    a.send(&b.me(), b"last");
    assert!(eventually(|| b.recorder.payloads().len() == 1).await);
    let server = b.messenger.registry().find(&b.me(), &a.me()).unwrap();

    a.messenger.shutdown();
    assert!(a.messenger.is_stopped());
    assert!(matches!(
        a.messenger.send(user(b"late"), &b.me()),
        Err(VconnError::Stopped)
    ));
    assert!(a.messenger.get_loopback_connection(&a.me()).is_err());

    assert!(eventually(|| b.recorder.remote_resets() == vec![server.local_seq()]).await);
    assert!(b.messenger.registry().is_empty());
    assert_eq!(network.endpoints(), 1);

    // Shutting down twice is harmless
    a.messenger.shutdown();
    settle().await;
    assert!(a.recorder.resets().is_empty());
}
