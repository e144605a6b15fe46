//! Handshake integration tests
//!
//! Connection establishment between memory-transport nodes: queued sends,
//! simultaneous connects, peer supersession, loopback and clients that start
//! without an address.


use futures::future::join_all;
use std::sync::Arc;
use test_utils::{eventually, payloads, settle, Node, Recorder};
use vconn_harness::MemoryNetwork;
use vconn_harness::MemoryTransportConfig;
use vconn_runtime::{ConnectionState, Direction, EntityName, MessengerConfig, OwnerKey};

#[tokio::test]
async fn test_handshake_delivers_queued_messages_in_order() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);
    let b = Node::member(&network, 1);

    a.send(&b.me(), b"one");
    a.send(&b.me(), b"two");
    a.send(&b.me(), b"three");

    let conn = a.messenger.registry().find(&a.me(), &b.me()).unwrap();
    assert_eq!(conn.direction(), Direction::Client);

    assert!(eventually(|| b.recorder.payloads().len() == 3).await);
    assert_eq!(
        b.recorder.payloads(),
        payloads(&[b"one", b"two", b"three"])
    );
    assert_eq!(b.recorder.senders()[0], a.me());

    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.pending_len(), 0);
    assert!(eventually(|| a.recorder.connects() == vec![conn.local_seq()]).await);

    let server = b.messenger.registry().find(&b.me(), &a.me()).unwrap();
    assert_eq!(server.direction(), Direction::Server);
    assert_eq!(server.remote_seq(), conn.local_seq());
    assert_eq!(conn.remote_seq(), server.local_seq());
    assert_eq!(b.recorder.accepts(), vec![server.local_seq()]);
}

#[tokio::test]
async fn test_simultaneous_connect_converges() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);
    let b = Node::member(&network, 1);

    a.send(&b.me(), b"from a");
    b.send(&a.me(), b"from b");

    assert!(eventually(|| a.recorder.payloads().len() == 1 && b.recorder.payloads().len() == 1).await);
    settle().await;

    let ab = a.messenger.registry().find(&a.me(), &b.me()).unwrap();
    let ba = b.messenger.registry().find(&b.me(), &a.me()).unwrap();
    assert_eq!(ab.state(), ConnectionState::Connected);
    assert_eq!(ba.state(), ConnectionState::Connected);
    assert_eq!(ab.remote_seq(), ba.local_seq());
    assert_eq!(ba.remote_seq(), ab.local_seq());
    assert_eq!(a.messenger.registry().len(), 1);
    assert_eq!(b.messenger.registry().len(), 1);
    assert_eq!(a.transport.connection_count(), 1);
}

#[tokio::test]
async fn test_newer_peer_connection_supersedes_old() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);
    let b = Node::member(&network, 1);

    a.send(&b.me(), b"before");
    assert!(eventually(|| b.recorder.payloads().len() == 1).await);
    let old = b.messenger.registry().find(&b.me(), &a.me()).unwrap();

    // Forget the session locally; the peer is not told
    a.messenger.remove_all_dispatchers(OwnerKey::member(0));
    a.messenger
        .add_dispatcher_tail(a.recorder.clone(), OwnerKey::member(0));
    a.send(&b.me(), b"after");

    assert!(eventually(|| b.recorder.payloads().len() == 2).await);
    assert_eq!(b.recorder.payloads(), payloads(&[b"before", b"after"]));
    assert!(eventually(|| b.recorder.resets() == vec![old.local_seq()]).await);

    assert_eq!(old.state(), ConnectionState::Stopped);

    let new = b.messenger.registry().find(&b.me(), &a.me()).unwrap();
    assert!(!Arc::ptr_eq(&old, &new));
    assert!(new.remote_seq() > old.remote_seq());
    assert_eq!(b.messenger.registry().len(), 1);
}

#[tokio::test]
async fn test_concurrent_get_connection_yields_one_connection() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);
    let b = Node::member(&network, 1);
    let (src, dst) = (a.me(), b.me());

    let attempts = (0..8).map(|_| a.messenger.get_connection(&src, &dst));
    let conns: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert!(conns.iter().all(|c| Arc::ptr_eq(c, &conns[0])));
    assert!(conns[0].is_bound());
    assert_eq!(a.messenger.registry().len(), 1);
}

#[tokio::test]
async fn test_get_connection_times_out_when_unreachable() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);
    let b = Node::member(&network, 1);
    let dst = b.me();
    drop(b);

    let result = a.messenger.get_connection(&a.me(), &dst).await;
    assert!(result.is_err());
    let conn = a.messenger.registry().find(&a.me(), &dst).unwrap();
    assert!(!conn.is_bound());
}

#[tokio::test]
async fn test_loopback_connection_is_connected_immediately() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);

    let conn = a.messenger.get_loopback_connection(&a.me()).unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.remote_seq(), conn.local_seq());

    a.send(&a.me(), b"self");
    assert!(eventually(|| a.recorder.payloads() == payloads(&[b"self"])).await);
    assert_eq!(a.messenger.registry().len(), 1);
}

#[tokio::test]
async fn test_unaddressed_client_migrates_and_connects() {
    let network = MemoryNetwork::new();
    let server = Node::member(&network, 0);
    let client = Node::client(&network, 7);
    assert!(client.me().has_blank_addr());

    client.send(&server.me(), b"hello");
    assert!(!client.me().has_blank_addr());

    assert!(eventually(|| server.recorder.payloads() == payloads(&[b"hello"])).await);
    assert_eq!(server.recorder.senders()[0], client.me());

    let conn = client
        .messenger
        .registry()
        .find(&client.me(), &server.me())
        .unwrap();
    assert_eq!(conn.src(), client.me());
    assert_eq!(client.messenger.diagnostics().connections.pending_source, 0);

    // The server answers over the client's session
    server.send(&client.me(), b"welcome");
    assert!(eventually(|| client.recorder.payloads() == payloads(&[b"welcome"])).await);
}

#[tokio::test]
async fn test_rejected_authorizer_keeps_session_connecting() {
    let network = MemoryNetwork::new();
    let a = Node::start(
        &network,
        EntityName::storage(0),
        MemoryTransportConfig::member(),
        MessengerConfig::testing(),
        Recorder::authenticated(1, 1),
    );
    let mut strict = MessengerConfig::testing();
    strict.reject_invalid_authorizers = true;
    let b = Node::start(
        &network,
        EntityName::storage(1),
        MemoryTransportConfig::member(),
        strict,
        Recorder::authenticated(2, 2),
    );

    a.send(&b.me(), b"denied");
    settle().await;

    let conn = a.messenger.registry().find(&a.me(), &b.me()).unwrap();
    assert_eq!(conn.state(), ConnectionState::Connecting);
    assert_eq!(conn.pending_len(), 1);
    assert!(b.recorder.payloads().is_empty());
    assert!(b.recorder.accepts().is_empty());
    assert!(a.recorder.connects().is_empty());
}

#[tokio::test]
async fn test_invalid_authorizer_tolerated_by_default() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);
    let b = Node::start(
        &network,
        EntityName::storage(1),
        MemoryTransportConfig::member(),
        MessengerConfig::testing(),
        Recorder::authenticated(2, 2),
    );

    a.send(&b.me(), b"tolerated");
    assert!(eventually(|| b.recorder.payloads() == payloads(&[b"tolerated"])).await);
    let conn = a.messenger.registry().find(&a.me(), &b.me()).unwrap();
    assert!(conn.auth_context().is_none());
}

#[tokio::test]
async fn test_unaddressed_client_burst_keeps_one_session() {
    let network = MemoryNetwork::new();
    let server = Node::member(&network, 0);
    let client = Node::client(&network, 8);

    client.send(&server.me(), b"one");
    client.send(&server.me(), b"two");
    client.send(&server.me(), b"three");
    assert_eq!(client.messenger.registry().len(), 1);

    assert!(eventually(|| server.recorder.payloads().len() == 3).await);
    assert_eq!(
        server.recorder.payloads(),
        payloads(&[b"one", b"two", b"three"])
    );
    settle().await;
    assert!(client.recorder.resets().is_empty());
    assert_eq!(server.messenger.registry().len(), 1);
}
