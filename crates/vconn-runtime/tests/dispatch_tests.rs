//! Dispatch integration tests
//!
//! Fast and full dispatch tiers, send policy, and the diagnostics surface.


use std::sync::Arc;

use test_utils::{eventually, payloads, settle, stamped, typed, user, Node, Recorder};
use vconn_harness::{MemoryNetwork, MemoryTransportConfig};
use vconn_runtime::{
    ConnectionState, DispatchTier, EntityInstance, EntityName, Message, MessengerConfig, OwnerKey,
    PhysicalConnection, Position, VconnError,
};

#[tokio::test]
async fn test_fast_capable_messages_skip_full_dispatch() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);
    let b = Node::start(
        &network,
        EntityName::storage(1),
        MemoryTransportConfig::member(),
        MessengerConfig::testing(),
        Recorder::fast(&[7]),
    );

    a.messenger.send(typed(7, b"fast"), &b.me()).unwrap();
    a.messenger.send(typed(8, b"slow"), &b.me()).unwrap();
    a.messenger.send(typed(7, b"fast again"), &b.me()).unwrap();

    assert!(eventually(|| b.recorder.fast_payloads().len() == 2 && b.recorder.payloads().len() == 1).await);
    assert_eq!(
        b.recorder.fast_payloads(),
        payloads(&[b"fast", b"fast again"])
    );
    assert_eq!(b.recorder.payloads(), payloads(&[b"slow"]));
}

#[tokio::test]
async fn test_member_without_fast_handlers_uses_full_dispatch() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);
    let b = Node::member(&network, 1);

    a.messenger.send(typed(7, b"only full"), &b.me()).unwrap();
    assert!(eventually(|| b.recorder.payloads() == payloads(&[b"only full"])).await);
    assert!(b.recorder.fast_payloads().is_empty());
}

#[tokio::test]
async fn test_head_dispatcher_takes_precedence() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);
    let b = Node::member(&network, 1);
    let first = Recorder::new();
    b.messenger
        .add_dispatcher(first.clone(), OwnerKey::member(1), Position::Head);

    a.send(&b.me(), b"claimed");
    assert!(eventually(|| first.payloads() == payloads(&[b"claimed"])).await);
    settle().await;
    assert!(b.recorder.payloads().is_empty());
}

#[tokio::test]
async fn test_server_policy_requires_existing_session() {
    let network = MemoryNetwork::new();
    let server = Node::member(&network, 0);
    let client = Node::client(&network, 3);

    // Clients are never dialled by a member
    let unknown_client = EntityInstance::new(EntityName::client(3), client.transport.addr());
    let err = server
        .messenger
        .send(user(b"push"), &unknown_client)
        .unwrap_err();
    assert!(matches!(err, VconnError::NoConnection { .. }));
    assert!(server.messenger.registry().is_empty());

    client.send(&server.me(), b"hello");
    assert!(eventually(|| server.recorder.payloads().len() == 1).await);
    server.send(&client.me(), b"reply");
    assert!(eventually(|| client.recorder.payloads() == payloads(&[b"reply"])).await);
}

#[tokio::test]
async fn test_slow_samples_identify_sender() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 5);
    let b = Node::member(&network, 1);

    a.send(&b.me(), b"x");
    a.send(&b.me(), b"y");
    assert!(eventually(|| b.recorder.payloads().len() == 2).await);

    let samples = b.messenger.diagnostics().slow_samples;
    let user_samples: Vec<_> = samples
        .iter()
        .filter(|s| s.tier == DispatchTier::Dispatch)
        .collect();
    assert_eq!(user_samples.len(), 2);
    assert!(user_samples.iter().all(|s| s.src.starts_with("osd.5")));
}

#[tokio::test]
async fn test_diagnostics_report_counts_and_clears() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);
    let b = Node::member(&network, 1);

    for _ in 0..3 {
        a.send(&b.me(), b"tick");
    }
    assert!(eventually(|| b.recorder.payloads().len() == 3).await);

    let report = b.messenger.diagnostics();
    assert_eq!(report.name, "osd.1");
    assert_eq!(report.connections.connected, 1);
    assert_eq!(report.connections.total(), 1);
    assert_eq!(report.dispatcher_owners, 1);
    assert_eq!(report.reset_queue_depth, 0);

    let dispatch = report
        .tiers
        .iter()
        .find(|t| t.tier == DispatchTier::Dispatch)
        .unwrap();
    assert_eq!(dispatch.total.count, 3);
    assert!(dispatch.total.max_us >= dispatch.handlers.max_us);
    assert!(!report.slow_samples.is_empty());
    assert!(report.slow_samples.len() <= MessengerConfig::testing().slow_sample_capacity);

    let snapshot = &b.messenger.connections()[0];
    assert_eq!(snapshot.src, b.me().to_string());
    assert_eq!(snapshot.remote_seq, 1);

    b.messenger.clear_diagnostics();
    let cleared = b.messenger.diagnostics();
    assert!(cleared.slow_samples.is_empty());
    assert!(cleared.tiers.iter().all(|t| t.total.count == 0));
}

#[tokio::test]
async fn test_sequence_mismatch_is_dropped() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);
    let b = Node::member(&network, 1);

    a.send(&b.me(), b"first");
    assert!(eventually(|| b.recorder.payloads().len() == 1).await);
    let client = a.messenger.registry().find(&a.me(), &b.me()).unwrap();
    let server = b.messenger.registry().find(&b.me(), &a.me()).unwrap();
    let link = a.transport.connection_to(&b.transport.addr()).unwrap();
    let (src, dst) = (a.me(), b.me());

    // Unknown sender sequence, addressed by id and by pair
    let wrong = client.local_seq() + 100;
    link.send_message(stamped(user(b"by id"), &src, &dst, wrong, server.local_seq()))
        .unwrap();
    link.send_message(stamped(user(b"by pair"), &src, &dst, wrong, 0))
        .unwrap();
    // Correct stamping goes through the same way
    link.send_message(stamped(
        user(b"genuine"),
        &src,
        &dst,
        client.local_seq(),
        server.local_seq(),
    ))
    .unwrap();

    assert!(eventually(|| b.recorder.payloads().len() == 2).await);
    settle().await;
    assert_eq!(b.recorder.payloads(), payloads(&[b"first", b"genuine"]));
    assert_eq!(server.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_message_for_removed_connection_is_not_rerouted() {
    let network = MemoryNetwork::new();
    let a = Node::member(&network, 0);
    let b = Node::member(&network, 1);

    a.send(&b.me(), b"first");
    assert!(eventually(|| b.recorder.payloads().len() == 1).await);
    let client = a.messenger.registry().find(&a.me(), &b.me()).unwrap();
    let old = b.messenger.registry().find(&b.me(), &a.me()).unwrap();

    b.messenger.mark_down(&old);
    assert!(eventually(|| {
        a.messenger.registry().is_empty() && b.messenger.registry().is_empty()
    })
    .await);

    // B reconnects; its new session is still connecting when the late
    // traffic for the removed one arrives
    b.send(&a.me(), b"again");
    let fresh = b.messenger.registry().find(&b.me(), &a.me()).unwrap();
    assert_eq!(fresh.state(), ConnectionState::Connecting);
    assert_eq!(fresh.remote_seq(), 0);

    let link = a.transport.connection_to(&b.transport.addr()).unwrap();
    let (src, dst) = (a.me(), b.me());
    let (seq, removed) = (client.local_seq(), old.local_seq());
    link.send_message(stamped(typed(99, b"late"), &src, &dst, seq, removed))
        .unwrap();
    link.send_message(stamped(Message::remove(), &src, &dst, seq, removed))
        .unwrap();

    assert!(eventually(|| a.recorder.payloads() == payloads(&[b"again"])).await);
    settle().await;
    assert_eq!(b.recorder.payloads(), payloads(&[b"first"]));
    assert_eq!(fresh.state(), ConnectionState::Connected);
    assert_eq!(b.recorder.resets(), vec![old.local_seq()]);
    assert!(Arc::ptr_eq(
        &fresh,
        &b.messenger.registry().find(&b.me(), &a.me()).unwrap()
    ));
}
