//! Integration test: forwarding between two links through the switch.
//!
//! Drives the switch the way links do, through `LinkHandle` reports, and
//! checks what reaches each channel state machine.

use std::time::Duration;

use hopswitch::{ForwardOutcome, LinkStatus, SwitchError};
use hopswitch_core::{
    ChannelId, CircuitKey, FailureCode, FailureReason, Preimage, Resolution, SwitchConfig,
};
use hopswitch_integration_tests::{
    eventually, exit_htlc, forward_to, Node, ALICE, BOB, FORWARD_MSAT,
};

// =========================================================================
// Happy path: Alice -> Bob
// =========================================================================

#[tokio::test]
async fn test_forward_and_settle_through_link_reports() {
    let mut node = Node::start(SwitchConfig::default()).await;
    let p = Preimage::random();

    node.alice_link
        .report_incoming(forward_to(0, p.hash(), BOB))
        .await
        .expect("report should be accepted");

    let offered = tokio::time::timeout(Duration::from_secs(2), node.bob_link.next_outgoing())
        .await
        .expect("bob should be offered the HTLC")
        .expect("mailbox open");
    assert_eq!(offered.incoming, CircuitKey::new(ALICE, 0));
    assert_eq!(offered.amount_msat, FORWARD_MSAT);
    assert_eq!(offered.payment_hash, p.hash());

    // Circuit is found by its outgoing key
    let circuit = node
        .switch
        .lookup_by_outgoing(&offered.key)
        .expect("circuit should be open");
    assert_eq!(circuit.incoming, CircuitKey::new(ALICE, 0));
    assert!(circuit.resolution.is_none());

    // Bob settles downstream
    node.bob_link
        .report_settled(offered.key, p)
        .await
        .expect("report should be accepted");

    assert!(eventually(|| node.alice.settled_count() == 1).await);
    assert_eq!(node.alice.resolution(0), Some(Resolution::Settle(p)));
    assert_eq!(node.switch.lookup_preimage(&p.hash()).unwrap(), Some(p));
    assert_eq!(node.switch.circuit_count(), 0);
    assert!(node.switch.lookup_by_outgoing(&offered.key).is_none());
}

#[tokio::test]
async fn test_downstream_failure_reaches_upstream() {
    let mut node = Node::start(SwitchConfig::default()).await;
    node.alice_link
        .report_incoming(forward_to(2, Preimage::random().hash(), BOB))
        .await
        .unwrap();
    let offered = node.bob_link.next_outgoing().await.unwrap();

    let reason = FailureReason::with_message(FailureCode::IncorrectPaymentDetails, "unknown invoice");
    node.bob_link
        .report_failed(offered.key, reason.clone())
        .await
        .unwrap();

    assert!(eventually(|| node.alice.failed_count() == 1).await);
    assert_eq!(node.alice.resolution(2), Some(Resolution::Fail(reason)));
    assert_eq!(node.switch.circuit_count(), 0);
}

#[tokio::test]
async fn test_outgoing_indexes_are_distinct() {
    let mut node = Node::start(SwitchConfig::default()).await;
    for index in 0..3 {
        node.switch
            .forward_htlc(forward_to(index, Preimage::random().hash(), BOB))
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    while let Some(offered) = node.bob_link.try_next_outgoing() {
        assert_eq!(offered.key.chan_id, BOB);
        seen.push(offered.key.htlc_index);
    }
    assert_eq!(seen, vec![0, 1, 2]);
    assert_eq!(node.switch.circuit_count(), 3);
}

// =========================================================================
// Failures without a circuit
// =========================================================================

#[tokio::test]
async fn test_no_route_fails_without_circuit() {
    let node = Node::start(SwitchConfig::default()).await;
    let outcome = node
        .switch
        .forward_htlc(forward_to(0, Preimage::random().hash(), ChannelId(99)))
        .await
        .unwrap();

    let ForwardOutcome::Failed(reason) = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };
    assert_eq!(reason.code, FailureCode::UnknownNextPeer);
    assert_eq!(node.switch.circuit_count(), 0);
    assert_eq!(node.alice.resolution(0), Some(Resolution::Fail(reason)));
}

#[tokio::test]
async fn test_offline_link_is_temporary_failure() {
    let node = Node::start(SwitchConfig::default()).await;
    node.switch.link_down(BOB).await.unwrap();
    assert_eq!(node.switch.link_status(BOB).await, Some(LinkStatus::Restarting));

    let outcome = node
        .switch
        .forward_htlc(forward_to(0, Preimage::random().hash(), BOB))
        .await
        .unwrap();
    let ForwardOutcome::Failed(reason) = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };
    assert_eq!(reason.code, FailureCode::TemporaryChannelFailure);
    assert!(reason.code.is_temporary());
    assert_eq!(node.switch.circuit_count(), 0);
}

// =========================================================================
// Protocol violations
// =========================================================================

#[tokio::test]
async fn test_wrong_preimage_leaves_circuit_open() {
    let node = Node::start(SwitchConfig::default()).await;
    let p = Preimage::random();
    let ForwardOutcome::Forwarded { outgoing } = node
        .switch
        .forward_htlc(forward_to(0, p.hash(), BOB))
        .await
        .unwrap()
    else {
        panic!("HTLC should be forwarded");
    };

    let result = node.switch.settle_circuit(outgoing, Preimage::random()).await;
    assert!(matches!(
        result,
        Err(SwitchError::PreimageMismatch(key)) if key == CircuitKey::new(ALICE, 0)
    ));
    assert_eq!(node.switch.circuit_count(), 1);
    assert_eq!(node.alice.settled_count(), 0);
    assert_eq!(node.switch.lookup_preimage(&p.hash()).unwrap(), None);
    assert!(!node.switch.is_halted());

    // The right preimage still settles it
    assert!(node.switch.settle_circuit(outgoing, p).await.unwrap());
    assert_eq!(node.alice.settled_count(), 1);
    assert_eq!(node.switch.circuit_count(), 0);
}

#[tokio::test]
async fn test_second_open_for_same_incoming_rejected() {
    let mut node = Node::start(SwitchConfig::default()).await;
    let hash = Preimage::random().hash();
    node.switch
        .forward_htlc(forward_to(7, hash, BOB))
        .await
        .unwrap();

    let second = node.switch.forward_htlc(forward_to(7, hash, BOB)).await;
    assert!(matches!(second, Err(SwitchError::DuplicateHtlc(key)) if key == CircuitKey::new(ALICE, 7)));
    assert_eq!(node.switch.circuit_count(), 1);

    // Only one HTLC went downstream
    assert!(node.bob_link.try_next_outgoing().is_some());
    assert!(node.bob_link.try_next_outgoing().is_none());
}

#[tokio::test]
async fn test_first_resolution_wins() {
    let node = Node::start(SwitchConfig::default()).await;
    let p = Preimage::random();
    let ForwardOutcome::Forwarded { outgoing } = node
        .switch
        .forward_htlc(forward_to(0, p.hash(), BOB))
        .await
        .unwrap()
    else {
        panic!("HTLC should be forwarded");
    };

    let (settled, failed) = tokio::join!(
        node.switch.settle_circuit(outgoing, p),
        node.switch
            .fail_circuit(outgoing, FailureReason::new(FailureCode::TemporaryChannelFailure)),
    );
    // exactly one of the two took effect
    assert_ne!(settled.unwrap(), failed.unwrap());
    assert_eq!(node.alice.settled_count() + node.alice.failed_count(), 1);
    assert_eq!(node.switch.circuit_count(), 0);
}

#[tokio::test]
async fn test_link_cannot_resolve_another_links_htlc() {
    let mut node = Node::start(SwitchConfig::default()).await;
    let p = Preimage::random();
    node.switch
        .forward_htlc(forward_to(0, p.hash(), BOB))
        .await
        .unwrap();
    let offered = node.bob_link.try_next_outgoing().unwrap();

    // Alice's link claims Bob's outgoing HTLC failed
    node.alice_link
        .report_failed(offered.key, FailureReason::new(FailureCode::TemporaryChannelFailure))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.switch.circuit_count(), 1);
    assert_eq!(node.alice.failed_count(), 0);

    // Bob's own report still settles it
    node.bob_link.report_settled(offered.key, p).await.unwrap();
    assert!(eventually(|| node.alice.settled_count() == 1).await);
    assert!(eventually(|| node.switch.circuit_count() == 0).await);
}

#[tokio::test]
async fn test_settle_refused_upstream_is_redelivered() {
    let config = SwitchConfig {
        redelivery_interval: Duration::from_millis(20),
        ..SwitchConfig::default()
    };
    let node = Node::start(config).await;
    let p = Preimage::random();
    let ForwardOutcome::Forwarded { outgoing } = node
        .switch
        .forward_htlc(forward_to(0, p.hash(), BOB))
        .await
        .unwrap()
    else {
        panic!("HTLC should be forwarded");
    };

    node.alice.set_online(false);
    let result = node.switch.settle_circuit(outgoing, p).await;
    assert!(matches!(result, Err(SwitchError::Channel(_))));
    assert_eq!(node.switch.circuit_count(), 1);
    assert_eq!(node.switch.lookup_preimage(&p.hash()).unwrap(), Some(p));

    node.alice.set_online(true);
    assert!(eventually(|| node.alice.settled_count() == 1).await);
    assert!(eventually(|| node.switch.circuit_count() == 0).await);
    assert_eq!(node.alice.resolution(0), Some(Resolution::Settle(p)));
}

// =========================================================================
// Link down
// =========================================================================

#[tokio::test]
async fn test_link_down_fails_forwarded_circuits_only() {
    let node = Node::start(SwitchConfig::default()).await;
    let exit_hash = Preimage::random().hash();

    node.switch
        .forward_htlc(forward_to(0, Preimage::random().hash(), BOB))
        .await
        .unwrap();
    let outcome = node.switch.forward_htlc(exit_htlc(1, exit_hash)).await.unwrap();
    assert_eq!(outcome, ForwardOutcome::AwaitingPreimage);
    assert_eq!(node.switch.beacon().subscriber_count(&exit_hash), 1);

    node.bob_link.report_down().await.unwrap();
    assert!(eventually(|| node.alice.failed_count() == 1).await);

    match node.alice.resolution(0) {
        Some(Resolution::Fail(reason)) => {
            assert_eq!(reason.code, FailureCode::TemporaryChannelFailure)
        }
        other => panic!("unexpected resolution {other:?}"),
    }
    // The exit circuit and its subscription survive
    assert_eq!(node.switch.circuit_count(), 1);
    assert_eq!(node.switch.beacon().subscriber_count(&exit_hash), 1);
    assert_eq!(node.alice.resolution(1), None);
}

#[tokio::test]
async fn test_restarting_link_can_be_reattached() {
    let node = Node::start(SwitchConfig::default()).await;
    node.switch.link_down(BOB).await.unwrap();

    let mut bob_link = node
        .switch
        .add_link(BOB, node.bob.clone())
        .await
        .expect("restarting link should be replaceable");
    assert_eq!(node.switch.link_status(BOB).await, Some(LinkStatus::Active));

    node.switch
        .forward_htlc(forward_to(0, Preimage::random().hash(), BOB))
        .await
        .unwrap();
    assert!(bob_link.try_next_outgoing().is_some());
}

// =========================================================================
// Storage outage
// =========================================================================

#[tokio::test]
async fn test_storage_outage_applies_nothing() {
    let node = Node::start(SwitchConfig::default()).await;
    let p = Preimage::random();
    let ForwardOutcome::Forwarded { outgoing } = node
        .switch
        .forward_htlc(forward_to(0, p.hash(), BOB))
        .await
        .unwrap()
    else {
        panic!("HTLC should be forwarded");
    };

    node.store.set_available(false);
    let result = node.switch.settle_circuit(outgoing, p).await;
    assert!(matches!(result, Err(SwitchError::Storage(_))));
    assert!(node.switch.is_halted());
    assert_eq!(node.alice.settled_count(), 0);

    node.store.set_available(true);
    let result = node.switch.settle_circuit(outgoing, p).await;
    assert!(matches!(result, Err(SwitchError::Halted)));
    assert_eq!(node.alice.settled_count(), 0);
}
