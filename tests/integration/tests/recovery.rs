//! Integration test: circuits surviving a restart of the switch.
//!
//! A node is stopped and reopened over the same `MemoryStore` and channel
//! state machines, which is what a process restart looks like to the switch.

use std::time::Duration;

use hopswitch::{ForwardOutcome, SwitchError};
use hopswitch_core::{CircuitKey, FailureCode, Preimage, Resolution, SwitchConfig};
use hopswitch_integration_tests::{eventually, exit_htlc, forward_to, Node, ALICE, BOB};

#[tokio::test]
async fn test_crash_between_apply_and_close_settles_once() {
    let config = SwitchConfig::default();
    let node = Node::start(config.clone()).await;
    let p = Preimage::random();
    let incoming = CircuitKey::new(ALICE, 0);

    let ForwardOutcome::Forwarded { outgoing } = node
        .switch
        .forward_htlc(forward_to(0, p.hash(), BOB))
        .await
        .unwrap()
    else {
        panic!("HTLC should be forwarded");
    };

    // Preimage and resolution get written, the circuit delete does not
    node.store.fail_writes_after(Some(2));
    let result = node.switch.settle_circuit(outgoing, p).await;
    assert!(matches!(result, Err(SwitchError::Storage(_))));
    assert!(node.switch.is_halted());
    assert_eq!(node.alice.settled_count(), 1);
    let stuck = node.switch.lookup_by_incoming(&incoming).unwrap();
    assert_eq!(stuck.resolution, Some(Resolution::Settle(p)));

    let (store, alice, bob) = node.stop().await;
    store.fail_writes_after(None);
    let node = Node::restart(config, store, alice, bob).await;

    // Attaching Alice replayed the resolution and closed the circuit
    assert!(!node.switch.is_halted());
    assert_eq!(node.switch.circuit_count(), 0);
    assert_eq!(node.alice.settled_count(), 1);
    assert_eq!(node.alice.resolution(0), Some(Resolution::Settle(p)));
    assert_eq!(node.switch.lookup_preimage(&p.hash()).unwrap(), Some(p));

    // Replaying the close once more is harmless
    let replayed = node
        .switch
        .close_circuit(incoming, Resolution::Settle(p))
        .await
        .unwrap();
    assert!(!replayed);
    assert_eq!(node.alice.settled_count(), 1);
}

#[tokio::test]
async fn test_re_presented_htlc_reattaches() {
    let config = SwitchConfig::default();
    let node = Node::start(config.clone()).await;
    let p = Preimage::random();

    let ForwardOutcome::Forwarded { outgoing } = node
        .switch
        .forward_htlc(forward_to(4, p.hash(), BOB))
        .await
        .unwrap()
    else {
        panic!("HTLC should be forwarded");
    };

    let (store, alice, bob) = node.stop().await;
    let mut node = Node::restart(config, store, alice, bob).await;
    assert_eq!(node.switch.circuit_count(), 1);
    assert_eq!(
        node.switch.lookup_by_outgoing(&outgoing).unwrap().incoming,
        CircuitKey::new(ALICE, 4)
    );

    let outcome = node
        .switch
        .forward_htlc(forward_to(4, p.hash(), BOB))
        .await
        .unwrap();
    assert_eq!(outcome, ForwardOutcome::Reattached);

    // Only the first re-presentation reattaches
    let again = node.switch.forward_htlc(forward_to(4, p.hash(), BOB)).await;
    assert!(matches!(again, Err(SwitchError::DuplicateHtlc(_))));

    // New forwards do not reuse the restored outgoing slot
    let ForwardOutcome::Forwarded { outgoing: fresh } = node
        .switch
        .forward_htlc(forward_to(5, Preimage::random().hash(), BOB))
        .await
        .unwrap()
    else {
        panic!("HTLC should be forwarded");
    };
    assert!(fresh.htlc_index > outgoing.htlc_index);
    assert_eq!(node.bob_link.try_next_outgoing().map(|h| h.key), Some(fresh));

    assert!(node.switch.settle_circuit(outgoing, p).await.unwrap());
    assert_eq!(node.alice.resolution(4), Some(Resolution::Settle(p)));
}

#[tokio::test]
async fn test_re_presented_htlc_collects_undelivered_settle() {
    let config = SwitchConfig {
        redelivery_interval: Duration::from_secs(3600),
        ..SwitchConfig::default()
    };
    let node = Node::start(config).await;
    let p = Preimage::random();
    let ForwardOutcome::Forwarded { outgoing } = node
        .switch
        .forward_htlc(forward_to(2, p.hash(), BOB))
        .await
        .unwrap()
    else {
        panic!("HTLC should be forwarded");
    };

    node.alice.set_online(false);
    assert!(matches!(
        node.switch.settle_circuit(outgoing, p).await,
        Err(SwitchError::Channel(_))
    ));
    node.alice.set_online(true);

    // The upstream peer re-sends the HTLC before the next retry is due
    let outcome = node
        .switch
        .forward_htlc(forward_to(2, p.hash(), BOB))
        .await
        .unwrap();
    assert_eq!(outcome, ForwardOutcome::Reattached);
    assert_eq!(node.alice.resolution(2), Some(Resolution::Settle(p)));
    assert_eq!(node.alice.settled_count(), 1);
    assert_eq!(node.switch.circuit_count(), 0);
}

#[tokio::test]
async fn test_restored_exit_circuit_gets_fresh_subscription() {
    let config = SwitchConfig::default();
    let node = Node::start(config.clone()).await;
    let p = Preimage::random();

    node.switch.forward_htlc(exit_htlc(0, p.hash())).await.unwrap();
    let (store, alice, bob) = node.stop().await;

    let node = Node::restart(config, store, alice, bob).await;
    // Subscriptions are not persisted
    assert_eq!(node.switch.beacon().subscriber_count(&p.hash()), 0);

    let outcome = node.switch.forward_htlc(exit_htlc(0, p.hash())).await.unwrap();
    assert_eq!(outcome, ForwardOutcome::AwaitingPreimage);
    assert_eq!(node.switch.beacon().subscriber_count(&p.hash()), 1);

    node.switch.add_preimages(&[p]).unwrap();
    assert!(eventually(|| node.alice.settled_count() == 1).await);
    assert!(eventually(|| node.switch.circuit_count() == 0).await);
}

#[tokio::test]
async fn test_staleness_timer_rearmed_after_restart() {
    let config = SwitchConfig {
        circuit_timeout: Duration::from_millis(300),
        ..SwitchConfig::default()
    };
    let node = Node::start(config.clone()).await;
    node.switch
        .forward_htlc(forward_to(0, Preimage::random().hash(), BOB))
        .await
        .unwrap();

    let (store, alice, bob) = node.stop().await;
    assert_eq!(alice.failed_count(), 0);

    let node = Node::restart(config, store, alice, bob).await;
    assert!(eventually(|| node.alice.failed_count() == 1).await);
    match node.alice.resolution(0) {
        Some(Resolution::Fail(reason)) => assert_eq!(reason.code, FailureCode::CircuitTimeout),
        other => panic!("unexpected resolution {other:?}"),
    }
    assert!(eventually(|| node.switch.circuit_count() == 0).await);
}
