//! Integration test: the interception hook taking forwarding decisions.

use std::time::Duration;

use hopswitch::{ForwardOutcome, InterceptError, SwitchError};
use hopswitch_core::{
    CircuitKey, FailureCode, FailureReason, InterceptTimeoutPolicy, Preimage, Resolution,
    SwitchConfig,
};
use hopswitch_integration_tests::{
    eventually, exit_htlc, fast_config, forward_to, Node, ALICE, BOB, FORWARD_MSAT,
};

fn failure_code(resolution: Option<Resolution>) -> Option<FailureCode> {
    match resolution {
        Some(Resolution::Fail(reason)) => Some(reason.code),
        _ => None,
    }
}

#[tokio::test]
async fn test_single_registration() {
    let node = Node::start(SwitchConfig::default()).await;
    let hook = node.switch.register_interceptor().unwrap();
    assert!(node.switch.has_interceptor());

    let second = node.switch.register_interceptor();
    assert!(matches!(second, Err(SwitchError::InterceptorRegistered)));

    // A dropped hook frees the slot
    drop(hook);
    assert!(!node.switch.has_interceptor());
    assert!(node.switch.register_interceptor().is_ok());
}

#[tokio::test]
async fn test_interceptor_settle_skips_outgoing_link() {
    let mut node = Node::start(SwitchConfig::default()).await;
    let mut hook = node.switch.register_interceptor().unwrap();
    let p = Preimage::random();

    let outcome = node
        .switch
        .forward_htlc(forward_to(0, p.hash(), BOB))
        .await
        .unwrap();
    assert_eq!(outcome, ForwardOutcome::Intercepted);
    assert_eq!(node.switch.held_count(), 1);
    assert_eq!(node.switch.circuit_count(), 0);

    let forward = hook.next().await.expect("hook should receive the HTLC");
    assert_eq!(forward.incoming_key(), CircuitKey::new(ALICE, 0));
    assert_eq!(forward.instruction().amount_to_forward_msat, FORWARD_MSAT);
    forward.settle(p).expect("settle before the deadline");

    assert!(eventually(|| node.alice.settled_count() == 1).await);
    assert_eq!(node.alice.resolution(0), Some(Resolution::Settle(p)));
    assert_eq!(node.switch.held_count(), 0);
    assert_eq!(node.switch.lookup_preimage(&p.hash()).unwrap(), Some(p));

    // Bob never saw the HTLC
    assert!(node.bob_link.try_next_outgoing().is_none());
    assert_eq!(node.bob.settled_count() + node.bob.failed_count(), 0);
    assert_eq!(node.switch.circuit_count(), 0);
}

#[tokio::test]
async fn test_silent_interceptor_times_out() {
    let node = Node::start(fast_config()).await;
    let mut hook = node.switch.register_interceptor().unwrap();
    let p = Preimage::random();

    node.switch
        .forward_htlc(forward_to(0, p.hash(), BOB))
        .await
        .unwrap();
    let forward = hook.next().await.unwrap();
    assert!(forward.deadline().unwrap() > node.switch.started_at());

    assert!(eventually(|| node.alice.failed_count() == 1).await);
    assert_eq!(
        failure_code(node.alice.resolution(0)),
        Some(FailureCode::InterceptorTimeout)
    );
    assert!(FailureCode::InterceptorTimeout.is_temporary());

    // A late decision is refused and changes nothing
    let late = forward.settle(p);
    assert!(matches!(late, Err(InterceptError::Expired(key)) if key == CircuitKey::new(ALICE, 0)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.alice.settled_count(), 0);
    assert_eq!(node.switch.held_count(), 0);
}

#[tokio::test]
async fn test_permanent_timeout_policy() {
    let config = SwitchConfig {
        intercept_timeout_policy: InterceptTimeoutPolicy::Permanent,
        ..fast_config()
    };
    let node = Node::start(config).await;
    let mut hook = node.switch.register_interceptor().unwrap();

    node.switch
        .forward_htlc(forward_to(0, Preimage::random().hash(), BOB))
        .await
        .unwrap();
    let _forward = hook.next().await.unwrap();

    assert!(eventually(|| node.alice.failed_count() == 1).await);
    let code = failure_code(node.alice.resolution(0)).unwrap();
    assert_eq!(code, FailureCode::PermanentChannelFailure);
    assert!(!code.is_temporary());
}

#[tokio::test]
async fn test_hook_disconnect_fails_outstanding() {
    let node = Node::start(SwitchConfig::default()).await;
    let hook = node.switch.register_interceptor().unwrap();

    for index in 0..2 {
        let outcome = node
            .switch
            .forward_htlc(forward_to(index, Preimage::random().hash(), BOB))
            .await
            .unwrap();
        assert_eq!(outcome, ForwardOutcome::Intercepted);
    }

    // Long default timeout; only the disconnect can resolve these
    drop(hook);
    assert!(eventually(|| node.alice.failed_count() == 2).await);
    for index in 0..2 {
        assert_eq!(
            failure_code(node.alice.resolution(index)),
            Some(FailureCode::InterceptorTimeout)
        );
    }
    assert!(!node.switch.has_interceptor());
}

#[tokio::test]
async fn test_resume_forwards_normally() {
    let mut node = Node::start(SwitchConfig::default()).await;
    let mut hook = node.switch.register_interceptor().unwrap();
    let p = Preimage::random();

    node.switch
        .forward_htlc(forward_to(0, p.hash(), BOB))
        .await
        .unwrap();
    hook.next().await.unwrap().resume().unwrap();

    let offered = tokio::time::timeout(Duration::from_secs(2), node.bob_link.next_outgoing())
        .await
        .expect("resumed HTLC should reach bob")
        .unwrap();
    assert_eq!(offered.incoming, CircuitKey::new(ALICE, 0));
    assert_eq!(node.switch.circuit_count(), 1);

    assert!(node.switch.settle_circuit(offered.key, p).await.unwrap());
    assert_eq!(node.alice.settled_count(), 1);
}

#[tokio::test]
async fn test_interceptor_rejects() {
    let node = Node::start(SwitchConfig::default()).await;
    let mut hook = node.switch.register_interceptor().unwrap();

    node.switch
        .forward_htlc(forward_to(0, Preimage::random().hash(), BOB))
        .await
        .unwrap();
    let reason = FailureReason::with_message(FailureCode::InterceptorRejected, "policy");
    hook.next().await.unwrap().fail(reason.clone()).unwrap();

    assert!(eventually(|| node.alice.failed_count() == 1).await);
    assert_eq!(node.alice.resolution(0), Some(Resolution::Fail(reason)));
    assert_eq!(node.switch.circuit_count(), 0);
}

#[tokio::test]
async fn test_interceptor_wrong_preimage_hands_forward_back() {
    let node = Node::start(SwitchConfig::default()).await;
    let mut hook = node.switch.register_interceptor().unwrap();
    let p = Preimage::random();

    node.switch
        .forward_htlc(forward_to(0, p.hash(), BOB))
        .await
        .unwrap();
    let forward = hook.next().await.unwrap();
    let forward = match forward.settle(Preimage::random()) {
        Err(err @ InterceptError::PreimageMismatch(_)) => err.into_forward().unwrap(),
        other => panic!("unexpected result {other:?}"),
    };

    // Still held, nothing delivered upstream
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.switch.held_count(), 1);
    assert_eq!(node.alice.settled_count() + node.alice.failed_count(), 0);

    forward.settle(p).unwrap();
    assert!(eventually(|| node.alice.settled_count() == 1).await);
    assert_eq!(node.alice.resolution(0), Some(Resolution::Settle(p)));
}

#[tokio::test]
async fn test_held_htlc_is_not_forwarded_twice() {
    let node = Node::start(SwitchConfig::default()).await;
    let _hook = node.switch.register_interceptor().unwrap();
    let hash = Preimage::random().hash();

    node.switch.forward_htlc(forward_to(0, hash, BOB)).await.unwrap();
    let again = node.switch.forward_htlc(forward_to(0, hash, BOB)).await;
    assert!(matches!(again, Err(SwitchError::DuplicateHtlc(_))));
    assert_eq!(node.switch.held_count(), 1);
}

// =========================================================================
// Exit hop
// =========================================================================

#[tokio::test]
async fn test_exit_settle_releases_other_waiters() {
    let node = Node::start(SwitchConfig::default()).await;
    let p = Preimage::random();

    // Arrives before any hook is registered and waits on the beacon
    let first = node.switch.forward_htlc(exit_htlc(0, p.hash())).await.unwrap();
    assert_eq!(first, ForwardOutcome::AwaitingPreimage);

    let mut hook = node.switch.register_interceptor().unwrap();
    let second = node.switch.forward_htlc(exit_htlc(1, p.hash())).await.unwrap();
    assert_eq!(second, ForwardOutcome::AwaitingPreimage);
    assert_eq!(node.switch.held_count(), 0);

    // Only the subscription opened after registration is offered
    let forward = hook.next().await.unwrap();
    assert!(forward.is_witness());
    assert_eq!(forward.incoming_key(), CircuitKey::new(ALICE, 1));
    assert_eq!(forward.deadline(), None);
    assert!(hook.try_next().is_none());
    forward.settle(p).unwrap();

    assert!(eventually(|| node.alice.settled_count() == 2).await);
    assert_eq!(node.alice.resolution(0), Some(Resolution::Settle(p)));
    assert_eq!(node.alice.resolution(1), Some(Resolution::Settle(p)));
    assert_eq!(node.switch.beacon().subscriber_count(&p.hash()), 0);
    assert!(eventually(|| node.switch.circuit_count() == 0).await);
}

#[tokio::test]
async fn test_exit_forward_cannot_fail_or_resume() {
    let node = Node::start(SwitchConfig::default()).await;
    let mut hook = node.switch.register_interceptor().unwrap();
    let p = Preimage::random();

    node.switch.forward_htlc(exit_htlc(0, p.hash())).await.unwrap();
    let forward = hook.next().await.unwrap();
    let reason = FailureReason::new(FailureCode::InterceptorRejected);
    assert!(matches!(forward.fail(reason), Err(InterceptError::SettleOnly(_))));

    // The subscription keeps waiting for the invoice layer
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.alice.failed_count(), 0);
    assert_eq!(node.switch.beacon().subscriber_count(&p.hash()), 1);

    node.switch.add_preimages(&[p]).unwrap();
    assert!(eventually(|| node.alice.settled_count() == 1).await);
}
