//! Shared harness for the HopSwitch scenario tests.
//!
//! A [`Node`] is a switch over an in-memory store with two links attached:
//! Alice, where HTLCs arrive, and Bob, where they are forwarded to.

use bytes::Bytes;
use hopswitch::adapters::{ClearTextDecoder, MemoryChannel};
use hopswitch::{LinkHandle, Switch};
use hopswitch_core::{
    ChannelId, CircuitKey, ForwardingInstruction, IncomingHtlc, NextHop, PaymentHash, SwitchConfig,
};
use hopswitch_store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;

pub const ALICE: ChannelId = ChannelId(1);
pub const BOB: ChannelId = ChannelId(2);

/// Bandwidth of each harness channel.
pub const BANDWIDTH_MSAT: u64 = 1_000_000;
/// Amount every harness HTLC forwards.
pub const FORWARD_MSAT: u64 = 10_000;

pub struct Node {
    pub switch: Switch,
    pub store: Arc<MemoryStore>,
    pub alice: Arc<MemoryChannel>,
    pub bob: Arc<MemoryChannel>,
    pub alice_link: LinkHandle,
    pub bob_link: LinkHandle,
}

impl Node {
    /// A fresh node with empty storage.
    pub async fn start(config: SwitchConfig) -> Self {
        Self::restart(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryChannel::new(BANDWIDTH_MSAT)),
            Arc::new(MemoryChannel::new(BANDWIDTH_MSAT)),
        )
        .await
    }

    /// Open a switch over state left by a previous node.
    pub async fn restart(
        config: SwitchConfig,
        store: Arc<MemoryStore>,
        alice: Arc<MemoryChannel>,
        bob: Arc<MemoryChannel>,
    ) -> Self {
        let switch = Switch::open(config, store.clone(), Arc::new(ClearTextDecoder::new()))
            .await
            .expect("switch should open");
        let alice_link = switch
            .add_link(ALICE, alice.clone())
            .await
            .expect("alice link");
        let bob_link = switch.add_link(BOB, bob.clone()).await.expect("bob link");
        Self {
            switch,
            store,
            alice,
            bob,
            alice_link,
            bob_link,
        }
    }

    /// Simulate a process exit: close links and stop timers, keeping storage
    /// and channel state for [`Node::restart`].
    pub async fn stop(self) -> (Arc<MemoryStore>, Arc<MemoryChannel>, Arc<MemoryChannel>) {
        // Links must be closed before the handles drop, or the report pumps
        // would treat the drop as a disconnect.
        self.switch.shutdown().await;
        drop(self.alice_link);
        drop(self.bob_link);
        (self.store, self.alice, self.bob)
    }
}

/// Switch config with short timers for scenario tests.
pub fn fast_config() -> SwitchConfig {
    SwitchConfig {
        intercept_timeout: Duration::from_millis(100),
        ..SwitchConfig::default()
    }
}

/// An HTLC arriving from Alice at `index`, routed to `next`.
pub fn forward_to(index: u64, hash: PaymentHash, next: ChannelId) -> IncomingHtlc {
    htlc(index, hash, NextHop::Channel(next))
}

/// An HTLC arriving from Alice at `index` that terminates here.
pub fn exit_htlc(index: u64, hash: PaymentHash) -> IncomingHtlc {
    htlc(index, hash, NextHop::Exit)
}

fn htlc(index: u64, hash: PaymentHash, next_hop: NextHop) -> IncomingHtlc {
    let onion = ClearTextDecoder::encode(&ForwardingInstruction {
        next_hop,
        amount_to_forward_msat: FORWARD_MSAT,
        outgoing_cltv: 500,
        payload: Bytes::from_static(b"next-hop"),
    });
    IncomingHtlc {
        key: CircuitKey::new(ALICE, index),
        payment_hash: hash,
        amount_msat: FORWARD_MSAT + 100,
        cltv_expiry: 540,
        onion,
    }
}

/// Poll `condition` until it holds, giving up after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
