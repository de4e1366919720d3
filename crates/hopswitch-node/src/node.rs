//! The HopSwitch node orchestrator.
//!
//! Composition root: picks the storage backend, opens the switch, attaches
//! the configured links and runs the HTTP API server.

use anyhow::Result;
use hopswitch::adapters::{ClearTextDecoder, MemoryChannel};
use hopswitch::{LinkHandle, Switch};
use hopswitch_core::ChannelId;
use hopswitch_store::{KvStore, MemoryStore, RocksStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{NodeConfig, StorageBackend, StorageConfig};
use crate::state::NodeState;

/// The HopSwitch node.
pub struct HopSwitchNode {
    /// Node configuration.
    config: NodeConfig,
    /// The switch (None until started).
    switch: Option<Switch>,
    /// Shared state accessible from HTTP handlers.
    node_state: Option<Arc<NodeState>>,
}

impl HopSwitchNode {
    /// Create a new node with the given config.
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.switch.validate()?;
        tracing::info!(backend = ?config.storage.backend, "HopSwitch node created");
        Ok(Self {
            config,
            switch: None,
            node_state: None,
        })
    }

    /// Initialize and start the node: storage, switch, links, HTTP API.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("starting HopSwitch node");

        let store = open_store(&self.config.storage)?;
        let backend = store.backend();
        let switch = Switch::open(
            self.config.switch.clone(),
            store,
            Arc::new(ClearTextDecoder::new()),
        )
        .await?;

        for link in &self.config.links {
            let channel = Arc::new(MemoryChannel::new(link.bandwidth_msat));
            let handle = switch.add_link(ChannelId(link.chan_id), channel).await?;
            tokio::spawn(log_outgoing(handle));
        }

        let node_state = Arc::new(NodeState::new(switch.clone(), backend));
        if self.config.api.enabled {
            let api_addr: SocketAddr = self.config.api_addr().parse()?;
            let api_state = node_state.clone();
            tokio::spawn(async move {
                if let Err(e) = crate::api::start_api_server(api_addr, api_state).await {
                    tracing::error!(error = %e, "HTTP API server error");
                }
            });
        }

        self.switch = Some(switch);
        self.node_state = Some(node_state);
        tracing::info!(links = self.config.links.len(), "HopSwitch node started");
        Ok(())
    }

    /// Run until the switch halts on a storage failure.
    pub async fn run(&self) -> Result<()> {
        let switch = self
            .switch
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("node not started"))?;

        tracing::info!("entering main loop");
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            if switch.is_halted() {
                anyhow::bail!("switch halted after a storage failure");
            }
        }
    }

    /// Shut down the node gracefully. Circuits stay on disk.
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("shutting down HopSwitch node");
        if let Some(switch) = self.switch.take() {
            switch.shutdown().await;
        }
        self.node_state = None;
        tracing::info!("HopSwitch node shut down");
        Ok(())
    }

    pub fn switch(&self) -> Option<&Switch> {
        self.switch.as_ref()
    }
}

/// Build the key-value store selected by configuration.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn KvStore>> {
    let store: Arc<dyn KvStore> = match config.backend {
        StorageBackend::Rocksdb => {
            let store = RocksStore::open(&config.data_dir, config.sync_writes)?;
            tracing::info!(path = %config.data_dir.display(), "storage initialized");
            Arc::new(store)
        }
        StorageBackend::Memory => {
            tracing::warn!("using in-memory storage, circuits will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(store)
}

/// Configured links have no peer transport attached; offered HTLCs are
/// only logged.
async fn log_outgoing(mut handle: LinkHandle) {
    let chan_id = handle.channel_id();
    while let Some(htlc) = handle.next_outgoing().await {
        tracing::info!(
            %chan_id,
            outgoing = %htlc.key,
            payment_hash = %htlc.payment_hash,
            amount_msat = htlc.amount_msat,
            "HTLC offered"
        );
    }
    tracing::debug!(%chan_id, "link mailbox closed");
}
