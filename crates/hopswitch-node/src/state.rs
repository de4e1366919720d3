//! Shared node state for the HTTP handlers.

use hopswitch::Switch;
use std::time::Instant;

/// Shared state for the running node, accessible from HTTP handlers.
pub struct NodeState {
    pub switch: Switch,
    /// When the node started.
    pub start_time: Instant,
    /// Name of the storage backend in use.
    pub backend: &'static str,
}

impl NodeState {
    pub fn new(switch: Switch, backend: &'static str) -> Self {
        Self {
            switch,
            start_time: Instant::now(),
            backend,
        }
    }
}
