//! Interface configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing and sizing of one CAN interface.
///
/// All durations are milliseconds of executor time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IfConfig {
    /// How long a candidate alias must go unchallenged after its Check-ID frames.
    pub contention_window_ms: u64,
    /// Wait for an AMD answering an alias map enquiry.
    pub alias_lookup_timeout_ms: u64,
    /// Wait for a Verified Node ID after the global verify broadcast.
    pub verify_timeout_ms: u64,
    /// Message slots per queue (receive, writes).
    pub queue_depth: usize,
    /// Priority levels of the executor and its queues.
    pub priority_levels: usize,
    /// Write flows serving addressed messages in parallel.
    pub addressed_write_flows: usize,
    /// Aliases to keep reserved ahead of demand once allocation has started.
    pub reserved_alias_target: usize,
    pub local_alias_capacity: usize,
    pub remote_alias_capacity: usize,
    /// Multi-frame addressed messages assembled at once.
    pub reassembly_slots: usize,
    /// Longest addressed payload accepted from the bus, in bytes.
    pub max_message_len: usize,
}

impl Default for IfConfig {
    fn default() -> Self {
        Self {
            contention_window_ms: 200,
            alias_lookup_timeout_ms: 1000,
            verify_timeout_ms: 3000,
            queue_depth: 32,
            priority_levels: 4,
            addressed_write_flows: 2,
            reserved_alias_target: 1,
            local_alias_capacity: 16,
            remote_alias_capacity: 64,
            reassembly_slots: 8,
            max_message_len: 256,
        }
    }
}

impl IfConfig {
    pub fn contention_window(&self) -> Duration {
        Duration::from_millis(self.contention_window_ms)
    }

    pub fn alias_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.alias_lookup_timeout_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    pub fn with_contention_window_ms(mut self, ms: u64) -> Self {
        self.contention_window_ms = ms;
        self
    }

    pub fn with_alias_lookup_timeout_ms(mut self, ms: u64) -> Self {
        self.alias_lookup_timeout_ms = ms;
        self
    }

    pub fn with_verify_timeout_ms(mut self, ms: u64) -> Self {
        self.verify_timeout_ms = ms;
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn with_priority_levels(mut self, levels: usize) -> Self {
        self.priority_levels = levels;
        self
    }

    pub fn with_addressed_write_flows(mut self, flows: usize) -> Self {
        self.addressed_write_flows = flows;
        self
    }

    pub fn with_reserved_alias_target(mut self, target: usize) -> Self {
        self.reserved_alias_target = target;
        self
    }

    pub fn with_alias_capacity(mut self, local: usize, remote: usize) -> Self {
        self.local_alias_capacity = local;
        self.remote_alias_capacity = remote;
        self
    }

    pub fn with_reassembly_limits(mut self, slots: usize, max_message_len: usize) -> Self {
        self.reassembly_slots = slots;
        self.max_message_len = max_message_len;
        self
    }
}
