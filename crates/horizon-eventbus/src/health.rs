//! Health check types.

use serde::{Deserialize, Serialize};

/// Health of the broker connection as seen from one bus topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Whether the broker answered.
    pub connected: bool,
    /// Number of brokers discovered.
    pub brokers: usize,
    /// Partitions of the bus topic that have a leader.
    pub partitions: usize,
}

impl HealthStatus {
    /// Check if the connection is healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.connected && self.brokers > 0
    }

    /// Check if the topic exists and can take traffic.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.is_healthy() && self.partitions > 0
    }
}
