use sava_core::ordering::QueueOrdering;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker-wide policy defaults. Individual queues may override ordering and
/// the redelivery threshold at declaration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policies {
    /// Delivery attempts before a reject-with-requeue is dead-lettered
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
    /// Credit window for consumers that do not ask for one
    #[serde(default = "default_prefetch")]
    pub default_prefetch: u32,
    /// Maximum accepted message payload size (bytes)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default)]
    pub queue_ordering: QueueOrdering,
    /// Expiry sweep cadence (ms)
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_max_deliveries() -> u32 {
    6
}

fn default_prefetch() -> u32 {
    32
}

fn default_max_message_size() -> usize {
    10 * 1024 * 1024
}

fn default_sweep_interval_ms() -> u64 {
    500
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            max_deliveries: default_max_deliveries(),
            default_prefetch: default_prefetch(),
            max_message_size: default_max_message_size(),
            queue_ordering: QueueOrdering::default(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl Policies {
    /// Effective per-queue policy set, with optional declaration overrides.
    pub(crate) fn queue_policies(
        &self,
        ordering: Option<QueueOrdering>,
        max_deliveries: Option<u32>,
    ) -> QueuePolicies {
        QueuePolicies {
            ordering: ordering.unwrap_or(self.queue_ordering),
            max_deliveries: max_deliveries.unwrap_or(self.max_deliveries),
            default_prefetch: self.default_prefetch,
            sweep_interval: Duration::from_millis(self.sweep_interval_ms.max(1)),
        }
    }
}

/// Policies as applied to one queue.
#[derive(Debug, Clone)]
pub struct QueuePolicies {
    pub ordering: QueueOrdering,
    pub max_deliveries: u32,
    pub default_prefetch: u32,
    pub sweep_interval: Duration,
}
