use dashmap::DashMap;
use sava_core::message::MessageHandle;
use tracing::{error, warn};

use crate::errors::{DispatchError, Result};

/// A counted reference to a stored message.
///
/// Move-only: `MessageRegistry::release` consumes the value, so a reference
/// cannot be released twice. Dropping one without releasing it is a lifetime
/// bug; the `Drop` impl logs it so leaks show up in operation.
#[derive(Debug)]
pub struct MessageRef {
    handle: MessageHandle,
    released: bool,
}

impl MessageRef {
    pub fn handle(&self) -> MessageHandle {
        self.handle
    }
}

impl Drop for MessageRef {
    fn drop(&mut self) {
        if !self.released {
            warn!("message reference to {} dropped without release", self.handle);
        }
    }
}

/// Result of releasing a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other references remain live.
    Retained,
    /// The last reference was released; the store may reclaim the message.
    Reclaimable(MessageHandle),
}

/// Broker-global live-reference counts, one entry per stored message.
///
/// The store may reclaim a message only once its entry here has dropped to
/// zero. Counts are mutated exclusively through `register`/`acquire`/`release`,
/// which is what lets instances on distinct queues share one message without
/// a lock on the message itself.
#[derive(Debug, Default)]
pub struct MessageRegistry {
    counts: DashMap<MessageHandle, u64>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// First reference to a newly stored message, created when routing
    /// places the message on a queue.
    pub fn register(&self, handle: MessageHandle) -> MessageRef {
        *self.counts.entry(handle).or_insert(0) += 1;
        MessageRef {
            handle,
            released: false,
        }
    }

    /// Additional reference to a message that must still be live. Fails with
    /// `StaleMessage` if every prior holder already released, which under
    /// correct usage cannot happen: callers acquire while holding another
    /// live reference.
    pub fn acquire(&self, handle: MessageHandle) -> Result<MessageRef> {
        match self.counts.get_mut(&handle) {
            Some(mut count) => {
                *count += 1;
                Ok(MessageRef {
                    handle,
                    released: false,
                })
            }
            None => Err(DispatchError::StaleMessage(handle)),
        }
    }

    /// Releases exactly one reference, consuming it. Returns `Reclaimable`
    /// when the count reaches zero so the caller can notify the store.
    pub fn release(&self, mut reference: MessageRef) -> ReleaseOutcome {
        reference.released = true;
        let handle = reference.handle;

        let remaining = match self.counts.get_mut(&handle) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => {
                error!("released a reference to {} with no registry entry", handle);
                return ReleaseOutcome::Retained;
            }
        };

        if remaining == 0 {
            // remove_if re-checks under the shard lock; a concurrent acquire
            // between the decrement and here keeps the entry alive
            self.counts.remove_if(&handle, |_, count| *count == 0);
            ReleaseOutcome::Reclaimable(handle)
        } else {
            ReleaseOutcome::Retained
        }
    }

    /// Live references to one message; zero once reclaimed or never stored.
    pub fn live_count(&self, handle: MessageHandle) -> u64 {
        self.counts.get(&handle).map(|count| *count).unwrap_or(0)
    }

    /// Total live references across all messages, the leak-detection gauge.
    pub fn total_live(&self) -> u64 {
        self.counts.iter().map(|entry| *entry.value()).sum()
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod registry_test;
