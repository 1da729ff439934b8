use std::sync::Arc;
use std::time::Instant;

use sava_core::message::{Message, MessageHandle};

use crate::errors::{DispatchError, Result};
use crate::registry::MessageRef;

/// Where a message instance sits in its delivery lifecycle on one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Visible to the dispatch engine.
    Available,
    /// Claimed for an in-progress delivery attempt, not yet handed off.
    Acquired { consumer_id: u64 },
    /// Handed to the consumer, awaiting acknowledgment.
    PendingAck { consumer_id: u64 },
    /// Terminal: acknowledged.
    Accepted,
    /// Terminal: expired past its deadline.
    Expired,
    /// Terminal: rejected without requeue or past the redelivery threshold.
    DeadLettered,
}

/// Where a requeued instance ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequeueDisposition {
    /// Back on the queue, visible to the engine again.
    Available,
    /// The deadline passed while the delivery was in flight; the instance
    /// goes terminal instead of back on the queue.
    Expired,
}

/// One message's presence on one queue: the shared immutable content plus
/// per-queue delivery state. Holds the queue's own reference to the message
/// for as long as the instance is live; terminal transitions surrender it.
#[derive(Debug)]
pub struct MessageInstance {
    instance_id: u64,
    handle: MessageHandle,
    message: Arc<Message>,
    queue_ref: Option<MessageRef>,
    state: InstanceState,
    delivery_count: u32,
    expires_at: Option<Instant>,
    expired_in_flight: bool,
}

impl MessageInstance {
    pub(crate) fn new(
        instance_id: u64,
        handle: MessageHandle,
        message: Arc<Message>,
        queue_ref: MessageRef,
        expires_at: Option<Instant>,
    ) -> Self {
        Self {
            instance_id,
            handle,
            message,
            queue_ref: Some(queue_ref),
            state: InstanceState::Available,
            delivery_count: 0,
            expires_at,
            expired_in_flight: false,
        }
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn handle(&self) -> MessageHandle {
        self.handle
    }

    pub fn message(&self) -> Arc<Message> {
        self.message.clone()
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn priority(&self) -> u8 {
        self.message.priority
    }

    pub fn is_available(&self) -> bool {
        self.state == InstanceState::Available
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            InstanceState::Accepted | InstanceState::Expired | InstanceState::DeadLettered
        )
    }

    pub fn has_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |deadline| deadline <= now)
    }

    /// Claims the instance for one delivery attempt. Single-consumer
    /// ownership: only an `Available` instance can be acquired.
    pub(crate) fn acquire(&mut self, consumer_id: u64) -> Result<()> {
        match self.state {
            InstanceState::Available => {
                self.state = InstanceState::Acquired { consumer_id };
                Ok(())
            }
            _ => Err(DispatchError::AlreadyAcquired(self.instance_id)),
        }
    }

    /// The consumer took the delivery; the instance now awaits its ack.
    /// Counts the delivery attempt.
    pub(crate) fn mark_delivered(&mut self) -> Result<()> {
        match self.state {
            InstanceState::Acquired { consumer_id } => {
                self.state = InstanceState::PendingAck { consumer_id };
                self.delivery_count += 1;
                Ok(())
            }
            other => Err(DispatchError::InvalidState(format!(
                "mark_delivered on instance {} in {:?}",
                self.instance_id, other
            ))),
        }
    }

    /// Acknowledged; terminal.
    pub(crate) fn accept(&mut self) -> Result<()> {
        match self.state {
            InstanceState::PendingAck { .. } => {
                self.state = InstanceState::Accepted;
                Ok(())
            }
            other => Err(DispatchError::InvalidState(format!(
                "accept on instance {} in {:?}",
                self.instance_id, other
            ))),
        }
    }

    /// Returns the instance to the queue after a rejected, deferred, or
    /// abandoned delivery. Delivery count is preserved for redelivery
    /// policies. An instance that expired while in flight goes terminal
    /// instead of back on the queue.
    pub(crate) fn requeue(&mut self) -> Result<RequeueDisposition> {
        match self.state {
            InstanceState::Acquired { .. } | InstanceState::PendingAck { .. } => {
                if self.expired_in_flight {
                    self.state = InstanceState::Expired;
                    Ok(RequeueDisposition::Expired)
                } else {
                    self.state = InstanceState::Available;
                    Ok(RequeueDisposition::Available)
                }
            }
            other => Err(DispatchError::InvalidState(format!(
                "requeue on instance {} in {:?}",
                self.instance_id, other
            ))),
        }
    }

    /// Expires an available instance past its deadline; terminal.
    pub(crate) fn expire(&mut self) -> Result<()> {
        match self.state {
            InstanceState::Available => {
                self.state = InstanceState::Expired;
                Ok(())
            }
            other => Err(DispatchError::InvalidState(format!(
                "expire on instance {} in {:?}",
                self.instance_id, other
            ))),
        }
    }

    /// Notes that the deadline passed while a delivery is outstanding. The
    /// in-flight delivery resolves normally; a reject then lands on
    /// `Expired` instead of `Available`.
    pub(crate) fn mark_expired_in_flight(&mut self) {
        self.expired_in_flight = true;
    }

    /// Terminal disposition for an instance that cannot be delivered.
    pub(crate) fn dead_letter(&mut self) -> Result<()> {
        match self.state {
            InstanceState::Acquired { .. } | InstanceState::PendingAck { .. } => {
                self.state = InstanceState::DeadLettered;
                Ok(())
            }
            other => Err(DispatchError::InvalidState(format!(
                "dead_letter on instance {} in {:?}",
                self.instance_id, other
            ))),
        }
    }

    /// Surrenders the queue-held reference on removal from the live set.
    pub(crate) fn take_queue_ref(&mut self) -> Option<MessageRef> {
        self.queue_ref.take()
    }
}

#[cfg(test)]
#[path = "instance_test.rs"]
mod instance_test;
