use metrics::counter;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use sava_core::message::Message;

use crate::broker_metrics::{CONSUMER_BYTES_OUT_TOTAL, CONSUMER_MESSAGES_OUT_TOTAL};
use crate::utils::next_id;

/// How a consumer wants deliveries scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Round-robin with the queue's other consumers.
    Shared,
    /// Sole consumer of the queue while subscribed.
    Exclusive,
}

/// Options for attaching a consumer to a queue.
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub consumer_name: String,
    pub kind: SubscriptionKind,
    /// Credit window; `None` takes the queue's default. Zero means credit
    /// arrives only through explicit grants.
    pub prefetch: Option<u32>,
    /// >1 lets the engine group eligible messages into one delivery
    pub batch_capacity: u32,
    /// On disconnect, requeue outstanding deliveries (otherwise dead-letter)
    pub requeue_on_disconnect: bool,
}

impl ConsumeOptions {
    pub fn shared(consumer_name: &str) -> Self {
        Self {
            consumer_name: consumer_name.into(),
            kind: SubscriptionKind::Shared,
            prefetch: None,
            batch_capacity: 1,
            requeue_on_disconnect: true,
        }
    }

    pub fn exclusive(consumer_name: &str) -> Self {
        Self {
            kind: SubscriptionKind::Exclusive,
            ..Self::shared(consumer_name)
        }
    }
}

/// One message as handed to the consumer transport.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub message: Arc<Message>,
    /// Attempt number, this delivery included.
    pub delivery_count: u32,
    pub redelivered: bool,
}

/// What the protocol layer receives for one delivery attempt. Settled as a
/// unit by resolving the delivery tag: a batch is acknowledged or rejected
/// together, never in part.
#[derive(Debug, Clone)]
pub struct QueueDelivery {
    pub delivery_tag: u64,
    pub queue_name: String,
    pub batch: bool,
    pub messages: Vec<DeliveredMessage>,
}

/// Outcome of offering a delivery to a consumer's transport channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Offer {
    Accepted,
    /// Transient backpressure; the engine backs the delivery out and retries
    /// elsewhere.
    Deferred,
    /// The transport is gone; triggers the disconnect path.
    Gone,
}

/// Represents the session state for a consumer connection.
#[derive(Debug)]
pub(crate) struct ConsumerSession {
    /// Unique ID for this session
    pub(crate) session_id: u64,
    /// Whether this consumer is currently active
    pub(crate) active: bool,
    /// Cancellation token for the transport streaming task
    pub(crate) cancellation: CancellationToken,
}

impl ConsumerSession {
    pub(crate) fn new() -> Self {
        Self {
            session_id: next_id(),
            active: true,
            cancellation: CancellationToken::new(),
        }
    }
}

/// Represents a consumer connected and associated with a queue.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub(crate) struct Consumer {
    pub(crate) consumer_id: u64,
    pub(crate) consumer_name: String,
    pub(crate) queue_name: String,
    pub(crate) kind: SubscriptionKind,
    pub(crate) prefetch: u32,
    pub(crate) batch_capacity: u32,
    pub(crate) requeue_on_disconnect: bool,
    pub(crate) tx_cons: mpsc::Sender<QueueDelivery>,
    pub(crate) session: Arc<Mutex<ConsumerSession>>,
}

impl Consumer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        consumer_id: u64,
        consumer_name: &str,
        queue_name: &str,
        kind: SubscriptionKind,
        prefetch: u32,
        batch_capacity: u32,
        requeue_on_disconnect: bool,
        tx_cons: mpsc::Sender<QueueDelivery>,
        session: Arc<Mutex<ConsumerSession>>,
    ) -> Self {
        Consumer {
            consumer_id,
            consumer_name: consumer_name.into(),
            queue_name: queue_name.into(),
            kind,
            prefetch,
            batch_capacity,
            requeue_on_disconnect,
            tx_cons,
            session,
        }
    }

    /// Non-blocking hand-off to the consumer transport. A full channel is
    /// transient backpressure (`Deferred`); a closed one means the consumer
    /// is gone. The engine must never block here while it owns the queue's
    /// dispatch state.
    pub(crate) fn offer(&self, delivery: QueueDelivery) -> Offer {
        let message_count = delivery.messages.len() as u64;
        let byte_count: u64 = delivery
            .messages
            .iter()
            .map(|delivered| delivered.message.size() as u64)
            .sum();
        match self.tx_cons.try_send(delivery) {
            Ok(()) => {
                trace!(
                    "delivery handed over channel to consumer {}",
                    self.consumer_id
                );
                counter!(CONSUMER_MESSAGES_OUT_TOTAL.name, "queue" => self.queue_name.clone())
                    .increment(message_count);
                counter!(CONSUMER_BYTES_OUT_TOTAL.name, "queue" => self.queue_name.clone())
                    .increment(byte_count);
                Offer::Accepted
            }
            Err(mpsc::error::TrySendError::Full(_)) => Offer::Deferred,
            Err(mpsc::error::TrySendError::Closed(_)) => Offer::Gone,
        }
    }

    /// Get the current active status of this consumer
    pub(crate) async fn get_status(&self) -> bool {
        self.session.lock().await.active
    }

    /// Set the consumer status to inactive and cancel its transport task
    pub(crate) async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        session.active = false;
        session.cancellation.cancel();
        trace!("consumer session disconnected: session_id={}", session.session_id);
    }
}
