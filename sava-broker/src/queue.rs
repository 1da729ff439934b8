use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use sava_core::message::{Message, MessageHandle};
use sava_core::storage::MessageStore;
use sava_dispatch::{MessageRef, MessageRegistry, Resolution};

use crate::consumer::{ConsumeOptions, Consumer, ConsumerSession, QueueDelivery};
use crate::dispatcher::QueueDispatcher;
use crate::policies::QueuePolicies;
use crate::utils::next_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueState {
    Active,
    Deleting,
}

// Queue
//
// Owns one dispatch engine and the policies it runs under. Routing places
// message instances here; consumers attach directly to the queue and settle
// deliveries through it.
#[derive(Debug)]
pub(crate) struct Queue {
    pub(crate) queue_name: String,
    pub(crate) policies: QueuePolicies,
    dispatcher: QueueDispatcher,
    state: Mutex<QueueState>,
}

impl Queue {
    pub(crate) fn new(
        queue_name: &str,
        policies: QueuePolicies,
        registry: Arc<MessageRegistry>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        let dispatcher = QueueDispatcher::new(
            queue_name,
            policies.ordering,
            policies.max_deliveries,
            policies.sweep_interval,
            registry,
            store,
        );
        Queue {
            queue_name: queue_name.into(),
            policies,
            dispatcher,
            state: Mutex::new(QueueState::Active),
        }
    }

    /// Places a routed message on this queue. The reference comes back on
    /// failure so the caller can release it.
    pub(crate) async fn enqueue(
        &self,
        handle: MessageHandle,
        message: Arc<Message>,
        reference: MessageRef,
    ) -> std::result::Result<(), MessageRef> {
        {
            let state = self.state.lock().await;
            if *state == QueueState::Deleting {
                return Err(reference);
            }
        }
        self.dispatcher.enqueue(handle, message, reference).await
    }

    /// Attaches a consumer and returns its id plus the delivery stream the
    /// transport reads from.
    pub(crate) async fn subscribe(
        &self,
        options: ConsumeOptions,
    ) -> Result<(u64, mpsc::Receiver<QueueDelivery>)> {
        {
            let state = self.state.lock().await;
            if *state == QueueState::Deleting {
                return Err(anyhow!("queue {} is being deleted", self.queue_name));
            }
        }

        let prefetch = options.prefetch.unwrap_or(self.policies.default_prefetch);
        // channel sized to the credit window so a full channel means real
        // transport backpressure, not an under-sized buffer
        let (tx_cons, rx_cons) = mpsc::channel(prefetch.max(1) as usize);

        let consumer_id = next_id();
        let session = Arc::new(Mutex::new(ConsumerSession::new()));
        let consumer = Consumer::new(
            consumer_id,
            &options.consumer_name,
            &self.queue_name,
            options.kind,
            prefetch,
            options.batch_capacity.max(1),
            options.requeue_on_disconnect,
            tx_cons,
            session,
        );

        self.dispatcher.subscribe(consumer).await?;
        info!(
            "consumer {} ({}) subscribed to queue {}",
            consumer_id, options.consumer_name, self.queue_name
        );
        Ok((consumer_id, rx_cons))
    }

    pub(crate) async fn unsubscribe(&self, consumer_id: u64) -> Result<()> {
        self.dispatcher.unsubscribe(consumer_id).await
    }

    pub(crate) async fn resolve(&self, delivery_tag: u64, resolution: Resolution) -> Result<()> {
        self.dispatcher.resolve(delivery_tag, resolution).await
    }

    pub(crate) async fn grant_credit(&self, consumer_id: u64, credits: u32) -> Result<()> {
        self.dispatcher.grant_credit(consumer_id, credits).await
    }

    /// Deletes the queue: refuses further publishes, force-resolves every
    /// outstanding delivery, and releases every reference the queue holds.
    pub(crate) async fn delete(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state == QueueState::Deleting {
                return Ok(());
            }
            *state = QueueState::Deleting;
        }
        self.dispatcher.disconnect_all().await?;
        info!("queue {} deleted", self.queue_name);
        Ok(())
    }
}
