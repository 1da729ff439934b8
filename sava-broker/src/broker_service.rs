use anyhow::{anyhow, Result};
use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use sava_core::message::Message;
use sava_core::ordering::QueueOrdering;
use sava_core::storage::MessageStore;
use sava_dispatch::{MessageRegistry, ReleaseOutcome, Resolution};

use crate::broker_metrics::{
    BROKER_LIVE_REFERENCES, QUEUE_MESSAGES_UNROUTABLE_TOTAL, QUEUE_MESSAGE_SIZE_BYTES,
};
use crate::consumer::{ConsumeOptions, QueueDelivery};
use crate::policies::Policies;
use crate::queue::Queue;
use crate::routing::ExchangeRouter;

/// Result of a publish: how many queues the message was placed on. A message
/// matching no binding is dropped, not an error.
#[derive(Debug, Clone, Copy)]
pub struct PublishOutcome {
    pub routed_to: usize,
}

// BrokerService
//
// Owns the store collaborator, the broker-global reference registry, the
// exchange binding table, and the queues. The wire protocol attaches through
// this API: publish on behalf of producers, subscribe/resolve/grant on
// behalf of consumers.
#[derive(Debug)]
pub struct BrokerService {
    store: Arc<dyn MessageStore>,
    registry: Arc<MessageRegistry>,
    router: ExchangeRouter,
    queues: DashMap<String, Arc<Queue>>,
    policies: Policies,
}

impl BrokerService {
    pub fn new(store: Arc<dyn MessageStore>, policies: Policies) -> Self {
        BrokerService {
            store,
            registry: Arc::new(MessageRegistry::new()),
            router: ExchangeRouter::new(),
            queues: DashMap::new(),
            policies,
        }
    }

    /// Declares a queue with broker-default policies. Idempotent.
    pub fn declare_queue(&self, queue_name: &str) -> Result<()> {
        self.declare_queue_with(queue_name, None, None)
    }

    /// Declares a queue, optionally overriding ordering and the redelivery
    /// threshold. Redeclaration of an existing queue is a no-op.
    pub fn declare_queue_with(
        &self,
        queue_name: &str,
        ordering: Option<QueueOrdering>,
        max_deliveries: Option<u32>,
    ) -> Result<()> {
        if queue_name.is_empty() {
            return Err(anyhow!("queue name must not be empty"));
        }
        if self.queues.contains_key(queue_name) {
            return Ok(());
        }
        let queue = Queue::new(
            queue_name,
            self.policies.queue_policies(ordering, max_deliveries),
            self.registry.clone(),
            self.store.clone(),
        );
        self.queues.insert(queue_name.to_string(), Arc::new(queue));
        info!("queue {} declared", queue_name);
        Ok(())
    }

    /// Deletes a queue: drops its bindings, force-resolves everything it
    /// still holds, and releases its references.
    pub async fn delete_queue(&self, queue_name: &str) -> Result<()> {
        let (_, queue) = self
            .queues
            .remove(queue_name)
            .ok_or_else(|| anyhow!("queue {} does not exist", queue_name))?;
        self.router.drop_queue(queue_name);
        queue.delete().await?;
        gauge!(BROKER_LIVE_REFERENCES.name).set(self.registry.total_live() as f64);
        Ok(())
    }

    /// Binds a queue to an exchange. A `None` routing key makes the binding
    /// match every key (fanout).
    pub fn bind_queue(
        &self,
        exchange: &str,
        routing_key: Option<&str>,
        queue_name: &str,
    ) -> Result<()> {
        if !self.queues.contains_key(queue_name) {
            return Err(anyhow!("queue {} does not exist", queue_name));
        }
        self.router.bind(exchange, routing_key, queue_name);
        Ok(())
    }

    pub fn unbind_queue(
        &self,
        exchange: &str,
        routing_key: Option<&str>,
        queue_name: &str,
    ) -> bool {
        self.router.unbind(exchange, routing_key, queue_name)
    }

    /// Publishes a message: resolves target queues through the binding
    /// table, stores the message once, then places one instance per queue,
    /// each holding its own reference. The empty exchange routes the key as
    /// a queue name.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<PublishOutcome> {
        histogram!(QUEUE_MESSAGE_SIZE_BYTES.name).record(message.size() as f64);
        if message.size() > self.policies.max_message_size {
            return Err(anyhow!(
                "message of {} bytes exceeds the {} byte limit",
                message.size(),
                self.policies.max_message_size
            ));
        }

        let targets: Vec<Arc<Queue>> = self
            .router
            .route(exchange, routing_key)
            .into_iter()
            .filter_map(|queue_name| self.queues.get(&queue_name).map(|queue| queue.clone()))
            .collect();
        if targets.is_empty() {
            counter!(QUEUE_MESSAGES_UNROUTABLE_TOTAL.name).increment(1);
            return Ok(PublishOutcome { routed_to: 0 });
        }

        let (handle, shared) = self
            .store
            .store_message(message)
            .await
            .map_err(|e| anyhow!("store failed to accept the message: {}", e))?;

        // one reference per target, taken before any hand-off so the count
        // cannot touch zero while enqueue commands are in flight
        let references: Vec<_> = targets
            .iter()
            .map(|_| self.registry.register(handle))
            .collect();

        let mut routed = 0;
        for (queue, reference) in targets.iter().zip(references) {
            match queue.enqueue(handle, shared.clone(), reference).await {
                Ok(()) => routed += 1,
                Err(reference) => {
                    warn!(
                        "queue {} refused the publish, releasing its reference",
                        queue.queue_name
                    );
                    if let ReleaseOutcome::Reclaimable(handle) = self.registry.release(reference) {
                        if let Err(e) = self.store.reclaim(handle).await {
                            warn!("store failed to reclaim {}: {}", handle, e);
                        }
                    }
                }
            }
        }
        gauge!(BROKER_LIVE_REFERENCES.name).set(self.registry.total_live() as f64);
        Ok(PublishOutcome { routed_to: routed })
    }

    /// Attaches a consumer to a queue; returns the consumer id and the
    /// delivery stream its transport reads from.
    pub async fn subscribe(
        &self,
        queue_name: &str,
        options: ConsumeOptions,
    ) -> Result<(u64, mpsc::Receiver<QueueDelivery>)> {
        self.queue(queue_name)?.subscribe(options).await
    }

    pub async fn unsubscribe(&self, queue_name: &str, consumer_id: u64) -> Result<()> {
        self.queue(queue_name)?.unsubscribe(consumer_id).await
    }

    /// Settles a delivery on behalf of the consumer transport:
    /// acknowledgment, or rejection with or without requeue.
    pub async fn resolve(
        &self,
        queue_name: &str,
        delivery_tag: u64,
        resolution: Resolution,
    ) -> Result<()> {
        let result = self.queue(queue_name)?.resolve(delivery_tag, resolution).await;
        gauge!(BROKER_LIVE_REFERENCES.name).set(self.registry.total_live() as f64);
        result
    }

    /// Explicit credit grant on top of the consumer's prefetch window.
    pub async fn grant_credit(
        &self,
        queue_name: &str,
        consumer_id: u64,
        credits: u32,
    ) -> Result<()> {
        self.queue(queue_name)?.grant_credit(consumer_id, credits).await
    }

    /// Live message references across all queues; zero at idle. The leak
    /// detection feed for operators.
    pub fn live_references(&self) -> u64 {
        self.registry.total_live()
    }

    pub fn queue_exists(&self, queue_name: &str) -> bool {
        self.queues.contains_key(queue_name)
    }

    fn queue(&self, queue_name: &str) -> Result<Arc<Queue>> {
        self.queues
            .get(queue_name)
            .map(|queue| queue.clone())
            .ok_or_else(|| anyhow!("queue {} does not exist", queue_name))
    }
}
