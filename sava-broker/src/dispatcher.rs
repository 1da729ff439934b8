use anyhow::{anyhow, Result};
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{trace, warn};

use sava_core::message::{Message, MessageHandle};
use sava_core::ordering::QueueOrdering;
use sava_core::storage::MessageStore;
use sava_dispatch::{
    ConsumerSlot, MessageRef, MessageRegistry, QueueScheduler, Resolution, ResolutionEffects,
};

use crate::broker_metrics::{
    QUEUE_ACTIVE_CONSUMERS, QUEUE_AVAILABLE_MESSAGES, QUEUE_MESSAGES_ACKED_TOTAL,
    QUEUE_MESSAGES_DEAD_LETTERED_TOTAL, QUEUE_MESSAGES_DELIVERED_TOTAL,
    QUEUE_MESSAGES_EXPIRED_TOTAL, QUEUE_MESSAGES_IN_TOTAL, QUEUE_MESSAGES_REQUEUED_TOTAL,
    QUEUE_OUTSTANDING_DELIVERIES,
};
use crate::consumer::{Consumer, DeliveredMessage, Offer, QueueDelivery, SubscriptionKind};

/// Per-queue dispatch engine handle. The engine itself is a spawned task
/// owning the queue's `QueueScheduler`; ownership is the mutual-exclusion
/// boundary, so publishers, consumers, and settlements all serialize through
/// the command channel while consumer hand-off stays non-blocking.
#[derive(Debug)]
pub(crate) struct QueueDispatcher {
    control_tx: mpsc::Sender<DispatcherCommand>,
}

#[derive(Debug)]
enum DispatcherCommand {
    Enqueue {
        handle: MessageHandle,
        message: Arc<Message>,
        reference: MessageRef,
    },
    Subscribe {
        consumer: Consumer,
        response: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        consumer_id: u64,
        response: oneshot::Sender<Result<()>>,
    },
    GrantCredit {
        consumer_id: u64,
        credits: u32,
    },
    Resolve {
        delivery_tag: u64,
        resolution: Resolution,
        response: oneshot::Sender<Result<()>>,
    },
    DisconnectAll {
        response: oneshot::Sender<()>,
    },
}

impl QueueDispatcher {
    pub(crate) fn new(
        queue_name: &str,
        ordering: QueueOrdering,
        max_deliveries: u32,
        sweep_interval: Duration,
        registry: Arc<MessageRegistry>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        let (control_tx, mut control_rx) = mpsc::channel(64);
        let queue_name = queue_name.to_string();

        tokio::spawn(async move {
            let mut scheduler =
                QueueScheduler::new(&queue_name, ordering, max_deliveries, registry);
            let mut consumers: HashMap<u64, Consumer> = HashMap::new();
            let mut sweep = interval(sweep_interval);

            loop {
                tokio::select! {
                    maybe_cmd = control_rx.recv() => {
                        let Some(cmd) = maybe_cmd else {
                            // queue handle dropped; the engine ends with it
                            break;
                        };
                        match cmd {
                            DispatcherCommand::Enqueue { handle, message, reference } => {
                                let expires_at = message.ttl.map(|ttl| Instant::now() + ttl);
                                scheduler.enqueue(handle, message, reference, expires_at);
                                counter!(QUEUE_MESSAGES_IN_TOTAL.name, "queue" => queue_name.clone())
                                    .increment(1);
                                dispatch_cycle(&mut scheduler, &mut consumers, &store, &queue_name).await;
                            }
                            DispatcherCommand::Subscribe { consumer, response } => {
                                let slot = ConsumerSlot::new(
                                    consumer.consumer_id,
                                    consumer.kind == SubscriptionKind::Exclusive,
                                    consumer.prefetch,
                                    consumer.batch_capacity,
                                    consumer.requeue_on_disconnect,
                                );
                                let result = match scheduler.add_consumer(slot) {
                                    Ok(()) => {
                                        consumers.insert(consumer.consumer_id, consumer);
                                        Ok(())
                                    }
                                    Err(e) => Err(anyhow!(e)),
                                };
                                let _ = response.send(result);
                                dispatch_cycle(&mut scheduler, &mut consumers, &store, &queue_name).await;
                            }
                            DispatcherCommand::Unsubscribe { consumer_id, response } => {
                                let result = if remove_consumer(
                                    &mut scheduler,
                                    &mut consumers,
                                    consumer_id,
                                    &store,
                                    &queue_name,
                                )
                                .await
                                {
                                    Ok(())
                                } else {
                                    Err(anyhow!("consumer {} is not subscribed", consumer_id))
                                };
                                let _ = response.send(result);
                                // a requeued backlog may now flow to the remaining consumers
                                dispatch_cycle(&mut scheduler, &mut consumers, &store, &queue_name).await;
                            }
                            DispatcherCommand::GrantCredit { consumer_id, credits } => {
                                if scheduler.grant_credit(consumer_id, credits) {
                                    dispatch_cycle(&mut scheduler, &mut consumers, &store, &queue_name).await;
                                } else {
                                    warn!(
                                        "queue {}: credit grant for unknown consumer {}",
                                        queue_name, consumer_id
                                    );
                                }
                            }
                            DispatcherCommand::Resolve { delivery_tag, resolution, response } => {
                                let result = match scheduler.resolve(delivery_tag, resolution) {
                                    Ok(effects) => {
                                        record_resolution_metrics(&queue_name, &effects);
                                        reclaim(&store, effects.reclaimable, &queue_name).await;
                                        Ok(())
                                    }
                                    Err(e) => Err(anyhow!(e)),
                                };
                                let _ = response.send(result);
                                dispatch_cycle(&mut scheduler, &mut consumers, &store, &queue_name).await;
                            }
                            DispatcherCommand::DisconnectAll { response } => {
                                let consumer_ids: Vec<u64> = consumers.keys().copied().collect();
                                for consumer_id in consumer_ids {
                                    remove_consumer(
                                        &mut scheduler,
                                        &mut consumers,
                                        consumer_id,
                                        &store,
                                        &queue_name,
                                    )
                                    .await;
                                }
                                let reclaimable = scheduler.shutdown();
                                reclaim(&store, reclaimable, &queue_name).await;
                                update_gauges(&scheduler, &queue_name);
                                let _ = response.send(());
                                // queue deleted; the engine task ends with it
                                break;
                            }
                        }
                        update_gauges(&scheduler, &queue_name);
                    }
                    _ = sweep.tick() => {
                        let effects = scheduler.sweep_expired(Instant::now());
                        if effects.expired > 0 {
                            trace!(
                                "queue {}: expired {} message(s) on sweep",
                                queue_name,
                                effects.expired
                            );
                            counter!(QUEUE_MESSAGES_EXPIRED_TOTAL.name, "queue" => queue_name.clone())
                                .increment(effects.expired as u64);
                        }
                        reclaim(&store, effects.reclaimable, &queue_name).await;
                        update_gauges(&scheduler, &queue_name);
                    }
                }
            }
        });

        Self { control_tx }
    }

    /// Hands the queue's reference to the engine. On a dead engine the
    /// reference comes back so the caller can release it.
    pub(crate) async fn enqueue(
        &self,
        handle: MessageHandle,
        message: Arc<Message>,
        reference: MessageRef,
    ) -> std::result::Result<(), MessageRef> {
        match self
            .control_tx
            .send(DispatcherCommand::Enqueue {
                handle,
                message,
                reference,
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(cmd)) => match cmd {
                DispatcherCommand::Enqueue { reference, .. } => Err(reference),
                _ => unreachable!("send error returns the enqueue command"),
            },
        }
    }

    pub(crate) async fn subscribe(&self, consumer: Consumer) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.control_tx
            .send(DispatcherCommand::Subscribe {
                consumer,
                response: response_tx,
            })
            .await
            .map_err(|_| anyhow!("Failed to send subscribe command"))?;
        response_rx
            .await
            .map_err(|_| anyhow!("Failed to receive subscribe response"))?
    }

    pub(crate) async fn unsubscribe(&self, consumer_id: u64) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.control_tx
            .send(DispatcherCommand::Unsubscribe {
                consumer_id,
                response: response_tx,
            })
            .await
            .map_err(|_| anyhow!("Failed to send unsubscribe command"))?;
        response_rx
            .await
            .map_err(|_| anyhow!("Failed to receive unsubscribe response"))?
    }

    pub(crate) async fn grant_credit(&self, consumer_id: u64, credits: u32) -> Result<()> {
        self.control_tx
            .send(DispatcherCommand::GrantCredit {
                consumer_id,
                credits,
            })
            .await
            .map_err(|_| anyhow!("Failed to send credit grant command"))
    }

    pub(crate) async fn resolve(&self, delivery_tag: u64, resolution: Resolution) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.control_tx
            .send(DispatcherCommand::Resolve {
                delivery_tag,
                resolution,
                response: response_tx,
            })
            .await
            .map_err(|_| anyhow!("Failed to send resolve command"))?;
        response_rx
            .await
            .map_err(|_| anyhow!("Failed to receive resolve response"))?
    }

    pub(crate) async fn disconnect_all(&self) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.control_tx
            .send(DispatcherCommand::DisconnectAll {
                response: response_tx,
            })
            .await
            .map_err(|_| anyhow!("Failed to send disconnect all command"))?;
        response_rx
            .await
            .map_err(|_| anyhow!("Failed to receive disconnect all response"))
    }
}

/// One scheduling pass: form deliveries and offer them until no eligible
/// work remains. Offers are non-blocking; a deferring consumer is skipped
/// for the rest of the cycle so one backpressured transport cannot stall
/// the others.
async fn dispatch_cycle(
    scheduler: &mut QueueScheduler,
    consumers: &mut HashMap<u64, Consumer>,
    store: &Arc<dyn MessageStore>,
    queue_name: &str,
) {
    let mut skip: Vec<u64> = Vec::new();
    for consumer in consumers.values() {
        if !consumer.get_status().await {
            skip.push(consumer.consumer_id);
        }
    }

    loop {
        let Some(prepared) = scheduler.prepare_dispatch(&skip) else {
            break;
        };
        let delivery_tag = prepared.delivery_tag;
        let consumer_id = prepared.consumer_id;
        let delivered_count = prepared.messages.len() as u64;

        let Some(consumer) = consumers.get(&consumer_id) else {
            // roster drifted from the scheduler; back the delivery out
            warn!(
                "queue {}: prepared delivery {} for unknown consumer {}",
                queue_name, delivery_tag, consumer_id
            );
            if let Ok(reclaimable) = scheduler.defer_delivery(delivery_tag) {
                reclaim(store, reclaimable, queue_name).await;
            }
            skip.push(consumer_id);
            continue;
        };

        let delivery = QueueDelivery {
            delivery_tag,
            queue_name: queue_name.to_string(),
            batch: prepared.batch,
            messages: prepared
                .messages
                .iter()
                .map(|message| DeliveredMessage {
                    message: message.message.clone(),
                    delivery_count: message.prior_deliveries + 1,
                    redelivered: message.prior_deliveries > 0,
                })
                .collect(),
        };

        match consumer.offer(delivery) {
            Offer::Accepted => {
                if let Err(e) = scheduler.commit_delivery(delivery_tag) {
                    warn!(
                        "queue {}: committing delivery {} failed: {}",
                        queue_name, delivery_tag, e
                    );
                }
                counter!(QUEUE_MESSAGES_DELIVERED_TOTAL.name, "queue" => queue_name.to_string())
                    .increment(delivered_count);
            }
            Offer::Deferred => {
                trace!(
                    "queue {}: consumer {} deferred delivery {}",
                    queue_name,
                    consumer_id,
                    delivery_tag
                );
                match scheduler.defer_delivery(delivery_tag) {
                    Ok(reclaimable) => reclaim(store, reclaimable, queue_name).await,
                    Err(e) => warn!(
                        "queue {}: backing out deferred delivery {} failed: {}",
                        queue_name, delivery_tag, e
                    ),
                }
                skip.push(consumer_id);
            }
            Offer::Gone => {
                warn!(
                    "queue {}: consumer {} unreachable, forcing resolution of its deliveries",
                    queue_name, consumer_id
                );
                // this delivery never reached the consumer; plain back-out
                if let Ok(reclaimable) = scheduler.defer_delivery(delivery_tag) {
                    reclaim(store, reclaimable, queue_name).await;
                }
                remove_consumer(scheduler, consumers, consumer_id, store, queue_name).await;
            }
        }
    }
}

/// Drops a consumer from the roster and force-resolves every delivery it
/// still holds; references are released unconditionally since the consumer
/// can no longer settle them itself.
async fn remove_consumer(
    scheduler: &mut QueueScheduler,
    consumers: &mut HashMap<u64, Consumer>,
    consumer_id: u64,
    store: &Arc<dyn MessageStore>,
    queue_name: &str,
) -> bool {
    let Some(consumer) = consumers.remove(&consumer_id) else {
        return false;
    };
    consumer.disconnect().await;
    if let Some(effects) = scheduler.remove_consumer(consumer_id) {
        record_resolution_metrics(queue_name, &effects);
        reclaim(store, effects.reclaimable, queue_name).await;
    }
    true
}

/// Forwards fully-released messages to the store. Runs after the scheduling
/// steps, never inside them; a store failure is surfaced to the operator log
/// and the message stays reclaimable on a later release.
async fn reclaim(store: &Arc<dyn MessageStore>, handles: Vec<MessageHandle>, queue_name: &str) {
    for handle in handles {
        if let Err(e) = store.reclaim(handle).await {
            warn!("queue {}: store failed to reclaim {}: {}", queue_name, handle, e);
        }
    }
}

fn record_resolution_metrics(queue_name: &str, effects: &ResolutionEffects) {
    if effects.accepted > 0 {
        counter!(QUEUE_MESSAGES_ACKED_TOTAL.name, "queue" => queue_name.to_string())
            .increment(effects.accepted as u64);
    }
    if effects.requeued > 0 {
        counter!(QUEUE_MESSAGES_REQUEUED_TOTAL.name, "queue" => queue_name.to_string())
            .increment(effects.requeued as u64);
    }
    if effects.dead_lettered > 0 {
        counter!(QUEUE_MESSAGES_DEAD_LETTERED_TOTAL.name, "queue" => queue_name.to_string())
            .increment(effects.dead_lettered as u64);
    }
    if effects.expired > 0 {
        counter!(QUEUE_MESSAGES_EXPIRED_TOTAL.name, "queue" => queue_name.to_string())
            .increment(effects.expired as u64);
    }
}

fn update_gauges(scheduler: &QueueScheduler, queue_name: &str) {
    gauge!(QUEUE_AVAILABLE_MESSAGES.name, "queue" => queue_name.to_string())
        .set(scheduler.available_count() as f64);
    gauge!(QUEUE_OUTSTANDING_DELIVERIES.name, "queue" => queue_name.to_string())
        .set(scheduler.outstanding_count() as f64);
    gauge!(QUEUE_ACTIVE_CONSUMERS.name, "queue" => queue_name.to_string())
        .set(scheduler.consumer_count() as f64);
}
