use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use sava_core::message::{Message, MessageHandle};
use sava_core::ordering::QueueOrdering;
use tracing::{error, trace};

use crate::delivery::{Delivery, DeliveryEntry, Resolution};
use crate::errors::{DispatchError, Result};
use crate::instance::{MessageInstance, RequeueDisposition};
use crate::registry::{MessageRef, MessageRegistry, ReleaseOutcome};

/// Scheduler-side view of one subscribed consumer: its credit window and
/// selection attributes. Consumer variants (single, batch, exclusive) differ
/// only in these fields, not in type.
#[derive(Debug)]
pub struct ConsumerSlot {
    consumer_id: u64,
    exclusive: bool,
    // credit ceiling restored by resolutions; zero means grant-driven only
    prefetch: u32,
    // >1 lets the engine group eligible instances into one delivery
    batch_capacity: u32,
    requeue_on_disconnect: bool,
    credit: u32,
    last_served: u64,
}

impl ConsumerSlot {
    pub fn new(
        consumer_id: u64,
        exclusive: bool,
        prefetch: u32,
        batch_capacity: u32,
        requeue_on_disconnect: bool,
    ) -> Self {
        Self {
            consumer_id,
            exclusive,
            prefetch,
            batch_capacity,
            requeue_on_disconnect,
            credit: prefetch,
            last_served: 0,
        }
    }

    pub fn consumer_id(&self) -> u64 {
        self.consumer_id
    }

    /// Remaining capacity; the engine never forms a delivery for a consumer
    /// whose credit is exhausted.
    pub fn credit(&self) -> u32 {
        self.credit
    }
}

/// One message of a prepared delivery, snapshotted for hand-off to the
/// consumer transport.
#[derive(Debug, Clone)]
pub struct PreparedMessage {
    pub instance_id: u64,
    pub message: Arc<Message>,
    /// Attempts counted so far, the one being prepared excluded.
    pub prior_deliveries: u32,
}

/// A formed delivery ready to be offered. The owning `Delivery` record sits
/// in the outstanding set until the offer is committed or deferred.
#[derive(Debug)]
pub struct PreparedDelivery {
    pub delivery_tag: u64,
    pub consumer_id: u64,
    pub batch: bool,
    pub messages: Vec<PreparedMessage>,
}

/// State changes produced by settling a delivery, reported back to the
/// caller so counters and the store collaborator can be driven outside the
/// scheduling steps.
#[derive(Debug, Default)]
pub struct ResolutionEffects {
    pub consumer_id: u64,
    pub accepted: u32,
    pub requeued: u32,
    pub dead_lettered: u32,
    pub expired: u32,
    /// Messages whose last reference was released; forward to the store.
    pub reclaimable: Vec<MessageHandle>,
}

/// State changes produced by an expiry sweep.
#[derive(Debug, Default)]
pub struct SweepEffects {
    pub expired: u32,
    pub reclaimable: Vec<MessageHandle>,
}

/// Per-queue dispatch state: the live instance set, the consumer roster,
/// and the outstanding deliveries.
///
/// The scheduler is the single arena for a queue's dispatch decisions. It is
/// owned exclusively by the queue's dispatcher task; every method runs under
/// that task's mutual exclusion, so the match-and-acquire steps observe a
/// consistent snapshot without per-field locking.
#[derive(Debug)]
pub struct QueueScheduler {
    queue_name: String,
    ordering: QueueOrdering,
    // delivery attempts before a reject-with-requeue turns into dead-letter
    max_deliveries: u32,
    registry: Arc<MessageRegistry>,
    instances: HashMap<u64, MessageInstance>,
    // arrival-order index over live instances; candidates filter by state,
    // so a requeued instance keeps its original position
    available: VecDeque<u64>,
    consumers: Vec<ConsumerSlot>,
    outstanding: HashMap<u64, Delivery>,
    next_instance_id: u64,
    next_delivery_tag: u64,
    serve_seq: u64,
}

impl QueueScheduler {
    pub fn new(
        queue_name: &str,
        ordering: QueueOrdering,
        max_deliveries: u32,
        registry: Arc<MessageRegistry>,
    ) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            ordering,
            max_deliveries: max_deliveries.max(1),
            registry,
            instances: HashMap::new(),
            available: VecDeque::new(),
            consumers: Vec::new(),
            outstanding: HashMap::new(),
            next_instance_id: 0,
            next_delivery_tag: 0,
            serve_seq: 0,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Places a routed message on this queue. The caller passes the queue's
    /// own reference, held until the instance leaves the live set.
    pub fn enqueue(
        &mut self,
        handle: MessageHandle,
        message: Arc<Message>,
        queue_ref: MessageRef,
        expires_at: Option<Instant>,
    ) -> u64 {
        let instance_id = self.next_instance_id;
        self.next_instance_id += 1;
        let instance = MessageInstance::new(instance_id, handle, message, queue_ref, expires_at);
        self.instances.insert(instance_id, instance);
        self.available.push_back(instance_id);
        trace!(
            "queue {}: enqueued {} as instance {}",
            self.queue_name,
            handle,
            instance_id
        );
        instance_id
    }

    /// Registers a consumer. A queue held by an exclusive consumer refuses
    /// further subscriptions, and an exclusive subscription is refused while
    /// other consumers exist.
    pub fn add_consumer(&mut self, slot: ConsumerSlot) -> Result<()> {
        if self.consumers.iter().any(|existing| existing.exclusive) {
            return Err(DispatchError::InvalidState(format!(
                "queue {} is held by an exclusive consumer",
                self.queue_name
            )));
        }
        if slot.exclusive && !self.consumers.is_empty() {
            return Err(DispatchError::InvalidState(format!(
                "queue {} already has consumers, exclusive subscription refused",
                self.queue_name
            )));
        }
        self.consumers.push(slot);
        Ok(())
    }

    /// Removes a consumer and force-resolves every delivery it still holds.
    /// Requeue-on-disconnect is the subscription's choice; opting out
    /// dead-letters the outstanding instances instead. References are
    /// released unconditionally. Returns `None` for an unknown consumer.
    pub fn remove_consumer(&mut self, consumer_id: u64) -> Option<ResolutionEffects> {
        let position = self
            .consumers
            .iter()
            .position(|slot| slot.consumer_id == consumer_id)?;
        let slot = self.consumers.remove(position);

        let tags: Vec<u64> = self
            .outstanding
            .values()
            .filter(|delivery| delivery.consumer_id() == consumer_id)
            .map(|delivery| delivery.delivery_tag())
            .collect();

        let mut effects = ResolutionEffects {
            consumer_id,
            ..Default::default()
        };
        for tag in tags {
            match self.resolve(
                tag,
                Resolution::Reject {
                    requeue: slot.requeue_on_disconnect,
                },
            ) {
                Ok(mut one) => {
                    effects.accepted += one.accepted;
                    effects.requeued += one.requeued;
                    effects.dead_lettered += one.dead_lettered;
                    effects.expired += one.expired;
                    effects.reclaimable.append(&mut one.reclaimable);
                }
                Err(e) => error!(
                    "queue {}: forced resolution of delivery {} failed: {}",
                    self.queue_name, tag, e
                ),
            }
        }
        Some(effects)
    }

    /// Tops up a consumer's credit window. Returns false for an unknown
    /// consumer.
    pub fn grant_credit(&mut self, consumer_id: u64, credits: u32) -> bool {
        match self
            .consumers
            .iter_mut()
            .find(|slot| slot.consumer_id == consumer_id)
        {
            Some(slot) => {
                slot.credit = slot.credit.saturating_add(credits);
                true
            }
            None => false,
        }
    }

    /// Forms the next delivery: ordered instance selection, eligible-consumer
    /// selection, then atomic acquisition of every instance and one message
    /// reference per instance. Any acquisition failure backs that instance
    /// out and moves on, so no partial delivery is ever produced. Consumers
    /// in `skip` were deferred this cycle and are not reconsidered.
    pub fn prepare_dispatch(&mut self, skip: &[u64]) -> Option<PreparedDelivery> {
        let slot_index = self.select_consumer(skip)?;
        let consumer_id = self.consumers[slot_index].consumer_id;
        let credit = self.consumers[slot_index].credit;
        let batch_limit = self.consumers[slot_index].batch_capacity.max(1).min(credit) as usize;

        let candidates = self.ordered_candidates();
        if candidates.is_empty() {
            return None;
        }

        let mut entries: Vec<DeliveryEntry> = Vec::new();
        let mut messages: Vec<PreparedMessage> = Vec::new();
        for instance_id in candidates {
            if entries.len() == batch_limit {
                break;
            }
            let instance = match self.instances.get_mut(&instance_id) {
                Some(instance) => instance,
                None => continue,
            };
            if instance.acquire(consumer_id).is_err() {
                // raced with another attempt in this same cycle; next candidate
                continue;
            }
            match self.registry.acquire(instance.handle()) {
                Ok(reference) => {
                    messages.push(PreparedMessage {
                        instance_id,
                        message: instance.message(),
                        prior_deliveries: instance.delivery_count(),
                    });
                    entries.push(DeliveryEntry {
                        instance_id,
                        reference,
                    });
                }
                Err(e) => {
                    // lifetime fault upstream: a live instance references a
                    // reclaimed message; back this acquisition out and keep
                    // the queue moving
                    error!(
                        "queue {}: reference acquisition failed for instance {}: {}",
                        self.queue_name, instance_id, e
                    );
                    let _ = instance.requeue();
                }
            }
        }
        if entries.is_empty() {
            return None;
        }

        let delivered = entries.len() as u32;
        let delivery_tag = self.next_delivery_tag;
        self.next_delivery_tag += 1;
        let delivery = Delivery::new(delivery_tag, consumer_id, entries);
        let batch = delivery.is_batch();
        self.outstanding.insert(delivery_tag, delivery);

        let slot = &mut self.consumers[slot_index];
        slot.credit -= delivered;
        self.serve_seq += 1;
        slot.last_served = self.serve_seq;

        trace!(
            "queue {}: prepared delivery {} of {} message(s) for consumer {}",
            self.queue_name,
            delivery_tag,
            delivered,
            consumer_id
        );
        Some(PreparedDelivery {
            delivery_tag,
            consumer_id,
            batch,
            messages,
        })
    }

    /// The consumer took the delivery: every carried instance moves to
    /// pending-ack and counts the attempt.
    pub fn commit_delivery(&mut self, delivery_tag: u64) -> Result<()> {
        let instance_ids: Vec<u64> = self
            .outstanding
            .get(&delivery_tag)
            .ok_or(DispatchError::UnknownDelivery(delivery_tag))?
            .instance_ids()
            .collect();
        for instance_id in instance_ids {
            if let Some(instance) = self.instances.get_mut(&instance_id) {
                instance.mark_delivered()?;
            }
        }
        Ok(())
    }

    /// The consumer could not take the delivery right now: release its
    /// references, return every instance to the queue, and restore the
    /// consumer's credit. The engine retries with another consumer.
    pub fn defer_delivery(&mut self, delivery_tag: u64) -> Result<Vec<MessageHandle>> {
        let delivery = self
            .outstanding
            .remove(&delivery_tag)
            .ok_or(DispatchError::UnknownDelivery(delivery_tag))?;
        let consumer_id = delivery.consumer_id();
        let count = delivery.len() as u32;

        let mut reclaimable = Vec::new();
        for entry in delivery.into_entries() {
            let DeliveryEntry {
                instance_id,
                reference,
            } = entry;
            match self.instances.get_mut(&instance_id) {
                Some(instance) => match instance.requeue() {
                    Ok(RequeueDisposition::Available) => {}
                    Ok(RequeueDisposition::Expired) => {
                        if let Some(handle) = self.remove_instance(instance_id) {
                            reclaimable.push(handle);
                        }
                    }
                    Err(e) => error!(
                        "queue {}: defer could not requeue instance {}: {}",
                        self.queue_name, instance_id, e
                    ),
                },
                None => error!(
                    "queue {}: deferred delivery {} carried unknown instance {}",
                    self.queue_name, delivery_tag, instance_id
                ),
            }
            if let ReleaseOutcome::Reclaimable(handle) = self.registry.release(reference) {
                reclaimable.push(handle);
            }
        }

        if let Some(slot) = self
            .consumers
            .iter_mut()
            .find(|slot| slot.consumer_id == consumer_id)
        {
            slot.credit = slot.credit.saturating_add(count);
        }
        Ok(reclaimable)
    }

    /// Settles an outstanding delivery. A batch settles every instance it
    /// carries together; the delivery's references are released exactly once
    /// regardless of disposition. A reject-with-requeue past the redelivery
    /// threshold dead-letters instead, and an instance that expired while in
    /// flight goes terminal on reject.
    pub fn resolve(&mut self, delivery_tag: u64, resolution: Resolution) -> Result<ResolutionEffects> {
        let delivery = self
            .outstanding
            .remove(&delivery_tag)
            .ok_or(DispatchError::UnknownDelivery(delivery_tag))?;
        let consumer_id = delivery.consumer_id();
        let count = delivery.len() as u32;

        let mut effects = ResolutionEffects {
            consumer_id,
            ..Default::default()
        };
        for entry in delivery.into_entries() {
            let DeliveryEntry {
                instance_id,
                reference,
            } = entry;
            if let Err(e) = self.settle_instance(instance_id, resolution, &mut effects) {
                error!(
                    "queue {}: settling instance {} of delivery {} failed: {}",
                    self.queue_name, instance_id, delivery_tag, e
                );
            }
            if let ReleaseOutcome::Reclaimable(handle) = self.registry.release(reference) {
                effects.reclaimable.push(handle);
            }
        }

        // restore the consumed window, capped at the subscription's prefetch
        if let Some(slot) = self
            .consumers
            .iter_mut()
            .find(|slot| slot.consumer_id == consumer_id)
        {
            if slot.prefetch > 0 {
                slot.credit = slot.credit.saturating_add(count).min(slot.prefetch);
            }
        }
        Ok(effects)
    }

    fn settle_instance(
        &mut self,
        instance_id: u64,
        resolution: Resolution,
        effects: &mut ResolutionEffects,
    ) -> Result<()> {
        let instance = self
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| DispatchError::InvalidState(format!("unknown instance {}", instance_id)))?;

        match resolution {
            Resolution::Accept => {
                instance.accept()?;
                effects.accepted += 1;
                if let Some(handle) = self.remove_instance(instance_id) {
                    effects.reclaimable.push(handle);
                }
            }
            Resolution::Reject { requeue: true } => {
                if instance.delivery_count() >= self.max_deliveries {
                    instance.dead_letter()?;
                    effects.dead_lettered += 1;
                    if let Some(handle) = self.remove_instance(instance_id) {
                        effects.reclaimable.push(handle);
                    }
                } else {
                    match instance.requeue()? {
                        RequeueDisposition::Available => effects.requeued += 1,
                        RequeueDisposition::Expired => {
                            effects.expired += 1;
                            if let Some(handle) = self.remove_instance(instance_id) {
                                effects.reclaimable.push(handle);
                            }
                        }
                    }
                }
            }
            Resolution::Reject { requeue: false } => {
                instance.dead_letter()?;
                effects.dead_lettered += 1;
                if let Some(handle) = self.remove_instance(instance_id) {
                    effects.reclaimable.push(handle);
                }
            }
        }
        Ok(())
    }

    /// Expires available instances past their deadline and marks in-flight
    /// ones so their resolution observes the expiry.
    pub fn sweep_expired(&mut self, now: Instant) -> SweepEffects {
        let mut effects = SweepEffects::default();

        let expired_available: Vec<u64> = self
            .instances
            .values()
            .filter(|instance| instance.is_available() && instance.has_expired(now))
            .map(|instance| instance.instance_id())
            .collect();
        for instance_id in expired_available {
            if let Some(instance) = self.instances.get_mut(&instance_id) {
                if instance.expire().is_ok() {
                    effects.expired += 1;
                    if let Some(handle) = self.remove_instance(instance_id) {
                        effects.reclaimable.push(handle);
                    }
                }
            }
        }

        for instance in self.instances.values_mut() {
            if !instance.is_available() && !instance.is_terminal() && instance.has_expired(now) {
                instance.mark_expired_in_flight();
            }
        }
        effects
    }

    /// Tears the queue down: releases every outstanding delivery's
    /// references and every queue-held reference. Used by queue deletion
    /// after consumers are gone.
    pub fn shutdown(&mut self) -> Vec<MessageHandle> {
        let mut reclaimable = Vec::new();
        for (_, delivery) in self.outstanding.drain() {
            for entry in delivery.into_entries() {
                if let ReleaseOutcome::Reclaimable(handle) = self.registry.release(entry.reference) {
                    reclaimable.push(handle);
                }
            }
        }
        for (_, mut instance) in self.instances.drain() {
            if let Some(queue_ref) = instance.take_queue_ref() {
                if let ReleaseOutcome::Reclaimable(handle) = self.registry.release(queue_ref) {
                    reclaimable.push(handle);
                }
            }
        }
        self.available.clear();
        self.consumers.clear();
        reclaimable
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn has_consumers(&self) -> bool {
        !self.consumers.is_empty()
    }

    /// Instances currently visible to the engine.
    pub fn available_count(&self) -> usize {
        self.instances
            .values()
            .filter(|instance| instance.is_available())
            .count()
    }

    pub fn live_instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Deliveries currently outstanding against one consumer; the credit
    /// bound keeps this at or below the consumer's window.
    pub fn outstanding_for(&self, consumer_id: u64) -> usize {
        self.outstanding
            .values()
            .filter(|delivery| delivery.consumer_id() == consumer_id)
            .count()
    }

    /// Drops a terminal instance from the live set and surrenders the
    /// queue-held reference.
    fn remove_instance(&mut self, instance_id: u64) -> Option<MessageHandle> {
        let mut instance = self.instances.remove(&instance_id)?;
        self.available.retain(|id| *id != instance_id);
        let queue_ref = instance.take_queue_ref()?;
        match self.registry.release(queue_ref) {
            ReleaseOutcome::Reclaimable(handle) => Some(handle),
            ReleaseOutcome::Retained => None,
        }
    }

    /// Next eligible consumer: the exclusive holder if there is one,
    /// otherwise round-robin by least-recently-served among credited
    /// consumers.
    fn select_consumer(&self, skip: &[u64]) -> Option<usize> {
        if let Some(index) = self.consumers.iter().position(|slot| slot.exclusive) {
            let slot = &self.consumers[index];
            if slot.credit > 0 && !skip.contains(&slot.consumer_id) {
                return Some(index);
            }
            return None;
        }
        self.consumers
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.credit > 0 && !skip.contains(&slot.consumer_id))
            .min_by_key(|(_, slot)| slot.last_served)
            .map(|(index, _)| index)
    }

    /// Eligible instances in dispatch order. FIFO walks arrival order;
    /// priority sorts on message priority, stable within a band.
    fn ordered_candidates(&self) -> Vec<u64> {
        let mut candidates: Vec<u64> = self
            .available
            .iter()
            .copied()
            .filter(|id| {
                self.instances
                    .get(id)
                    .map_or(false, |instance| instance.is_available())
            })
            .collect();
        if self.ordering == QueueOrdering::Priority {
            candidates.sort_by_key(|id| {
                std::cmp::Reverse(
                    self.instances
                        .get(id)
                        .map(|instance| instance.priority())
                        .unwrap_or(0),
                )
            });
        }
        candidates
    }
}

#[cfg(test)]
#[path = "scheduler_test.rs"]
mod scheduler_test;
