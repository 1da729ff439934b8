use crate::registry::MessageRef;

/// How a consumer settled a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Acknowledged: every carried instance is accepted.
    Accept,
    /// Negatively settled. `requeue` returns instances to the queue;
    /// otherwise they are dead-lettered.
    Reject { requeue: bool },
}

/// One entry of a delivery: the instance plus the reference that keeps its
/// message alive for the duration of the attempt.
#[derive(Debug)]
pub(crate) struct DeliveryEntry {
    pub(crate) instance_id: u64,
    pub(crate) reference: MessageRef,
}

/// The dispatch unit: one consumer bound to one or more message instances
/// for a single delivery attempt.
///
/// Owns exactly one message reference per carried instance, acquired when
/// the delivery is formed and released exactly once when it resolves or is
/// torn down on consumer disconnect. Never partially resolved: a batch
/// settles all of its instances together.
#[derive(Debug)]
pub struct Delivery {
    delivery_tag: u64,
    consumer_id: u64,
    entries: Vec<DeliveryEntry>,
    batch: bool,
}

impl Delivery {
    pub(crate) fn new(delivery_tag: u64, consumer_id: u64, entries: Vec<DeliveryEntry>) -> Self {
        let batch = entries.len() > 1;
        Self {
            delivery_tag,
            consumer_id,
            entries,
            batch,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn consumer_id(&self) -> u64 {
        self.consumer_id
    }

    pub fn is_batch(&self) -> bool {
        self.batch
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn instance_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|entry| entry.instance_id)
    }

    /// Consumes the delivery for resolution; each entry's reference is
    /// released exactly once by the scheduler.
    pub(crate) fn into_entries(self) -> Vec<DeliveryEntry> {
        self.entries
    }
}
