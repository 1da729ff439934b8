use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sava_core::message::{Message, MessageHandle};

use crate::errors::DispatchError;
use crate::instance::{InstanceState, MessageInstance, RequeueDisposition};
use crate::registry::{MessageRegistry, ReleaseOutcome};

fn make_instance(registry: &MessageRegistry, expires_at: Option<Instant>) -> MessageInstance {
    let handle = MessageHandle(1);
    let message = Arc::new(Message {
        payload: b"payload".to_vec(),
        headers: HashMap::new(),
        producer_name: "producer-test".to_string(),
        publish_time: 0,
        priority: 4,
        ttl: None,
    });
    let queue_ref = registry.register(handle);
    MessageInstance::new(10, handle, message, queue_ref, expires_at)
}

#[test]
fn happy_path_available_to_accepted() {
    let registry = MessageRegistry::new();
    let mut instance = make_instance(&registry, None);
    assert_eq!(instance.state(), InstanceState::Available);

    instance.acquire(42).unwrap();
    assert_eq!(instance.state(), InstanceState::Acquired { consumer_id: 42 });
    assert_eq!(instance.delivery_count(), 0);

    instance.mark_delivered().unwrap();
    assert_eq!(
        instance.state(),
        InstanceState::PendingAck { consumer_id: 42 }
    );
    assert_eq!(instance.delivery_count(), 1);

    instance.accept().unwrap();
    assert!(instance.is_terminal());

    let queue_ref = instance.take_queue_ref().expect("queue ref still held");
    assert_eq!(
        registry.release(queue_ref),
        ReleaseOutcome::Reclaimable(MessageHandle(1))
    );
}

#[test]
fn acquire_is_single_owner() {
    let registry = MessageRegistry::new();
    let mut instance = make_instance(&registry, None);

    instance.acquire(1).unwrap();
    match instance.acquire(2) {
        Err(DispatchError::AlreadyAcquired(id)) => assert_eq!(id, 10),
        other => panic!("expected AlreadyAcquired, got {:?}", other),
    }
    drop(instance.take_queue_ref().map(|r| registry.release(r)));
}

#[test]
fn requeue_preserves_delivery_count() {
    let registry = MessageRegistry::new();
    let mut instance = make_instance(&registry, None);

    instance.acquire(1).unwrap();
    instance.mark_delivered().unwrap();
    assert_eq!(
        instance.requeue().unwrap(),
        RequeueDisposition::Available
    );
    assert!(instance.is_available());
    assert_eq!(instance.delivery_count(), 1);

    // second attempt counts up
    instance.acquire(2).unwrap();
    instance.mark_delivered().unwrap();
    assert_eq!(instance.delivery_count(), 2);
    drop(instance.take_queue_ref().map(|r| registry.release(r)));
}

#[test]
fn abandonment_requeues_from_acquired_without_counting() {
    let registry = MessageRegistry::new();
    let mut instance = make_instance(&registry, None);

    instance.acquire(1).unwrap();
    assert_eq!(
        instance.requeue().unwrap(),
        RequeueDisposition::Available
    );
    // never handed off, so the attempt does not count
    assert_eq!(instance.delivery_count(), 0);
    drop(instance.take_queue_ref().map(|r| registry.release(r)));
}

#[test]
fn expired_in_flight_goes_terminal_on_requeue() {
    let registry = MessageRegistry::new();
    let mut instance = make_instance(&registry, None);

    instance.acquire(1).unwrap();
    instance.mark_delivered().unwrap();
    instance.mark_expired_in_flight();

    assert_eq!(instance.requeue().unwrap(), RequeueDisposition::Expired);
    assert_eq!(instance.state(), InstanceState::Expired);
    assert!(instance.is_terminal());
    drop(instance.take_queue_ref().map(|r| registry.release(r)));
}

#[test]
fn expiry_deadline_is_observed() {
    let registry = MessageRegistry::new();
    let past = Instant::now() - Duration::from_millis(1);
    let mut instance = make_instance(&registry, Some(past));

    assert!(instance.has_expired(Instant::now()));
    instance.expire().unwrap();
    assert_eq!(instance.state(), InstanceState::Expired);
    drop(instance.take_queue_ref().map(|r| registry.release(r)));
}

#[test]
fn terminal_transitions_reject_further_operations() {
    let registry = MessageRegistry::new();
    let mut instance = make_instance(&registry, None);

    instance.acquire(1).unwrap();
    instance.mark_delivered().unwrap();
    instance.dead_letter().unwrap();

    assert!(matches!(
        instance.accept(),
        Err(DispatchError::InvalidState(_))
    ));
    assert!(matches!(
        instance.requeue(),
        Err(DispatchError::InvalidState(_))
    ));
    drop(instance.take_queue_ref().map(|r| registry.release(r)));
}
