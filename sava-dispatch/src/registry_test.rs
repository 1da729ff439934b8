use sava_core::message::MessageHandle;

use crate::errors::DispatchError;
use crate::registry::{MessageRegistry, ReleaseOutcome};

#[test]
fn last_release_reports_reclaimable() {
    let registry = MessageRegistry::new();
    let handle = MessageHandle(7);

    let first = registry.register(handle);
    let second = registry.acquire(handle).expect("acquire while live");
    assert_eq!(registry.live_count(handle), 2);

    assert_eq!(registry.release(second), ReleaseOutcome::Retained);
    assert_eq!(registry.live_count(handle), 1);

    assert_eq!(
        registry.release(first),
        ReleaseOutcome::Reclaimable(handle)
    );
    assert_eq!(registry.live_count(handle), 0);
}

#[test]
fn acquire_after_full_release_is_stale() {
    let registry = MessageRegistry::new();
    let handle = MessageHandle(1);

    let only = registry.register(handle);
    assert_eq!(registry.release(only), ReleaseOutcome::Reclaimable(handle));

    match registry.acquire(handle) {
        Err(DispatchError::StaleMessage(h)) => assert_eq!(h, handle),
        other => panic!("expected StaleMessage, got {:?}", other),
    }
}

#[test]
fn acquire_on_never_stored_message_is_stale() {
    let registry = MessageRegistry::new();
    assert!(matches!(
        registry.acquire(MessageHandle(99)),
        Err(DispatchError::StaleMessage(_))
    ));
}

#[test]
fn counts_are_per_message() {
    let registry = MessageRegistry::new();
    let a = MessageHandle(1);
    let b = MessageHandle(2);

    let ref_a = registry.register(a);
    let ref_b1 = registry.register(b);
    let ref_b2 = registry.acquire(b).unwrap();

    assert_eq!(registry.live_count(a), 1);
    assert_eq!(registry.live_count(b), 2);
    assert_eq!(registry.total_live(), 3);

    assert_eq!(registry.release(ref_a), ReleaseOutcome::Reclaimable(a));
    // b is untouched by a's reclamation
    assert_eq!(registry.live_count(b), 2);

    assert_eq!(registry.release(ref_b1), ReleaseOutcome::Retained);
    assert_eq!(registry.release(ref_b2), ReleaseOutcome::Reclaimable(b));
    assert_eq!(registry.total_live(), 0);
}

#[test]
fn register_twice_counts_independent_queue_references() {
    // one message routed to two queues holds two independent references
    let registry = MessageRegistry::new();
    let handle = MessageHandle(4);

    let queue_a = registry.register(handle);
    let queue_b = registry.register(handle);
    assert_eq!(registry.live_count(handle), 2);

    assert_eq!(registry.release(queue_a), ReleaseOutcome::Retained);
    assert_eq!(registry.release(queue_b), ReleaseOutcome::Reclaimable(handle));
}
