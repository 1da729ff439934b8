//! Ordering tests: FIFO default and priority-ordered queues

use anyhow::Result;

use sava_broker::consumer::ConsumeOptions;
use sava_broker::Resolution;
use sava_core::ordering::QueueOrdering;


/// What this test validates
///
/// - Scenario: one non-batching consumer with ample credit on a FIFO queue;
///   three messages published in order, each acknowledged before the next is
///   consumed.
/// - Expectation: the consumer observes M1, M2, M3 in publish order, each on
///   its first delivery attempt, and no message reference survives the run.
#[tokio::test]
async fn fifo_single_consumer_sees_publish_order() -> Result<()> {
    let broker = test_utils::setup_broker();
    broker.declare_queue("orders")?;

    let (_, mut rx) = broker
        .subscribe("orders", ConsumeOptions::shared("cons-fifo"))
        .await?;

    for payload in ["m1", "m2", "m3"] {
        let outcome = broker
            .publish("", "orders", test_utils::make_message(payload))
            .await?;
        assert_eq!(outcome.routed_to, 1);
    }

    for expected in ["m1", "m2", "m3"] {
        let delivery = test_utils::recv_delivery(&mut rx, 2).await;
        assert_eq!(test_utils::payload_of(&delivery, 0), expected);
        assert_eq!(delivery.messages[0].delivery_count, 1);
        assert!(!delivery.messages[0].redelivered);
        broker
            .resolve("orders", delivery.delivery_tag, Resolution::Accept)
            .await?;
    }

    assert_eq!(broker.live_references(), 0, "no reference may leak");
    Ok(())
}

/// What this test validates
///
/// - Scenario: a priority-ordered queue accumulates three messages of
///   priorities 1, 9 and 5 before any consumer attaches.
/// - Expectation: once a consumer subscribes, deliveries arrive highest
///   priority first.
#[tokio::test]
async fn priority_queue_delivers_high_priority_first() -> Result<()> {
    let broker = test_utils::setup_broker();
    broker.declare_queue_with("alerts", Some(QueueOrdering::Priority), None)?;

    for (payload, priority) in [("low", 1u8), ("high", 9u8), ("mid", 5u8)] {
        broker
            .publish("", "alerts", test_utils::make_priority_message(payload, priority))
            .await?;
    }

    let (_, mut rx) = broker
        .subscribe("alerts", ConsumeOptions::shared("cons-prio"))
        .await?;

    for expected in ["high", "mid", "low"] {
        let delivery = test_utils::recv_delivery(&mut rx, 2).await;
        assert_eq!(test_utils::payload_of(&delivery, 0), expected);
        broker
            .resolve("alerts", delivery.delivery_tag, Resolution::Accept)
            .await?;
    }

    assert_eq!(broker.live_references(), 0);
    Ok(())
}

/// What this test validates
///
/// - Scenario: a publish whose routing resolves to no queue (default
///   exchange, nonexistent queue name).
/// - Expectation: the publish succeeds with `routed_to == 0` and nothing is
///   stored or referenced.
#[tokio::test]
async fn unroutable_publish_is_dropped_cleanly() -> Result<()> {
    let broker = test_utils::setup_broker();
    broker.declare_queue("orders")?;

    let outcome = broker
        .publish("", "no-such-queue", test_utils::make_message("lost"))
        .await?;
    assert_eq!(outcome.routed_to, 0);
    assert_eq!(broker.live_references(), 0);
    Ok(())
}
