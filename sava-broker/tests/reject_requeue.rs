//! Negative settlement tests: reject with requeue, redelivery counting, and
//! the dead-letter threshold

use anyhow::Result;

use sava_broker::consumer::ConsumeOptions;
use sava_broker::policies::Policies;
use sava_broker::Resolution;


/// What this test validates
///
/// - Scenario: M1 is delivered and rejected with requeue; the queue has one
///   consumer, so the redelivery lands on the same one.
/// - Expectation: the second delivery carries delivery_count 2 and the
///   redelivered flag; after acknowledgment no reference remains.
#[tokio::test]
async fn reject_with_requeue_redelivers() -> Result<()> {
    let broker = test_utils::setup_broker();
    broker.declare_queue("work")?;

    let (_, mut rx) = broker
        .subscribe("work", ConsumeOptions::shared("cons-nack"))
        .await?;

    broker.publish("", "work", test_utils::make_message("m1")).await?;

    let first = test_utils::recv_delivery(&mut rx, 2).await;
    assert_eq!(first.messages[0].delivery_count, 1);
    broker
        .resolve("work", first.delivery_tag, Resolution::Reject { requeue: true })
        .await?;

    let second = test_utils::recv_delivery(&mut rx, 2).await;
    assert_eq!(test_utils::payload_of(&second, 0), "m1");
    assert_eq!(second.messages[0].delivery_count, 2);
    assert!(second.messages[0].redelivered);

    broker
        .resolve("work", second.delivery_tag, Resolution::Accept)
        .await?;
    assert_eq!(broker.live_references(), 0, "requeue cycle must not leak");
    Ok(())
}

/// What this test validates
///
/// - Scenario: the queue policy allows two delivery attempts; the consumer
///   rejects with requeue twice.
/// - Expectation: the second rejection dead-letters the message instead of
///   requeueing it; nothing further is delivered and no reference remains.
#[tokio::test]
async fn redelivery_threshold_dead_letters() -> Result<()> {
    let policies = Policies {
        max_deliveries: 2,
        ..Policies::default()
    };
    let broker = test_utils::setup_broker_with(policies);
    broker.declare_queue("work")?;

    let (_, mut rx) = broker
        .subscribe("work", ConsumeOptions::shared("cons-dlq"))
        .await?;

    broker.publish("", "work", test_utils::make_message("poison")).await?;

    for attempt in 1..=2u32 {
        let delivery = test_utils::recv_delivery(&mut rx, 2).await;
        assert_eq!(delivery.messages[0].delivery_count, attempt);
        broker
            .resolve("work", delivery.delivery_tag, Resolution::Reject { requeue: true })
            .await?;
    }

    test_utils::expect_no_delivery(&mut rx, 300).await;
    assert_eq!(broker.live_references(), 0);
    Ok(())
}

/// What this test validates
///
/// - Scenario: a delivery rejected with `requeue: false`.
/// - Expectation: the message is dead-lettered on the first rejection, never
///   redelivered, and all references are released.
#[tokio::test]
async fn reject_without_requeue_is_terminal() -> Result<()> {
    let broker = test_utils::setup_broker();
    broker.declare_queue("work")?;

    let (_, mut rx) = broker
        .subscribe("work", ConsumeOptions::shared("cons-drop"))
        .await?;

    broker.publish("", "work", test_utils::make_message("m1")).await?;

    let delivery = test_utils::recv_delivery(&mut rx, 2).await;
    broker
        .resolve("work", delivery.delivery_tag, Resolution::Reject { requeue: false })
        .await?;

    test_utils::expect_no_delivery(&mut rx, 300).await;
    assert_eq!(broker.live_references(), 0);
    Ok(())
}

/// What this test validates
///
/// - Scenario: a settlement for a delivery tag the queue does not hold.
/// - Expectation: the broker surfaces an error instead of silently touching
///   any state.
#[tokio::test]
async fn stray_settlement_is_an_error() -> Result<()> {
    let broker = test_utils::setup_broker();
    broker.declare_queue("work")?;
    assert!(broker.resolve("work", 12345, Resolution::Accept).await.is_err());
    Ok(())
}
