//! Message TTL tests: the expiry sweep and expiry during an in-flight
//! delivery

use anyhow::Result;
use std::time::Duration;
use tokio::time::sleep;

use sava_broker::consumer::ConsumeOptions;
use sava_broker::policies::Policies;
use sava_broker::Resolution;


fn fast_sweep_policies() -> Policies {
    Policies {
        sweep_interval_ms: 50,
        ..Policies::default()
    }
}

/// What this test validates
///
/// - Scenario: a message with a short TTL sits on a queue with no consumer
///   until the expiry sweep passes.
/// - Expectation: the instance expires, its references are released, and a
///   consumer attaching afterwards receives nothing.
#[tokio::test]
async fn queued_message_expires_on_sweep() -> Result<()> {
    let broker = test_utils::setup_broker_with(fast_sweep_policies());
    broker.declare_queue("timed")?;

    broker
        .publish(
            "",
            "timed",
            test_utils::make_ttl_message("fleeting", Duration::from_millis(20)),
        )
        .await?;
    assert_eq!(broker.live_references(), 1);

    // let the deadline and at least one sweep pass
    sleep(Duration::from_millis(300)).await;
    assert_eq!(broker.live_references(), 0, "expired instance released its ref");

    let (_, mut rx) = broker
        .subscribe("timed", ConsumeOptions::shared("cons-late"))
        .await?;
    test_utils::expect_no_delivery(&mut rx, 200).await;
    Ok(())
}

/// What this test validates
///
/// - Scenario: a message expires while its delivery is outstanding; the
///   consumer then rejects with requeue.
/// - Expectation: the delivery is not retracted; the rejection lands on the
///   expired state instead of requeueing, nothing is redelivered, and no
///   reference remains.
#[tokio::test]
async fn in_flight_expiry_resolves_on_reject() -> Result<()> {
    let broker = test_utils::setup_broker_with(fast_sweep_policies());
    broker.declare_queue("timed")?;

    let (_, mut rx) = broker
        .subscribe("timed", ConsumeOptions::shared("cons-slow"))
        .await?;

    broker
        .publish(
            "",
            "timed",
            test_utils::make_ttl_message("fleeting", Duration::from_millis(20)),
        )
        .await?;

    let delivery = test_utils::recv_delivery(&mut rx, 2).await;

    // the deadline and a sweep pass while the delivery is outstanding; the
    // in-flight delivery stays out
    sleep(Duration::from_millis(300)).await;

    broker
        .resolve("timed", delivery.delivery_tag, Resolution::Reject { requeue: true })
        .await?;

    test_utils::expect_no_delivery(&mut rx, 200).await;
    assert_eq!(broker.live_references(), 0);
    Ok(())
}

/// What this test validates
///
/// - Scenario: the same in-flight expiry, but the consumer acknowledges.
/// - Expectation: acceptance needs no special handling; the message settles
///   normally.
#[tokio::test]
async fn in_flight_expiry_still_accepts() -> Result<()> {
    let broker = test_utils::setup_broker_with(fast_sweep_policies());
    broker.declare_queue("timed")?;

    let (_, mut rx) = broker
        .subscribe("timed", ConsumeOptions::shared("cons-ack"))
        .await?;

    broker
        .publish(
            "",
            "timed",
            test_utils::make_ttl_message("fleeting", Duration::from_millis(20)),
        )
        .await?;

    let delivery = test_utils::recv_delivery(&mut rx, 2).await;
    sleep(Duration::from_millis(300)).await;

    broker
        .resolve("timed", delivery.delivery_tag, Resolution::Accept)
        .await?;
    assert_eq!(broker.live_references(), 0);
    Ok(())
}
