//! Flow-control tests: the credit bound, window restoration on settlement,
//! and grant-driven consumers

use anyhow::Result;

use sava_broker::consumer::ConsumeOptions;
use sava_broker::Resolution;


/// What this test validates
///
/// - Scenario: a consumer with a prefetch window of 2 and four queued
///   messages.
/// - Expectation: only two deliveries are outstanding at any moment; the
///   third arrives only after one of the first two is settled.
#[tokio::test]
async fn prefetch_window_bounds_outstanding_deliveries() -> Result<()> {
    let broker = test_utils::setup_broker();
    broker.declare_queue("paced")?;

    let options = ConsumeOptions {
        prefetch: Some(2),
        ..ConsumeOptions::shared("cons-paced")
    };
    let (_, mut rx) = broker.subscribe("paced", options).await?;

    for payload in ["m1", "m2", "m3", "m4"] {
        broker.publish("", "paced", test_utils::make_message(payload)).await?;
    }

    let first = test_utils::recv_delivery(&mut rx, 2).await;
    let second = test_utils::recv_delivery(&mut rx, 2).await;
    assert_eq!(test_utils::payload_of(&first, 0), "m1");
    assert_eq!(test_utils::payload_of(&second, 0), "m2");

    // credit exhausted: m3 must not arrive yet
    test_utils::expect_no_delivery(&mut rx, 300).await;

    broker
        .resolve("paced", first.delivery_tag, Resolution::Accept)
        .await?;
    let third = test_utils::recv_delivery(&mut rx, 2).await;
    assert_eq!(test_utils::payload_of(&third, 0), "m3");

    broker.resolve("paced", second.delivery_tag, Resolution::Accept).await?;
    broker.resolve("paced", third.delivery_tag, Resolution::Accept).await?;
    let fourth = test_utils::recv_delivery(&mut rx, 2).await;
    broker.resolve("paced", fourth.delivery_tag, Resolution::Accept).await?;

    assert_eq!(broker.live_references(), 0);
    Ok(())
}

/// What this test validates
///
/// - Scenario: a consumer subscribed with prefetch 0, so its credit comes
///   only from explicit grants.
/// - Expectation: nothing is delivered until credit is granted; each grant
///   releases exactly that many deliveries.
#[tokio::test]
async fn grant_driven_consumer_needs_explicit_credit() -> Result<()> {
    let broker = test_utils::setup_broker();
    broker.declare_queue("manual")?;

    let options = ConsumeOptions {
        prefetch: Some(0),
        ..ConsumeOptions::shared("cons-manual")
    };
    let (consumer_id, mut rx) = broker.subscribe("manual", options).await?;

    broker.publish("", "manual", test_utils::make_message("m1")).await?;
    broker.publish("", "manual", test_utils::make_message("m2")).await?;

    test_utils::expect_no_delivery(&mut rx, 300).await;

    broker.grant_credit("manual", consumer_id, 1).await?;
    let first = test_utils::recv_delivery(&mut rx, 2).await;
    assert_eq!(test_utils::payload_of(&first, 0), "m1");

    // the single grant is spent; the second message stays queued
    test_utils::expect_no_delivery(&mut rx, 300).await;

    broker.grant_credit("manual", consumer_id, 1).await?;
    let second = test_utils::recv_delivery(&mut rx, 2).await;
    assert_eq!(test_utils::payload_of(&second, 0), "m2");

    broker.resolve("manual", first.delivery_tag, Resolution::Accept).await?;
    broker.resolve("manual", second.delivery_tag, Resolution::Accept).await?;
    assert_eq!(broker.live_references(), 0);
    Ok(())
}
