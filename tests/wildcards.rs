use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crossbar::CrossBar;

async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn collector(bus: &CrossBar, pattern: &str) -> Arc<Mutex<Vec<i64>>> {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    bus.subscribe::<i64, _, _>(pattern, move |message| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().push(message.body);
            Ok(())
        }
    })
    .expect("subscribe");
    received
}

#[tokio::test(flavor = "multi_thread")]
async fn star_matches_exactly_one_segment() {
    let bus = CrossBar::new();
    let received = collector(&bus, "orders.*");

    bus.publish("orders.new", 1_i64).expect("publish");
    bus.publish("orders.cancelled", 2_i64).expect("publish");
    bus.publish("orders.shipped.fedex", 3_i64).expect("publish");

    wait_for(|| received.lock().len() == 2, "two matches").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut got = received.lock().clone();
    got.sort_unstable();
    assert_eq!(got, vec![1, 2]);
}

#[tokio::test(flavor = "multi_thread")]
async fn tail_matches_one_or_more_segments() {
    let bus = CrossBar::new();
    let received = collector(&bus, "orders.>");

    bus.publish("orders.new", 1_i64).expect("publish");
    bus.publish("orders.cancelled", 2_i64).expect("publish");
    bus.publish("orders.shipped.fedex", 3_i64).expect("publish");

    wait_for(|| received.lock().len() == 3, "three matches").await;
    let mut got = received.lock().clone();
    got.sort_unstable();
    assert_eq!(got, vec![1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread")]
async fn wildcard_attaches_to_channels_created_later() {
    let bus = CrossBar::new();
    let received = collector(&bus, "metrics.>");

    // The channels do not exist yet when the wildcard registers.
    bus.publish("metrics.cpu", 10_i64).expect("publish");
    bus.publish("metrics.mem.rss", 20_i64).expect("publish");

    wait_for(|| received.lock().len() == 2, "late-channel matches").await;
    let mut got = received.lock().clone();
    got.sort_unstable();
    assert_eq!(got, vec![10, 20]);
}

#[tokio::test(flavor = "multi_thread")]
async fn wildcard_skips_channels_of_a_different_body_type() {
    let bus = CrossBar::new();
    let received = collector(&bus, "mixed.*");

    bus.publish("mixed.text", "hello".to_string()).expect("publish");
    bus.publish("mixed.number", 5_i64).expect("publish");

    wait_for(|| received.lock().len() == 1, "typed match").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*received.lock(), vec![5]);
}

#[tokio::test(flavor = "multi_thread")]
async fn literal_type_conflicts_are_rejected() {
    let bus = CrossBar::new();
    bus.publish("typed", 1_i64).expect("publish");

    let err = bus.publish("typed", "oops".to_string()).expect_err("type mismatch");
    assert!(matches!(err, crossbar::Error::ChannelTypeMismatch { .. }));

    let err = bus
        .subscribe::<String, _, _>("typed", |_m| async { Ok(()) })
        .expect_err("type mismatch");
    assert!(matches!(err, crossbar::Error::ChannelTypeMismatch { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_names_are_rejected() {
    let bus = CrossBar::new();
    for name in ["", "   ", "a..b", "$reserved", "wild.*"] {
        let err = bus.publish(name, 1_i64).expect_err("invalid name");
        assert!(
            matches!(err, crossbar::Error::InvalidChannelName(_)),
            "'{name}' should be invalid"
        );
    }
    let err = bus
        .subscribe::<i64, _, _>(">.orders", |_m| async { Ok(()) })
        .expect_err("invalid pattern");
    assert!(matches!(err, crossbar::Error::InvalidChannelName(_)));
}
