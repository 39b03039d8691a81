use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crossbar::{CrossBar, PublishOptions, SubscribeOptions};

async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn rapid_updates_coalesce_to_the_most_recent_value() {
    let bus = CrossBar::new();
    let received = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&received);
    bus.subscribe_with::<i64, _, _>(
        "p",
        move |message| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(message.body);
                Ok(())
            }
        },
        SubscribeOptions {
            conflation_interval: Some(Duration::from_millis(200)),
            ..Default::default()
        },
    )
    .expect("subscribe");

    for i in 0..100_i64 {
        bus.publish_with("p", i, PublishOptions::default().key("k"))
            .expect("publish");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    wait_for(
        || received.lock().last() == Some(&99),
        "final conflated value",
    )
    .await;
    let received = received.lock();
    assert!(!received.is_empty() && received.len() <= 100);
    // Coalescing keeps only the most recent value per key, so deliveries
    // are strictly increasing.
    assert!(received.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(flavor = "multi_thread")]
async fn conflation_tracks_each_key_independently() {
    let bus = CrossBar::new();
    let received: Arc<Mutex<Vec<(Option<String>, i64)>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&received);
    bus.subscribe_with::<i64, _, _>(
        "quotes",
        move |message| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock()
                    .push((message.key().map(str::to_string), message.body));
                Ok(())
            }
        },
        SubscribeOptions {
            conflation_interval: Some(Duration::from_millis(100)),
            ..Default::default()
        },
    )
    .expect("subscribe");

    for i in 0..50_i64 {
        bus.publish_with("quotes", i, PublishOptions::default().key("a"))
            .expect("publish");
        bus.publish_with("quotes", 1000 + i, PublishOptions::default().key("b"))
            .expect("publish");
    }

    wait_for(
        || {
            let received = received.lock();
            received.iter().any(|(k, v)| k.as_deref() == Some("a") && *v == 49)
                && received
                    .iter()
                    .any(|(k, v)| k.as_deref() == Some("b") && *v == 1049)
        },
        "final value per key",
    )
    .await;
    // One burst per key fits into a single flush window.
    let received = received.lock();
    let for_key = |key: &str| {
        received
            .iter()
            .filter(|(k, _)| k.as_deref() == Some(key))
            .count()
    };
    assert!(for_key("a") < 50);
    assert!(for_key("b") < 50);
}
