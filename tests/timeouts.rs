use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbar::{CrossBar, SubscribeOptions};

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

#[tokio::test(flavor = "multi_thread")]
async fn slow_handlers_time_out_without_stalling_the_loop() {
    let bus = CrossBar::new();
    let callbacks = Arc::new(AtomicU64::new(0));

    let counter = Arc::clone(&callbacks);
    let subscription = bus
        .subscribe_with::<i64, _, _>(
            "slow",
            |_message| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            },
            SubscribeOptions {
                handler_timeout: Some(Duration::from_millis(50)),
                on_timeout: Some(Arc::new(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })),
                ..Default::default()
            },
        )
        .expect("subscribe");

    for i in 0..10_i64 {
        bus.publish("slow", i).expect("publish");
    }

    wait_for(
        || subscription.stats(false).total_timeouts == 10,
        "ten timeouts",
    )
    .await;
    assert_eq!(callbacks.load(Ordering::Relaxed), 10);
    wait_for(
        || subscription.stats(false).queue_length == 0,
        "queue to drain",
    )
    .await;
    // Timed-out items release the loop without counting as processed.
    let stats = subscription.stats(false);
    assert_eq!(stats.total_dequeued, 10);
    assert_eq!(stats.total_processed, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn fast_handlers_never_hit_the_deadline() {
    let bus = CrossBar::new();
    let subscription = bus
        .subscribe_with::<i64, _, _>(
            "fast",
            |_message| async { Ok(()) },
            SubscribeOptions {
                handler_timeout: Some(Duration::from_secs(5)),
                ..Default::default()
            },
        )
        .expect("subscribe");

    for i in 0..100_i64 {
        bus.publish("fast", i).expect("publish");
    }
    wait_for(
        || subscription.stats(false).total_processed == 100,
        "all processed",
    )
    .await;
    assert_eq!(subscription.stats(false).total_timeouts, 0);
}
