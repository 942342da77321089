//! Wall-clock behavior of the precise delay scheduler.

#[macro_use]
mod common;

use common::*;
use cordon::config::DelayConfig;
use cordon::{block_on, delay, spawn, DelayScheduler, WallClock};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper slack for a loaded CI machine on top of the polling ceiling.
const SLACK: Duration = Duration::from_millis(150);

fn isolated() -> DelayScheduler {
    DelayScheduler::new(Arc::new(WallClock::new()), DelayConfig::default())
}

#[test]
fn delay_is_never_early_and_rarely_late() {
    init_test("delay_is_never_early_and_rarely_late");
    let scheduler = isolated();
    let start = Instant::now();
    block_on(scheduler.delay(200));
    let elapsed = start.elapsed();
    assert_with_log!(
        elapsed >= Duration::from_millis(200),
        "not early",
        ">= 200ms",
        elapsed
    );
    let ceiling = Duration::from_millis(200) + DelayConfig::default().poll_ceiling + SLACK;
    assert_with_log!(elapsed <= ceiling, "bounded lateness", ceiling, elapsed);
    scheduler.shutdown();
    test_complete!("delay_is_never_early_and_rarely_late");
}

#[test]
fn earlier_request_preempts_long_sleep() {
    init_test("earlier_request_preempts_long_sleep");
    let scheduler = isolated();
    let _far = scheduler.delay(5_000);
    std::thread::sleep(Duration::from_millis(20));

    let start = Instant::now();
    block_on(scheduler.delay(30));
    let elapsed = start.elapsed();
    assert_with_log!(
        elapsed < Duration::from_millis(30) + SLACK,
        "woken for the nearer deadline",
        "< 180ms",
        elapsed
    );
    scheduler.shutdown();
    test_complete!("earlier_request_preempts_long_sleep");
}

#[test]
fn identical_deadlines_share_one_wakeup() {
    init_test("identical_deadlines_share_one_wakeup");
    let scheduler = isolated();
    let delays: Vec<_> = (0..64).map(|_| scheduler.delay(250)).collect();
    let metrics = scheduler.metrics();
    assert_eq!(metrics.requests, 64);
    assert_with_log!(
        metrics.pending_deadlines < 64,
        "requests coalesced",
        "< 64 deadlines",
        metrics.pending_deadlines
    );
    assert!(metrics.coalesce_ratio() > 0.0);

    for d in delays {
        block_on(d);
    }
    let fired = scheduler.metrics().fired;
    assert_eq!(fired, metrics.pending_deadlines as u64);
    scheduler.shutdown();
    test_complete!("identical_deadlines_share_one_wakeup");
}

#[test]
fn many_concurrent_delays_complete() {
    init_test("many_concurrent_delays_complete");
    let handles: Vec<_> = (0..200)
        .map(|i| {
            spawn(async move {
                delay(10 + (i % 20)).await;
                Ok(i)
            })
        })
        .collect();
    let sum: i64 = handles
        .into_iter()
        .map(|h| block_on(h).expect("delay task"))
        .sum();
    assert_eq!(sum, (0..200).sum::<i64>());
    test_complete!("many_concurrent_delays_complete");
}
