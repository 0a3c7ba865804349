//! Timing behavior of the in-process identify queue.

use nimbus_gateway::queue::{LocalQueue, Queue};
use std::time::Duration;
use tokio::time::Instant;

const IDENTIFY_INTERVAL: Duration = Duration::from_secs(5);
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test(start_paused = true)]
async fn same_bucket_is_serial() {
    let queue = LocalQueue::new(1);
    let started = Instant::now();

    let permit = queue.request([0, 2]).await;
    assert!(started.elapsed() < IDENTIFY_INTERVAL, "first identify was throttled");

    permit.release();

    queue.request([1, 2]).await.release();
    assert!(
        started.elapsed() >= IDENTIFY_INTERVAL,
        "two identifies ran within one window",
    );
}

#[tokio::test(start_paused = true)]
async fn different_buckets_are_parallel() {
    let queue = LocalQueue::new(2);
    let started = Instant::now();

    queue.request([0, 2]).await.release();
    queue.request([1, 2]).await.release();

    assert!(
        started.elapsed() < IDENTIFY_INTERVAL,
        "distinct buckets were serialized",
    );
}

#[tokio::test(start_paused = true)]
async fn held_permit_is_reclaimed() {
    let queue = LocalQueue::new(1);
    let started = Instant::now();

    // Simulate a wedged shard that never observes READY.
    let _held = queue.request([0, 2]).await;

    queue.request([1, 2]).await.release();
    assert!(
        started.elapsed() >= IDENTIFY_TIMEOUT,
        "queue didn't wait for the stuck shard's timeout",
    );
}

#[tokio::test(start_paused = true)]
async fn release_frees_the_bucket_early() {
    let queue = LocalQueue::new(1);

    let permit = queue.request([0, 2]).await;
    permit.release();

    let started = Instant::now();
    queue.request([1, 2]).await.release();

    // Only the window spacing applies, not the stuck-shard timeout.
    assert!(started.elapsed() <= IDENTIFY_INTERVAL);
}
