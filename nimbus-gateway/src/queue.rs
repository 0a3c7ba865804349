//! Ratelimiting queue for starting new gateway sessions.
//!
//! The gateway allows a limited number of IDENTIFY launches: one per 5-second
//! window per identify bucket, where a shard's bucket is
//! `shard_id % max_concurrency`. Exceeding the limit hard-disconnects every
//! offender without refunding the daily session budget, so shards must funnel
//! every identify through a shared queue.
//!
//! A granted [`IdentifyPermit`] is held while the IDENTIFY is in flight and
//! released when the shard observes READY or INVALID_SESSION. The bucket
//! waiter bounds how long it waits for that release, so one wedged shard
//! can't starve the rest of its bucket.

use crate::ratelimiter::CommandRatelimiter;
use std::{fmt::Debug, future::Future, pin::Pin, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    time,
};

/// Spacing between identify launches within one bucket.
const IDENTIFY_INTERVAL: Duration = Duration::from_secs(5);

/// How long a bucket waits for a granted permit to be released before moving
/// on to the next waiter.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Queue for shards to request the ability to initialize new sessions.
///
/// Implement this when identify coordination needs to span multiple
/// processes; the provided [`LocalQueue`] covers all shards of one process.
pub trait Queue: Debug + Send + Sync {
    /// Request a permit to send an IDENTIFY for the given
    /// `[shard_id, shard_total]`.
    ///
    /// The returned future resolves only when the identify may be sent. Hold
    /// the permit until READY or INVALID_SESSION is observed, then drop it.
    fn request(&self, shard_id: [u32; 2]) -> Pin<Box<dyn Future<Output = IdentifyPermit> + Send + '_>>;
}

/// Permission to have one IDENTIFY in flight.
///
/// Dropping the permit signals the queue that the identify reached a terminal
/// response and the next waiter in the bucket may proceed.
#[derive(Debug)]
pub struct IdentifyPermit {
    _release: oneshot::Sender<()>,
}

impl IdentifyPermit {
    /// Release the permit, letting the next identify in the bucket proceed.
    pub fn release(self) {}

    /// Permit that isn't connected to any queue.
    ///
    /// Used when a queue has shut down and blocking the shard forever would
    /// be worse than identifying unthrottled.
    fn detached() -> Self {
        let (release, _) = oneshot::channel();

        Self { _release: release }
    }
}

/// In-process [`Queue`] with one waiter task per identify bucket.
#[derive(Debug)]
pub struct LocalQueue {
    buckets: Vec<mpsc::UnboundedSender<oneshot::Sender<IdentifyPermit>>>,
}

impl LocalQueue {
    /// Create a queue with the given `max_concurrency` bucket count.
    pub fn new(max_concurrency: u16) -> Self {
        let buckets = (0..max_concurrency.max(1))
            .map(|bucket| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(waiter(bucket, rx));

                tx
            })
            .collect();

        Self { buckets }
    }
}

impl Queue for LocalQueue {
    fn request(
        &self,
        [id, total]: [u32; 2],
    ) -> Pin<Box<dyn Future<Output = IdentifyPermit> + Send + '_>> {
        Box::pin(async move {
            let bucket = id as usize % self.buckets.len();
            let (tx, rx) = oneshot::channel();

            if self.buckets[bucket].send(tx).is_err() {
                tracing::warn!(shard = id, "identify queue is gone, skipping throttle");

                return IdentifyPermit::detached();
            }

            tracing::debug!(shard = id, shard_total = total, bucket, "waiting for identify allowance");

            match rx.await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::warn!(shard = id, "identify queue dropped the request, skipping throttle");

                    IdentifyPermit::detached()
                }
            }
        })
    }
}

/// Grant permits one at a time, spaced by the identify window and gated on
/// the previous permit being released.
async fn waiter(bucket: u16, mut rx: mpsc::UnboundedReceiver<oneshot::Sender<IdentifyPermit>>) {
    let limiter = CommandRatelimiter::new(1, IDENTIFY_INTERVAL);

    while let Some(request) = rx.recv().await {
        limiter.acquire_one().await;

        let (release, released) = oneshot::channel();

        if request.send(IdentifyPermit { _release: release }).is_err() {
            // Requester went away while queued; its window is reusable.
            continue;
        }

        if time::timeout(IDENTIFY_TIMEOUT, released).await.is_err() {
            tracing::warn!(bucket, "identify permit wasn't released in time");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{IdentifyPermit, LocalQueue, Queue};
    use static_assertions::{assert_impl_all, assert_obj_safe};
    use std::fmt::Debug;

    assert_impl_all!(LocalQueue: Debug, Send, Sync);
    assert_impl_all!(IdentifyPermit: Debug, Send, Sync);
    assert_obj_safe!(Queue);
}
