//! Hooks invoked as shards receive packets and terminate.

use crate::{config::ShardId, error::FatalError, packet::ReceivePacket};
use std::fmt::Debug;

/// Observer of per-shard gateway traffic and terminal failures.
///
/// `on_packet` is called from the shard's connection driver for every inbound
/// packet. Dispatch packets are sequence-gated first, so stale replays never
/// arrive and dispatches are observed strictly in sequence order.
/// Implementations must return quickly; hand slow work to a channel or task
/// instead of doing it inline.
pub trait EventObserver: Debug + Send + Sync {
    /// An inbound packet arrived on a shard.
    fn on_packet(&self, shard: ShardId, packet: &ReceivePacket) {
        let _ = (shard, packet);
    }

    /// A shard terminated and will not reconnect.
    fn on_shard_terminal(&self, shard: ShardId, error: &FatalError) {
        let _ = (shard, error);
    }
}

/// Observer that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl EventObserver for NoopObserver {}

#[cfg(test)]
mod tests {
    use super::{EventObserver, NoopObserver};
    use static_assertions::{assert_impl_all, assert_obj_safe};
    use std::fmt::Debug;

    assert_impl_all!(NoopObserver: Clone, Copy, Debug, Default, Send, Sync);
    assert_obj_safe!(EventObserver);
}
