//! Injectable metrics surface.
//!
//! Shards and the manager record observations through a [`Collector`] so
//! tests can watch behavior without global state. Production wires the
//! [`MetricsCollector`], which forwards to the process-wide `metrics`
//! recorder; the binary installs a Prometheus exporter as that recorder.

use crate::config::ShardId;
use std::{fmt::Debug, time::Duration};

/// Sink for the gateway's operational observations.
pub trait Collector: Debug + Send + Sync {
    /// A packet arrived from the gateway.
    fn packet_received(&self, shard: ShardId, op: u8, event: Option<&str>);

    /// A packet was written to the gateway.
    fn packet_sent(&self, shard: ShardId, op: u8);

    /// A shard entered (`true`) or left (`false`) its running state.
    fn shard_alive(&self, shard: ShardId, alive: bool);

    /// Total number of shards the bot is running with.
    fn total_shards(&self, total: u32);

    /// A heartbeat round trip completed.
    fn heartbeat_rtt(&self, shard: ShardId, rtt: Duration);
}

/// Collector that discards every observation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCollector;

impl Collector for NoopCollector {
    fn packet_received(&self, _: ShardId, _: u8, _: Option<&str>) {}

    fn packet_sent(&self, _: ShardId, _: u8) {}

    fn shard_alive(&self, _: ShardId, _: bool) {}

    fn total_shards(&self, _: u32) {}

    fn heartbeat_rtt(&self, _: ShardId, _: Duration) {}
}

/// Collector forwarding to the process-wide `metrics` recorder.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsCollector;

impl Collector for MetricsCollector {
    fn packet_received(&self, shard: ShardId, op: u8, event: Option<&str>) {
        metrics::counter!(
            "gateway_packets_received",
            1,
            "t" => event.unwrap_or_default().to_owned(),
            "op" => op.to_string(),
            "shard" => shard.number().to_string(),
        );
    }

    fn packet_sent(&self, shard: ShardId, op: u8) {
        metrics::counter!(
            "gateway_packets_sent",
            1,
            "t" => String::new(),
            "op" => op.to_string(),
            "shard" => shard.number().to_string(),
        );
    }

    fn shard_alive(&self, shard: ShardId, alive: bool) {
        metrics::gauge!(
            "gateway_shards_alive",
            if alive { 1.0 } else { 0.0 },
            "id" => shard.number().to_string(),
        );
    }

    fn total_shards(&self, total: u32) {
        metrics::gauge!("gateway_total_shards", f64::from(total));
    }

    fn heartbeat_rtt(&self, shard: ShardId, rtt: Duration) {
        metrics::histogram!(
            "gateway_ping",
            rtt.as_secs_f64() * 1_000.0,
            "id" => shard.number().to_string(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{Collector, MetricsCollector, NoopCollector};
    use static_assertions::{assert_impl_all, assert_obj_safe};
    use std::fmt::Debug;

    assert_impl_all!(NoopCollector: Clone, Copy, Debug, Default, Send, Sync);
    assert_impl_all!(MetricsCollector: Clone, Copy, Debug, Default, Send, Sync);
    assert_obj_safe!(Collector);
}
