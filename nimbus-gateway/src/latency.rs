//! Heartbeat latency bookkeeping.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Maximum number of recent round-trip times to retain.
const RECENT_LEN: usize = 5;

/// Round-trip statistics of a shard's heartbeats.
///
/// A round trip is measured from sending a heartbeat to receiving its
/// acknowledgement. The most recent measurements feed the ping metric; the
/// running average is useful for operator-facing diagnostics.
#[derive(Clone, Debug)]
pub struct Latency {
    /// Number of acknowledged heartbeats over the shard's lifetime.
    heartbeats: u32,
    /// When the last acknowledgement was received.
    received: Option<Instant>,
    /// Most recent round-trip times, oldest first.
    recent: VecDeque<Duration>,
    /// When the last heartbeat was sent.
    sent: Option<Instant>,
    /// Combined round-trip time of all acknowledged heartbeats.
    total: Duration,
}

impl Latency {
    pub(crate) fn new() -> Self {
        Self {
            heartbeats: 0,
            received: None,
            recent: VecDeque::with_capacity(RECENT_LEN),
            sent: None,
            total: Duration::ZERO,
        }
    }

    /// Average round-trip time across the shard's lifetime.
    ///
    /// `None` until the first heartbeat has been acknowledged.
    pub fn average(&self) -> Option<Duration> {
        self.total.checked_div(self.heartbeats)
    }

    /// Number of heartbeats that have been acknowledged.
    pub const fn heartbeats(&self) -> u32 {
        self.heartbeats
    }

    /// Most recent round-trip times, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = Duration> + '_ {
        self.recent.iter().copied()
    }

    /// When the last acknowledgement was received.
    pub const fn received(&self) -> Option<Instant> {
        self.received
    }

    /// When the last heartbeat was sent.
    pub const fn sent(&self) -> Option<Instant> {
        self.sent
    }

    /// Record that a heartbeat was sent.
    pub(crate) fn track_sent(&mut self) {
        self.received = None;
        self.sent = Some(Instant::now());
    }

    /// Record an acknowledgement, returning the round trip it completes.
    pub(crate) fn track_received(&mut self) -> Option<Duration> {
        let now = Instant::now();
        self.received = Some(now);
        self.heartbeats += 1;

        let rtt = self.sent.map(|sent| now.saturating_duration_since(sent))?;

        self.total += rtt;

        if self.recent.len() == RECENT_LEN {
            self.recent.pop_front();
        }

        self.recent.push_back(rtt);

        Some(rtt)
    }
}

#[cfg(test)]
mod tests {
    use super::Latency;
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;

    assert_impl_all!(Latency: Clone, Debug, Send, Sync);

    #[test]
    fn round_trip_tracking() {
        let mut latency = Latency::new();

        assert!(latency.average().is_none());
        assert!(latency.track_received().is_none());

        latency.track_sent();
        assert!(latency.sent().is_some());
        assert!(latency.received().is_none());

        let rtt = latency.track_received();
        assert!(rtt.is_some());
        assert_eq!(2, latency.heartbeats());
        assert!(latency.average().is_some());
        assert_eq!(1, latency.recent().count());
    }

    #[test]
    fn recent_is_bounded() {
        let mut latency = Latency::new();

        for _ in 0..8 {
            latency.track_sent();
            latency.track_received();
        }

        assert_eq!(super::RECENT_LEN, latency.recent().count());
    }
}
