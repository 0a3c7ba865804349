//! Ownership and supervision of every shard assigned to this process.

use crate::{
    channel::{CommandChannel, ShardSender},
    config::{Config, ShardId},
    info::{GatewayInfoProvider, GatewayMeta},
    metrics::Collector,
    observer::EventObserver,
    packet::SendPacket,
    queue::{LocalQueue, Queue},
    shard::{Shard, ShardContext},
    store::SessionStore,
};
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::{
    collections::HashMap,
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
    sync::{Arc, RwLock},
};
use tokio::sync::watch;

/// How the shard space is split across server instances.
///
/// A process owns shard `i` when `i mod server_count == server_index`, unless
/// an explicit sparse ID list overrides the arithmetic.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShardScheme {
    /// Total number of shards, or 0 to use the gateway's recommendation.
    pub count: u32,
    /// Explicit shard IDs owned by this process, overriding the split.
    pub ids: Option<Vec<u32>>,
    /// Index of this server instance, 0-based.
    pub server_index: u32,
    /// Number of server instances sharing the shard space.
    pub server_count: u32,
}

impl ShardScheme {
    /// Final shard total, given the gateway's recommendation.
    pub const fn resolve_total(&self, recommended: u32) -> u32 {
        if self.count == 0 {
            recommended
        } else {
            self.count
        }
    }

    /// Shard IDs this process owns out of `total`.
    pub fn assigned(&self, total: u32) -> Vec<u32> {
        if let Some(ids) = &self.ids {
            let (valid, invalid): (Vec<u32>, Vec<u32>) =
                ids.iter().copied().partition(|id| *id < total);

            if !invalid.is_empty() {
                tracing::warn!(?invalid, total, "ignoring configured shard ids beyond the total");
            }

            return valid;
        }

        let server_count = self.server_count.max(1);

        (0..total)
            .filter(|id| id % server_count == self.server_index)
            .collect()
    }
}

impl Default for ShardScheme {
    fn default() -> Self {
        Self {
            count: 0,
            ids: None,
            server_index: 0,
            server_count: 1,
        }
    }
}

/// Shard layout of a started manager.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Topology {
    /// Total number of shards across all server instances.
    pub shard_total: u32,
    /// Shard IDs owned by this process.
    pub owned: Vec<u32>,
}

#[derive(Debug)]
struct HandleInner {
    senders: RwLock<HashMap<u32, ShardSender>>,
    topology_tx: watch::Sender<Option<Topology>>,
    topology_rx: watch::Receiver<Option<Topology>>,
}

/// Cloneable handle for routing commands to a running manager's shards.
#[derive(Clone, Debug)]
pub struct ManagerHandle {
    inner: Arc<HandleInner>,
}

impl ManagerHandle {
    fn new() -> Self {
        let (topology_tx, topology_rx) = watch::channel(None);

        Self {
            inner: Arc::new(HandleInner {
                senders: RwLock::new(HashMap::new()),
                topology_tx,
                topology_rx,
            }),
        }
    }

    /// Sender for a locally owned shard, if it is alive.
    pub fn sender(&self, shard_id: u32) -> Option<ShardSender> {
        self.inner
            .senders
            .read()
            .expect("sender map poisoned")
            .get(&shard_id)
            .cloned()
    }

    /// Queue a command for delivery over the owning shard.
    ///
    /// # Errors
    ///
    /// Returns a [`ManagerErrorType::ShardNotOwned`] error type if this
    /// process doesn't own a live shard with the given ID, and a
    /// [`ManagerErrorType::Sending`] error type if the shard shut down while
    /// the command was queued.
    pub fn send(&self, shard_id: u32, packet: SendPacket) -> Result<(), ManagerError> {
        let sender = self.sender(shard_id).ok_or(ManagerError {
            kind: ManagerErrorType::ShardNotOwned { id: shard_id },
            source: None,
        })?;

        sender.send(packet).map_err(|source| ManagerError {
            kind: ManagerErrorType::Sending,
            source: Some(Box::new(source)),
        })
    }

    /// Shard layout, available once the manager has fetched gateway metadata
    /// and spawned its shards.
    pub async fn topology(&self) -> Option<Topology> {
        let mut rx = self.inner.topology_rx.clone();

        loop {
            if let Some(topology) = rx.borrow().clone() {
                return Some(topology);
            }

            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    fn insert(&self, shard_id: u32, sender: ShardSender) {
        self.inner
            .senders
            .write()
            .expect("sender map poisoned")
            .insert(shard_id, sender);
    }

    fn remove(&self, shard_id: u32) {
        self.inner
            .senders
            .write()
            .expect("sender map poisoned")
            .remove(&shard_id);
    }

    fn publish_topology(&self, topology: Topology) {
        let _ = self.inner.topology_tx.send(Some(topology));
    }
}

/// Supervisor owning every shard assigned to this process.
///
/// Each shard runs its own reconnect loop independently; the manager only
/// fetches gateway metadata, spawns the assigned shards, and waits for all of
/// them to exit. A terminally closed shard is removed from the routing map
/// while its siblings keep running.
#[derive(Debug)]
pub struct Manager {
    config: Arc<Config>,
    scheme: ShardScheme,
    gateway: Arc<GatewayMeta>,
    store: Arc<dyn SessionStore>,
    collector: Arc<dyn Collector>,
    observer: Arc<dyn EventObserver>,
    handle: ManagerHandle,
}

impl Manager {
    /// Create a manager. Shards are spawned by [`start`][`Self::start`].
    pub fn new(
        config: Config,
        scheme: ShardScheme,
        provider: Arc<dyn GatewayInfoProvider>,
        store: Arc<dyn SessionStore>,
        collector: Arc<dyn Collector>,
        observer: Arc<dyn EventObserver>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            scheme,
            gateway: Arc::new(GatewayMeta::new(provider)),
            store,
            collector,
            observer,
            handle: ManagerHandle::new(),
        }
    }

    /// Handle for routing commands to this manager's shards.
    pub fn handle(&self) -> ManagerHandle {
        self.handle.clone()
    }

    /// Fetch gateway metadata, spawn every assigned shard, and block until
    /// all of them have exited.
    ///
    /// # Errors
    ///
    /// Returns a [`ManagerErrorType::GatewayInfo`] error type if the initial
    /// metadata fetch failed, and a [`ManagerErrorType::FatalShards`] error
    /// type if any shard terminated abnormally.
    pub async fn start(&mut self, shutdown: watch::Receiver<bool>) -> Result<(), ManagerError> {
        let info = self.gateway.refresh().await.map_err(|source| ManagerError {
            kind: ManagerErrorType::GatewayInfo,
            source: Some(Box::new(source)),
        })?;

        let total = self.scheme.resolve_total(info.shards);
        let owned = self.scheme.assigned(total);

        tracing::info!(
            shard_total = total,
            owned = owned.len(),
            max_concurrency = info.session_start_limit.max_concurrency,
            remaining_starts = info.session_start_limit.remaining,
            "starting shards",
        );

        self.collector.total_shards(total);

        let context = ShardContext {
            queue: Arc::new(LocalQueue::new(info.session_start_limit.max_concurrency))
                as Arc<dyn Queue>,
            store: Arc::clone(&self.store),
            collector: Arc::clone(&self.collector),
            observer: Arc::clone(&self.observer),
            gateway: Arc::clone(&self.gateway),
        };

        let mut tasks = FuturesUnordered::new();

        for &id in &owned {
            let (rx, sender) = CommandChannel::new().into_rx();
            self.handle.insert(id, sender);

            let shard = Shard::new(
                ShardId::new(id, total),
                Arc::clone(&self.config),
                context.clone(),
            );
            let task = tokio::spawn(shard.run(rx, shutdown.clone()));

            tasks.push(async move { (id, task.await) });
        }

        self.handle.publish_topology(Topology {
            shard_total: total,
            owned,
        });

        let mut fatal: u32 = 0;

        while let Some((id, result)) = tasks.next().await {
            self.handle.remove(id);

            match result {
                Ok(Ok(())) => tracing::info!(shard = id, "shard shut down cleanly"),
                Ok(Err(_)) => {
                    // The shard already logged and notified the observer.
                    fatal += 1;
                }
                Err(source) => {
                    tracing::error!(shard = id, error = %source, "shard task failed");
                    fatal += 1;
                }
            }
        }

        if fatal > 0 {
            return Err(ManagerError {
                kind: ManagerErrorType::FatalShards { count: fatal },
                source: None,
            });
        }

        Ok(())
    }
}

/// A manager operation failed.
#[derive(Debug)]
pub struct ManagerError {
    pub(crate) kind: ManagerErrorType,
    pub(crate) source: Option<Box<dyn Error + Send + Sync>>,
}

impl ManagerError {
    /// Immutable reference to the type of error that occurred.
    #[must_use = "retrieving the type has no effect if left unused"]
    pub const fn kind(&self) -> &ManagerErrorType {
        &self.kind
    }

    /// Consume the error, returning the owned error type and the source error.
    #[must_use = "consuming the error into its parts has no effect if left unused"]
    pub fn into_parts(self) -> (ManagerErrorType, Option<Box<dyn Error + Send + Sync>>) {
        (self.kind, self.source)
    }
}

impl Display for ManagerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.kind {
            ManagerErrorType::FatalShards { count } => {
                Display::fmt(&count, f)?;

                f.write_str(" shard(s) terminated abnormally")
            }
            ManagerErrorType::GatewayInfo => f.write_str("fetching gateway metadata failed"),
            ManagerErrorType::Sending => f.write_str("the owning shard has shut down"),
            ManagerErrorType::ShardNotOwned { id } => {
                f.write_str("shard ")?;
                Display::fmt(&id, f)?;

                f.write_str(" isn't owned by this process")
            }
        }
    }
}

impl Error for ManagerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn Error + 'static))
    }
}

/// Type of [`ManagerError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum ManagerErrorType {
    /// One or more shards terminated abnormally.
    FatalShards {
        /// Number of shards that terminated abnormally.
        count: u32,
    },
    /// Gateway metadata couldn't be fetched.
    GatewayInfo,
    /// The owning shard shut down while the command was queued.
    Sending,
    /// No live shard with the given ID is owned by this process.
    ShardNotOwned {
        /// The requested shard ID.
        id: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::{Manager, ManagerError, ManagerErrorType, ManagerHandle, ShardScheme, Topology};
    use crate::packet::SendPacket;
    use static_assertions::assert_impl_all;
    use std::{error::Error, fmt::Debug};

    assert_impl_all!(Manager: Debug, Send, Sync);
    assert_impl_all!(ManagerHandle: Clone, Debug, Send, Sync);
    assert_impl_all!(ManagerError: Error, Send, Sync);
    assert_impl_all!(ShardScheme: Clone, Debug, Eq, PartialEq, Send, Sync);
    assert_impl_all!(Topology: Clone, Debug, Eq, PartialEq, Send, Sync);

    #[test]
    fn scheme_splits_by_server() {
        let first = ShardScheme {
            server_index: 0,
            server_count: 2,
            ..ShardScheme::default()
        };
        let second = ShardScheme {
            server_index: 1,
            server_count: 2,
            ..ShardScheme::default()
        };

        assert_eq!(vec![0, 2, 4], first.assigned(5));
        assert_eq!(vec![1, 3], second.assigned(5));
    }

    #[test]
    fn scheme_single_server_owns_everything() {
        let scheme = ShardScheme::default();

        assert_eq!(vec![0, 1, 2], scheme.assigned(3));
    }

    #[test]
    fn scheme_explicit_ids_win() {
        let scheme = ShardScheme {
            ids: Some(vec![1, 3, 9]),
            server_index: 0,
            server_count: 2,
            ..ShardScheme::default()
        };

        assert_eq!(vec![1, 3], scheme.assigned(4));
    }

    #[test]
    fn scheme_resolves_total() {
        let auto = ShardScheme::default();
        assert_eq!(8, auto.resolve_total(8));

        let pinned = ShardScheme {
            count: 16,
            ..ShardScheme::default()
        };
        assert_eq!(16, pinned.resolve_total(8));
    }

    #[test]
    fn handle_send_requires_ownership() {
        let handle = ManagerHandle::new();
        let error = handle.send(3, SendPacket::heartbeat(None)).unwrap_err();

        assert!(matches!(
            error.kind(),
            ManagerErrorType::ShardNotOwned { id: 3 },
        ));
    }
}
