//! Persistence of per-shard session state.
//!
//! Stores keep `(session_id, last_seq)` per shard so a process restart, or a
//! shard migrating between server instances, can resume sessions instead of
//! burning identify budget. The in-memory store covers single-process runs;
//! the Redis store is shared by a whole fleet and therefore enforces its
//! sequence updates server-side.

use std::{
    collections::HashMap,
    error::Error,
    fmt::{Debug, Display, Formatter, Result as FmtResult},
    future::Future,
    pin::Pin,
    sync::RwLock,
};

use redis::{aio::ConnectionManager, AsyncCommands, Script};

/// Future resolved by [`SessionStore`] operations.
pub type StoreFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Storage of shard session records.
///
/// `set_seq` is an atomic max: the stored value only ever moves forward, for
/// any interleaving of writers. Implementations shared between processes must
/// enforce this on the storage side.
pub trait SessionStore: Debug + Send + Sync {
    /// Last persisted sequence for a shard.
    fn seq(&self, shard_id: u32) -> StoreFuture<'_, Option<u64>>;

    /// Raise the persisted sequence to `max(stored, seq)`.
    fn set_seq(&self, shard_id: u32, seq: u64) -> StoreFuture<'_, ()>;

    /// Persisted session identifier for a shard.
    fn session(&self, shard_id: u32) -> StoreFuture<'_, Option<String>>;

    /// Persist the session identifier for a shard.
    fn set_session(&self, shard_id: u32, session_id: String) -> StoreFuture<'_, ()>;

    /// Remove the persisted session identifier for a shard.
    fn clear_session(&self, shard_id: u32) -> StoreFuture<'_, ()>;
}

/// Process-local store backed by a reader-writer lock.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    records: RwLock<HashMap<u32, ShardRecord>>,
}

#[derive(Debug, Default)]
struct ShardRecord {
    seq: Option<u64>,
    session: Option<String>,
}

impl InMemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn seq(&self, shard_id: u32) -> StoreFuture<'_, Option<u64>> {
        Box::pin(async move {
            let records = self.records.read().expect("session store poisoned");

            Ok(records.get(&shard_id).and_then(|record| record.seq))
        })
    }

    fn set_seq(&self, shard_id: u32, seq: u64) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut records = self.records.write().expect("session store poisoned");
            let record = records.entry(shard_id).or_default();

            if record.seq.map_or(true, |current| seq > current) {
                record.seq = Some(seq);
            }

            Ok(())
        })
    }

    fn session(&self, shard_id: u32) -> StoreFuture<'_, Option<String>> {
        Box::pin(async move {
            let records = self.records.read().expect("session store poisoned");

            Ok(records
                .get(&shard_id)
                .and_then(|record| record.session.clone()))
        })
    }

    fn set_session(&self, shard_id: u32, session_id: String) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut records = self.records.write().expect("session store poisoned");
            records.entry(shard_id).or_default().session = Some(session_id);

            Ok(())
        })
    }

    fn clear_session(&self, shard_id: u32) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut records = self.records.write().expect("session store poisoned");

            if let Some(record) = records.get_mut(&shard_id) {
                record.session = None;
            }

            Ok(())
        })
    }
}

/// Server-side compare-and-set-if-greater, so concurrent writers from
/// different processes can never move a sequence backwards.
const SET_SEQ_SCRIPT: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]))
if current == nil or tonumber(ARGV[1]) > current then
    redis.call('SET', KEYS[1], ARGV[1])
end
return redis.call('GET', KEYS[1])
";

/// Fleet-shared store backed by Redis.
///
/// Records live under `{prefix}{shard_id}:seq` and `{prefix}{shard_id}:session`.
pub struct RedisSessionStore {
    conn: ConnectionManager,
    prefix: Box<str>,
    set_seq: Script,
}

impl RedisSessionStore {
    /// Create a store over an established connection.
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into().into_boxed_str(),
            set_seq: Script::new(SET_SEQ_SCRIPT),
        }
    }

    /// Connect to Redis and create a store.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreErrorType::Backend`] error type if the connection
    /// couldn't be established.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(StoreError::backend)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(StoreError::backend)?;

        Ok(Self::new(conn, prefix))
    }

    fn key(&self, shard_id: u32, field: &str) -> String {
        shard_key(&self.prefix, shard_id, field)
    }
}

impl Debug for RedisSessionStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("RedisSessionStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl SessionStore for RedisSessionStore {
    fn seq(&self, shard_id: u32) -> StoreFuture<'_, Option<u64>> {
        let key = self.key(shard_id, "seq");
        let mut conn = self.conn.clone();

        Box::pin(async move {
            conn.get::<_, Option<u64>>(key)
                .await
                .map_err(StoreError::backend)
        })
    }

    fn set_seq(&self, shard_id: u32, seq: u64) -> StoreFuture<'_, ()> {
        let key = self.key(shard_id, "seq");
        let mut conn = self.conn.clone();

        Box::pin(async move {
            self.set_seq
                .key(key)
                .arg(seq)
                .invoke_async::<_, redis::Value>(&mut conn)
                .await
                .map(|_| ())
                .map_err(StoreError::backend)
        })
    }

    fn session(&self, shard_id: u32) -> StoreFuture<'_, Option<String>> {
        let key = self.key(shard_id, "session");
        let mut conn = self.conn.clone();

        Box::pin(async move {
            conn.get::<_, Option<String>>(key)
                .await
                .map_err(StoreError::backend)
        })
    }

    fn set_session(&self, shard_id: u32, session_id: String) -> StoreFuture<'_, ()> {
        let key = self.key(shard_id, "session");
        let mut conn = self.conn.clone();

        Box::pin(async move {
            conn.set(key, session_id).await.map_err(StoreError::backend)
        })
    }

    fn clear_session(&self, shard_id: u32) -> StoreFuture<'_, ()> {
        let key = self.key(shard_id, "session");
        let mut conn = self.conn.clone();

        Box::pin(async move { conn.del(key).await.map_err(StoreError::backend) })
    }
}

fn shard_key(prefix: &str, shard_id: u32, field: &str) -> String {
    format!("{prefix}{shard_id}:{field}")
}

/// A session store operation failed.
#[derive(Debug)]
pub struct StoreError {
    pub(crate) kind: StoreErrorType,
    pub(crate) source: Option<Box<dyn Error + Send + Sync>>,
}

impl StoreError {
    /// Immutable reference to the type of error that occurred.
    #[must_use = "retrieving the type has no effect if left unused"]
    pub const fn kind(&self) -> &StoreErrorType {
        &self.kind
    }

    fn backend(source: impl Error + Send + Sync + 'static) -> Self {
        Self {
            kind: StoreErrorType::Backend,
            source: Some(Box::new(source)),
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.kind {
            StoreErrorType::Backend => f.write_str("the storage backend failed"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn Error + 'static))
    }
}

/// Type of [`StoreError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum StoreErrorType {
    /// The storage backend failed or is unreachable.
    Backend,
}

#[cfg(test)]
mod tests {
    use super::{shard_key, InMemorySessionStore, SessionStore};
    use static_assertions::{assert_impl_all, assert_obj_safe};
    use std::fmt::Debug;

    assert_impl_all!(InMemorySessionStore: Debug, Default, Send, Sync);
    assert_obj_safe!(SessionStore);

    #[tokio::test]
    async fn seq_is_atomic_max() {
        let store = InMemorySessionStore::new();

        store.set_seq(0, 5).await.unwrap();
        store.set_seq(0, 3).await.unwrap();
        assert_eq!(Some(5), store.seq(0).await.unwrap());

        store.set_seq(0, 9).await.unwrap();
        assert_eq!(Some(9), store.seq(0).await.unwrap());

        // Shards don't share records.
        assert_eq!(None, store.seq(1).await.unwrap());
    }

    #[tokio::test]
    async fn session_round_trip() {
        let store = InMemorySessionStore::new();

        assert_eq!(None, store.session(2).await.unwrap());

        store.set_session(2, "abc".to_owned()).await.unwrap();
        assert_eq!(Some("abc".to_owned()), store.session(2).await.unwrap());

        store.clear_session(2).await.unwrap();
        assert_eq!(None, store.session(2).await.unwrap());
    }

    #[test]
    fn redis_key_layout() {
        assert_eq!("gateway:3:seq", shard_key("gateway:", 3, "seq"));
        assert_eq!("0:session", shard_key("", 0, "session"));
    }
}
