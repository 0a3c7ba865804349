//! Gateway connection metadata fetched from the HTTP API.
//!
//! The `/gateway/bot` endpoint names the URL to connect to, the recommended
//! shard count, and the session-start budget. Fetching it is left to a
//! provider implemented outside this crate; here the result is cached per
//! process and refreshed ahead of fresh identifies so the advertised limits
//! stay current.

use serde::Deserialize;
use std::{
    error::Error,
    fmt::{Debug, Display, Formatter, Result as FmtResult},
    future::Future,
    pin::Pin,
    sync::Arc,
};
use tokio::sync::Mutex;

/// Connection metadata for the bot, as served by `/gateway/bot`.
#[derive(Clone, Debug, Deserialize)]
pub struct GatewayBot {
    /// Base URL to open gateway connections against.
    pub url: String,
    /// Recommended number of shards.
    pub shards: u32,
    /// Session-start budget and concurrency limit.
    pub session_start_limit: SessionStartLimit,
}

/// Limits on starting new gateway sessions.
#[derive(Clone, Debug, Deserialize)]
pub struct SessionStartLimit {
    /// Total number of session starts allowed per reset window.
    pub total: u64,
    /// Remaining session starts in the current window.
    pub remaining: u64,
    /// Milliseconds until the budget resets.
    pub reset_after: u64,
    /// Number of identify buckets that may start sessions concurrently.
    pub max_concurrency: u16,
}

/// Source of gateway connection metadata.
pub trait GatewayInfoProvider: Debug + Send + Sync {
    /// Fetch `/gateway/bot`.
    fn gateway_bot(&self) -> Pin<Box<dyn Future<Output = Result<GatewayBot, InfoError>> + Send + '_>>;
}

/// Per-process cache over a [`GatewayInfoProvider`].
#[derive(Debug)]
pub struct GatewayMeta {
    provider: Arc<dyn GatewayInfoProvider>,
    cached: Mutex<Option<GatewayBot>>,
}

impl GatewayMeta {
    /// Create an empty cache over a provider.
    pub fn new(provider: Arc<dyn GatewayInfoProvider>) -> Self {
        Self {
            provider,
            cached: Mutex::new(None),
        }
    }

    /// Cached metadata, fetching it on first use.
    ///
    /// # Errors
    ///
    /// Returns the provider's error if nothing is cached and the fetch fails.
    pub async fn get(&self) -> Result<GatewayBot, InfoError> {
        let mut cached = self.cached.lock().await;

        if let Some(info) = cached.as_ref() {
            return Ok(info.clone());
        }

        let info = self.provider.gateway_bot().await?;
        *cached = Some(info.clone());

        Ok(info)
    }

    /// Fetch fresh metadata, falling back to the cache if the fetch fails.
    ///
    /// Fresh identifies refresh so that the advertised session budget is
    /// current; a transient HTTP failure shouldn't take the fleet down when
    /// a previous answer is available.
    ///
    /// # Errors
    ///
    /// Returns the provider's error if the fetch fails and nothing is cached.
    pub async fn refresh(&self) -> Result<GatewayBot, InfoError> {
        let mut cached = self.cached.lock().await;

        match self.provider.gateway_bot().await {
            Ok(info) => {
                *cached = Some(info.clone());

                Ok(info)
            }
            Err(source) => {
                if let Some(info) = cached.as_ref() {
                    tracing::warn!(error = %source, "using cached gateway info after failed refresh");

                    return Ok(info.clone());
                }

                Err(source)
            }
        }
    }
}

/// Fetching gateway metadata failed.
#[derive(Debug)]
pub struct InfoError {
    kind: InfoErrorType,
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl InfoError {
    /// Create an error for a request that failed to complete.
    pub fn requesting(source: impl Error + Send + Sync + 'static) -> Self {
        Self {
            kind: InfoErrorType::Requesting,
            source: Some(Box::new(source)),
        }
    }

    /// Create an error for a response that couldn't be deserialized.
    pub fn deserializing(source: impl Error + Send + Sync + 'static) -> Self {
        Self {
            kind: InfoErrorType::Deserializing,
            source: Some(Box::new(source)),
        }
    }

    /// Immutable reference to the type of error that occurred.
    #[must_use = "retrieving the type has no effect if left unused"]
    pub const fn kind(&self) -> &InfoErrorType {
        &self.kind
    }
}

impl Display for InfoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.kind {
            InfoErrorType::Deserializing => f.write_str("gateway info payload isn't recognized"),
            InfoErrorType::Requesting => f.write_str("gateway info request failed to complete"),
        }
    }
}

impl Error for InfoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn Error + 'static))
    }
}

/// Type of [`InfoError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum InfoErrorType {
    /// The response body couldn't be deserialized.
    Deserializing,
    /// The request failed to complete.
    Requesting,
}

#[cfg(test)]
mod tests {
    use super::{GatewayBot, GatewayInfoProvider, GatewayMeta, InfoError, InfoErrorType};
    use static_assertions::{assert_impl_all, assert_obj_safe};
    use std::{
        fmt::Debug,
        future::Future,
        pin::Pin,
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
    };

    assert_impl_all!(GatewayBot: Clone, Debug, Send, Sync);
    assert_impl_all!(GatewayMeta: Debug, Send, Sync);
    assert_obj_safe!(GatewayInfoProvider);

    #[derive(Debug, Default)]
    struct CountingProvider {
        calls: AtomicU32,
    }

    impl GatewayInfoProvider for CountingProvider {
        fn gateway_bot(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<GatewayBot, InfoError>> + Send + '_>> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            Box::pin(async {
                serde_json::from_str::<GatewayBot>(
                    r#"{
                        "url": "wss://gateway.discord.gg",
                        "shards": 2,
                        "session_start_limit": {
                            "total": 1000,
                            "remaining": 997,
                            "reset_after": 3600000,
                            "max_concurrency": 1
                        }
                    }"#,
                )
                .map_err(InfoError::deserializing)
            })
        }
    }

    #[tokio::test]
    async fn get_caches_and_refresh_fetches() {
        let provider = Arc::new(CountingProvider::default());
        let meta = GatewayMeta::new(Arc::clone(&provider) as Arc<dyn GatewayInfoProvider>);

        let info = meta.get().await.unwrap();
        assert_eq!(2, info.shards);
        assert_eq!(1, info.session_start_limit.max_concurrency);

        meta.get().await.unwrap();
        assert_eq!(1, provider.calls.load(std::sync::atomic::Ordering::SeqCst));

        meta.refresh().await.unwrap();
        assert_eq!(2, provider.calls.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn error_kinds() {
        let error = InfoError::requesting(std::io::Error::new(std::io::ErrorKind::Other, "nope"));
        assert!(matches!(error.kind(), InfoErrorType::Requesting));
    }
}
