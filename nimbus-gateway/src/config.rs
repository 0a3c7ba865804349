//! Customizable configuration for shards.

use crate::{compression::CompressionAlgorithm, intents::Intents, packet::IdentifyProperties};
use serde_json::Value;
use std::fmt::{Display, Formatter, Result as FmtResult};

/// Maximum value of an acceptable [large threshold].
///
/// [large threshold]: ConfigBuilder::large_threshold
pub const LARGE_THRESHOLD_MAXIMUM: u64 = 250;

/// Minimum value of an acceptable [large threshold].
///
/// [large threshold]: ConfigBuilder::large_threshold
pub const LARGE_THRESHOLD_MINIMUM: u64 = 50;

/// Identifier of a shard, pairing its ID with the total number of shards in
/// use by the bot.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ShardId {
    /// ID of the shard, 0-indexed.
    number: u32,
    /// Total number of shards used by the bot, 1-indexed.
    total: u32,
}

impl ShardId {
    /// ID of a bot that has only one shard.
    pub const ONE: ShardId = ShardId::new(0, 1);

    /// Create a new identifier for a shard.
    ///
    /// The shard ID is 0-indexed while the total is 1-indexed, so a shard ID
    /// of 7 with a total of 8 is valid while 8 of 8 is not.
    ///
    /// # Panics
    ///
    /// Panics if the shard ID isn't less than the total, or if the total is
    /// zero.
    pub const fn new(number: u32, total: u32) -> Self {
        assert!(total > 0, "total must be greater than zero");
        assert!(
            number < total,
            "shard id (0-indexed) must be less than the total (1-indexed)",
        );

        Self { number, total }
    }

    /// Create a new identifier if the indexes are valid.
    pub const fn new_checked(number: u32, total: u32) -> Option<Self> {
        if total > 0 && number < total {
            Some(Self { number, total })
        } else {
            None
        }
    }

    /// ID of the shard, 0-indexed.
    pub const fn number(self) -> u32 {
        self.number
    }

    /// Total number of shards, 1-indexed.
    pub const fn total(self) -> u32 {
        self.total
    }
}

/// Display the shard ID.
///
/// Formats as `shard {number}/{total}`.
impl Display for ShardId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str("shard ")?;
        Display::fmt(&self.number, f)?;
        f.write_str("/")?;

        Display::fmt(&self.total, f)
    }
}

/// Configuration shared by every shard of a process.
///
/// Use [`Config::builder`] to start configuring shards.
#[derive(Clone, Debug)]
pub struct Config {
    /// Transport compression to request, if any.
    compression: Option<CompressionAlgorithm>,
    /// Gateway API version to request.
    gateway_version: u8,
    /// Identification properties shards will use.
    identify_properties: IdentifyProperties,
    /// Intents requested when identifying.
    intents: Intents,
    /// When the gateway will stop sending a guild's member list in Guild
    /// Create events.
    large_threshold: u64,
    /// Presence to set when identifying, passed through undecoded.
    presence: Option<Value>,
    /// Token used to authenticate when identifying.
    token: Box<str>,
}

impl Config {
    /// Create a new default configuration.
    ///
    /// Shortcut for calling [`builder`][`Self::builder`] and immediately
    /// finalizing the builder.
    pub fn new(token: String, intents: Intents) -> Self {
        Self::builder(token, intents).build()
    }

    /// Create a builder to customize the shard configuration.
    pub fn builder(token: String, intents: Intents) -> ConfigBuilder {
        ConfigBuilder::new(token, intents)
    }

    /// Transport compression to request, if any.
    pub const fn compression(&self) -> Option<CompressionAlgorithm> {
        self.compression
    }

    /// Gateway API version to request.
    pub const fn gateway_version(&self) -> u8 {
        self.gateway_version
    }

    /// Identification properties shards will use.
    pub const fn identify_properties(&self) -> &IdentifyProperties {
        &self.identify_properties
    }

    /// Intents requested when identifying.
    pub const fn intents(&self) -> Intents {
        self.intents
    }

    /// Member-list threshold sent when identifying.
    pub const fn large_threshold(&self) -> u64 {
        self.large_threshold
    }

    /// Presence to set when identifying.
    pub const fn presence(&self) -> Option<&Value> {
        self.presence.as_ref()
    }

    /// Token used to authenticate, including the `Bot ` prefix.
    pub const fn token(&self) -> &str {
        &self.token
    }
}

/// Builder to customize the operation of shards.
#[derive(Debug)]
#[must_use = "builder must be completed to be used"]
pub struct ConfigBuilder {
    inner: Config,
}

impl ConfigBuilder {
    /// Create a new builder.
    ///
    /// Refer to each method to learn their default values.
    pub fn new(mut token: String, intents: Intents) -> Self {
        if !token.starts_with("Bot ") {
            token.insert_str(0, "Bot ");
        }

        Self {
            inner: Config {
                compression: default_compression(),
                gateway_version: crate::API_VERSION,
                identify_properties: IdentifyProperties::default(),
                intents,
                large_threshold: 50,
                presence: None,
                token: token.into_boxed_str(),
            },
        }
    }

    /// Consume the builder, constructing the configuration.
    #[allow(clippy::missing_const_for_fn)]
    pub fn build(self) -> Config {
        self.inner
    }

    /// Set the transport compression to request.
    ///
    /// Defaults to zlib when a zlib feature is enabled, otherwise to no
    /// compression.
    pub const fn compression(mut self, compression: Option<CompressionAlgorithm>) -> Self {
        self.inner.compression = compression;

        self
    }

    /// Set the gateway API version to request. Defaults to
    /// [`API_VERSION`][`crate::API_VERSION`].
    pub const fn gateway_version(mut self, version: u8) -> Self {
        self.inner.gateway_version = version;

        self
    }

    /// Set the properties to identify with.
    #[allow(clippy::missing_const_for_fn)]
    pub fn identify_properties(mut self, identify_properties: IdentifyProperties) -> Self {
        self.inner.identify_properties = identify_properties;

        self
    }

    /// Set the maximum guild size at which the gateway stops sending member
    /// lists.
    ///
    /// Default value is `50`.
    ///
    /// # Panics
    ///
    /// Panics if the provided value is below 50 or above 250.
    pub const fn large_threshold(mut self, large_threshold: u64) -> Self {
        assert!(
            large_threshold >= LARGE_THRESHOLD_MINIMUM
                && large_threshold <= LARGE_THRESHOLD_MAXIMUM,
            "large threshold isn't in the accepted range",
        );

        self.inner.large_threshold = large_threshold;

        self
    }

    /// Set the presence to use when identifying.
    ///
    /// The value is passed through to the gateway undecoded. Default is no
    /// presence, which the gateway treats as plainly being online.
    #[allow(clippy::missing_const_for_fn)]
    pub fn presence(mut self, presence: Value) -> Self {
        self.inner.presence = Some(presence);

        self
    }
}

const fn default_compression() -> Option<CompressionAlgorithm> {
    #[cfg(any(feature = "zlib-stock", feature = "zlib-simd"))]
    {
        Some(CompressionAlgorithm::Zlib)
    }

    #[cfg(not(any(feature = "zlib-stock", feature = "zlib-simd")))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, ShardId};
    use crate::intents::Intents;
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;

    assert_impl_all!(Config: Clone, Debug, Send, Sync);
    assert_impl_all!(ShardId: Clone, Copy, Debug, Eq, PartialEq, Send, Sync);

    #[test]
    const fn shard_id() {
        let id = ShardId::new(2, 4);

        assert!(id.number() == 2);
        assert!(id.total() == 4);
    }

    #[should_panic(expected = "less than the total")]
    #[test]
    const fn shard_id_number_equal_invalid() {
        ShardId::new(4, 4);
    }

    #[test]
    const fn shard_id_new_checked() {
        assert!(ShardId::new_checked(0, 1).is_some());
        assert!(ShardId::new_checked(1, 1).is_none());
        assert!(ShardId::new_checked(0, 0).is_none());
    }

    #[test]
    fn shard_id_display() {
        assert_eq!("shard 0/1", ShardId::ONE.to_string());
        assert_eq!("shard 13/102", ShardId::new(13, 102).to_string());
    }

    #[test]
    fn token_is_prefixed() {
        let config = Config::new("abc123".to_owned(), Intents::empty());
        assert_eq!("Bot abc123", config.token());

        let config = Config::new("Bot abc123".to_owned(), Intents::empty());
        assert_eq!("Bot abc123", config.token());
    }
}
