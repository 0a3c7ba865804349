//! Daemon configuration: a TOML file overridden by environment variables.

use anyhow::{bail, Context};
use nimbus_gateway::Intents;
use serde::Deserialize;
use std::{env, net::SocketAddr, path::Path, time::Duration};

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bot token. Required.
    pub token: String,
    /// Dispatch event names forwarded to the broker.
    pub events: Vec<String>,
    /// Symbolic intent names, unioned into the bitmask.
    pub intents: Vec<String>,
    /// Raw intent bitmask, overriding the symbolic names when nonzero.
    pub raw_intents: u64,
    /// Gateway API version. 0 means the default.
    pub gateway_version: u8,
    /// Transport compression: "zlib-stream", "zstd-stream", or "none".
    pub compression: Option<String>,
    /// Shard layout.
    pub shards: Shards,
    /// Index of this server instance, 0-based.
    pub server_index: u32,
    /// Number of server instances sharing the shard space.
    pub server_count: u32,
    /// Broker transport settings.
    pub broker: BrokerConfig,
    /// Session store settings.
    pub shard_store: ShardStore,
    /// Initial presence payload, passed to the gateway undecoded.
    pub presence: Option<toml::Value>,
    /// Prometheus exporter settings.
    pub prometheus: Prometheus,
}

/// Shard layout settings.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Shards {
    /// Total shard count; 0 uses the gateway's recommendation.
    pub count: u32,
    /// Explicit shard IDs owned by this process.
    pub ids: Vec<u32>,
}

/// Broker transport settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Transport to use.
    #[serde(rename = "type")]
    pub kind: BrokerKind,
    /// Connection URL for AMQP and Redis transports.
    pub url: String,
    /// Broker group: the AMQP exchange or Redis stream prefix.
    pub group: String,
    /// How long one delivery may wait on a shard send before its consumer
    /// slot is released, such as "30s" or "2m".
    pub message_timeout: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Amqp,
            url: "amqp://localhost".to_owned(),
            group: "gateway".to_owned(),
            message_timeout: "2m".to_owned(),
        }
    }
}

/// Broker transports.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// AMQP work queues.
    Amqp,
    /// Redis streams with consumer groups.
    Redis,
    /// Newline-delimited JSON on stdio.
    Stdio,
}

/// Session store settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShardStore {
    /// Store backend.
    #[serde(rename = "type")]
    pub kind: ShardStoreKind,
    /// Connection URL for the Redis backend.
    pub url: String,
    /// Key prefix for the Redis backend.
    pub prefix: String,
}

impl Default for ShardStore {
    fn default() -> Self {
        Self {
            kind: ShardStoreKind::Memory,
            url: "redis://localhost".to_owned(),
            prefix: String::new(),
        }
    }
}

/// Session store backends.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ShardStoreKind {
    /// Process-local memory; sessions don't survive restarts.
    Memory,
    /// Redis, shared across the fleet.
    Redis,
}

/// Prometheus exporter settings.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Prometheus {
    /// Listen address for the metrics endpoint; unset disables the exporter.
    pub address: Option<SocketAddr>,
    /// Path of the metrics endpoint.
    pub endpoint: String,
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides.
    ///
    /// A missing file isn't an error; everything can come from the
    /// environment.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;

            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env();

        Ok(config)
    }

    /// Apply the documented environment overrides.
    pub fn apply_env(&mut self) {
        override_string(&mut self.token, "DISCORD_TOKEN");
        override_parsed(&mut self.raw_intents, "DISCORD_INTENTS");
        override_parsed(&mut self.gateway_version, "DISCORD_GATEWAY_VERSION");
        override_list(&mut self.events, "EVENTS");

        override_parsed(&mut self.shards.count, "SHARD_COUNT");
        override_parsed(&mut self.server_index, "SERVER_INDEX");
        override_parsed(&mut self.server_count, "SERVER_COUNT");

        if let Ok(value) = env::var("BROKER_TYPE") {
            match value.as_str() {
                "amqp" => self.broker.kind = BrokerKind::Amqp,
                "redis" => self.broker.kind = BrokerKind::Redis,
                "stdio" => self.broker.kind = BrokerKind::Stdio,
                other => tracing::warn!(value = other, "unrecognized BROKER_TYPE, keeping configured value"),
            }
        }
        override_string(&mut self.broker.url, "BROKER_URL");
        override_string(&mut self.broker.group, "BROKER_GROUP");
        override_string(&mut self.broker.message_timeout, "BROKER_MESSAGE_TIMEOUT");

        if let Ok(value) = env::var("SHARD_STORE_TYPE") {
            match value.as_str() {
                "memory" => self.shard_store.kind = ShardStoreKind::Memory,
                "redis" => self.shard_store.kind = ShardStoreKind::Redis,
                other => tracing::warn!(value = other, "unrecognized SHARD_STORE_TYPE, keeping configured value"),
            }
        }
        override_string(&mut self.shard_store.url, "SHARD_STORE_URL");
        override_string(&mut self.shard_store.prefix, "SHARD_STORE_PREFIX");

        if let Ok(value) = env::var("PROMETHEUS_ADDRESS") {
            match value.parse() {
                Ok(address) => self.prometheus.address = Some(address),
                Err(_) => tracing::warn!(%value, "unparseable PROMETHEUS_ADDRESS, keeping configured value"),
            }
        }
        override_string(&mut self.prometheus.endpoint, "PROMETHEUS_ENDPOINT");
    }

    /// Check values that have no usable default.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.token.is_empty() {
            bail!("a bot token is required; set `token` in the config file or DISCORD_TOKEN");
        }

        if self.server_count() == 0 {
            bail!("server_count must be at least 1");
        }

        if self.server_index >= self.server_count() {
            bail!(
                "server_index {} is out of range for server_count {}",
                self.server_index,
                self.server_count(),
            );
        }

        Ok(())
    }

    /// Effective server count; unset means a single instance.
    pub fn server_count(&self) -> u32 {
        if self.server_count == 0 {
            1
        } else {
            self.server_count
        }
    }

    /// Effective gateway version.
    pub fn gateway_version(&self) -> u8 {
        if self.gateway_version == 0 {
            nimbus_gateway::API_VERSION
        } else {
            self.gateway_version
        }
    }

    /// Resolve the configured intents into a bitmask.
    pub fn resolved_intents(&self) -> anyhow::Result<Intents> {
        if self.raw_intents != 0 {
            return Ok(Intents::from_bits_truncate(self.raw_intents));
        }

        let mut intents = Intents::empty();

        for name in &self.intents {
            match Intents::from_name(name) {
                Some(intent) => intents |= intent,
                None => bail!("unknown intent name: {name}"),
            }
        }

        Ok(intents)
    }

    /// Parse the broker message timeout.
    pub fn message_timeout(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.broker.message_timeout)
            .with_context(|| format!("parsing broker.message_timeout {:?}", self.broker.message_timeout))
    }

    /// Presence payload converted to JSON for the identify payload.
    pub fn presence_json(&self) -> anyhow::Result<Option<serde_json::Value>> {
        self.presence
            .as_ref()
            .map(|value| serde_json::to_value(value).context("converting presence to json"))
            .transpose()
    }
}

fn override_string(slot: &mut String, key: &str) {
    if let Ok(value) = env::var(key) {
        *slot = value;
    }
}

fn override_list(slot: &mut Vec<String>, key: &str) {
    if let Ok(value) = env::var(key) {
        *slot = value
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(ToOwned::to_owned)
            .collect();
    }
}

fn override_parsed<T: std::str::FromStr>(slot: &mut T, key: &str) {
    if let Ok(value) = env::var(key) {
        match value.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(%value, key, "unparseable environment override, keeping configured value"),
        }
    }
}

/// Parse durations of the form `500ms`, `30s`, `2m`, or `1h`.
fn parse_duration(text: &str) -> anyhow::Result<Duration> {
    let text = text.trim();

    let (number, unit) = match text.find(|c: char| !c.is_ascii_digit()) {
        Some(split) if split > 0 => text.split_at(split),
        _ => bail!("expected a number followed by ms, s, m, or h"),
    };

    let number: u64 = number.parse()?;

    let duration = match unit {
        "ms" => Duration::from_millis(number),
        "s" => Duration::from_secs(number),
        "m" => Duration::from_secs(number * 60),
        "h" => Duration::from_secs(number * 3_600),
        other => bail!("unknown duration unit: {other}"),
    };

    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::{parse_duration, BrokerKind, Config, ShardStoreKind};
    use nimbus_gateway::Intents;
    use std::time::Duration;

    #[test]
    fn defaults() {
        let config = Config::default();

        assert_eq!(BrokerKind::Amqp, config.broker.kind);
        assert_eq!("gateway", config.broker.group);
        assert_eq!(ShardStoreKind::Memory, config.shard_store.kind);
        assert_eq!(1, config.server_count());
        assert_eq!(nimbus_gateway::API_VERSION, config.gateway_version());
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_a_full_file() {
        let config: Config = toml::from_str(
            r#"
                token = "abc"
                events = ["MESSAGE_CREATE", "MESSAGE_DELETE"]
                intents = ["GUILDS", "GUILD_MESSAGES"]
                server_index = 1
                server_count = 2

                [shards]
                count = 16

                [broker]
                type = "redis"
                url = "redis://broker"
                group = "events"
                message_timeout = "30s"

                [shard_store]
                type = "redis"
                url = "redis://store"
                prefix = "gateway:"

                [prometheus]
                address = "0.0.0.0:9090"
                endpoint = "/metrics"
            "#,
        )
        .unwrap();

        assert_eq!("abc", config.token);
        assert_eq!(BrokerKind::Redis, config.broker.kind);
        assert_eq!(16, config.shards.count);
        assert_eq!(ShardStoreKind::Redis, config.shard_store.kind);
        assert_eq!("gateway:", config.shard_store.prefix);
        assert_eq!(
            Duration::from_secs(30),
            config.message_timeout().unwrap(),
        );
        assert_eq!(
            Intents::GUILDS | Intents::GUILD_MESSAGES,
            config.resolved_intents().unwrap(),
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn raw_intents_override_names() {
        let config: Config = toml::from_str(
            r#"
                token = "abc"
                intents = ["GUILDS"]
                raw_intents = 513
            "#,
        )
        .unwrap();

        assert_eq!(
            Intents::from_bits_truncate(513),
            config.resolved_intents().unwrap(),
        );
    }

    #[test]
    fn unknown_intent_is_an_error() {
        let config: Config = toml::from_str(
            r#"
                token = "abc"
                intents = ["GUILD_KARAOKE"]
            "#,
        )
        .unwrap();

        assert!(config.resolved_intents().is_err());
    }

    #[test]
    fn durations() {
        assert_eq!(Duration::from_millis(500), parse_duration("500ms").unwrap());
        assert_eq!(Duration::from_secs(30), parse_duration("30s").unwrap());
        assert_eq!(Duration::from_secs(120), parse_duration("2m").unwrap());
        assert_eq!(Duration::from_secs(3_600), parse_duration("1h").unwrap());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("10").is_err());
    }

    #[test]
    fn server_index_must_fit() {
        let config: Config = toml::from_str(
            r#"
                token = "abc"
                server_index = 2
                server_count = 2
            "#,
        )
        .unwrap();

        assert!(config.validate().is_err());
    }
}
