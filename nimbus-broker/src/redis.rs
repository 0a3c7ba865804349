//! Redis-streams transport with consumer groups.
//!
//! Each channel is a stream named `{group}:{channel}`. Publishing appends an
//! entry with a single `data` field; consumption reads through a consumer
//! group named after the broker group, so multiple gateway processes share
//! the work and unacknowledged entries are redelivered.

use crate::{Ack, Broker, BrokerError, BrokerFuture, Delivery};
use ::redis::{
    aio::ConnectionManager,
    streams::{StreamReadOptions, StreamReadReply},
    AsyncCommands, Client, RedisError, Value,
};
use std::time::Duration;
use tokio::sync::mpsc;

/// Capacity of the merged delivery stream handed to the consumer.
const DELIVERY_BUFFER: usize = 64;

/// How long one XREADGROUP call blocks waiting for entries, in milliseconds.
const READ_BLOCK_MS: usize = 5_000;

/// Entries fetched per XREADGROUP call.
const READ_COUNT: usize = 10;

/// Pause after a failed read before retrying.
const READ_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Broker transport over Redis streams.
pub struct RedisBroker {
    client: Client,
    conn: ConnectionManager,
    group: String,
    consumer: String,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Connect to Redis.
    ///
    /// The consumer name must be unique per process within the group, such as
    /// a hostname or server index.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerErrorType::Connecting`] error type if the connection
    /// couldn't be established.
    ///
    /// [`BrokerErrorType::Connecting`]: crate::BrokerErrorType::Connecting
    pub async fn connect(
        url: &str,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, BrokerError> {
        let client =
            Client::open(url).map_err(|source| BrokerError::connecting(Box::new(source)))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|source| BrokerError::connecting(Box::new(source)))?;

        let group = group.into();
        tracing::info!(%group, "connected to redis broker");

        Ok(Self {
            client,
            conn,
            group,
            consumer: consumer.into(),
        })
    }

    fn stream_key(&self, channel: &str) -> String {
        format!("{}:{}", self.group, channel)
    }

    /// Create the consumer group on a stream, tolerating it already existing.
    async fn ensure_group(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();

        let created: Result<Value, RedisError> = ::redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(source) if source.to_string().contains("BUSYGROUP") => Ok(()),
            Err(source) => Err(BrokerError::subscribing(Box::new(source))),
        }
    }
}

impl Broker for RedisBroker {
    fn publish<'a>(&'a self, channel: &'a str, payload: &'a [u8]) -> BrokerFuture<'a, ()> {
        let key = self.stream_key(channel);
        let mut conn = self.conn.clone();

        Box::pin(async move {
            conn.xadd::<_, _, _, _, String>(key, "*", &[("data", payload)])
                .await
                .map(|_| ())
                .map_err(|source| BrokerError::publishing(Box::new(source)))
        })
    }

    fn subscribe<'a>(
        &'a self,
        channels: &'a [String],
    ) -> BrokerFuture<'a, mpsc::Receiver<Delivery>> {
        Box::pin(async move {
            let keys: Vec<String> = channels
                .iter()
                .map(|channel| self.stream_key(channel))
                .collect();

            for key in &keys {
                self.ensure_group(key).await?;
            }

            // Reads block server-side, so they get a dedicated connection
            // instead of the shared multiplexed one.
            let mut read_conn = self
                .client
                .get_async_connection()
                .await
                .map_err(|source| BrokerError::subscribing(Box::new(source)))?;

            let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
            let ack_conn = self.conn.clone();
            let group = self.group.clone();
            let consumer = self.consumer.clone();
            let prefix = format!("{}:", self.group);

            tokio::spawn(async move {
                let ids = vec![">"; keys.len()];

                loop {
                    if tx.is_closed() {
                        break;
                    }

                    let options = StreamReadOptions::default()
                        .group(&group, &consumer)
                        .count(READ_COUNT)
                        .block(READ_BLOCK_MS);

                    let reply: StreamReadReply =
                        match read_conn.xread_options(&keys, &ids, &options).await {
                            Ok(reply) => reply,
                            Err(source) => {
                                tracing::warn!(error = %source, "redis stream read failed");
                                tokio::time::sleep(READ_RETRY_DELAY).await;

                                continue;
                            }
                        };

                    for stream in reply.keys {
                        let channel = stream
                            .key
                            .strip_prefix(&prefix)
                            .unwrap_or(&stream.key)
                            .to_owned();

                        for entry in stream.ids {
                            let payload = match entry.map.get("data") {
                                Some(Value::Data(bytes)) => bytes.clone(),
                                _ => {
                                    tracing::warn!(
                                        stream = %stream.key,
                                        id = %entry.id,
                                        "stream entry without a data field",
                                    );

                                    continue;
                                }
                            };

                            let delivery = Delivery {
                                channel: channel.clone(),
                                payload,
                                ack: Ack::redis(
                                    ack_conn.clone(),
                                    stream.key.clone(),
                                    group.clone(),
                                    entry.id.clone(),
                                ),
                            };

                            if tx.send(delivery).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });

            Ok(rx)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::RedisBroker;
    use crate::Broker;
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;

    assert_impl_all!(RedisBroker: Broker, Debug, Send, Sync);
}
