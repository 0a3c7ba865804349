//! AMQP transport: a direct exchange per broker group with one durable work
//! queue per channel.
//!
//! Dispatches are published to the group exchange with the event name as the
//! routing key; consumers of `{group}:{event}` queues share the work.
//! Outbound command channels follow the same topology, so any number of
//! producers can feed one gateway process.

use crate::{Ack, Broker, BrokerError, BrokerFuture, Delivery};
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::mpsc;

/// Capacity of the merged delivery stream handed to the consumer.
const DELIVERY_BUFFER: usize = 64;

/// Broker transport over an AMQP server.
#[derive(Debug)]
pub struct AmqpBroker {
    /// Kept alive for the channel's sake.
    _conn: Connection,
    channel: Channel,
    exchange: String,
}

impl AmqpBroker {
    /// Connect and declare the group's direct exchange.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerErrorType::Connecting`] error type if the connection
    /// or exchange declaration failed.
    ///
    /// [`BrokerErrorType::Connecting`]: crate::BrokerErrorType::Connecting
    pub async fn connect(url: &str, group: impl Into<String>) -> Result<Self, BrokerError> {
        let exchange = group.into();

        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|source| BrokerError::connecting(Box::new(source)))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|source| BrokerError::connecting(Box::new(source)))?;

        channel
            .exchange_declare(
                &exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| BrokerError::connecting(Box::new(source)))?;

        tracing::info!(%exchange, "connected to amqp broker");

        Ok(Self {
            _conn: conn,
            channel,
            exchange,
        })
    }
}

impl Broker for AmqpBroker {
    fn publish<'a>(&'a self, channel: &'a str, payload: &'a [u8]) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.channel
                .basic_publish(
                    &self.exchange,
                    channel,
                    BasicPublishOptions::default(),
                    payload,
                    BasicProperties::default(),
                )
                .await
                .map_err(|source| BrokerError::publishing(Box::new(source)))?;

            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        channels: &'a [String],
    ) -> BrokerFuture<'a, mpsc::Receiver<Delivery>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);

            for name in channels {
                let queue = format!("{}:{}", self.exchange, name);

                self.channel
                    .queue_declare(
                        &queue,
                        QueueDeclareOptions {
                            durable: true,
                            ..QueueDeclareOptions::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|source| BrokerError::subscribing(Box::new(source)))?;

                self.channel
                    .queue_bind(
                        &queue,
                        &self.exchange,
                        name,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|source| BrokerError::subscribing(Box::new(source)))?;

                let mut consumer = self
                    .channel
                    .basic_consume(
                        &queue,
                        &format!("nimbus-{name}"),
                        BasicConsumeOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|source| BrokerError::subscribing(Box::new(source)))?;

                let tx = tx.clone();
                let channel_name = name.clone();

                tokio::spawn(async move {
                    while let Some(delivery) = consumer.next().await {
                        let delivery = match delivery {
                            Ok(delivery) => delivery,
                            Err(source) => {
                                tracing::warn!(
                                    channel = %channel_name,
                                    error = %source,
                                    "amqp consumer error",
                                );

                                break;
                            }
                        };

                        let out = Delivery {
                            channel: channel_name.clone(),
                            payload: delivery.data,
                            ack: Ack::amqp(delivery.acker),
                        };

                        if tx.send(out).await.is_err() {
                            break;
                        }
                    }

                    tracing::debug!(channel = %channel_name, "amqp consumer ended");
                });
            }

            Ok(rx)
        })
    }
}
