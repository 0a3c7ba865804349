//! Message-broker transports for the Nimbus event pump.
//!
//! The daemon publishes gateway dispatches to a broker, one channel per event
//! name, and consumes outbound commands from a `SEND` channel plus one
//! channel per owned shard. The [`Broker`] trait abstracts over transports:
//! an AMQP work queue, Redis streams with consumer groups, and
//! newline-delimited JSON on stdio for development and tests.
//!
//! Deliveries are acknowledged explicitly after the consumer has handled
//! them, so a crashed process hands unfinished work back to the broker.

#![warn(clippy::pedantic, missing_docs, rust_2018_idioms, unsafe_code)]
#![allow(clippy::module_name_repetitions, clippy::must_use_candidate)]

pub mod amqp;
pub mod redis;
pub mod stdio;

pub use self::{amqp::AmqpBroker, redis::RedisBroker, stdio::StdioBroker};

use ::redis::aio::ConnectionManager;
use lapin::{acker::Acker, options::BasicAckOptions};
use std::{
    error::Error,
    fmt::{Debug, Display, Formatter, Result as FmtResult},
    future::Future,
    pin::Pin,
};
use tokio::sync::mpsc;

/// Future resolved by [`Broker`] operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// A connection to a message broker.
pub trait Broker: Debug + Send + Sync {
    /// Publish a payload to a channel.
    fn publish<'a>(&'a self, channel: &'a str, payload: &'a [u8]) -> BrokerFuture<'a, ()>;

    /// Subscribe to a set of channels, receiving deliveries on one stream.
    ///
    /// Consumption runs in background tasks; dropping the returned receiver
    /// ends them.
    fn subscribe<'a>(
        &'a self,
        channels: &'a [String],
    ) -> BrokerFuture<'a, mpsc::Receiver<Delivery>>;
}

/// One message consumed from a broker.
#[derive(Debug)]
pub struct Delivery {
    /// Channel the message arrived on.
    pub channel: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Acknowledgement handle; call [`Ack::ack`] once handled.
    pub ack: Ack,
}

/// Acknowledgement of one delivery.
#[derive(Debug)]
pub struct Ack {
    inner: AckInner,
}

enum AckInner {
    Noop,
    Amqp(Acker),
    Redis {
        conn: ConnectionManager,
        stream: String,
        group: String,
        id: String,
    },
}

impl Debug for AckInner {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Noop => f.write_str("AckInner::Noop"),
            Self::Amqp(_) => f.write_str("AckInner::Amqp"),
            Self::Redis { stream, id, .. } => f
                .debug_struct("AckInner::Redis")
                .field("stream", stream)
                .field("id", id)
                .finish_non_exhaustive(),
        }
    }
}

impl Ack {
    /// Acknowledgement that does nothing, for transports without redelivery.
    pub const fn noop() -> Self {
        Self {
            inner: AckInner::Noop,
        }
    }

    pub(crate) const fn amqp(acker: Acker) -> Self {
        Self {
            inner: AckInner::Amqp(acker),
        }
    }

    pub(crate) const fn redis(
        conn: ConnectionManager,
        stream: String,
        group: String,
        id: String,
    ) -> Self {
        Self {
            inner: AckInner::Redis {
                conn,
                stream,
                group,
                id,
            },
        }
    }

    /// Confirm the delivery to the broker.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerErrorType::Acking`] error type if the broker
    /// rejected or never received the acknowledgement.
    pub async fn ack(self) -> Result<(), BrokerError> {
        match self.inner {
            AckInner::Noop => Ok(()),
            AckInner::Amqp(acker) => acker
                .ack(BasicAckOptions::default())
                .await
                .map_err(|source| BrokerError::acking(Box::new(source))),
            AckInner::Redis {
                mut conn,
                stream,
                group,
                id,
            } => ::redis::cmd("XACK")
                .arg(&stream)
                .arg(&group)
                .arg(&id)
                .query_async::<_, i64>(&mut conn)
                .await
                .map(|_| ())
                .map_err(|source| BrokerError::acking(Box::new(source))),
        }
    }
}

/// A broker operation failed.
#[derive(Debug)]
pub struct BrokerError {
    pub(crate) kind: BrokerErrorType,
    pub(crate) source: Option<Box<dyn Error + Send + Sync>>,
}

impl BrokerError {
    /// Immutable reference to the type of error that occurred.
    #[must_use = "retrieving the type has no effect if left unused"]
    pub const fn kind(&self) -> &BrokerErrorType {
        &self.kind
    }

    /// Consume the error, returning the owned error type and the source error.
    #[must_use = "consuming the error into its parts has no effect if left unused"]
    pub fn into_parts(self) -> (BrokerErrorType, Option<Box<dyn Error + Send + Sync>>) {
        (self.kind, self.source)
    }

    pub(crate) fn connecting(source: Box<dyn Error + Send + Sync>) -> Self {
        Self {
            kind: BrokerErrorType::Connecting,
            source: Some(source),
        }
    }

    pub(crate) fn publishing(source: Box<dyn Error + Send + Sync>) -> Self {
        Self {
            kind: BrokerErrorType::Publishing,
            source: Some(source),
        }
    }

    pub(crate) fn subscribing(source: Box<dyn Error + Send + Sync>) -> Self {
        Self {
            kind: BrokerErrorType::Subscribing,
            source: Some(source),
        }
    }

    pub(crate) fn acking(source: Box<dyn Error + Send + Sync>) -> Self {
        Self {
            kind: BrokerErrorType::Acking,
            source: Some(source),
        }
    }
}

impl Display for BrokerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.kind {
            BrokerErrorType::Acking => f.write_str("acknowledging a delivery failed"),
            BrokerErrorType::Connecting => f.write_str("connecting to the broker failed"),
            BrokerErrorType::Publishing => f.write_str("publishing a message failed"),
            BrokerErrorType::Subscribing => f.write_str("subscribing to a channel failed"),
        }
    }
}

impl Error for BrokerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn Error + 'static))
    }
}

/// Type of [`BrokerError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum BrokerErrorType {
    /// An acknowledgement was rejected or lost.
    Acking,
    /// The broker connection couldn't be established.
    Connecting,
    /// A message couldn't be published.
    Publishing,
    /// A channel couldn't be subscribed to.
    Subscribing,
}

#[cfg(test)]
mod tests {
    use super::{Ack, Broker, BrokerError, BrokerErrorType, Delivery};
    use static_assertions::{assert_impl_all, assert_obj_safe};
    use std::{error::Error, fmt::Debug};

    assert_impl_all!(Ack: Debug, Send, Sync);
    assert_impl_all!(Delivery: Debug, Send, Sync);
    assert_impl_all!(BrokerErrorType: Debug, Send, Sync);
    assert_impl_all!(BrokerError: Error, Send, Sync);
    assert_obj_safe!(Broker);

    #[tokio::test]
    async fn noop_ack_succeeds() {
        Ack::noop().ack().await.unwrap();
    }
}
