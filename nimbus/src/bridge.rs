//! Bidirectional bridge between the gateway manager and the broker.
//!
//! Outbound, dispatches matching the configured event allow-list are
//! published to the broker under their event name. Inbound, the bridge
//! consumes the `SEND` channel plus one channel per owned shard. A `SEND`
//! envelope names a guild; its owning shard is `(guild_id >> 22) mod total`.
//! If that shard lives in another process the inner packet is re-published
//! to the owner's shard channel, so an envelope bounces at most once.

use nimbus_broker::{Broker, BrokerError, Delivery};
use nimbus_gateway::{
    EventObserver, ManagerHandle, OpCode, ReceivePacket, SendPacket, ShardId, ShardSender,
    Topology,
};
use serde::Deserialize;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time,
};

/// Logical channel carrying guild-routed command envelopes.
pub const SEND_CHANNEL: &str = "SEND";

/// Envelope for a command routed by guild ID.
#[derive(Debug, Deserialize)]
pub struct SendEnvelope {
    /// Guild the command concerns, as a decimal string on the wire.
    #[serde(with = "guild_id_string")]
    pub guild_id: u64,
    /// The command itself.
    pub packet: SendPacket,
}

mod guild_id_string {
    use serde::{de::Error as DeError, Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let text = String::deserialize(deserializer)?;

        text.parse().map_err(DeError::custom)
    }
}

/// Shard that owns a guild's events and voice state.
pub fn shard_for_guild(guild_id: u64, shard_total: u32) -> u32 {
    u32::try_from((guild_id >> 22) % u64::from(shard_total)).expect("shard index fits total")
}

/// Observer publishing allow-listed dispatches to the broker.
///
/// Packets are handed off through an unbounded channel so a slow or
/// disconnected broker never blocks a shard's read pump.
#[derive(Debug)]
pub struct BridgePublisher {
    events: HashSet<String>,
    tx: UnboundedSender<(String, Vec<u8>)>,
}

impl BridgePublisher {
    /// Create the observer plus the receiving half of its hand-off channel.
    pub fn new(events: impl IntoIterator<Item = String>) -> (Self, UnboundedReceiver<(String, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Self {
                events: events.into_iter().collect(),
                tx,
            },
            rx,
        )
    }
}

impl EventObserver for BridgePublisher {
    fn on_packet(&self, shard: ShardId, packet: &ReceivePacket) {
        if packet.op != OpCode::Dispatch as u8 {
            return;
        }

        let event = match packet.event() {
            Some(event) if self.events.contains(event) => event,
            _ => return,
        };

        let data = match packet.d.as_deref() {
            Some(data) => data.get().as_bytes().to_vec(),
            None => return,
        };

        if self.tx.send((event.to_owned(), data)).is_err() {
            tracing::warn!(id = %shard, "publisher task is gone, dropping dispatch");
        }
    }
}

/// Drain the publisher hand-off channel into the broker.
pub async fn run_publisher(
    broker: Arc<dyn Broker>,
    mut rx: UnboundedReceiver<(String, Vec<u8>)>,
) {
    while let Some((event, data)) = rx.recv().await {
        if let Err(source) = broker.publish(&event, &data).await {
            tracing::error!(%event, error = %source, "publishing dispatch failed");
        }
    }
}

/// Consume broker channels and route commands to their owning shards.
///
/// Resolves when the broker's delivery stream ends.
///
/// # Errors
///
/// Returns the broker's error if subscribing failed.
pub async fn run_consumer(
    broker: Arc<dyn Broker>,
    handle: ManagerHandle,
    message_timeout: Duration,
) -> Result<(), BrokerError> {
    let topology = match handle.topology().await {
        Some(topology) => topology,
        None => {
            tracing::warn!("manager went away before publishing its topology");

            return Ok(());
        }
    };

    let mut channels = vec![SEND_CHANNEL.to_owned()];
    channels.extend(topology.owned.iter().map(u32::to_string));

    let mut deliveries = broker.subscribe(&channels).await?;

    tracing::info!(channels = channels.len(), "consuming broker channels");

    while let Some(delivery) = deliveries.recv().await {
        handle_delivery(&*broker, &handle, &topology, message_timeout, delivery).await;
    }

    tracing::warn!("broker delivery stream ended");

    Ok(())
}

/// Route one delivery, acknowledging it afterwards.
async fn handle_delivery(
    broker: &dyn Broker,
    handle: &ManagerHandle,
    topology: &Topology,
    message_timeout: Duration,
    delivery: Delivery,
) {
    if delivery.channel == SEND_CHANNEL {
        let envelope: SendEnvelope = match serde_json::from_slice(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(source) => {
                tracing::warn!(error = %source, "unparseable SEND envelope");
                ack(delivery.ack).await;

                return;
            }
        };

        let target = shard_for_guild(envelope.guild_id, topology.shard_total);

        match handle.sender(target) {
            Some(sender) => {
                deliver(&sender, envelope.packet, message_timeout).await;
            }
            None => {
                // Not ours: bounce the bare packet to the owner's channel.
                match serde_json::to_vec(&envelope.packet) {
                    Ok(data) => {
                        if let Err(source) = broker.publish(&target.to_string(), &data).await {
                            tracing::error!(
                                target,
                                error = %source,
                                "re-publishing to the owning shard failed",
                            );
                        }
                    }
                    Err(source) => {
                        tracing::warn!(error = %source, "unserializable forwarded packet");
                    }
                }
            }
        }

        ack(delivery.ack).await;

        return;
    }

    match delivery.channel.parse::<u32>() {
        Ok(shard_id) => match handle.sender(shard_id) {
            Some(sender) => match serde_json::from_slice::<SendPacket>(&delivery.payload) {
                Ok(packet) => deliver(&sender, packet, message_timeout).await,
                Err(source) => {
                    tracing::warn!(shard_id, error = %source, "unparseable shard packet");
                }
            },
            None => {
                tracing::warn!(shard_id, "received a packet for a shard this process doesn't own");
            }
        },
        Err(_) => {
            tracing::warn!(channel = %delivery.channel, "delivery on an unexpected channel");
        }
    }

    ack(delivery.ack).await;
}

/// Send a packet over a shard and wait for its completion signal.
async fn deliver(sender: &ShardSender, packet: SendPacket, message_timeout: Duration) {
    let done = match sender.send_notified(packet) {
        Ok(done) => done,
        Err(source) => {
            tracing::warn!(error = %source, "shard is gone, dropping command");

            return;
        }
    };

    match time::timeout(message_timeout, done).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(source))) => {
            tracing::warn!(error = %source, "shard couldn't deliver the command");
        }
        Ok(Err(_)) => {
            tracing::warn!("shard shut down while the command was queued");
        }
        Err(_) => {
            tracing::warn!("timed out waiting for the shard to deliver the command");
        }
    }
}

async fn ack(ack: nimbus_broker::Ack) {
    if let Err(source) = ack.ack().await {
        tracing::warn!(error = %source, "acknowledging a delivery failed");
    }
}

#[cfg(test)]
mod tests {
    use super::{shard_for_guild, BridgePublisher, SendEnvelope};
    use nimbus_gateway::{EventObserver, OpCode, ReceivePacket, ShardId};

    #[test]
    fn guild_routing_matches_the_shard_formula() {
        assert_eq!(0, shard_for_guild(0, 2));
        assert_eq!(1, shard_for_guild(1 << 22, 2));
        assert_eq!(0, shard_for_guild(2 << 22, 2));
        assert_eq!(3, shard_for_guild(7 << 22, 4));

        // The low 22 bits never affect routing.
        assert_eq!(
            shard_for_guild(5 << 22, 8),
            shard_for_guild((5 << 22) | 0x3f_ffff, 8),
        );
    }

    #[test]
    fn envelope_guild_id_is_a_decimal_string() {
        let envelope: SendEnvelope = serde_json::from_str(
            r#"{"guild_id":"4194304","packet":{"op":4,"d":{"channel_id":null}}}"#,
        )
        .unwrap();

        assert_eq!(1 << 22, envelope.guild_id);
        assert_eq!(OpCode::VoiceStateUpdate, envelope.packet.op);

        assert!(serde_json::from_str::<SendEnvelope>(
            r#"{"guild_id":4194304,"packet":{"op":4,"d":null}}"#,
        )
        .is_err());
    }

    #[test]
    fn publisher_filters_by_event_name() {
        let (publisher, mut rx) =
            BridgePublisher::new(["MESSAGE_CREATE".to_owned()]);

        let wanted: ReceivePacket = serde_json::from_str(
            r#"{"op":0,"s":3,"t":"MESSAGE_CREATE","d":{"content":"hi"}}"#,
        )
        .unwrap();
        let unwanted: ReceivePacket = serde_json::from_str(
            r#"{"op":0,"s":4,"t":"TYPING_START","d":{}}"#,
        )
        .unwrap();
        let control: ReceivePacket = serde_json::from_str(r#"{"op":11}"#).unwrap();

        publisher.on_packet(ShardId::ONE, &wanted);
        publisher.on_packet(ShardId::ONE, &unwanted);
        publisher.on_packet(ShardId::ONE, &control);

        let (event, data) = rx.try_recv().unwrap();
        assert_eq!("MESSAGE_CREATE", event);
        assert_eq!(br#"{"content":"hi"}"#.to_vec(), data);
        assert!(rx.try_recv().is_err());
    }
}
