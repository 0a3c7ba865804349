//! Channel for routing outbound commands to a shard from other tasks.

use crate::{
    error::{SendError, SendErrorType},
    packet::SendPacket,
};
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot,
};

/// Outbound command queued for a shard, with an optional completion signal.
#[derive(Debug)]
pub(crate) struct ShardCommand {
    /// The command to deliver.
    pub packet: SendPacket,
    /// Resolved once the shard has written the command to the socket, or
    /// failed trying. Used by the broker bridge to acknowledge deliveries.
    pub notify: Option<oneshot::Sender<Result<(), SendError>>>,
}

/// Command channel between a shard and its senders.
#[derive(Debug)]
pub(crate) struct CommandChannel {
    rx: UnboundedReceiver<ShardCommand>,
    tx: UnboundedSender<ShardCommand>,
}

impl CommandChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        Self { rx, tx }
    }

    /// Receiving half, owned by the shard's connection driver.
    pub fn into_rx(self) -> (UnboundedReceiver<ShardCommand>, ShardSender) {
        let sender = ShardSender {
            tx: self.tx.clone(),
        };

        (self.rx, sender)
    }
}

/// Handle to submit commands to one shard.
///
/// Commands from a single sender are delivered to the gateway in submission
/// order; commands from different senders race under the shard's send
/// limiter.
#[derive(Clone, Debug)]
pub struct ShardSender {
    tx: UnboundedSender<ShardCommand>,
}

impl ShardSender {
    /// Whether the owning shard has shut down.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue a command for delivery.
    ///
    /// # Errors
    ///
    /// Returns a [`SendErrorType::Sending`] error type if the shard has shut
    /// down.
    pub fn send(&self, packet: SendPacket) -> Result<(), SendError> {
        self.tx
            .send(ShardCommand {
                packet,
                notify: None,
            })
            .map_err(|_| SendError {
                kind: SendErrorType::Sending,
                source: None,
            })
    }

    /// Queue a command and receive a signal once the shard has delivered it.
    ///
    /// The returned receiver resolves with the delivery result, or with a
    /// receive error if the shard shuts down before handling the command.
    ///
    /// # Errors
    ///
    /// Returns a [`SendErrorType::Sending`] error type if the shard has shut
    /// down.
    pub fn send_notified(
        &self,
        packet: SendPacket,
    ) -> Result<oneshot::Receiver<Result<(), SendError>>, SendError> {
        let (done, done_rx) = oneshot::channel();

        self.tx
            .send(ShardCommand {
                packet,
                notify: Some(done),
            })
            .map_err(|_| SendError {
                kind: SendErrorType::Sending,
                source: None,
            })?;

        Ok(done_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandChannel, ShardSender};
    use crate::packet::{OpCode, SendPacket};
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;

    assert_impl_all!(ShardSender: Clone, Debug, Send, Sync);

    #[test]
    fn commands_arrive_in_order() {
        let (mut rx, sender) = CommandChannel::new().into_rx();

        sender.send(SendPacket::heartbeat(Some(1))).unwrap();
        sender.send(SendPacket::heartbeat(Some(2))).unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(OpCode::Heartbeat, first.packet.op);
        assert_eq!(serde_json::json!(1), first.packet.d);
        assert_eq!(serde_json::json!(2), second.packet.d);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sender_observes_shutdown() {
        let (rx, sender) = CommandChannel::new().into_rx();

        assert!(!sender.is_closed());
        drop(rx);
        assert!(sender.is_closed());
        assert!(sender.send(SendPacket::heartbeat(None)).is_err());
        assert!(sender.send_notified(SendPacket::heartbeat(None)).is_err());
    }
}
