//! Utility future deciding a connection driver's next action.
//!
//! Combining the per-connection inputs into one future keeps the driver loop
//! free of borrow gymnastics and gives the heartbeat deadline a fixed
//! precedence over socket reads.

use crate::{channel::ShardCommand, connection::Connection};
use futures_util::{future::FutureExt, stream::Next, StreamExt};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    time::{sleep_until, Instant, Sleep},
};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

/// Resolved value from polling a [`NextActionFuture`].
pub(crate) enum NextAction {
    /// A handshake deadline passed before the awaited response arrived.
    DeadlineExpired,
    /// The next heartbeat is due.
    SendHeartbeat,
    /// A command was submitted for delivery over this shard.
    Command(ShardCommand),
    /// A message, error, or end of stream arrived from the socket.
    Message(Option<Result<WsMessage, WsError>>),
}

/// Future resolving with the next action a connection driver must take.
///
/// Polled in a fixed order: expired deadlines, due heartbeats, queued
/// commands, then socket messages. Heartbeats preempt reads so a busy socket
/// can't starve the session keep-alive.
pub(crate) struct NextActionFuture<'a> {
    command_rx: &'a mut UnboundedReceiver<ShardCommand>,
    deadline: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Pin<Box<Sleep>>>,
    message: Next<'a, Connection>,
}

impl<'a> NextActionFuture<'a> {
    pub fn new(
        command_rx: &'a mut UnboundedReceiver<ShardCommand>,
        connection: &'a mut Connection,
        next_heartbeat: Option<Instant>,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            command_rx,
            deadline: deadline.map(|at| Box::pin(sleep_until(at))),
            heartbeat: next_heartbeat.map(|at| Box::pin(sleep_until(at))),
            message: connection.next(),
        }
    }
}

impl Future for NextActionFuture<'_> {
    type Output = NextAction;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.as_mut().get_mut();

        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.poll_unpin(cx).is_ready() {
                return Poll::Ready(NextAction::DeadlineExpired);
            }
        }

        if let Some(heartbeat) = this.heartbeat.as_mut() {
            if heartbeat.poll_unpin(cx).is_ready() {
                return Poll::Ready(NextAction::SendHeartbeat);
            }
        }

        if let Poll::Ready(Some(command)) = this.command_rx.poll_recv(cx) {
            return Poll::Ready(NextAction::Command(command));
        }

        if let Poll::Ready(maybe_message) = this.message.poll_unpin(cx) {
            return Poll::Ready(NextAction::Message(maybe_message));
        }

        Poll::Pending
    }
}
