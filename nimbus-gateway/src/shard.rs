//! Primary logic and implementation details of gateway connections.
//!
//! A [`Shard`] owns one logical session with the gateway and drives it
//! through an iterative lifecycle: dial, await HELLO, identify or resume,
//! then pump packets until the connection ends. Recoverable closes feed an
//! exponential backoff and reconnect; terminal close codes end the shard and
//! are reported to the manager.
//!
//! The connection driver is a single task multiplexing four inputs with fixed
//! precedence: handshake deadlines, the heartbeat schedule, queued outbound
//! commands, and the socket itself. Writes are therefore naturally
//! serialized, and every write passes through the send limiter first.

use crate::{
    channel::ShardCommand,
    compression::Decompressor,
    config::{Config, ShardId},
    connection::{self, Connection},
    error::{
        close_code_recoverable, FatalError, ProcessError, ProcessErrorType, SendError,
        SendErrorType,
    },
    future::{NextAction, NextActionFuture},
    info::GatewayMeta,
    latency::Latency,
    metrics::Collector,
    observer::EventObserver,
    packet::{Hello, Identify, OpCode, Ready, ReceivePacket, Resume, SendPacket, EVENT_READY,
        EVENT_RESUMED},
    queue::{IdentifyPermit, Queue},
    ratelimiter::CommandRatelimiter,
    session::Session,
    store::SessionStore,
};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use std::{borrow::Cow, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc::UnboundedReceiver, watch},
    time::{self, Instant},
};
use tokio_tungstenite::tungstenite::{
    protocol::{frame::coding::CloseCode as WsCloseCode, CloseFrame},
    Message as WsMessage,
};

/// Time allowed for the TCP, TLS, and WebSocket handshakes plus the HELLO
/// packet.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed between sending IDENTIFY and observing READY or
/// INVALID_SESSION.
const IDENTIFY_DEADLINE: Duration = Duration::from_secs(10);

/// Time allowed for the peer to answer a close frame.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive failed reconnects after which a shard gives up.
const MAX_RECONNECT_ATTEMPTS: u8 = 5;

/// Upper bound of the reconnect backoff.
const RECONNECT_DELAY_CAP: Duration = Duration::from_secs(300);

/// Close code used when the shard initiates a close it intends to resume
/// from.
const CLOSE_CODE_RESUME: u16 = 4000;

/// Current position of a shard in its connection lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Stage {
    /// No connection is open.
    Disconnected,
    /// The WebSocket handshake is in progress.
    Dialing,
    /// Connected and waiting for the gateway's HELLO.
    AwaitingHello,
    /// An identify slot has been granted and IDENTIFY is being sent.
    Identifying,
    /// IDENTIFY was sent and READY hasn't arrived yet.
    AwaitingReady,
    /// RESUME was sent and the replay hasn't completed yet.
    Resuming,
    /// A session is established and packets are being pumped.
    Running,
    /// Waiting out the backoff before the next connection attempt.
    Reconnecting,
    /// A close is in progress.
    Closing,
    /// A terminal close ended the shard; it will not reconnect.
    FatallyClosed,
}

impl Stage {
    /// Whether the shard has an established session.
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Handles to the process-wide facilities a shard works with.
///
/// Shards deliberately receive these narrow handles instead of a reference to
/// the manager that spawned them.
#[derive(Clone, Debug)]
pub struct ShardContext {
    /// Identify coordinator shared by all shards of the process.
    pub queue: Arc<dyn Queue>,
    /// Persistence for session identity and sequence.
    pub store: Arc<dyn SessionStore>,
    /// Sink for operational metrics.
    pub collector: Arc<dyn Collector>,
    /// Observer of inbound packets and terminal failures.
    pub observer: Arc<dyn EventObserver>,
    /// Cached `/gateway/bot` metadata.
    pub gateway: Arc<GatewayMeta>,
}

/// How a connection cycle ended.
enum CycleEnd {
    /// The process is shutting down; the connection was closed cleanly.
    Shutdown,
    /// The connection ended in a way that permits reconnecting.
    Recoverable,
    /// The gateway closed the connection with a terminal code.
    Fatal {
        /// Close code of the close message.
        close_code: u16,
    },
}

/// What the driver must do after processing one inbound payload.
#[derive(Debug)]
enum PayloadFlow {
    /// Nothing further.
    Continue,
    /// Send a heartbeat immediately.
    Heartbeat,
    /// Acquire an identify slot if needed and send IDENTIFY, after an
    /// optional delay.
    Identify {
        /// Backoff before re-identifying after a failed session.
        delay: Option<Duration>,
    },
    /// Send RESUME for the current session.
    Resume,
    /// Close the connection with the given code and reconnect.
    Close {
        /// Close code to send.
        code: u16,
    },
}

/// Shard running and maintaining one gateway session.
#[derive(Debug)]
pub struct Shard {
    /// Identity of the shard.
    id: ShardId,
    /// Shared shard configuration.
    config: Arc<Config>,
    /// Handles to process-wide facilities.
    context: ShardContext,
    /// State of the current session, if any.
    session: Session,
    /// Heartbeat round-trip statistics.
    latency: Latency,
    /// Position in the connection lifecycle.
    stage: Stage,
    /// Limiter on all writes to the current connection.
    send_limiter: CommandRatelimiter,
    /// Interval between heartbeats, learned from HELLO.
    heartbeat_interval: Option<Duration>,
    /// When the next heartbeat is due.
    next_heartbeat: Option<Instant>,
    /// Deadline on the current handshake step, if one is pending.
    deadline: Option<Instant>,
    /// Whether the last heartbeat was acknowledged.
    heartbeat_acked: bool,
    /// Identify slot held while an IDENTIFY is in flight.
    identify_permit: Option<IdentifyPermit>,
    /// Consecutive recoverable closes without an established session.
    reconnect_attempts: u8,
}

impl Shard {
    /// Create a shard. It does nothing until [`run`][`Self::run`] is awaited.
    pub(crate) fn new(id: ShardId, config: Arc<Config>, context: ShardContext) -> Self {
        Self {
            id,
            config,
            context,
            session: Session::new(),
            latency: Latency::new(),
            stage: Stage::Disconnected,
            send_limiter: CommandRatelimiter::send_limiter(),
            heartbeat_interval: None,
            next_heartbeat: None,
            deadline: None,
            heartbeat_acked: true,
            identify_permit: None,
            reconnect_attempts: 0,
        }
    }

    /// Identity of the shard.
    pub const fn id(&self) -> ShardId {
        self.id
    }

    /// Position in the connection lifecycle.
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Heartbeat round-trip statistics.
    pub const fn latency(&self) -> &Latency {
        &self.latency
    }

    /// Run the shard until shutdown or a terminal failure.
    ///
    /// Reconnects are handled internally with exponential backoff; the future
    /// resolves only when the process shuts down or the shard hits a terminal
    /// close code or exhausts its reconnect budget.
    ///
    /// # Errors
    ///
    /// Returns a [`FatalError`] if the shard terminated abnormally.
    pub(crate) async fn run(
        mut self,
        mut command_rx: UnboundedReceiver<ShardCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), FatalError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.connection_cycle(&mut command_rx, &mut shutdown).await {
                CycleEnd::Shutdown => return Ok(()),
                CycleEnd::Fatal { close_code } => {
                    self.stage = Stage::FatallyClosed;
                    self.context.collector.shard_alive(self.id, false);

                    let error = FatalError::closed(close_code);
                    tracing::error!(id = %self.id, %error, "shard closed fatally");
                    self.context.observer.on_shard_terminal(self.id, &error);

                    return Err(error);
                }
                CycleEnd::Recoverable => {
                    self.context.collector.shard_alive(self.id, false);
                    self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);

                    if self.reconnect_attempts > MAX_RECONNECT_ATTEMPTS {
                        self.stage = Stage::FatallyClosed;

                        let error = FatalError::reconnects_exhausted();
                        tracing::error!(id = %self.id, %error, "giving up on shard");
                        self.context.observer.on_shard_terminal(self.id, &error);

                        return Err(error);
                    }

                    self.stage = Stage::Reconnecting;
                    let wait = reconnect_delay(self.reconnect_attempts);
                    tracing::info!(
                        id = %self.id,
                        attempt = self.reconnect_attempts,
                        wait_seconds = wait.as_secs(),
                        "waiting before attempting a reconnect",
                    );

                    tokio::select! {
                        _ = shutdown.changed() => {}
                        () = time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// Run a single connection from dial to close.
    async fn connection_cycle(
        &mut self,
        command_rx: &mut UnboundedReceiver<ShardCommand>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> CycleEnd {
        self.heartbeat_interval = None;
        self.next_heartbeat = None;
        self.deadline = None;
        self.heartbeat_acked = true;
        // An identify that died with its connection no longer holds a slot.
        self.identify_permit = None;

        if self.session.id().is_none() {
            self.restore_session().await;
        }

        let fresh = !self.session.is_resumable();

        if fresh {
            self.session.reset();
        }

        let base_url = match self.gateway_url(fresh).await {
            Some(url) => url,
            None => return CycleEnd::Recoverable,
        };

        let url = connection::configure_url(
            &base_url,
            self.config.gateway_version(),
            self.config.compression(),
        );

        self.stage = Stage::Dialing;
        let started = Instant::now();

        let mut connection = match time::timeout(CONNECT_TIMEOUT, connection::connect(&url)).await
        {
            Ok(Ok(connection)) => connection,
            Ok(Err(source)) => {
                tracing::warn!(id = %self.id, error = %source, "connecting to the gateway failed");

                return CycleEnd::Recoverable;
            }
            Err(_) => {
                tracing::warn!(id = %self.id, "connecting to the gateway timed out");

                return CycleEnd::Recoverable;
            }
        };

        // The rest of the connect window bounds the wait for HELLO.
        self.stage = Stage::AwaitingHello;
        self.deadline = Some(started + CONNECT_TIMEOUT);

        let mut decompressor = self.config.compression().map(Decompressor::new);

        loop {
            let action = tokio::select! {
                _ = shutdown.changed() => None,
                action = NextActionFuture::new(
                    command_rx,
                    &mut connection,
                    self.next_heartbeat,
                    self.deadline,
                ) => Some(action),
            };

            let action = match action {
                Some(action) => action,
                None => {
                    self.graceful_close(&mut connection).await;

                    return CycleEnd::Shutdown;
                }
            };

            match action {
                NextAction::DeadlineExpired => {
                    tracing::warn!(
                        id = %self.id,
                        stage = ?self.stage,
                        "gateway didn't answer within the deadline",
                    );
                    self.close_connection(&mut connection, CLOSE_CODE_RESUME, "timed out").await;

                    return CycleEnd::Recoverable;
                }
                NextAction::SendHeartbeat => {
                    if !self.heartbeat_acked {
                        tracing::warn!(
                            id = %self.id,
                            "heartbeat not acknowledged within an interval, closing zombie connection",
                        );
                        self.close_connection(
                            &mut connection,
                            CLOSE_CODE_RESUME,
                            "heartbeat ack timeout",
                        )
                        .await;

                        return CycleEnd::Recoverable;
                    }

                    if let Err(source) = self.send_heartbeat(&mut connection).await {
                        tracing::warn!(id = %self.id, error = %source, "sending heartbeat failed");

                        return CycleEnd::Recoverable;
                    }
                }
                NextAction::Command(command) => {
                    if let Some(end) = self.handle_command(&mut connection, command).await {
                        return end;
                    }
                }
                NextAction::Message(Some(Ok(message))) => {
                    match self
                        .handle_message(&mut connection, &mut decompressor, message, shutdown)
                        .await
                    {
                        Ok(Some(end)) => return end,
                        Ok(None) => {}
                        Err(source) => {
                            tracing::warn!(
                                id = %self.id,
                                error = %source,
                                "processing an inbound message failed",
                            );
                            self.close_connection(
                                &mut connection,
                                CLOSE_CODE_RESUME,
                                "processing error",
                            )
                            .await;

                            return CycleEnd::Recoverable;
                        }
                    }
                }
                NextAction::Message(Some(Err(source))) => {
                    tracing::warn!(id = %self.id, error = %source, "websocket error");

                    return CycleEnd::Recoverable;
                }
                NextAction::Message(None) => {
                    tracing::debug!(id = %self.id, "gateway stream ended");

                    return CycleEnd::Recoverable;
                }
            }
        }
    }

    /// Base URL for the next connection.
    ///
    /// Fresh identifies refresh the endpoint metadata to honor the advertised
    /// session limits; resumes prefer the session's own resume URL.
    async fn gateway_url(&mut self, fresh: bool) -> Option<String> {
        if !fresh {
            if let Some(url) = self.session.resume_gateway_url() {
                return Some(url.to_owned());
            }
        }

        let result = if fresh {
            self.context.gateway.refresh().await
        } else {
            self.context.gateway.get().await
        };

        match result {
            Ok(info) => Some(info.url),
            Err(source) => {
                tracing::warn!(id = %self.id, error = %source, "fetching gateway info failed");

                None
            }
        }
    }

    /// Load any persisted session so the next connection can resume it.
    async fn restore_session(&mut self) {
        let session_id = match self.context.store.session(self.id.number()).await {
            Ok(session_id) => session_id,
            Err(source) => {
                tracing::warn!(
                    id = %self.id,
                    error = %source,
                    "reading the persisted session failed, identifying fresh",
                );

                return;
            }
        };

        if let Some(session_id) = session_id {
            let seq = match self.context.store.seq(self.id.number()).await {
                Ok(seq) => seq,
                Err(source) => {
                    tracing::warn!(id = %self.id, error = %source, "reading the persisted sequence failed");

                    None
                }
            };

            tracing::info!(id = %self.id, seq = ?seq, "restored persisted session");
            self.session = Session::from_parts(Some(session_id), seq);
        }
    }

    /// Deliver one queued outbound command.
    async fn handle_command(
        &mut self,
        connection: &mut Connection,
        command: ShardCommand,
    ) -> Option<CycleEnd> {
        let result = if self.stage.is_running() {
            self.send_packet(connection, &command.packet).await
        } else {
            Err(SendError {
                kind: SendErrorType::NotRunning,
                source: None,
            })
        };

        let connection_failed =
            matches!(&result, Err(error) if matches!(error.kind(), SendErrorType::Sending));

        match command.notify {
            Some(notify) => {
                let _ = notify.send(result);
            }
            None => {
                if let Err(source) = result {
                    tracing::warn!(id = %self.id, error = %source, "dropped outbound command");
                }
            }
        }

        connection_failed.then(|| CycleEnd::Recoverable)
    }

    /// Handle one raw WebSocket message.
    async fn handle_message(
        &mut self,
        connection: &mut Connection,
        decompressor: &mut Option<Decompressor>,
        message: WsMessage,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<CycleEnd>, ProcessError> {
        match message {
            WsMessage::Binary(frame) => {
                let payload = match decompressor {
                    Some(decompressor) => match decompressor.feed(&frame) {
                        Ok(Some(payload)) => payload,
                        Ok(None) => return Ok(None),
                        Err(source) => return Err(ProcessError::decompressing(source)),
                    },
                    None => frame,
                };

                self.handle_payload(connection, &payload, shutdown).await
            }
            WsMessage::Text(text) => {
                self.handle_payload(connection, text.as_bytes(), shutdown).await
            }
            WsMessage::Close(frame) => {
                let code = frame.as_ref().map(|frame| u16::from(frame.code));
                let reason = frame.as_ref().map(|frame| frame.reason.as_ref().to_owned());
                tracing::info!(id = %self.id, code = ?code, reason = ?reason, "gateway closed the connection");

                Ok(Some(match code {
                    Some(code) if !close_code_recoverable(code) => {
                        CycleEnd::Fatal { close_code: code }
                    }
                    _ => CycleEnd::Recoverable,
                }))
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Ok(None),
        }
    }

    /// Process one complete payload and carry out whatever it demands.
    async fn handle_payload(
        &mut self,
        connection: &mut Connection,
        payload: &[u8],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<CycleEnd>, ProcessError> {
        match self.process(payload).await? {
            PayloadFlow::Continue => Ok(None),
            PayloadFlow::Heartbeat => {
                if let Err(source) = self.send_heartbeat(connection).await {
                    tracing::warn!(id = %self.id, error = %source, "answering heartbeat request failed");

                    return Ok(Some(CycleEnd::Recoverable));
                }

                Ok(None)
            }
            PayloadFlow::Resume => {
                if let Err(source) = self.send_resume(connection).await {
                    tracing::warn!(id = %self.id, error = %source, "sending resume failed");

                    return Ok(Some(CycleEnd::Recoverable));
                }

                Ok(None)
            }
            PayloadFlow::Identify { delay } => {
                if let Some(delay) = delay {
                    let interrupted = tokio::select! {
                        _ = shutdown.changed() => true,
                        () = time::sleep(delay) => false,
                    };

                    if interrupted {
                        self.graceful_close(connection).await;

                        return Ok(Some(CycleEnd::Shutdown));
                    }
                }

                // The identify slot is taken immediately before the send and
                // held until READY or INVALID_SESSION.
                if self.identify_permit.is_none() {
                    let permit = tokio::select! {
                        _ = shutdown.changed() => None,
                        permit = self.context.queue.request([self.id.number(), self.id.total()]) => {
                            Some(permit)
                        }
                    };

                    match permit {
                        Some(permit) => self.identify_permit = Some(permit),
                        None => {
                            self.graceful_close(connection).await;

                            return Ok(Some(CycleEnd::Shutdown));
                        }
                    }
                }

                if let Err(source) = self.send_identify(connection).await {
                    tracing::warn!(id = %self.id, error = %source, "sending identify failed");

                    return Ok(Some(CycleEnd::Recoverable));
                }

                Ok(None)
            }
            PayloadFlow::Close { code } => {
                self.close_connection(connection, code, "gateway requested reconnect").await;

                Ok(Some(CycleEnd::Recoverable))
            }
        }
    }

    /// Interpret one payload, updating session and timer state.
    async fn process(&mut self, payload: &[u8]) -> Result<PayloadFlow, ProcessError> {
        let packet: ReceivePacket =
            serde_json::from_slice(payload).map_err(ProcessError::deserializing)?;

        self.context
            .collector
            .packet_received(self.id, packet.op, packet.event());

        if OpCode::from_u8(packet.op) == Some(OpCode::Dispatch) {
            // Dispatches are sequence-gated before reaching the observer.
            return self.process_dispatch(packet).await;
        }

        self.context.observer.on_packet(self.id, &packet);

        match OpCode::from_u8(packet.op) {
            Some(OpCode::Heartbeat) => Ok(PayloadFlow::Heartbeat),
            Some(OpCode::Reconnect) => {
                tracing::debug!(id = %self.id, "gateway requested a reconnect");

                Ok(PayloadFlow::Close {
                    code: CLOSE_CODE_RESUME,
                })
            }
            Some(OpCode::InvalidSession) => {
                let resumable = packet
                    .d
                    .as_deref()
                    .and_then(|data| serde_json::from_str::<bool>(data.get()).ok())
                    .unwrap_or_default();

                tracing::debug!(id = %self.id, resumable, "gateway invalidated the session");

                if resumable && self.session.is_resumable() {
                    self.stage = Stage::Resuming;

                    Ok(PayloadFlow::Resume)
                } else {
                    self.invalidate_session().await;
                    self.stage = Stage::Identifying;

                    // Identify tokens are scarce; retry in place after a short
                    // random delay instead of burning a reconnect.
                    let delay =
                        Duration::from_secs_f64(rand::thread_rng().gen_range(1.0..6.0));

                    Ok(PayloadFlow::Identify { delay: Some(delay) })
                }
            }
            Some(OpCode::Hello) => {
                let hello: Hello = parse_data(packet.d.as_deref())?;
                let interval = Duration::from_millis(hello.heartbeat_interval);

                tracing::debug!(
                    id = %self.id,
                    heartbeat_interval = hello.heartbeat_interval,
                    "received hello",
                );

                self.heartbeat_interval = Some(interval);
                self.heartbeat_acked = true;

                // Jitter the first heartbeat to de-synchronize fleet-wide
                // heartbeat bursts.
                let jitter = interval.mul_f64(rand::thread_rng().gen_range(0.0..1.0));
                self.next_heartbeat = Some(Instant::now() + jitter);
                self.deadline = None;

                if self.session.is_resumable() {
                    self.stage = Stage::Resuming;

                    Ok(PayloadFlow::Resume)
                } else {
                    self.stage = Stage::Identifying;

                    Ok(PayloadFlow::Identify { delay: None })
                }
            }
            Some(OpCode::HeartbeatAck) => {
                self.heartbeat_acked = true;

                if let Some(rtt) = self.latency.track_received() {
                    self.context.collector.heartbeat_rtt(self.id, rtt);
                }

                Ok(PayloadFlow::Continue)
            }
            _ => {
                tracing::debug!(id = %self.id, op = packet.op, "ignoring unexpected opcode");

                Ok(PayloadFlow::Continue)
            }
        }
    }

    /// Handle a dispatch packet: gate its sequence, record session identity,
    /// and forward it to the observer.
    async fn process_dispatch(
        &mut self,
        packet: ReceivePacket,
    ) -> Result<PayloadFlow, ProcessError> {
        if let Some(seq) = packet.s {
            if !self.session.advance(seq) {
                tracing::debug!(
                    id = %self.id,
                    seq,
                    current = ?self.session.sequence(),
                    "dropping stale dispatch",
                );

                return Ok(PayloadFlow::Continue);
            }

            if let Err(source) = self.context.store.set_seq(self.id.number(), seq).await {
                tracing::warn!(id = %self.id, error = %source, "persisting the sequence failed");
            }
        }

        match packet.event() {
            Some(EVENT_READY) => {
                let ready: Ready = parse_data(packet.d.as_deref())?;

                tracing::info!(id = %self.id, session_id = %ready.session_id, "session ready");

                self.session.set_id(ready.session_id.clone());
                self.session.set_resume_gateway_url(ready.resume_gateway_url);

                if let Err(source) = self
                    .context
                    .store
                    .set_session(self.id.number(), ready.session_id)
                    .await
                {
                    tracing::warn!(id = %self.id, error = %source, "persisting the session failed");
                }

                self.session_established();
            }
            Some(EVENT_RESUMED) => {
                tracing::info!(id = %self.id, "session resumed");

                self.session_established();
            }
            _ => {}
        }

        self.context.observer.on_packet(self.id, &packet);

        Ok(PayloadFlow::Continue)
    }

    /// Mark the session as running and release handshake bookkeeping.
    fn session_established(&mut self) {
        self.stage = Stage::Running;
        self.deadline = None;
        self.reconnect_attempts = 0;
        // Dropping the permit lets the next queued identify proceed.
        self.identify_permit = None;
        self.context.collector.shard_alive(self.id, true);
    }

    /// Discard the session locally and in the store.
    async fn invalidate_session(&mut self) {
        self.session.reset();
        self.identify_permit = None;

        if let Err(source) = self.context.store.clear_session(self.id.number()).await {
            tracing::warn!(id = %self.id, error = %source, "clearing the persisted session failed");
        }
    }

    /// Serialize and write one packet, honoring the send limiter.
    async fn send_packet(
        &mut self,
        connection: &mut Connection,
        packet: &SendPacket,
    ) -> Result<(), SendError> {
        let bytes = serde_json::to_vec(packet).map_err(|source| SendError {
            kind: SendErrorType::Serializing,
            source: Some(Box::new(source)),
        })?;

        self.send_limiter.acquire_one().await;

        connection
            .send(WsMessage::Binary(bytes))
            .await
            .map_err(|source| SendError {
                kind: SendErrorType::Sending,
                source: Some(Box::new(source)),
            })?;

        self.context.collector.packet_sent(self.id, packet.op as u8);

        Ok(())
    }

    /// Send a heartbeat and schedule the next one.
    async fn send_heartbeat(&mut self, connection: &mut Connection) -> Result<(), SendError> {
        let packet = SendPacket::heartbeat(self.session.sequence());

        tracing::debug!(id = %self.id, seq = ?self.session.sequence(), "sending heartbeat");

        self.send_packet(connection, &packet).await?;

        self.heartbeat_acked = false;
        self.latency.track_sent();

        if let Some(interval) = self.heartbeat_interval {
            self.next_heartbeat = Some(Instant::now() + interval);
        }

        Ok(())
    }

    /// Send IDENTIFY for a fresh session.
    async fn send_identify(&mut self, connection: &mut Connection) -> Result<(), SendError> {
        let identify = Identify {
            token: self.config.token().to_owned(),
            properties: self.config.identify_properties().clone(),
            compress: false,
            large_threshold: self.config.large_threshold(),
            shard: [self.id.number(), self.id.total()],
            presence: self.config.presence().cloned(),
            intents: self.config.intents(),
        };

        let packet = SendPacket::new(OpCode::Identify, &identify).map_err(|source| SendError {
            kind: SendErrorType::Serializing,
            source: Some(Box::new(source)),
        })?;

        tracing::debug!(id = %self.id, intents = ?self.config.intents(), "identifying");

        self.send_packet(connection, &packet).await?;

        self.stage = Stage::AwaitingReady;
        self.deadline = Some(Instant::now() + IDENTIFY_DEADLINE);

        Ok(())
    }

    /// Send RESUME for the current session.
    async fn send_resume(&mut self, connection: &mut Connection) -> Result<(), SendError> {
        let session_id = match self.session.id() {
            Some(id) => id.to_owned(),
            None => {
                tracing::error!(id = %self.id, "resume scheduled without a session id");

                return Ok(());
            }
        };
        let seq = self.session.sequence().unwrap_or_default();

        let resume = Resume {
            token: self.config.token().to_owned(),
            session_id,
            seq,
        };

        let packet = SendPacket::new(OpCode::Resume, &resume).map_err(|source| SendError {
            kind: SendErrorType::Serializing,
            source: Some(Box::new(source)),
        })?;

        tracing::debug!(id = %self.id, seq, "resuming session");

        self.send_packet(connection, &packet).await?;

        self.stage = Stage::Resuming;
        // Replays can legitimately take a while; a dead connection is caught
        // by the heartbeat instead of a handshake deadline.
        self.deadline = None;

        Ok(())
    }

    /// Close the connection for the shutdown path, invalidating nothing
    /// locally but telling the gateway the session is over.
    async fn graceful_close(&mut self, connection: &mut Connection) {
        tracing::info!(id = %self.id, "shutting down");

        self.stage = Stage::Closing;
        self.close_connection(connection, 1000, "shutting down").await;
        self.context.collector.shard_alive(self.id, false);
        self.stage = Stage::Disconnected;
    }

    /// Send a close frame and wait briefly for the peer to answer it.
    async fn close_connection(
        &mut self,
        connection: &mut Connection,
        code: u16,
        reason: &'static str,
    ) {
        let frame = CloseFrame {
            code: WsCloseCode::from(code),
            reason: Cow::Borrowed(reason),
        };

        if let Err(source) = connection.send(WsMessage::Close(Some(frame))).await {
            tracing::debug!(id = %self.id, error = %source, "sending close frame failed");

            return;
        }

        let drain = async {
            while let Some(message) = connection.next().await {
                match message {
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };

        if time::timeout(CLOSE_HANDSHAKE_TIMEOUT, drain).await.is_err() {
            tracing::debug!(id = %self.id, "peer didn't answer the close frame in time");
        }
    }
}

/// Backoff before a reconnect attempt: 1 second doubling per attempt, capped.
fn reconnect_delay(attempt: u8) -> Duration {
    let seconds = 1_u64 << u32::from(attempt.saturating_sub(1)).min(32);

    Duration::from_secs(seconds).min(RECONNECT_DELAY_CAP)
}

/// Decode the `d` field of a packet into a concrete payload.
fn parse_data<T: DeserializeOwned>(data: Option<&RawValue>) -> Result<T, ProcessError> {
    let raw = data.ok_or(ProcessError {
        kind: ProcessErrorType::Deserializing,
        source: None,
    })?;

    serde_json::from_str(raw.get()).map_err(ProcessError::deserializing)
}

#[cfg(test)]
mod tests {
    use super::{reconnect_delay, PayloadFlow, Shard, ShardContext, Stage};
    use crate::{
        config::{Config, ShardId},
        info::{GatewayBot, GatewayInfoProvider, GatewayMeta, InfoError},
        intents::Intents,
        metrics::NoopCollector,
        observer::{EventObserver, NoopObserver},
        packet::ReceivePacket,
        queue::LocalQueue,
        session::Session,
        store::{InMemorySessionStore, SessionStore},
    };
    use static_assertions::assert_impl_all;
    use std::{
        fmt::Debug,
        future::Future,
        pin::Pin,
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
        time::Duration,
    };

    assert_impl_all!(Shard: Debug, Send, Sync);
    assert_impl_all!(Stage: Clone, Copy, Debug, Eq, PartialEq, Send, Sync);

    #[derive(Debug)]
    struct StaticProvider;

    impl GatewayInfoProvider for StaticProvider {
        fn gateway_bot(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<GatewayBot, InfoError>> + Send + '_>> {
            Box::pin(async {
                serde_json::from_str(
                    r#"{
                        "url": "wss://gateway.discord.gg",
                        "shards": 1,
                        "session_start_limit": {
                            "total": 1000,
                            "remaining": 1000,
                            "reset_after": 0,
                            "max_concurrency": 1
                        }
                    }"#,
                )
                .map_err(InfoError::deserializing)
            })
        }
    }

    #[derive(Debug, Default)]
    struct CountingObserver {
        packets: AtomicU32,
    }

    impl EventObserver for CountingObserver {
        fn on_packet(&self, _: ShardId, _: &ReceivePacket) {
            self.packets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn shard_with(store: Arc<InMemorySessionStore>, observer: Arc<dyn EventObserver>) -> Shard {
        let context = ShardContext {
            queue: Arc::new(LocalQueue::new(1)),
            store,
            collector: Arc::new(NoopCollector),
            observer,
            gateway: Arc::new(GatewayMeta::new(Arc::new(StaticProvider))),
        };

        Shard::new(
            ShardId::new(0, 1),
            Arc::new(Config::new("token".to_owned(), Intents::empty())),
            context,
        )
    }

    fn shard(store: Arc<InMemorySessionStore>) -> Shard {
        shard_with(store, Arc::new(NoopObserver))
    }

    #[tokio::test]
    async fn hello_schedules_heartbeat_and_identifies() {
        let mut shard = shard(Arc::new(InMemorySessionStore::new()));

        let flow = shard
            .process(br#"{"op":10,"d":{"heartbeat_interval":41250}}"#)
            .await
            .unwrap();

        assert!(matches!(flow, PayloadFlow::Identify { delay: None }));
        assert_eq!(Stage::Identifying, shard.stage());
        assert_eq!(Some(Duration::from_millis(41_250)), shard.heartbeat_interval);
        assert!(shard.next_heartbeat.is_some());
    }

    #[tokio::test]
    async fn hello_with_persisted_session_resumes() {
        let mut shard = shard(Arc::new(InMemorySessionStore::new()));
        shard.session = Session::from_parts(Some("abc".to_owned()), Some(42));

        let flow = shard
            .process(br#"{"op":10,"d":{"heartbeat_interval":41250}}"#)
            .await
            .unwrap();

        assert!(matches!(flow, PayloadFlow::Resume));
        assert_eq!(Stage::Resuming, shard.stage());
    }

    #[tokio::test]
    async fn ready_records_the_session() {
        let store = Arc::new(InMemorySessionStore::new());
        let mut shard = shard(Arc::clone(&store));

        let flow = shard
            .process(
                br#"{"op":0,"s":1,"t":"READY","d":{"session_id":"abc","resume_gateway_url":"wss://g2"}}"#,
            )
            .await
            .unwrap();

        assert!(matches!(flow, PayloadFlow::Continue));
        assert_eq!(Stage::Running, shard.stage());
        assert_eq!(Some("abc"), shard.session.id());
        assert_eq!(Some("wss://g2"), shard.session.resume_gateway_url());
        assert_eq!(Some("abc".to_owned()), store.session(0).await.unwrap());
        assert_eq!(Some(1), store.seq(0).await.unwrap());
        assert!(shard.identify_permit.is_none());
    }

    #[tokio::test]
    async fn stale_dispatches_are_dropped() {
        let store = Arc::new(InMemorySessionStore::new());
        let mut shard = shard(Arc::clone(&store));
        shard.session = Session::from_parts(Some("abc".to_owned()), Some(42));

        shard
            .process(br#"{"op":0,"s":40,"t":"MESSAGE_CREATE","d":{}}"#)
            .await
            .unwrap();
        assert_eq!(Some(42), shard.session.sequence());

        shard
            .process(br#"{"op":0,"s":43,"t":"MESSAGE_CREATE","d":{}}"#)
            .await
            .unwrap();
        assert_eq!(Some(43), shard.session.sequence());
        assert_eq!(Some(43), store.seq(0).await.unwrap());
    }

    #[tokio::test]
    async fn non_resumable_invalid_session_clears_state() {
        let store = Arc::new(InMemorySessionStore::new());
        store.set_session(0, "abc".to_owned()).await.unwrap();

        let mut shard = shard(Arc::clone(&store));
        shard.session = Session::from_parts(Some("abc".to_owned()), Some(42));

        let flow = shard.process(br#"{"op":9,"d":false}"#).await.unwrap();

        match flow {
            PayloadFlow::Identify { delay: Some(delay) } => {
                assert!(delay >= Duration::from_secs(1));
                assert!(delay < Duration::from_secs(6));
            }
            other => panic!("expected delayed identify, got {other:?}"),
        }

        assert!(shard.session.id().is_none());
        assert_eq!(None, store.session(0).await.unwrap());
    }

    #[tokio::test]
    async fn resumable_invalid_session_resumes() {
        let mut shard = shard(Arc::new(InMemorySessionStore::new()));
        shard.session = Session::from_parts(Some("abc".to_owned()), Some(42));

        let flow = shard.process(br#"{"op":9,"d":true}"#).await.unwrap();

        assert!(matches!(flow, PayloadFlow::Resume));
    }

    #[tokio::test]
    async fn every_packet_reaches_the_observer() {
        let observer = Arc::new(CountingObserver::default());
        let mut shard = shard_with(
            Arc::new(InMemorySessionStore::new()),
            Arc::clone(&observer) as Arc<dyn EventObserver>,
        );

        shard
            .process(br#"{"op":10,"d":{"heartbeat_interval":41250}}"#)
            .await
            .unwrap();
        shard.process(br#"{"op":11}"#).await.unwrap();
        shard
            .process(br#"{"op":0,"s":1,"t":"READY","d":{"session_id":"abc"}}"#)
            .await
            .unwrap();

        assert_eq!(3, observer.packets.load(Ordering::SeqCst));

        // Stale dispatches are dropped before reaching the observer.
        shard
            .process(br#"{"op":0,"s":1,"t":"MESSAGE_CREATE","d":{}}"#)
            .await
            .unwrap();

        assert_eq!(3, observer.packets.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn heartbeat_request_is_answered() {
        let mut shard = shard(Arc::new(InMemorySessionStore::new()));

        let flow = shard.process(br#"{"op":1,"d":null}"#).await.unwrap();

        assert!(matches!(flow, PayloadFlow::Heartbeat));
    }

    #[tokio::test]
    async fn reconnect_closes_resumably() {
        let mut shard = shard(Arc::new(InMemorySessionStore::new()));

        let flow = shard.process(br#"{"op":7,"d":null}"#).await.unwrap();

        assert!(matches!(flow, PayloadFlow::Close { code: 4000 }));
    }

    #[tokio::test]
    async fn ack_marks_the_heartbeat() {
        let mut shard = shard(Arc::new(InMemorySessionStore::new()));
        shard.heartbeat_acked = false;
        shard.latency.track_sent();

        let flow = shard.process(br#"{"op":11}"#).await.unwrap();

        assert!(matches!(flow, PayloadFlow::Continue));
        assert!(shard.heartbeat_acked);
        assert_eq!(1, shard.latency().heartbeats());
    }

    #[test]
    fn reconnect_delays_double_and_cap() {
        assert_eq!(Duration::from_secs(1), reconnect_delay(1));
        assert_eq!(Duration::from_secs(2), reconnect_delay(2));
        assert_eq!(Duration::from_secs(4), reconnect_delay(3));
        assert_eq!(Duration::from_secs(16), reconnect_delay(5));
        assert_eq!(Duration::from_secs(300), reconnect_delay(12));
    }
}
