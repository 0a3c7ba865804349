//! Errors returned by shard operations, and the close-code taxonomy that
//! decides whether a closed connection may reconnect.

use crate::compression::CompressionError;
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

/// Gateway close codes with defined meanings.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
#[repr(u16)]
pub enum CloseCode {
    /// Something went wrong on the gateway's side.
    UnknownError = 4000,
    /// An unknown operation code was sent.
    UnknownOpcode = 4001,
    /// An invalid payload was sent.
    DecodeError = 4002,
    /// A payload was sent before identifying.
    NotAuthenticated = 4003,
    /// The token in the identify payload is invalid.
    AuthenticationFailed = 4004,
    /// More than one identify payload was sent on one connection.
    AlreadyAuthenticated = 4005,
    /// The sequence sent when resuming was invalid.
    InvalidSequence = 4007,
    /// Payloads were sent too quickly.
    RateLimited = 4008,
    /// The session timed out.
    SessionTimedOut = 4009,
    /// The shard tuple in the identify payload was invalid.
    InvalidShard = 4010,
    /// The session would have handled too many guilds; sharding is required.
    ShardingRequired = 4011,
    /// An invalid gateway API version was requested.
    InvalidApiVersion = 4012,
    /// An invalid intent bitmask was sent.
    InvalidIntents = 4013,
    /// An intent was sent that the application has not been granted.
    DisallowedIntents = 4014,
}

impl CloseCode {
    /// Map a raw close code to a known variant, if there is one.
    pub const fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            4000 => Self::UnknownError,
            4001 => Self::UnknownOpcode,
            4002 => Self::DecodeError,
            4003 => Self::NotAuthenticated,
            4004 => Self::AuthenticationFailed,
            4005 => Self::AlreadyAuthenticated,
            4007 => Self::InvalidSequence,
            4008 => Self::RateLimited,
            4009 => Self::SessionTimedOut,
            4010 => Self::InvalidShard,
            4011 => Self::ShardingRequired,
            4012 => Self::InvalidApiVersion,
            4013 => Self::InvalidIntents,
            4014 => Self::DisallowedIntents,
            _ => return None,
        })
    }

    /// Whether a connection closed with this code may be re-established.
    ///
    /// Authentication, sharding, and intent validation failures are terminal:
    /// reconnecting would only reproduce them.
    pub const fn can_reconnect(self) -> bool {
        !matches!(
            self,
            Self::AuthenticationFailed
                | Self::InvalidShard
                | Self::ShardingRequired
                | Self::InvalidApiVersion
                | Self::InvalidIntents
                | Self::DisallowedIntents
        )
    }
}

impl Display for CloseCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(match self {
            Self::UnknownError => "unknown error",
            Self::UnknownOpcode => "unknown opcode",
            Self::DecodeError => "decode error",
            Self::NotAuthenticated => "not authenticated",
            Self::AuthenticationFailed => "authentication failed",
            Self::AlreadyAuthenticated => "already authenticated",
            Self::InvalidSequence => "invalid sequence",
            Self::RateLimited => "rate limited",
            Self::SessionTimedOut => "session timed out",
            Self::InvalidShard => "invalid shard",
            Self::ShardingRequired => "sharding required",
            Self::InvalidApiVersion => "invalid api version",
            Self::InvalidIntents => "invalid intents",
            Self::DisallowedIntents => "disallowed intents",
        })
    }
}

/// Whether a raw close code permits reconnecting.
///
/// Codes below 4000 and codes the gateway hasn't defined are treated as
/// recoverable; only the defined terminal codes end a shard.
pub fn close_code_recoverable(code: u16) -> bool {
    CloseCode::from_code(code).map_or(true, CloseCode::can_reconnect)
}

/// Establishing a gateway connection failed.
#[derive(Debug)]
pub struct ConnectError {
    pub(crate) kind: ConnectErrorType,
    pub(crate) source: Option<Box<dyn Error + Send + Sync>>,
}

impl ConnectError {
    /// Immutable reference to the type of error that occurred.
    #[must_use = "retrieving the type has no effect if left unused"]
    pub const fn kind(&self) -> &ConnectErrorType {
        &self.kind
    }

    /// Consume the error, returning the owned error type and the source error.
    #[must_use = "consuming the error into its parts has no effect if left unused"]
    pub fn into_parts(self) -> (ConnectErrorType, Option<Box<dyn Error + Send + Sync>>) {
        (self.kind, self.source)
    }
}

impl Display for ConnectError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.kind {
            ConnectErrorType::Establishing => f.write_str("establishing the connection failed"),
            ConnectErrorType::TimedOut => {
                f.write_str("connection wasn't fully established in time")
            }
        }
    }
}

impl Error for ConnectError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn Error + 'static))
    }
}

/// Type of [`ConnectError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum ConnectErrorType {
    /// The TCP, TLS, or WebSocket handshake failed.
    Establishing,
    /// The handshake didn't complete within the connect timeout.
    TimedOut,
}

/// Sending a command over a shard failed.
#[derive(Debug)]
pub struct SendError {
    pub(crate) kind: SendErrorType,
    pub(crate) source: Option<Box<dyn Error + Send + Sync>>,
}

impl SendError {
    /// Immutable reference to the type of error that occurred.
    #[must_use = "retrieving the type has no effect if left unused"]
    pub const fn kind(&self) -> &SendErrorType {
        &self.kind
    }

    /// Consume the error, returning the owned error type and the source error.
    #[must_use = "consuming the error into its parts has no effect if left unused"]
    pub fn into_parts(self) -> (SendErrorType, Option<Box<dyn Error + Send + Sync>>) {
        (self.kind, self.source)
    }
}

impl Display for SendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.kind {
            SendErrorType::NotRunning => {
                f.write_str("shard isn't in a running session, so commands can't be delivered")
            }
            SendErrorType::Sending => f.write_str("sending the message over the websocket failed"),
            SendErrorType::Serializing => f.write_str("serializing the value as json failed"),
        }
    }
}

impl Error for SendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn Error + 'static))
    }
}

/// Type of [`SendError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum SendErrorType {
    /// The shard is connected but hasn't established a running session.
    NotRunning,
    /// Sending the payload over the WebSocket failed. This is indicative of a
    /// connection that is restarting.
    Sending,
    /// Serializing the payload as JSON failed.
    Serializing,
}

/// Received gateway message couldn't be processed.
#[derive(Debug)]
pub struct ProcessError {
    pub(crate) kind: ProcessErrorType,
    pub(crate) source: Option<Box<dyn Error + Send + Sync>>,
}

impl ProcessError {
    /// Immutable reference to the type of error that occurred.
    #[must_use = "retrieving the type has no effect if left unused"]
    pub const fn kind(&self) -> &ProcessErrorType {
        &self.kind
    }

    pub(crate) fn decompressing(source: CompressionError) -> Self {
        Self {
            kind: ProcessErrorType::Decompressing,
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn deserializing(source: serde_json::Error) -> Self {
        Self {
            kind: ProcessErrorType::Deserializing,
            source: Some(Box::new(source)),
        }
    }
}

impl Display for ProcessError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.kind {
            ProcessErrorType::Decompressing => {
                f.write_str("decompressing a frame failed, the stream may be corrupt")
            }
            ProcessErrorType::Deserializing => {
                f.write_str("payload could not be parsed as a gateway packet")
            }
        }
    }
}

impl Error for ProcessError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn Error + 'static))
    }
}

/// Type of [`ProcessError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum ProcessErrorType {
    /// A compressed frame couldn't be decompressed.
    Decompressing,
    /// A payload couldn't be parsed as a gateway packet.
    Deserializing,
}

/// A shard terminated and will not reconnect.
#[derive(Debug)]
pub struct FatalError {
    pub(crate) kind: FatalErrorType,
}

impl FatalError {
    /// Immutable reference to the type of error that occurred.
    #[must_use = "retrieving the type has no effect if left unused"]
    pub const fn kind(&self) -> &FatalErrorType {
        &self.kind
    }

    pub(crate) const fn closed(close_code: u16) -> Self {
        Self {
            kind: FatalErrorType::FatallyClosed { close_code },
        }
    }

    pub(crate) const fn reconnects_exhausted() -> Self {
        Self {
            kind: FatalErrorType::ReconnectsExhausted,
        }
    }
}

impl Display for FatalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.kind {
            FatalErrorType::FatallyClosed { close_code } => {
                f.write_str("shard fatally closed: ")?;

                if let Some(code) = CloseCode::from_code(close_code) {
                    Display::fmt(&code, f)
                } else {
                    Display::fmt(&close_code, f)
                }
            }
            FatalErrorType::ReconnectsExhausted => {
                f.write_str("shard gave up after exhausting its reconnect attempts")
            }
        }
    }
}

impl Error for FatalError {}

/// Type of [`FatalError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum FatalErrorType {
    /// The connection was closed with a terminal close code.
    FatallyClosed {
        /// Close code of the close message.
        close_code: u16,
    },
    /// Every allowed reconnect attempt failed in a row.
    ReconnectsExhausted,
}

#[cfg(test)]
mod tests {
    use super::{
        close_code_recoverable, CloseCode, ConnectError, ConnectErrorType, FatalError,
        FatalErrorType, ProcessError, ProcessErrorType, SendError, SendErrorType,
    };
    use static_assertions::assert_impl_all;
    use std::{error::Error, fmt::Debug};

    assert_impl_all!(CloseCode: Clone, Copy, Debug, Eq, PartialEq, Send, Sync);
    assert_impl_all!(ConnectErrorType: Debug, Send, Sync);
    assert_impl_all!(ConnectError: Error, Send, Sync);
    assert_impl_all!(SendErrorType: Debug, Send, Sync);
    assert_impl_all!(SendError: Error, Send, Sync);
    assert_impl_all!(ProcessErrorType: Debug, Send, Sync);
    assert_impl_all!(ProcessError: Error, Send, Sync);
    assert_impl_all!(FatalErrorType: Debug, Send, Sync);
    assert_impl_all!(FatalError: Error, Send, Sync);

    #[test]
    fn terminal_close_codes() {
        for code in [4004, 4010, 4011, 4012, 4013, 4014] {
            assert!(!close_code_recoverable(code), "{code} must be terminal");
        }
    }

    #[test]
    fn recoverable_close_codes() {
        for code in [1000, 1001, 1006, 4000, 4001, 4002, 4003, 4005, 4007, 4008, 4009] {
            assert!(close_code_recoverable(code), "{code} must be recoverable");
        }

        // Codes the gateway hasn't defined don't end a shard.
        assert!(close_code_recoverable(4006));
        assert!(close_code_recoverable(4999));
    }
}
