//! Control-plane packet model for the gateway wire protocol.
//!
//! Dispatch payloads are deliberately left undecoded: a [`ReceivePacket`]
//! carries its `d` field as raw JSON so observers and the broker can forward
//! it without this crate knowing anything about application events.

use crate::intents::Intents;
use serde::{Deserialize, Serialize};
use serde_json::{value::RawValue, Value};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::env::consts::OS;

/// Dispatch event name carried by the first packet of a fresh session.
pub const EVENT_READY: &str = "READY";

/// Dispatch event name confirming a successful resume.
pub const EVENT_RESUMED: &str = "RESUMED";

/// Gateway operation codes.
#[derive(
    Clone, Copy, Debug, Deserialize_repr, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize_repr,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum OpCode {
    /// An application event, named by the packet's `t` field.
    Dispatch = 0,
    /// Keep-alive ping, sent periodically and on server request.
    Heartbeat = 1,
    /// Start a new session.
    Identify = 2,
    /// Update the bot's presence.
    PresenceUpdate = 3,
    /// Join, move, or leave a voice channel.
    VoiceStateUpdate = 4,
    /// Replay a previous session from a sequence number.
    Resume = 6,
    /// Server request to disconnect and resume.
    Reconnect = 7,
    /// Request guild member chunks.
    RequestGuildMembers = 8,
    /// The session is invalid; the payload says whether it can be resumed.
    InvalidSession = 9,
    /// First packet of a connection, carrying the heartbeat interval.
    Hello = 10,
    /// Acknowledgement of a sent heartbeat.
    HeartbeatAck = 11,
}

impl OpCode {
    /// Map a raw operation code to a known variant, if there is one.
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            3 => Self::PresenceUpdate,
            4 => Self::VoiceStateUpdate,
            6 => Self::Resume,
            7 => Self::Reconnect,
            8 => Self::RequestGuildMembers,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            _ => return None,
        })
    }
}

/// Inbound gateway frame.
///
/// The operation code is kept raw so that packets with codes this crate
/// doesn't know about are still counted and forwarded instead of failing
/// deserialization.
#[derive(Debug, Deserialize)]
pub struct ReceivePacket {
    /// Raw operation code.
    pub op: u8,
    /// Payload, undecoded.
    #[serde(default)]
    pub d: Option<Box<RawValue>>,
    /// Sequence number, present on dispatch packets.
    #[serde(default)]
    pub s: Option<u64>,
    /// Dispatch event name.
    #[serde(default)]
    pub t: Option<String>,
}

impl ReceivePacket {
    /// Dispatch event name, if this is a dispatch packet.
    pub fn event(&self) -> Option<&str> {
        self.t.as_deref()
    }
}

/// Outbound gateway command.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SendPacket {
    /// Operation code of the command.
    pub op: OpCode,
    /// Command payload.
    pub d: Value,
}

impl SendPacket {
    /// Create a packet from an operation code and a serializable payload.
    ///
    /// # Errors
    ///
    /// Returns the underlying error if the payload isn't representable as
    /// JSON.
    pub fn new(op: OpCode, payload: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            op,
            d: serde_json::to_value(payload)?,
        })
    }

    /// Create a heartbeat packet carrying the last seen sequence.
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self {
            op: OpCode::Heartbeat,
            d: sequence.map_or(Value::Null, Value::from),
        }
    }
}

/// HELLO payload.
#[derive(Debug, Deserialize)]
pub struct Hello {
    /// Interval between heartbeats, in milliseconds.
    pub heartbeat_interval: u64,
}

/// READY payload, reduced to the fields the session machinery needs.
#[derive(Debug, Deserialize)]
pub struct Ready {
    /// Server-assigned session identifier used for resuming.
    pub session_id: String,
    /// Gateway URL to reconnect to when resuming this session.
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

/// IDENTIFY payload starting a fresh session.
#[derive(Debug, Serialize)]
pub struct Identify {
    /// Authentication token, including the `Bot ` prefix.
    pub token: String,
    /// Client properties reported to the gateway.
    pub properties: IdentifyProperties,
    /// Whether payload compression is requested. Transport compression is
    /// negotiated through the connection URL instead, so this is `false`.
    pub compress: bool,
    /// Member-list threshold for large guilds.
    pub large_threshold: u64,
    /// Shard identity as `[shard_id, shard_total]`.
    pub shard: [u32; 2],
    /// Initial presence, passed through from configuration undecoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Value>,
    /// Requested gateway intents.
    pub intents: Intents,
}

/// Client properties reported in IDENTIFY.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IdentifyProperties {
    /// Operating system of the client.
    pub os: String,
    /// Library name reported as the browser.
    pub browser: String,
    /// Library name reported as the device.
    pub device: String,
}

impl IdentifyProperties {
    /// Create identify properties from the three reported names.
    pub fn new(
        os: impl Into<String>,
        browser: impl Into<String>,
        device: impl Into<String>,
    ) -> Self {
        Self {
            os: os.into(),
            browser: browser.into(),
            device: device.into(),
        }
    }
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self::new(OS, "nimbus", "nimbus")
    }
}

/// RESUME payload replaying a previous session.
#[derive(Debug, Serialize)]
pub struct Resume {
    /// Authentication token, including the `Bot ` prefix.
    pub token: String,
    /// Identifier of the session being resumed.
    pub session_id: String,
    /// Last sequence number seen before the connection was lost.
    pub seq: u64,
}

#[cfg(test)]
mod tests {
    use super::{OpCode, ReceivePacket, SendPacket};
    use serde::{Deserialize, Serialize};
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;

    assert_impl_all!(OpCode: Clone, Copy, Debug, Eq, PartialEq, Send, Sync);
    assert_impl_all!(ReceivePacket: Debug, Deserialize<'static>, Send, Sync);
    assert_impl_all!(
        SendPacket: Clone,
        Debug,
        Deserialize<'static>,
        Eq,
        PartialEq,
        Send,
        Serialize,
        Sync,
    );

    #[test]
    fn opcode_values() {
        assert_eq!(Some(OpCode::Dispatch), OpCode::from_u8(0));
        assert_eq!(Some(OpCode::Resume), OpCode::from_u8(6));
        assert_eq!(Some(OpCode::HeartbeatAck), OpCode::from_u8(11));
        assert!(OpCode::from_u8(5).is_none());
        assert!(OpCode::from_u8(12).is_none());
    }

    #[test]
    fn receive_packet_dispatch() {
        let json = r#"{"op":0,"d":{"content":"hi"},"s":3,"t":"MESSAGE_CREATE"}"#;
        let packet: ReceivePacket = serde_json::from_str(json).unwrap();

        assert_eq!(0, packet.op);
        assert_eq!(Some(3), packet.s);
        assert_eq!(Some("MESSAGE_CREATE"), packet.event());
        assert_eq!(
            r#"{"content":"hi"}"#,
            packet.d.as_deref().map(|d| d.get()).unwrap(),
        );
    }

    #[test]
    fn receive_packet_missing_fields() {
        let packet: ReceivePacket = serde_json::from_str(r#"{"op":11}"#).unwrap();

        assert_eq!(11, packet.op);
        assert!(packet.d.is_none());
        assert!(packet.s.is_none());
        assert!(packet.t.is_none());
    }

    #[test]
    fn send_packet_round_trip() {
        let packet = SendPacket::new(
            OpCode::VoiceStateUpdate,
            &serde_json::json!({"guild_id": "1", "channel_id": null}),
        )
        .unwrap();

        let encoded = serde_json::to_vec(&packet).unwrap();
        let decoded: SendPacket = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(packet, decoded);
    }

    #[test]
    fn heartbeat_payload() {
        let with_seq = SendPacket::heartbeat(Some(42));
        assert_eq!(
            r#"{"op":1,"d":42}"#,
            serde_json::to_string(&with_seq).unwrap(),
        );

        let without = SendPacket::heartbeat(None);
        assert_eq!(r#"{"op":1,"d":null}"#, serde_json::to_string(&without).unwrap());
    }
}
