//! Gateway intents requested when identifying.

use bitflags::bitflags;
use serde::{
    de::{Deserialize, Deserializer},
    ser::{Serialize, Serializer},
};

bitflags! {
    /// Bitmask of gateway event groups a session subscribes to.
    ///
    /// Sent in the IDENTIFY payload. The gateway validates the mask and closes
    /// the connection with a terminal code when an intent is invalid or not
    /// granted to the application.
    pub struct Intents: u64 {
        /// Guild lifecycle, channels, threads, and role events.
        const GUILDS = 1;
        /// Member add/update/remove events. Privileged.
        const GUILD_MEMBERS = 1 << 1;
        /// Ban add and remove events.
        const GUILD_BANS = 1 << 2;
        /// Emoji and sticker update events.
        const GUILD_EMOJIS_AND_STICKERS = 1 << 3;
        /// Integration update events.
        const GUILD_INTEGRATIONS = 1 << 4;
        /// Webhook update events.
        const GUILD_WEBHOOKS = 1 << 5;
        /// Invite create and delete events.
        const GUILD_INVITES = 1 << 6;
        /// Voice state update events.
        const GUILD_VOICE_STATES = 1 << 7;
        /// Presence update events. Privileged.
        const GUILD_PRESENCES = 1 << 8;
        /// Message events within guilds.
        const GUILD_MESSAGES = 1 << 9;
        /// Message reaction events within guilds.
        const GUILD_MESSAGE_REACTIONS = 1 << 10;
        /// Typing start events within guilds.
        const GUILD_MESSAGE_TYPING = 1 << 11;
        /// Message events within direct messages.
        const DIRECT_MESSAGES = 1 << 12;
        /// Message reaction events within direct messages.
        const DIRECT_MESSAGE_REACTIONS = 1 << 13;
        /// Typing start events within direct messages.
        const DIRECT_MESSAGE_TYPING = 1 << 14;
        /// Message content in message events. Privileged.
        const MESSAGE_CONTENT = 1 << 15;
        /// Scheduled event lifecycle events.
        const GUILD_SCHEDULED_EVENTS = 1 << 16;
        /// Auto moderation rule configuration events.
        const AUTO_MODERATION_CONFIGURATION = 1 << 20;
        /// Auto moderation rule execution events.
        const AUTO_MODERATION_EXECUTION = 1 << 21;
    }
}

impl Intents {
    /// Look up a single intent by its configuration name, such as
    /// `"GUILD_MESSAGES"`.
    ///
    /// Returns `None` for names the gateway doesn't define, which callers
    /// should treat as a configuration error rather than ignoring.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "GUILDS" => Self::GUILDS,
            "GUILD_MEMBERS" => Self::GUILD_MEMBERS,
            "GUILD_BANS" => Self::GUILD_BANS,
            "GUILD_EMOJIS_AND_STICKERS" => Self::GUILD_EMOJIS_AND_STICKERS,
            "GUILD_INTEGRATIONS" => Self::GUILD_INTEGRATIONS,
            "GUILD_WEBHOOKS" => Self::GUILD_WEBHOOKS,
            "GUILD_INVITES" => Self::GUILD_INVITES,
            "GUILD_VOICE_STATES" => Self::GUILD_VOICE_STATES,
            "GUILD_PRESENCES" => Self::GUILD_PRESENCES,
            "GUILD_MESSAGES" => Self::GUILD_MESSAGES,
            "GUILD_MESSAGE_REACTIONS" => Self::GUILD_MESSAGE_REACTIONS,
            "GUILD_MESSAGE_TYPING" => Self::GUILD_MESSAGE_TYPING,
            "DIRECT_MESSAGES" => Self::DIRECT_MESSAGES,
            "DIRECT_MESSAGE_REACTIONS" => Self::DIRECT_MESSAGE_REACTIONS,
            "DIRECT_MESSAGE_TYPING" => Self::DIRECT_MESSAGE_TYPING,
            "MESSAGE_CONTENT" => Self::MESSAGE_CONTENT,
            "GUILD_SCHEDULED_EVENTS" => Self::GUILD_SCHEDULED_EVENTS,
            "AUTO_MODERATION_CONFIGURATION" => Self::AUTO_MODERATION_CONFIGURATION,
            "AUTO_MODERATION_EXECUTION" => Self::AUTO_MODERATION_EXECUTION,
            _ => return None,
        })
    }
}

impl<'de> Deserialize<'de> for Intents {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from_bits_truncate(u64::deserialize(deserializer)?))
    }
}

impl Serialize for Intents {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.bits())
    }
}

#[cfg(test)]
mod tests {
    use super::Intents;
    use serde::{Deserialize, Serialize};
    use static_assertions::assert_impl_all;
    use std::{fmt::Debug, hash::Hash};

    assert_impl_all!(
        Intents: Copy,
        Clone,
        Debug,
        Deserialize<'static>,
        Eq,
        Hash,
        PartialEq,
        Send,
        Serialize,
        Sync,
    );

    #[test]
    fn from_name() {
        assert_eq!(Some(Intents::GUILDS), Intents::from_name("GUILDS"));
        assert_eq!(
            Some(Intents::GUILD_VOICE_STATES),
            Intents::from_name("GUILD_VOICE_STATES"),
        );
        assert!(Intents::from_name("GUILD_KARAOKE").is_none());
        assert!(Intents::from_name("guilds").is_none());
    }

    #[test]
    fn serde_bits() {
        let intents = Intents::GUILDS | Intents::GUILD_MESSAGES;
        let json = serde_json::to_string(&intents).unwrap();
        assert_eq!("513", json);
        assert_eq!(intents, serde_json::from_str::<Intents>(&json).unwrap());
    }
}
