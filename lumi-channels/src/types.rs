use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(ChannelId);
id_newtype!(GuildId);
id_newtype!(SenderId);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    /// `None` for direct messages.
    pub guild_id: Option<GuildId>,
    pub sender_id: SenderId,
    /// The bot's own user id at the time the message arrived, once known.
    pub bot_user_id: Option<SenderId>,
    pub mentions_bot: bool,
    pub content: String,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn is_direct_message(&self) -> bool {
        self.guild_id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub content: String,
    #[serde(default)]
    pub reply_to_message_id: Option<MessageId>,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            reply_to_message_id: None,
        }
    }

    pub fn reply(content: impl Into<String>, to: MessageId) -> Self {
        Self {
            content: content.into(),
            reply_to_message_id: Some(to),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedChannel {
    pub id: ChannelId,
    pub name: String,
}

impl ResolvedChannel {
    /// Platform markup that renders as a clickable channel reference.
    pub fn mention(&self) -> String {
        format!("<#{}>", self.id)
    }
}
