//! Host platform adapters for Lumi.
//!
//! Adapters are pure I/O: they convert platform events into `InboundMessage`
//! and carry `OutboundMessage` replies back, plus the few lookups the admin
//! commands need (channel resolution, administrator capability).

mod discord;
mod traits;
mod types;

pub use discord::DiscordAdapter;
pub use traits::ChannelAdapter;
pub use types::{
    ChannelId, GuildId, InboundMessage, MessageId, OutboundMessage, ResolvedChannel, SenderId,
};
