use crate::types::{ChannelId, GuildId, InboundMessage, OutboundMessage, ResolvedChannel, SenderId};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Platform identifier, e.g. "discord".
    fn platform(&self) -> &str;

    /// Start receiving messages. Push to tx for each inbound message.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Send a message into a channel, optionally as a reply.
    async fn send(&self, channel_id: &ChannelId, message: OutboundMessage) -> Result<()>;

    /// Show the typing indicator in a channel. Advisory only.
    async fn send_typing(&self, _channel_id: &ChannelId) -> Result<()> {
        Err(anyhow::anyhow!(
            "send_typing is not supported by this channel"
        ))
    }

    /// Look up a channel inside a guild. `None` when it no longer exists there.
    async fn resolve_channel(
        &self,
        guild_id: &GuildId,
        channel_id: &ChannelId,
    ) -> Result<Option<ResolvedChannel>>;

    /// Whether `user_id` holds administrator capability in `guild_id`.
    async fn is_administrator(&self, guild_id: &GuildId, user_id: &SenderId) -> Result<bool>;
}
