//! In-process fakes for the host platform and the completion endpoint.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use lumi_channels::{
    ChannelAdapter, ChannelId, GuildId, InboundMessage, OutboundMessage, ResolvedChannel, SenderId,
};
use lumi_llm::{ChatCompletion, ChatMessage, LlmError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

pub const BOT_USER_ID: &str = "999";

/// Build an inbound message. Channel ids are derived from the guild (or user for DMs).
pub fn inbound(sender: &str, guild: Option<&str>, content: &str, mentions_bot: bool) -> InboundMessage {
    let channel = match guild {
        Some(g) => format!("{g}-general"),
        None => format!("dm-{sender}"),
    };
    InboundMessage {
        message_id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed).to_string().into(),
        channel_id: channel.into(),
        guild_id: guild.map(GuildId::from),
        sender_id: sender.into(),
        bot_user_id: Some(BOT_USER_ID.into()),
        mentions_bot,
        content: content.to_string(),
        received_at: Utc::now(),
    }
}

#[derive(Default)]
pub struct FakeChannel {
    sent: Mutex<Vec<(ChannelId, OutboundMessage)>>,
    channels: Mutex<HashMap<ChannelId, (GuildId, String)>>,
    admins: Mutex<HashSet<(GuildId, SenderId)>>,
    failing_sends: AtomicUsize,
}

impl FakeChannel {
    pub fn sent(&self) -> Vec<(ChannelId, OutboundMessage)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn add_channel(&self, guild: &str, channel: &str, name: &str) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.insert(channel.into(), (guild.into(), name.to_string()));
        }
    }

    /// Make the next `n` sends fail as an upstream 500 would.
    pub fn fail_next_sends(&self, n: usize) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }

    pub fn grant_admin(&self, guild: &str, user: &str) {
        if let Ok(mut admins) = self.admins.lock() {
            admins.insert((guild.into(), user.into()));
        }
    }
}

#[async_trait]
impl ChannelAdapter for FakeChannel {
    fn platform(&self) -> &str {
        "fake"
    }

    async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        Ok(())
    }

    async fn send(&self, channel_id: &ChannelId, message: OutboundMessage) -> Result<()> {
        if self
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow::anyhow!("discord send failed: status=500"));
        }
        self.sent
            .lock()
            .map_err(|_| anyhow::anyhow!("sent log poisoned"))?
            .push((channel_id.clone(), message));
        Ok(())
    }

    async fn send_typing(&self, _channel_id: &ChannelId) -> Result<()> {
        Ok(())
    }

    async fn resolve_channel(
        &self,
        guild_id: &GuildId,
        channel_id: &ChannelId,
    ) -> Result<Option<ResolvedChannel>> {
        let channels = self
            .channels
            .lock()
            .map_err(|_| anyhow::anyhow!("channel map poisoned"))?;
        Ok(channels
            .get(channel_id)
            .filter(|(g, _)| g == guild_id)
            .map(|(_, name)| ResolvedChannel {
                id: channel_id.clone(),
                name: name.clone(),
            }))
    }

    async fn is_administrator(&self, guild_id: &GuildId, user_id: &SenderId) -> Result<bool> {
        let admins = self
            .admins
            .lock()
            .map_err(|_| anyhow::anyhow!("admin set poisoned"))?;
        Ok(admins.contains(&(guild_id.clone(), user_id.clone())))
    }
}

/// Replies from a fixed script and records every request it receives.
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<std::result::Result<String, LlmError>>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedCompletion {
    pub fn new(replies: Vec<std::result::Result<String, LlmError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChatCompletion for ScriptedCompletion {
    async fn complete(&self, messages: &[ChatMessage]) -> lumi_llm::Result<String> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }
        self.replies
            .lock()
            .map_err(|_| LlmError::Transport("script poisoned".to_string()))?
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Transport("script exhausted".to_string())))
    }
}
