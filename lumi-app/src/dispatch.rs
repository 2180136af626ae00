//! Dispatch policy: decides whether an inbound message gets a model reply and
//! assembles the prompt for it.
//!
//! The new user turn is staged, not stored, while the completion call is in
//! flight. It is committed together with the assistant turn only after the
//! reply has been delivered, so a failed completion or a failed send leaves the
//! window exactly as it was before the message arrived.

use crate::store::{DIRECT_MESSAGE_GUILD, Store, UsageRecord};
use crate::window::WindowManager;
use anyhow::Result;
use chrono::Utc;
use lumi_channels::{ChannelAdapter, ChannelId, GuildId, InboundMessage, OutboundMessage, SenderId};
use lumi_llm::{ChatCompletion, ChatMessage, LlmError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Discord clears the indicator after ~10s; refresh a little earlier.
const TYPING_REFRESH: Duration = Duration::from_secs(8);

/// DMs always qualify; guild messages need a mention or an allow-listed channel.
pub fn should_respond(
    is_direct_message: bool,
    is_bot_mentioned: bool,
    is_channel_allowed: bool,
) -> bool {
    if is_direct_message {
        return true;
    }
    is_bot_mentioned || is_channel_allowed
}

/// Remove the bot's own mention tokens and trim surrounding whitespace.
pub fn clean_content(text: &str, bot_user_id: Option<&SenderId>) -> String {
    let Some(bot) = bot_user_id else {
        return text.trim().to_string();
    };
    text.replace(&format!("<@{bot}>"), "")
        .replace(&format!("<@!{bot}>"), "")
        .trim()
        .to_string()
}

/// The ordered message list for one completion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Cleaned user text, committed to the window on success.
    pub cleaned: String,
    /// `[system] + window-after-append`.
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Ignored,
    Replied,
    Apologized,
}

pub struct Dispatcher {
    system_prompt: ChatMessage,
    fallback_reply: String,
    windows: Arc<WindowManager>,
    store: Store,
    llm: Arc<dyn ChatCompletion>,
    channel: Arc<dyn ChannelAdapter>,
}

impl Dispatcher {
    pub fn new(
        system_prompt: impl Into<String>,
        fallback_reply: impl Into<String>,
        windows: Arc<WindowManager>,
        store: Store,
        llm: Arc<dyn ChatCompletion>,
        channel: Arc<dyn ChannelAdapter>,
    ) -> Self {
        Self {
            system_prompt: ChatMessage::system(system_prompt),
            fallback_reply: fallback_reply.into(),
            windows,
            store,
            llm,
            channel,
        }
    }

    /// Apply `should_respond`, consulting the allow-list only when it can change the answer.
    pub async fn qualifies(&self, inbound: &InboundMessage) -> bool {
        let is_direct_message = inbound.is_direct_message();
        let is_channel_allowed = match inbound.guild_id.as_ref() {
            Some(guild_id) if !inbound.mentions_bot => {
                self.channel_allowed(guild_id, &inbound.channel_id).await
            }
            _ => false,
        };
        should_respond(is_direct_message, inbound.mentions_bot, is_channel_allowed)
    }

    async fn channel_allowed(&self, guild_id: &GuildId, channel_id: &ChannelId) -> bool {
        match self.store.is_channel_allowed(guild_id, channel_id).await {
            Ok(allowed) => allowed,
            Err(e) => {
                tracing::warn!(%e, %guild_id, %channel_id, "allow-list lookup failed; treating as not allowed");
                false
            }
        }
    }

    pub fn build_prompt(
        &self,
        user_id: &SenderId,
        incoming_text: &str,
        bot_user_id: Option<&SenderId>,
    ) -> Prompt {
        let cleaned = clean_content(incoming_text, bot_user_id);
        let window = self
            .windows
            .preview_append(user_id, ChatMessage::user(cleaned.clone()));
        let mut messages = Vec::with_capacity(window.len() + 1);
        messages.push(self.system_prompt.clone());
        messages.extend(window);
        Prompt { cleaned, messages }
    }

    /// Commit a delivered exchange to the user's window.
    pub fn on_reply(&self, user_id: &SenderId, incoming_text: &str, assistant_text: &str) {
        self.windows.append_exchange(
            user_id,
            ChatMessage::user(incoming_text),
            ChatMessage::assistant(assistant_text),
        );
        tracing::debug!(tracked_users = self.windows.tracked_users(), "exchange committed");
    }

    /// One completion round trip. Nothing is committed here; the caller
    /// commits through `on_reply` once the reply has actually been delivered.
    #[tracing::instrument(level = "info", skip_all, fields(user_id = %user_id))]
    pub async fn respond(
        &self,
        user_id: &SenderId,
        incoming_text: &str,
        bot_user_id: Option<&SenderId>,
    ) -> std::result::Result<(Prompt, String), LlmError> {
        let prompt = self.build_prompt(user_id, incoming_text, bot_user_id);
        tracing::debug!(prompt_messages = prompt.messages.len(), "calling completion endpoint");

        let reply = self.llm.complete(&prompt.messages).await?;
        if reply.trim().is_empty() {
            return Err(LlmError::MalformedResponse(
                "completion returned empty content".to_string(),
            ));
        }
        Ok((prompt, reply))
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(user_id = %inbound.sender_id, channel_id = %inbound.channel_id)
    )]
    pub async fn handle(&self, inbound: &InboundMessage) -> Result<Handled> {
        if !self.qualifies(inbound).await {
            return Ok(Handled::Ignored);
        }

        let outcome = {
            let _typing = self.start_typing(inbound.channel_id.clone());
            self.respond(
                &inbound.sender_id,
                &inbound.content,
                inbound.bot_user_id.as_ref(),
            )
            .await
        };

        let (prompt, reply) = match outcome {
            Ok(exchange) => exchange,
            Err(e) => {
                tracing::warn!(error = %e, error_kind = ?e, "completion failed; sending fallback reply");
                self.send_fallback(inbound).await?;
                return Ok(Handled::Apologized);
            }
        };

        if let Err(e) = self
            .channel
            .send(
                &inbound.channel_id,
                OutboundMessage::reply(reply.clone(), inbound.message_id.clone()),
            )
            .await
        {
            tracing::warn!(%e, "reply delivery failed; sending fallback reply");
            self.send_fallback(inbound).await.map_err(|fallback| {
                anyhow::anyhow!("reply delivery failed: {e}; fallback failed: {fallback}")
            })?;
            return Ok(Handled::Apologized);
        }

        self.on_reply(&inbound.sender_id, &prompt.cleaned, &reply);

        let usage = UsageRecord {
            user_id: inbound.sender_id.clone(),
            guild_id: inbound
                .guild_id
                .as_ref()
                .map(|g| g.to_string())
                .unwrap_or_else(|| DIRECT_MESSAGE_GUILD.to_string()),
            channel_id: inbound.channel_id.clone(),
            timestamp: Utc::now(),
            message_length: prompt.cleaned.chars().count(),
            response_length: reply.chars().count(),
        };
        if let Err(e) = self.store.insert_usage(usage).await {
            tracing::warn!(%e, "usage logging failed");
        }
        Ok(Handled::Replied)
    }

    async fn send_fallback(&self, inbound: &InboundMessage) -> Result<()> {
        self.channel
            .send(
                &inbound.channel_id,
                OutboundMessage::reply(self.fallback_reply.clone(), inbound.message_id.clone()),
            )
            .await
    }

    fn start_typing(&self, channel_id: ChannelId) -> DropGuard {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let channel = self.channel.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = channel.send_typing(&channel_id).await {
                    tracing::debug!(%e, "typing indicator failed");
                }
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tokio::time::sleep(TYPING_REFRESH) => {}
                }
            }
        });
        token.drop_guard()
    }
}
