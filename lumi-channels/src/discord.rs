use crate::traits::ChannelAdapter;
use crate::types::{
    ChannelId, GuildId, InboundMessage, OutboundMessage, ResolvedChannel, SenderId,
};
use anyhow::Result;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_tungstenite::tungstenite::Message;

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
const DISCORD_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
/// GUILDS | GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT
const DISCORD_DEFAULT_INTENTS: u64 = 1 | (1 << 9) | (1 << 12) | (1 << 15);
const DISCORD_ADMINISTRATOR: u64 = 1 << 3;
const DISCORD_MAX_MESSAGE_CHARS: usize = 2000;
const DISCORD_RECONNECT_BASE_MS: u64 = 1_000;
const DISCORD_RECONNECT_MAX_MS: u64 = 60_000;

#[derive(Clone)]
pub struct DiscordAdapter {
    http: reqwest::Client,
    bot_token: String,
    gateway_intents: u64,
}

impl DiscordAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
            gateway_intents: DISCORD_DEFAULT_INTENTS,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{DISCORD_API_BASE}{path}")
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.bot_token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let resp = self
            .http
            .get(self.api_url(path))
            .header("Authorization", self.auth_header())
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = resp.text().await?;
            return Err(anyhow::anyhow!(
                "discord GET {path} failed: status={status} body={text}"
            ));
        }
        Ok(Some(resp.json::<T>().await?))
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for DiscordAdapter {
    fn platform(&self) -> &str {
        "discord"
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.run_gateway_loop(tx).await {
                tracing::error!(%e, "discord gateway loop exited");
            }
        });
        Ok(())
    }

    async fn send(&self, channel_id: &ChannelId, message: OutboundMessage) -> Result<()> {
        let url = self.api_url(&format!("/channels/{channel_id}/messages"));
        let body = build_message_body(&message);
        let resp = self
            .http
            .post(url)
            .header("Authorization", self.auth_header())
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow::anyhow!(
                "discord send failed: status={status} body={text}"
            ));
        }
        Ok(())
    }

    async fn send_typing(&self, channel_id: &ChannelId) -> Result<()> {
        let url = self.api_url(&format!("/channels/{channel_id}/typing"));
        let resp = self
            .http
            .post(url)
            .header("Authorization", self.auth_header())
            .header("Content-Length", "0")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!(
                "discord typing failed: status={}",
                resp.status()
            ));
        }
        Ok(())
    }

    async fn resolve_channel(
        &self,
        guild_id: &GuildId,
        channel_id: &ChannelId,
    ) -> Result<Option<ResolvedChannel>> {
        let channel: Option<DiscordChannel> =
            self.get_json(&format!("/channels/{channel_id}")).await?;
        Ok(channel.and_then(|c| {
            if c.guild_id.as_deref() != Some(guild_id.as_str()) {
                return None;
            }
            Some(ResolvedChannel {
                id: c.id.into(),
                name: c.name.unwrap_or_default(),
            })
        }))
    }

    async fn is_administrator(&self, guild_id: &GuildId, user_id: &SenderId) -> Result<bool> {
        let Some(guild) = self
            .get_json::<DiscordGuild>(&format!("/guilds/{guild_id}"))
            .await?
        else {
            return Ok(false);
        };
        let Some(member) = self
            .get_json::<DiscordMember>(&format!("/guilds/{guild_id}/members/{user_id}"))
            .await?
        else {
            return Ok(false);
        };
        Ok(member_is_administrator(&guild, &member, user_id.as_str()))
    }
}

impl DiscordAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_gateway_loop(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let mut consecutive_failures: u32 = 0;
        loop {
            if tx.is_closed() {
                return Ok(());
            }
            match self.run_gateway_once(&tx, &mut consecutive_failures).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = reconnect_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "discord gateway session ended; reconnecting with backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn run_gateway_once(
        &self,
        tx: &mpsc::Sender<InboundMessage>,
        consecutive_failures: &mut u32,
    ) -> Result<()> {
        let (ws, _) = tokio_tungstenite::connect_async(DISCORD_GATEWAY_URL).await?;
        let (write, mut read) = ws.split();
        let write = Arc::new(Mutex::new(write));

        // HELLO.
        let heartbeat_interval_ms: u64 = if let Some(msg) = read.next().await {
            let msg = msg?;
            let v: serde_json::Value = serde_json::from_str(msg.to_text()?)?;
            v.get("d")
                .and_then(|d| d.get("heartbeat_interval"))
                .and_then(|x| x.as_u64())
                .ok_or_else(|| anyhow::anyhow!("discord HELLO missing heartbeat_interval"))?
        } else {
            return Err(anyhow::anyhow!("discord gateway closed before HELLO"));
        };

        // IDENTIFY.
        let identify = serde_json::json!({
            "op": 2,
            "d": {
                "token": self.auth_header(),
                "intents": self.gateway_intents,
                "properties": { "os": "linux", "browser": "lumi", "device": "lumi" }
            }
        });
        write
            .lock()
            .await
            .send(Message::Text(identify.to_string().into()))
            .await?;

        let seq: Arc<RwLock<Option<i64>>> = Arc::new(RwLock::new(None));
        let mut bot_user_id: Option<SenderId> = None;

        // Heartbeat loop.
        let heartbeat = {
            let write = write.clone();
            let seq = seq.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_millis(heartbeat_interval_ms));
                loop {
                    interval.tick().await;
                    let s = *seq.read().await;
                    let payload = serde_json::json!({ "op": 1, "d": s });
                    if write
                        .lock()
                        .await
                        .send(Message::Text(payload.to_string().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            })
        };

        let outcome: Result<()> = async {
            while let Some(msg) = read.next().await {
                let msg = msg?;
                if msg.is_close() {
                    return Err(anyhow::anyhow!("discord gateway sent close frame: {msg}"));
                }
                let Message::Text(txt) = &msg else {
                    continue;
                };
                let v: serde_json::Value = serde_json::from_str(txt.as_str())?;

                if let Some(s) = v.get("s").and_then(|s| s.as_i64()) {
                    *seq.write().await = Some(s);
                }

                let op = v
                    .get("op")
                    .and_then(|o| o.as_i64())
                    .ok_or_else(|| anyhow::anyhow!("discord payload missing op"))?;
                match op {
                    11 => continue,
                    7 => return Err(anyhow::anyhow!("discord requested reconnect")),
                    9 => return Err(anyhow::anyhow!("discord invalidated the session")),
                    _ => {}
                }

                match v.get("t").and_then(|t| t.as_str()) {
                    Some("READY") => {
                        let ready: DiscordReady = serde_json::from_value(
                            v.get("d").cloned().unwrap_or_default(),
                        )?;
                        tracing::info!(
                            bot_user_id = %ready.user.id,
                            bot_username = %ready.user.username,
                            "discord session ready"
                        );
                        *consecutive_failures = 0;
                        bot_user_id = Some(ready.user.id.into());
                    }
                    Some("MESSAGE_CREATE") => {
                        let event_payload = v.get("d").cloned().ok_or_else(|| {
                            anyhow::anyhow!("discord MESSAGE_CREATE missing payload")
                        })?;
                        let event: DiscordMessageCreate = serde_json::from_value(event_payload)?;
                        let Some(inbound) = build_inbound_message(event, bot_user_id.as_ref())
                        else {
                            continue;
                        };
                        if tx.send(inbound).await.is_err() {
                            tracing::info!("inbound queue closed; stopping discord gateway");
                            return Ok(());
                        }
                    }
                    Some(_) | None => {}
                }
            }
            Err(anyhow::anyhow!("discord gateway stream ended unexpectedly"))
        }
        .await;

        heartbeat.abort();
        outcome
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((DISCORD_RECONNECT_BASE_MS * multiplier).min(DISCORD_RECONNECT_MAX_MS))
}

fn build_message_body(message: &OutboundMessage) -> serde_json::Value {
    let content: String = message.content.chars().take(DISCORD_MAX_MESSAGE_CHARS).collect();
    let mut body = serde_json::json!({ "content": content });
    if let Some(reply_to) = message.reply_to_message_id.as_ref() {
        body["message_reference"] = serde_json::json!({
            "message_id": reply_to.as_str(),
            "fail_if_not_exists": false,
        });
    }
    body
}

/// Normalize a MESSAGE_CREATE event. Bot-authored messages (including our own) are dropped.
fn build_inbound_message(
    event: DiscordMessageCreate,
    bot_user_id: Option<&SenderId>,
) -> Option<InboundMessage> {
    if event.author.bot {
        return None;
    }
    if bot_user_id.is_some_and(|id| id.as_str() == event.author.id) {
        return None;
    }

    // @everyone and @here reach the bot like a direct mention.
    let mentions_bot = event.mention_everyone
        || bot_user_id.is_some_and(|id| {
            event.mentions.iter().any(|u| u.id == id.as_str())
                || event.content.contains(&format!("<@{id}>"))
                || event.content.contains(&format!("<@!{id}>"))
        });

    Some(InboundMessage {
        message_id: event.id.into(),
        channel_id: event.channel_id.into(),
        guild_id: event.guild_id.map(GuildId::from),
        sender_id: event.author.id.into(),
        bot_user_id: bot_user_id.cloned(),
        mentions_bot,
        content: event.content,
        received_at: Utc::now(),
    })
}

fn member_is_administrator(guild: &DiscordGuild, member: &DiscordMember, user_id: &str) -> bool {
    if guild.owner_id == user_id {
        return true;
    }
    let permissions = guild
        .roles
        .iter()
        // The @everyone role shares the guild id.
        .filter(|role| role.id == guild.id || member.roles.iter().any(|r| r == &role.id))
        .filter_map(|role| role.permissions.parse::<u64>().ok())
        .fold(0_u64, |acc, bits| acc | bits);
    permissions & DISCORD_ADMINISTRATOR != 0
}

#[derive(Debug, Deserialize)]
struct DiscordMessageCreate {
    id: String,
    channel_id: String,
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(default)]
    content: String,
    author: DiscordUser,
    #[serde(default)]
    mentions: Vec<DiscordUser>,
    #[serde(default)]
    mention_everyone: bool,
}

#[derive(Debug, Deserialize)]
struct DiscordUser {
    id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize)]
struct DiscordReady {
    user: DiscordUser,
}

#[derive(Debug, Deserialize)]
struct DiscordChannel {
    id: String,
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiscordGuild {
    id: String,
    owner_id: String,
    #[serde(default)]
    roles: Vec<DiscordRole>,
}

#[derive(Debug, Deserialize)]
struct DiscordRole {
    id: String,
    #[serde(default)]
    permissions: String,
}

#[derive(Debug, Deserialize)]
struct DiscordMember {
    #[serde(default)]
    roles: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_event(value: serde_json::Value) -> DiscordMessageCreate {
        serde_json::from_value(value).expect("valid MESSAGE_CREATE payload")
    }

    #[test]
    fn reconnect_delay_grows_exponentially_and_caps() {
        assert_eq!(reconnect_delay(1).as_millis(), 1_000);
        assert_eq!(reconnect_delay(2).as_millis(), 2_000);
        assert_eq!(reconnect_delay(3).as_millis(), 4_000);
        assert_eq!(reconnect_delay(30).as_millis(), 60_000);
    }

    #[test]
    fn guild_message_with_mention_is_flagged() {
        let bot = SenderId::from("999");
        let event = message_event(json!({
            "id": "1",
            "channel_id": "20",
            "guild_id": "300",
            "content": "<@999> hello there",
            "author": {"id": "42", "username": "ana", "bot": false},
            "mentions": [{"id": "999", "username": "lumi", "bot": true}]
        }));

        let inbound = build_inbound_message(event, Some(&bot)).expect("human message kept");
        assert!(inbound.mentions_bot);
        assert!(!inbound.is_direct_message());
        assert_eq!(inbound.guild_id.as_deref(), Some("300"));
        assert_eq!(inbound.bot_user_id.as_deref(), Some("999"));
        assert_eq!(inbound.sender_id.as_str(), "42");
    }

    #[test]
    fn nickname_mention_syntax_counts_as_mention() {
        let bot = SenderId::from("999");
        let event = message_event(json!({
            "id": "1",
            "channel_id": "20",
            "guild_id": "300",
            "content": "<@!999> yo",
            "author": {"id": "42"}
        }));
        let inbound = build_inbound_message(event, Some(&bot)).expect("kept");
        assert!(inbound.mentions_bot);
    }

    #[test]
    fn everyone_and_here_count_as_mentions() {
        let bot = SenderId::from("999");
        let event = message_event(json!({
            "id": "1",
            "channel_id": "20",
            "guild_id": "300",
            "content": "@here movie night?",
            "author": {"id": "42"},
            "mention_everyone": true
        }));
        let inbound = build_inbound_message(event, Some(&bot)).expect("kept");
        assert!(inbound.mentions_bot);

        let plain = message_event(json!({
            "id": "2",
            "channel_id": "20",
            "guild_id": "300",
            "content": "movie night?",
            "author": {"id": "42"},
            "mention_everyone": false
        }));
        assert!(!build_inbound_message(plain, Some(&bot)).expect("kept").mentions_bot);
    }

    #[test]
    fn direct_message_without_mention_is_kept() {
        let event = message_event(json!({
            "id": "1",
            "channel_id": "20",
            "content": "hi",
            "author": {"id": "42"}
        }));
        let inbound = build_inbound_message(event, None).expect("kept");
        assert!(inbound.is_direct_message());
        assert!(!inbound.mentions_bot);
    }

    #[test]
    fn bot_authored_messages_are_dropped() {
        let bot = SenderId::from("999");
        let other_bot = message_event(json!({
            "id": "1",
            "channel_id": "20",
            "content": "beep",
            "author": {"id": "77", "bot": true}
        }));
        assert!(build_inbound_message(other_bot, Some(&bot)).is_none());

        let own = message_event(json!({
            "id": "2",
            "channel_id": "20",
            "content": "my own reply",
            "author": {"id": "999"}
        }));
        assert!(build_inbound_message(own, Some(&bot)).is_none());
    }

    #[test]
    fn reply_body_references_original_message() {
        let body = build_message_body(&OutboundMessage::reply("hey!", "555".into()));
        assert_eq!(body["content"], "hey!");
        assert_eq!(body["message_reference"]["message_id"], "555");

        let plain = build_message_body(&OutboundMessage::text("x".repeat(2500)));
        assert!(plain.get("message_reference").is_none());
        assert_eq!(
            plain["content"].as_str().map(|s| s.chars().count()),
            Some(DISCORD_MAX_MESSAGE_CHARS)
        );
    }

    #[test]
    fn administrator_bit_is_computed_from_everyone_and_member_roles() {
        let guild: DiscordGuild = serde_json::from_value(json!({
            "id": "300",
            "owner_id": "1",
            "roles": [
                {"id": "300", "permissions": "1024"},
                {"id": "400", "permissions": "8"},
                {"id": "500", "permissions": "2048"}
            ]
        }))
        .expect("guild payload");

        let admin: DiscordMember =
            serde_json::from_value(json!({"roles": ["400"]})).expect("member");
        let regular: DiscordMember =
            serde_json::from_value(json!({"roles": ["500"]})).expect("member");

        assert!(member_is_administrator(&guild, &admin, "42"));
        assert!(!member_is_administrator(&guild, &regular, "43"));
        assert!(member_is_administrator(&guild, &regular, "1"), "owner is always admin");
    }
}
