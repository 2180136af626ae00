//! Admin chat commands: allow-list management, usage stats, window reset.
//!
//! Every handler requires a guild and an explicit administrator check through
//! the host adapter before touching the store or the windows.

use crate::store::{AllowedChannel, Store};
use crate::window::{ResetOutcome, WindowManager};
use chrono::Utc;
use lumi_channels::{ChannelAdapter, ChannelId, GuildId, InboundMessage, SenderId};
use std::sync::Arc;

const GUILD_ONLY: &str = "This command can only be used in servers!";
const FORBIDDEN: &str = "You need administrator permissions to use this command.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AddChannel(Option<ChannelId>),
    RemoveChannel(Option<ChannelId>),
    ListChannels,
    Stats,
    Reset(Option<SenderId>),
}

/// Parse `<prefix><name> [arg]`. `None` means the message is not a command at all;
/// `Some(Err(usage))` means a known command with an unusable argument.
pub fn parse_command(prefix: &str, content: &str) -> Option<Result<Command, String>> {
    let rest = content.trim().strip_prefix(prefix)?;
    let mut parts = rest.split_whitespace();
    let name = parts.next()?.to_ascii_lowercase();
    let arg = parts.next();

    let parsed = match name.as_str() {
        "addchannel" => channel_arg(arg)
            .map(Command::AddChannel)
            .ok_or_else(|| format!("Usage: {prefix}addchannel [#channel]")),
        "removechannel" => channel_arg(arg)
            .map(Command::RemoveChannel)
            .ok_or_else(|| format!("Usage: {prefix}removechannel [#channel]")),
        "listchannels" => Ok(Command::ListChannels),
        "stats" => Ok(Command::Stats),
        "reset" => user_arg(arg)
            .map(Command::Reset)
            .ok_or_else(|| format!("Usage: {prefix}reset [@user]")),
        _ => return None,
    };
    Some(parsed)
}

/// `None` arg parses to `Some(None)`; an unparseable arg parses to `None`.
fn channel_arg(arg: Option<&str>) -> Option<Option<ChannelId>> {
    let Some(raw) = arg else {
        return Some(None);
    };
    let id = raw
        .strip_prefix("<#")
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(raw);
    is_snowflake(id).then(|| Some(ChannelId::from(id)))
}

fn user_arg(arg: Option<&str>) -> Option<Option<SenderId>> {
    let Some(raw) = arg else {
        return Some(None);
    };
    let id = raw
        .strip_prefix("<@")
        .and_then(|s| s.strip_suffix('>'))
        .map(|s| s.trim_start_matches('!'))
        .unwrap_or(raw);
    is_snowflake(id).then(|| Some(SenderId::from(id)))
}

fn is_snowflake(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_digit())
}

fn user_mention(user: &SenderId) -> String {
    format!("<@{user}>")
}

fn channel_mention(channel: &ChannelId) -> String {
    format!("<#{channel}>")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    GuildOnly,
    Forbidden,
    Reply(String),
}

impl CommandOutcome {
    pub fn into_message(self) -> String {
        match self {
            Self::GuildOnly => GUILD_ONLY.to_string(),
            Self::Forbidden => FORBIDDEN.to_string(),
            Self::Reply(text) => text,
        }
    }
}

pub struct AdminCommands {
    bot_name: String,
    store: Store,
    windows: Arc<WindowManager>,
    channel: Arc<dyn ChannelAdapter>,
}

impl AdminCommands {
    pub fn new(
        bot_name: impl Into<String>,
        store: Store,
        windows: Arc<WindowManager>,
        channel: Arc<dyn ChannelAdapter>,
    ) -> Self {
        Self {
            bot_name: bot_name.into(),
            store,
            windows,
            channel,
        }
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(invoker = %inbound.sender_id, channel_id = %inbound.channel_id)
    )]
    pub async fn execute(
        &self,
        inbound: &InboundMessage,
        parsed: Result<Command, String>,
    ) -> CommandOutcome {
        let Some(guild_id) = inbound.guild_id.as_ref() else {
            return CommandOutcome::GuildOnly;
        };

        match self.channel.is_administrator(guild_id, &inbound.sender_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(%guild_id, "admin command rejected: missing administrator capability");
                return CommandOutcome::Forbidden;
            }
            Err(e) => {
                tracing::warn!(%e, %guild_id, "administrator check failed");
                return CommandOutcome::Reply(format!("Error checking permissions: {e}"));
            }
        }

        let command = match parsed {
            Ok(command) => command,
            Err(usage) => return CommandOutcome::Reply(usage),
        };
        tracing::info!(?command, %guild_id, "running admin command");

        let reply = match command {
            Command::AddChannel(channel) => self.add_channel(guild_id, inbound, channel).await,
            Command::RemoveChannel(channel) => {
                let channel = channel.unwrap_or_else(|| inbound.channel_id.clone());
                self.remove_channel(guild_id, &channel).await
            }
            Command::ListChannels => self.list_channels(guild_id).await,
            Command::Stats => self.stats(guild_id).await,
            Command::Reset(user) => {
                let user = user.unwrap_or_else(|| inbound.sender_id.clone());
                self.reset(&user)
            }
        };
        CommandOutcome::Reply(reply)
    }

    async fn add_channel(
        &self,
        guild_id: &GuildId,
        inbound: &InboundMessage,
        channel: Option<ChannelId>,
    ) -> String {
        let channel_id = match channel {
            None => inbound.channel_id.clone(),
            Some(channel_id) => match self.channel.resolve_channel(guild_id, &channel_id).await {
                Ok(Some(resolved)) => resolved.id,
                Ok(None) => return format!("Channel {channel_id} not found in this server."),
                Err(e) => return format!("Error adding channel: {e}"),
            },
        };

        let row = AllowedChannel {
            guild_id: guild_id.clone(),
            channel_id: channel_id.clone(),
            added_by: inbound.sender_id.clone(),
            added_at: Utc::now(),
        };
        match self.store.upsert_allowed_channel(row).await {
            Ok(()) => format!("✅ I'll now chat in {}!", channel_mention(&channel_id)),
            Err(e) => {
                tracing::warn!(%e, "add channel failed");
                format!("Error adding channel: {e}")
            }
        }
    }

    async fn remove_channel(&self, guild_id: &GuildId, channel_id: &ChannelId) -> String {
        match self.store.delete_allowed_channel(guild_id, channel_id).await {
            Ok(0) => "❓ That channel wasn't in my allowed list.".to_string(),
            Ok(_) => format!(
                "✅ I'll no longer chat in {} unless mentioned.",
                channel_mention(channel_id)
            ),
            Err(e) => {
                tracing::warn!(%e, "remove channel failed");
                format!("Error removing channel: {e}")
            }
        }
    }

    async fn list_channels(&self, guild_id: &GuildId) -> String {
        let rows = match self.store.list_by_guild(guild_id).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(%e, "list channels failed");
                return format!("Error listing channels: {e}");
            }
        };
        if rows.is_empty() {
            return "No channels have been added yet. I'll only respond when mentioned."
                .to_string();
        }

        let mut mentions = Vec::with_capacity(rows.len());
        for row in rows {
            match self.channel.resolve_channel(guild_id, &row.channel_id).await {
                Ok(Some(resolved)) => mentions.push(resolved.mention()),
                Ok(None) => {
                    tracing::debug!(channel_id = %row.channel_id, "skipping stale allowed channel");
                }
                Err(e) => {
                    tracing::warn!(%e, channel_id = %row.channel_id, "channel lookup failed; skipping");
                }
            }
        }

        if mentions.is_empty() {
            return "No valid channels found. They may have been deleted.".to_string();
        }
        format!(
            "I'm currently active in these channels: {}",
            mentions.join(", ")
        )
    }

    async fn stats(&self, guild_id: &GuildId) -> String {
        let stats = match self.store.aggregate_by_guild(guild_id).await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!(%e, "stats aggregation failed");
                return format!("Error retrieving stats: {e}");
            }
        };

        let mut out = format!("**{} Stats for this server**\n", self.bot_name);
        out.push_str(&format!("💬 Total interactions: {}\n", stats.total_interactions));
        out.push_str(&format!("👥 Unique users: {}\n", stats.unique_users));

        if let Some(channel_id) = stats.most_active_channel.as_ref() {
            match self.channel.resolve_channel(guild_id, channel_id).await {
                Ok(Some(resolved)) => {
                    out.push_str(&format!("📊 Most active channel: {}\n", resolved.mention()));
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(%e, %channel_id, "most active channel lookup failed"),
            }
        }
        out
    }

    fn reset(&self, user: &SenderId) -> String {
        match self.windows.reset(user) {
            ResetOutcome::Reset => format!(
                "✅ Conversation history reset for {}!",
                user_mention(user)
            ),
            ResetOutcome::NothingToReset => format!(
                "No conversation history found for {}.",
                user_mention(user)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UsageRecord;
    use crate::testing::{FakeChannel, inbound};
    use lumi_llm::ChatMessage;

    struct Harness {
        commands: AdminCommands,
        store: Store,
        windows: Arc<WindowManager>,
        channel: Arc<FakeChannel>,
    }

    fn harness() -> Harness {
        let store = Store::open_in_memory().expect("store");
        let windows = Arc::new(WindowManager::new(3));
        let channel = Arc::new(FakeChannel::default());
        channel.grant_admin("g1", "admin");
        Harness {
            commands: AdminCommands::new("Lumi", store.clone(), windows.clone(), channel.clone()),
            store,
            windows,
            channel,
        }
    }

    async fn run(h: &Harness, sender: &str, guild: Option<&str>, text: &str) -> CommandOutcome {
        let msg = inbound(sender, guild, text, false);
        let parsed = parse_command("!", text).expect("is a command");
        h.commands.execute(&msg, parsed).await
    }

    #[test]
    fn parses_commands_and_arguments() {
        assert_eq!(
            parse_command("!", "!addchannel"),
            Some(Ok(Command::AddChannel(None)))
        );
        assert_eq!(
            parse_command("!", "  !AddChannel <#123>  "),
            Some(Ok(Command::AddChannel(Some("123".into()))))
        );
        assert_eq!(
            parse_command("!", "!removechannel 456"),
            Some(Ok(Command::RemoveChannel(Some("456".into()))))
        );
        assert_eq!(parse_command("!", "!listchannels"), Some(Ok(Command::ListChannels)));
        assert_eq!(parse_command("!", "!stats"), Some(Ok(Command::Stats)));
        assert_eq!(
            parse_command("!", "!reset <@!77>"),
            Some(Ok(Command::Reset(Some("77".into()))))
        );
        assert_eq!(
            parse_command("!", "!reset <@78>"),
            Some(Ok(Command::Reset(Some("78".into()))))
        );
    }

    #[test]
    fn non_commands_fall_through() {
        assert_eq!(parse_command("!", "hello there"), None);
        assert_eq!(parse_command("!", "!dance"), None);
        assert_eq!(parse_command("!", "!"), None);
        assert_eq!(parse_command("?", "!stats"), None);
    }

    #[test]
    fn bad_arguments_yield_usage() {
        let Some(Err(usage)) = parse_command("!", "!addchannel general") else {
            panic!("expected usage error");
        };
        assert!(usage.contains("!addchannel"));
        assert!(matches!(parse_command("!", "!reset bob"), Some(Err(_))));
    }

    #[tokio::test]
    async fn commands_require_a_guild() {
        let h = harness();
        assert_eq!(run(&h, "admin", None, "!stats").await, CommandOutcome::GuildOnly);
        assert_eq!(CommandOutcome::GuildOnly.into_message(), GUILD_ONLY);
    }

    #[tokio::test]
    async fn non_admins_are_forbidden_before_any_side_effect() {
        let h = harness();
        let outcome = run(&h, "pleb", Some("g1"), "!addchannel").await;
        assert_eq!(outcome, CommandOutcome::Forbidden);
        assert!(h.store.list_by_guild(&"g1".into()).await.expect("list").is_empty());

        // Admin in another guild does not carry over.
        let outcome = run(&h, "admin", Some("g2"), "!stats").await;
        assert_eq!(outcome, CommandOutcome::Forbidden);
    }

    #[tokio::test]
    async fn add_then_remove_channel_updates_allow_list() {
        let h = harness();
        let channel = ChannelId::from("g1-general");

        let added = run(&h, "admin", Some("g1"), "!addchannel").await.into_message();
        assert_eq!(added, "✅ I'll now chat in <#g1-general>!");
        assert!(
            h.store
                .is_channel_allowed(&"g1".into(), &channel)
                .await
                .expect("lookup")
        );

        let removed = run(&h, "admin", Some("g1"), "!removechannel").await.into_message();
        assert!(removed.contains("no longer chat in <#g1-general>"));
        assert!(
            !h.store
                .is_channel_allowed(&"g1".into(), &channel)
                .await
                .expect("lookup")
        );

        let again = run(&h, "admin", Some("g1"), "!removechannel").await.into_message();
        assert_eq!(again, "❓ That channel wasn't in my allowed list.");
    }

    #[tokio::test]
    async fn add_explicit_channel_must_exist_in_guild() {
        let h = harness();
        h.channel.add_channel("g1", "555", "memes");
        h.channel.add_channel("g2", "666", "elsewhere");

        let ok = run(&h, "admin", Some("g1"), "!addchannel <#555>").await.into_message();
        assert_eq!(ok, "✅ I'll now chat in <#555>!");

        let foreign = run(&h, "admin", Some("g1"), "!addchannel <#666>").await.into_message();
        assert!(foreign.contains("not found"));
        assert!(
            !h.store
                .is_channel_allowed(&"g1".into(), &"666".into())
                .await
                .expect("lookup")
        );
    }

    #[tokio::test]
    async fn list_channels_skips_stale_entries_without_purging() {
        let h = harness();
        let empty = run(&h, "admin", Some("g1"), "!listchannels").await.into_message();
        assert!(empty.starts_with("No channels have been added yet"));

        h.channel.add_channel("g1", "111", "general");
        for id in ["111", "222"] {
            h.store
                .upsert_allowed_channel(AllowedChannel {
                    guild_id: "g1".into(),
                    channel_id: id.into(),
                    added_by: "admin".into(),
                    added_at: Utc::now(),
                })
                .await
                .expect("upsert");
        }

        let listed = run(&h, "admin", Some("g1"), "!listchannels").await.into_message();
        assert_eq!(listed, "I'm currently active in these channels: <#111>");
        assert_eq!(h.store.list_by_guild(&"g1".into()).await.expect("list").len(), 2);

        h.store
            .delete_allowed_channel(&"g1".into(), &"111".into())
            .await
            .expect("delete");
        let stale_only = run(&h, "admin", Some("g1"), "!listchannels").await.into_message();
        assert_eq!(stale_only, "No valid channels found. They may have been deleted.");
    }

    #[tokio::test]
    async fn stats_render_totals_and_resolvable_top_channel() {
        let h = harness();
        h.channel.add_channel("g1", "c2", "chat");
        for (user, channel) in [("u1", "c1"), ("u2", "c2"), ("u1", "c2")] {
            h.store
                .insert_usage(UsageRecord {
                    user_id: user.into(),
                    guild_id: "g1".to_string(),
                    channel_id: channel.into(),
                    timestamp: Utc::now(),
                    message_length: 3,
                    response_length: 5,
                })
                .await
                .expect("usage");
        }

        let stats = run(&h, "admin", Some("g1"), "!stats").await.into_message();
        assert!(stats.starts_with("**Lumi Stats for this server**\n"));
        assert!(stats.contains("Total interactions: 3"));
        assert!(stats.contains("Unique users: 2"));
        assert!(stats.contains("Most active channel: <#c2>"));
    }

    #[tokio::test]
    async fn stats_omit_top_channel_that_no_longer_resolves() {
        let h = harness();
        h.store
            .insert_usage(UsageRecord {
                user_id: "u1".into(),
                guild_id: "g1".to_string(),
                channel_id: "gone".into(),
                timestamp: Utc::now(),
                message_length: 1,
                response_length: 1,
            })
            .await
            .expect("usage");
        let stats = run(&h, "admin", Some("g1"), "!stats").await.into_message();
        assert!(stats.contains("Total interactions: 1"));
        assert!(!stats.contains("Most active channel"));
    }

    #[tokio::test]
    async fn reset_reports_distinct_outcomes() {
        let h = harness();
        let nothing = run(&h, "admin", Some("g1"), "!reset <@42>").await.into_message();
        assert_eq!(nothing, "No conversation history found for <@42>.");

        h.windows.append(&"42".into(), ChatMessage::user("hi"));
        let done = run(&h, "admin", Some("g1"), "!reset <@42>").await.into_message();
        assert_eq!(done, "✅ Conversation history reset for <@42>!");
        assert!(h.windows.get(&"42".into()).is_empty());

        h.windows.append(&"admin".into(), ChatMessage::user("me too"));
        let own = run(&h, "admin", Some("g1"), "!reset").await.into_message();
        assert_eq!(own, "✅ Conversation history reset for <@admin>!");
    }
}
