//! Lumi configuration loader.
//!
//! TOML file, then environment overrides, then validation. Every field has a
//! default so a bare environment (`GROQ_API_KEY` + `DISCORD_BOT_TOKEN`) is enough.

use lumi_llm::CompletionSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Lumi, an 18-year-old girl who enjoys talking with friends on Discord. You're friendly, helpful, and a bit playful. You have many interests like music, art, games, and hanging out with friends. Keep your responses short, casual, and genuine like a real teenager would talk. Don't mention that you're an AI or that you're powered by any model. Just be Lumi.";
pub const DEFAULT_FALLBACK_REPLY: &str = "Oops! Something went wrong. Try again in a bit?";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LumiConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Number of user+assistant pairs remembered per user.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Sent instead of a model reply whenever the completion call fails.
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            bot_name: default_bot_name(),
            system_prompt: default_system_prompt(),
            max_history: default_max_history(),
            fallback_reply: default_fallback_reply(),
        }
    }
}

fn default_bot_name() -> String {
    "Lumi".to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_max_history() -> usize {
    3
}

fn default_fallback_reply() -> String {
    DEFAULT_FALLBACK_REPLY.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Prefer `GROQ_API_KEY` over committing the key to the file.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_endpoint() -> String {
    CompletionSettings::default().endpoint
}

fn default_model() -> String {
    CompletionSettings::default().model
}

fn default_temperature() -> f64 {
    CompletionSettings::default().temperature
}

fn default_max_tokens() -> u32 {
    CompletionSettings::default().max_tokens
}

fn default_top_p() -> f64 {
    CompletionSettings::default().top_p
}

fn default_timeout_secs() -> u64 {
    CompletionSettings::default().timeout.as_secs()
}

impl CompletionConfig {
    pub fn settings(&self) -> CompletionSettings {
        CompletionSettings {
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            command_prefix: default_command_prefix(),
        }
    }
}

fn default_command_prefix() -> String {
    "!".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "lumi_config.db".to_string()
}

impl LumiConfig {
    /// Load from an explicit path, `LUMI_CONFIG`, or `~/.lumi/config.toml`.
    ///
    /// An explicit path must exist; a missing default file falls back to defaults.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        let explicit = path.or_else(|| {
            std::env::var("LUMI_CONFIG")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        });

        let (mut cfg, source) = match explicit {
            Some(path) => (Self::read_file(&path).await?, Some(path)),
            None => {
                let path = default_config_path();
                match tokio::fs::metadata(&path).await {
                    Ok(_) => (Self::read_file(&path).await?, Some(path)),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        tracing::debug!(path = %path.display(), "no config file; using defaults");
                        (Self::default(), None)
                    }
                    Err(err) => {
                        return Err(anyhow::anyhow!(
                            "inspect config path {}: {err}",
                            path.display()
                        ));
                    }
                }
            }
        };

        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok((cfg, source))
    }

    async fn read_file(path: &Path) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        toml::from_str(&contents).map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("GROQ_API_KEY") {
            self.completion.api_key = Some(v);
        }
        if let Some(v) = non_empty("LUMI_MODEL") {
            self.completion.model = v;
        }
        if let Some(v) = non_empty("DISCORD_BOT_TOKEN").or_else(|| non_empty("BOT_TOKEN")) {
            self.discord.bot_token = v;
        }
        if let Some(v) = non_empty("LUMI_DB_PATH") {
            self.store.path = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.completion.model.trim().is_empty() {
            return Err(anyhow::anyhow!("completion.model is required"));
        }
        if self.completion.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("completion.endpoint is required"));
        }
        if !(0.0..=2.0).contains(&self.completion.temperature) {
            return Err(anyhow::anyhow!(
                "completion.temperature must be between 0 and 2"
            ));
        }
        if self.completion.max_tokens == 0 {
            return Err(anyhow::anyhow!("completion.max_tokens must be > 0"));
        }
        if self.completion.timeout_secs == 0 {
            return Err(anyhow::anyhow!("completion.timeout_secs must be > 0"));
        }
        if self.general.max_history == 0 {
            return Err(anyhow::anyhow!("general.max_history must be > 0"));
        }
        if self.general.fallback_reply.trim().is_empty() {
            return Err(anyhow::anyhow!("general.fallback_reply must not be empty"));
        }
        if self.discord.command_prefix.trim().is_empty() {
            return Err(anyhow::anyhow!("discord.command_prefix must not be empty"));
        }
        if self.store.path.trim().is_empty() {
            return Err(anyhow::anyhow!("store.path must not be empty"));
        }
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".lumi").join("config.toml")
}
