use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::types::ChatMessage;
use async_trait::async_trait;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://api.groq.com/openai/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "mixtral-8x7b-32768";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Anything that can turn an ordered list of turns into a reply.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

/// Request parameters sent with every completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSettings {
    pub endpoint: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub timeout: Duration,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            max_tokens: 128,
            top_p: 1.0,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    inner: OpenAiClient,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, settings: CompletionSettings) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(LlmError::MissingCredential);
        }
        let http = build_http_client(settings.timeout)?;
        Ok(Self {
            inner: OpenAiClient::new(http, api_key, settings),
        })
    }

    pub fn model(&self) -> &str {
        self.inner.model()
    }
}

/// Every request made through the returned client is bounded by `timeout`.
fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| LlmError::Transport(format!("build http client: {e}")))
}

#[async_trait]
impl ChatCompletion for LlmClient {
    #[tracing::instrument(level = "info", skip_all, fields(messages = messages.len()))]
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        self.inner.chat(messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_credential_is_rejected() {
        let err = LlmClient::new("   ", CompletionSettings::default())
            .err()
            .expect("blank api key should be rejected");
        assert!(matches!(err, LlmError::MissingCredential));
    }

    #[test]
    fn defaults_match_the_groq_endpoint_contract() {
        let settings = CompletionSettings::default();
        assert_eq!(settings.max_tokens, 128);
        assert_eq!(settings.top_p, 1.0);
        assert_eq!(settings.timeout, Duration::from_secs(10));
        assert!(settings.endpoint.ends_with("/chat/completions"));
    }

    #[test]
    fn http_client_builds_with_bounded_timeout() {
        assert!(build_http_client(Duration::from_millis(250)).is_ok());
        assert!(build_http_client(DEFAULT_TIMEOUT).is_ok());
    }

    #[test]
    fn client_reports_configured_model() {
        let settings = CompletionSettings {
            model: "llama-3.1-8b-instant".to_string(),
            ..CompletionSettings::default()
        };
        let client = LlmClient::new("gsk_test", settings).expect("client builds");
        assert_eq!(client.model(), "llama-3.1-8b-instant");
    }
}
