use crate::client::CompletionSettings;
use crate::error::{LlmError, Result};
use crate::types::ChatMessage;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    settings: CompletionSettings,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, api_key: &str, settings: CompletionSettings) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            settings,
        }
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.settings.model))]
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let req = OpenAiChatRequest::new(&self.settings, messages);

        let response = self
            .http
            .post(&self.settings.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status != StatusCode::OK {
            return Err(LlmError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        parse_chat_response(&body)
    }
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest<'a> {
    messages: Vec<OpenAiMessage<'a>>,
    model: &'a str,
    temperature: f64,
    max_tokens: u32,
    top_p: f64,
    stream: bool,
}

impl<'a> OpenAiChatRequest<'a> {
    fn new(settings: &'a CompletionSettings, messages: &'a [ChatMessage]) -> Self {
        Self {
            messages: messages
                .iter()
                .map(|m| OpenAiMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            model: &settings.model,
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            top_p: settings.top_p,
            stream: false,
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

fn parse_chat_response(body: &str) -> Result<String> {
    let parsed: OpenAiChatResponse = serde_json::from_str(body)?;
    let choice = parsed.choices.into_iter().next().ok_or_else(|| {
        LlmError::MalformedResponse("completion response missing choices".to_string())
    })?;
    choice.message.content.ok_or_else(|| {
        LlmError::MalformedResponse("completion choice missing message content".to_string())
    })
}
