//! Chat-completion client for Lumi.
//!
//! Pure HTTP client against an OpenAI-compatible `/chat/completions` endpoint.
//! One request, one bounded-timeout attempt, one reply string.

mod client;
mod error;
mod openai;
mod types;

pub use client::{ChatCompletion, CompletionSettings, LlmClient};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, Role};
