//! Completion provider integrations

#[cfg(test)]
pub mod mock;
mod openai;

pub use openai::{OpenAiConfig, OpenAiProvider};

use async_trait::async_trait;
use thiserror::Error;

use crate::conversation::Message;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// An opaque remote completion service. The orchestration layer only ever
/// sees role-tagged text in and raw text out.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Complete the conversation, returning the assistant's reply text.
    async fn complete(&self, messages: &[Message]) -> Result<String, ProviderError>;

    /// Produce a short conversation title from the first user message.
    async fn synthesize_title(&self, first_message: &str) -> Result<String, ProviderError>;
}
