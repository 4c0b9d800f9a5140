//! OpenAI-compatible completion provider
//!
//! Works with any API that implements the OpenAI chat completions format
//! (api.openai.com, Groq, vLLM, LM Studio, and so on).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::conversation::{Message, DEFAULT_TITLE};

use super::{CompletionProvider, ProviderError};

const TITLE_INSTRUCTION: &str = "Generate a short, descriptive title (at most six words) \
for a conversation that starts with the following message. \
Do not use quotes or punctuation.";

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Base URL for the API (e.g. https://api.openai.com/v1)
    pub base_url: String,
    /// API key (optional for local servers)
    pub api_key: Option<String>,
    /// Model to use for completions and title synthesis
    pub model: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 120,
        }
    }
}

pub struct OpenAiProvider {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to build HTTP client");

        Self { config, client }
    }

    async fn completion(&self, messages: Vec<ChatMessage>) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.config.base_url);

        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages,
            temperature: Some(0.7),
        };

        let mut req_builder = self.client.post(&url);
        if let Some(ref api_key) = self.config.api_key {
            req_builder = req_builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req_builder.json(&request).send().await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let completion: ChatCompletionResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse response: {}", e))
        })?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("No choices in response".to_string()))?;

        Ok(choice.message.content.unwrap_or_default())
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn complete(&self, messages: &[Message]) -> Result<String, ProviderError> {
        let chat_messages: Vec<ChatMessage> = messages.iter().map(ChatMessage::from).collect();

        tracing::debug!(model = %self.config.model, turns = chat_messages.len(), "requesting completion");
        self.completion(chat_messages).await
    }

    async fn synthesize_title(&self, first_message: &str) -> Result<String, ProviderError> {
        let messages = vec![
            ChatMessage {
                role: "system".to_string(),
                content: TITLE_INSTRUCTION.to_string(),
            },
            ChatMessage {
                role: "user".to_string(),
                content: first_message.to_string(),
            },
        ];

        let title = self.completion(messages).await?;
        let title = title.trim();
        if title.is_empty() {
            return Ok(DEFAULT_TITLE.to_string());
        }
        Ok(title.to_string())
    }
}
