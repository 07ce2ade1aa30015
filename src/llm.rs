//! Chat model abstraction.
//!
//! [`ChatModel`] turns an ordered list of [`ChatMessage`]s into one reply.
//! Two backends are provided: an OpenAI-compatible `/chat/completions`
//! client and an Ollama `/api/chat` client. Both run with the configured
//! temperature (0 by default) and share the retry policy in
//! [`crate::backoff`].

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backoff;
use crate::config::{self, LlmConfig};
use crate::error::RagError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Return the assistant's reply to `messages`.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

// ─── OpenAI-compatible ───────────────────────────────────

#[derive(Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiChat {
    model: String,
    temperature: f32,
    base_url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config::env_secret(config::OPENAI_API_KEY)?;
        let base_url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Ok(Self {
            model: config.model.clone(),
            temperature: config.temperature,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
            client: backoff::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = OpenAiChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
        };
        let json = backoff::send_json("OpenAI", self.max_retries, || {
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&request)
        })
        .await?;

        let response: OpenAiChatResponse = serde_json::from_value(json)
            .map_err(|e| RagError::upstream("OpenAI", format!("unexpected chat response: {}", e)))?;
        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or_else(|| RagError::upstream("OpenAI", "chat response had no choices").into())
    }
}

// ─── Ollama ──────────────────────────────────────────────

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: ChatMessage,
}

pub struct OllamaChat {
    model: String,
    temperature: f32,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            model: config.model.clone(),
            temperature: config.temperature,
            url: url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            client: backoff::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl ChatModel for OllamaChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let url = format!("{}/api/chat", self.url);
        let request = OllamaChatRequest {
            model: &self.model,
            messages,
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
            },
        };
        let json = backoff::send_json("Ollama", self.max_retries, || {
            self.client.post(&url).json(&request)
        })
        .await?;

        let response: OllamaChatResponse = serde_json::from_value(json)
            .map_err(|e| RagError::upstream("Ollama", format!("unexpected chat response: {}", e)))?;
        Ok(response.message.content)
    }
}

pub fn create_chat_model(config: &LlmConfig) -> Result<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiChat::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaChat::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_request_shape() {
        let messages = vec![ChatMessage::system("ctx"), ChatMessage::user("hi")];
        let req = OpenAiChatRequest {
            model: "gpt-4o-mini",
            messages: &messages,
            temperature: 0.0,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(json["temperature"], 0.0);
    }

    #[test]
    fn openai_response_parses_null_content() {
        let json = serde_json::json!({"choices": [{"message": {"role": "assistant", "content": null}}]});
        let parsed: OpenAiChatResponse = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.choices[0].message.content, None);
    }

    #[test]
    fn ollama_response_parses() {
        let json = serde_json::json!({"message": {"role": "assistant", "content": "hello"}, "done": true});
        let parsed: OllamaChatResponse = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.message.content, "hello");
        assert_eq!(parsed.message.role, Role::Assistant);
    }

    #[test]
    fn unknown_provider_rejected() {
        let config = LlmConfig {
            provider: "magic".into(),
            ..LlmConfig::default()
        };
        assert!(create_chat_model(&config).is_err());
    }
}
