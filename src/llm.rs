//! Language model providers for retrieval-QA.
//!
//! | Config value | Provider | Endpoint |
//! |--------------|----------|----------|
//! | `"ollama"` | [`OllamaModel`] | `POST /api/generate` |
//! | `"openai"` | [`OpenAIChatModel`] | `POST /v1/chat/completions` |
//! | `"disabled"` | [`DisabledModel`] | (always fails) |
//!
//! Providers receive the conversation history on the request and decide
//! how to present it: the chat API gets one message per turn, the
//! completion API gets a transcript ahead of the prompt.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::LlmConfig;
use crate::http;

/// One exchange of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub question: String,
    pub answer: String,
}

impl ChatTurn {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub temperature: f32,
    pub chat_history: Vec<ChatTurn>,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider name used in errors and logs.
    fn name(&self) -> &str;
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn name(&self) -> &str {
        "disabled"
    }
    async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
        bail!("LLM provider is disabled")
    }
}

pub struct OllamaModel {
    model: String,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            model: config.model.clone().unwrap_or_else(|| "llama3.1".to_string()),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            max_retries: config.max_retries,
            client: http::client(config.timeout_secs)?,
        })
    }
}

/// Render prior turns ahead of the prompt for completion-style APIs.
pub fn render_transcript(history: &[ChatTurn], prompt: &str) -> String {
    if history.is_empty() {
        return prompt.to_string();
    }
    let mut out = String::from("Conversation so far:\n");
    for turn in history {
        out.push_str(&format!("User: {}\nAssistant: {}\n", turn.question, turn.answer));
    }
    out.push('\n');
    out.push_str(prompt);
    out
}

#[async_trait]
impl LanguageModel for OllamaModel {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = json!({
            "model": self.model,
            "prompt": render_transcript(&request.chat_history, &request.prompt),
            "stream": false,
            "options": { "temperature": request.temperature },
        });
        let json = http::post_json(
            &self.client,
            &format!("{}/api/generate", self.url.trim_end_matches('/')),
            None,
            &body,
            self.max_retries,
            "Ollama",
        )
        .await?;
        json.get("response")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing response field"))
    }
}

/// Requires `OPENAI_API_KEY`.
pub struct OpenAIChatModel {
    model: String,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIChatModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model: config.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string()),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key,
            max_retries: config.max_retries,
            client: http::client(config.timeout_secs)?,
        })
    }
}

pub fn chat_messages(request: &CompletionRequest) -> Vec<Value> {
    let mut messages = Vec::with_capacity(request.chat_history.len() * 2 + 1);
    for turn in &request.chat_history {
        messages.push(json!({ "role": "user", "content": turn.question }));
        messages.push(json!({ "role": "assistant", "content": turn.answer }));
    }
    messages.push(json!({ "role": "user", "content": request.prompt }));
    messages
}

#[async_trait]
impl LanguageModel for OpenAIChatModel {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": chat_messages(request),
            "temperature": request.temperature,
        });
        let json = http::post_json(
            &self.client,
            &format!("{}/v1/chat/completions", self.url.trim_end_matches('/')),
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        json.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"))
    }
}

pub fn create_language_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "ollama" => Ok(Arc::new(OllamaModel::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIChatModel::new(config)?)),
        "disabled" => Ok(Arc::new(DisabledModel)),
        other => bail!("Unknown llm provider: {}", other),
    }
}
