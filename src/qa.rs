//! Retrieval-augmented question answering.
//!
//! Both modes share one retriever and one dispatch point,
//! [`MemoryEngine::answer`]:
//!
//! - **Stateless**: retrieve top-k chunks, stuff them into a prompt, ask
//!   the model. The response carries a `result` field.
//! - **Conversational**: when history is present, first ask the model to
//!   rewrite the follow-up as a standalone question, retrieve with that,
//!   then answer with the history attached to the completion request.
//!   The response carries `answer` and echoes `chat_history` unchanged.

use std::time::Duration;

use serde::Serialize;

use context_memory_core::access::{Action, AuditOutcome};
use context_memory_core::models::{merge_filters, MetadataFilter, RetrievedChunk};
use context_memory_core::{EngineError, Result};

use crate::engine::MemoryEngine;
use crate::llm::{ChatTurn, CompletionRequest};

#[derive(Debug, Clone, PartialEq)]
pub enum QaMode {
    Stateless,
    Conversational { chat_history: Vec<ChatTurn> },
}

#[derive(Debug, Clone)]
pub struct QaRequest {
    pub question: String,
    pub mode: QaMode,
    /// Merged over `retrieval.default_filter`; keys here win.
    pub metadata_filter: Option<MetadataFilter>,
    pub temperature: f32,
    pub user: Option<String>,
    /// Chunks to retrieve; defaults to `retrieval.k`.
    pub k: Option<usize>,
    /// Per-call LLM timeout; defaults to `llm.timeout_secs`.
    pub timeout: Option<Duration>,
}

impl QaRequest {
    pub fn stateless(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            mode: QaMode::Stateless,
            metadata_filter: None,
            temperature: 0.0,
            user: None,
            k: None,
            timeout: None,
        }
    }

    pub fn conversational(question: impl Into<String>, chat_history: Vec<ChatTurn>) -> Self {
        Self {
            mode: QaMode::Conversational { chat_history },
            ..Self::stateless(question)
        }
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.metadata_filter = Some(filter);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QaResponse {
    Stateless {
        result: String,
        source_keys: Vec<String>,
    },
    Conversational {
        answer: String,
        chat_history: Vec<ChatTurn>,
        source_keys: Vec<String>,
    },
}

impl QaResponse {
    fn new(mode: &QaMode, text: String, source_keys: Vec<String>) -> Self {
        match mode {
            QaMode::Stateless => QaResponse::Stateless {
                result: text,
                source_keys,
            },
            QaMode::Conversational { chat_history } => QaResponse::Conversational {
                answer: text,
                chat_history: chat_history.clone(),
                source_keys,
            },
        }
    }

    /// The `result` or `answer` text.
    pub fn text(&self) -> &str {
        match self {
            QaResponse::Stateless { result, .. } => result,
            QaResponse::Conversational { answer, .. } => answer,
        }
    }

    pub fn source_keys(&self) -> &[String] {
        match self {
            QaResponse::Stateless { source_keys, .. } => source_keys,
            QaResponse::Conversational { source_keys, .. } => source_keys,
        }
    }
}

/// "Stuff" prompt: every retrieved chunk, then the question.
pub fn qa_prompt(question: &str, chunks: &[RetrievedChunk]) -> String {
    let context = if chunks.is_empty() {
        "(no relevant context found)".to_string()
    } else {
        chunks
            .iter()
            .enumerate()
            .map(|(i, c)| format!("[{}] {}", i + 1, c.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    };
    format!(
        "Use the following pieces of context to answer the question at the end. \
         If the answer is not in the context, say that you don't know; do not make one up.\n\n\
         {context}\n\n\
         Question: {question}\n\
         Helpful Answer:"
    )
}

/// Prompt asking the model to rewrite a follow-up as a standalone question.
pub fn condense_prompt(chat_history: &[ChatTurn], question: &str) -> String {
    let history = chat_history
        .iter()
        .map(|t| format!("Human: {}\nAssistant: {}", t.question, t.answer))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Given the following conversation and a follow up question, rephrase the follow up \
         question to be a standalone question.\n\n\
         Chat History:\n{history}\n\
         Follow Up Input: {question}\n\
         Standalone question:"
    )
}

impl MemoryEngine {
    /// Answer a question in the request's mode.
    ///
    /// Access denial returns an empty response. Model failure or timeout
    /// returns [`EngineError::ProviderUnavailable`] so the caller can retry.
    pub async fn answer(&self, request: QaRequest) -> Result<QaResponse> {
        let _span = self.profiler.span("answer");
        let user = request.user.as_deref();
        if !self.guard.authorize(user, Action::Read, "qa").is_allowed() {
            return Ok(QaResponse::new(&request.mode, String::new(), Vec::new()));
        }

        let question = self.clean_input(&request.question);
        let timeout = request
            .timeout
            .unwrap_or(Duration::from_secs(self.config.llm.timeout_secs));

        let (standalone, history) = match &request.mode {
            QaMode::Conversational { chat_history } if !chat_history.is_empty() => {
                let condensed = self
                    .complete(
                        CompletionRequest {
                            prompt: condense_prompt(chat_history, &question),
                            temperature: request.temperature,
                            chat_history: Vec::new(),
                        },
                        timeout,
                    )
                    .await?;
                let condensed = condensed.trim().to_string();
                let standalone = if condensed.is_empty() { question.clone() } else { condensed };
                (standalone, chat_history.clone())
            }
            _ => (question.clone(), Vec::new()),
        };
        tracing::debug!(question = %standalone, "retrieving for qa");

        let filter = merge_filters(&self.config.retrieval.default_filter, request.metadata_filter.as_ref());
        let k = request.k.unwrap_or(self.config.retrieval.k);
        let hits = self.search(&standalone, k, &filter).await?;
        let source_keys: Vec<String> = hits.iter().map(|h| h.chunk_key.clone()).collect();

        let completion = CompletionRequest {
            prompt: qa_prompt(&standalone, &hits),
            temperature: request.temperature,
            chat_history: history,
        };
        match self.complete(completion, timeout).await {
            Ok(text) => Ok(QaResponse::new(&request.mode, text, source_keys)),
            Err(e) => {
                self.guard.audit().record(user, Action::Read, "qa", AuditOutcome::Failed);
                Err(e)
            }
        }
    }

    /// Flat-parameter entry point over [`answer`](Self::answer).
    pub async fn retrieval_qa(
        &self,
        question: &str,
        use_conversation: bool,
        metadata_filter: Option<MetadataFilter>,
        temperature: f32,
        user: Option<&str>,
        chat_history: Option<Vec<ChatTurn>>,
    ) -> Result<QaResponse> {
        let mode = if use_conversation {
            QaMode::Conversational {
                chat_history: chat_history.unwrap_or_default(),
            }
        } else {
            QaMode::Stateless
        };
        self.answer(QaRequest {
            question: question.to_string(),
            mode,
            metadata_filter,
            temperature,
            user: user.map(str::to_string),
            k: None,
            timeout: None,
        })
        .await
    }

    /// Same parameters as [`retrieval_qa`](Self::retrieval_qa), passed
    /// through unchanged; returns only the answer text.
    pub async fn get_answer(
        &self,
        question: &str,
        use_conversation: bool,
        metadata_filter: Option<MetadataFilter>,
        temperature: f32,
        user: Option<&str>,
        chat_history: Option<Vec<ChatTurn>>,
    ) -> Result<String> {
        let response = self
            .retrieval_qa(question, use_conversation, metadata_filter, temperature, user, chat_history)
            .await?;
        Ok(response.text().to_string())
    }

    async fn complete(&self, request: CompletionRequest, timeout: Duration) -> Result<String> {
        let provider = self.llm.name().to_string();
        match tokio::time::timeout(timeout, self.llm.complete(&request)).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(EngineError::provider(provider, format!("{e:#}"))),
            Err(_) => Err(EngineError::provider(provider, format!("timed out after {timeout:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use context_memory_core::models::Metadata;
    use serde_json::json;

    fn hit(text: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk_key: "k".into(),
            text: text.into(),
            metadata: Metadata::new(),
            score: 1.0,
        }
    }

    #[test]
    fn test_qa_prompt_numbers_chunks() {
        let p = qa_prompt("Who owns retries?", &[hit("alpha"), hit("beta")]);
        assert!(p.contains("[1] alpha\n\n[2] beta"));
        assert!(p.ends_with("Question: Who owns retries?\nHelpful Answer:"));
    }

    #[test]
    fn test_condense_prompt_lists_history() {
        let p = condense_prompt(&[ChatTurn::new("What is X?", "X is a layer.")], "Who owns it?");
        assert!(p.contains("Human: What is X?\nAssistant: X is a layer."));
        assert!(p.contains("Follow Up Input: Who owns it?"));
    }

    #[test]
    fn test_response_field_names() {
        let stateless = QaResponse::new(&QaMode::Stateless, "42".into(), vec!["k".into()]);
        let v = serde_json::to_value(&stateless).unwrap();
        assert_eq!(v, json!({ "result": "42", "source_keys": ["k"] }));

        let history = vec![ChatTurn::new("q", "a")];
        let conv = QaResponse::new(
            &QaMode::Conversational {
                chat_history: history.clone(),
            },
            "yes".into(),
            vec![],
        );
        let v = serde_json::to_value(&conv).unwrap();
        assert_eq!(v["answer"], "yes");
        assert_eq!(v["chat_history"][0]["question"], "q");
        assert!(v.get("result").is_none());
        assert_eq!(conv.text(), "yes");
    }

    #[test]
    fn test_request_builders() {
        let r = QaRequest::conversational("q", vec![])
            .with_user("rita")
            .with_k(2)
            .with_temperature(0.3);
        assert_eq!(r.user.as_deref(), Some("rita"));
        assert_eq!(r.k, Some(2));
        assert!(matches!(r.mode, QaMode::Conversational { .. }));
    }
}
