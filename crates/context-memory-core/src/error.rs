//! Error taxonomy shared by the core library and the engine crate.
//!
//! Backends and providers use `anyhow` internally; the engine boundary
//! converts their failures into [`EngineError`] so callers can branch on
//! the kind of failure instead of parsing messages.
//!
//! | Variant | Raised when |
//! |---------|-------------|
//! | [`NotFound`](EngineError::NotFound) | A source file to ingest does not exist |
//! | [`Forbidden`](EngineError::Forbidden) | Access control denied a mutating call that must fail loudly |
//! | [`ProviderUnavailable`](EngineError::ProviderUnavailable) | An embedding or LLM call failed or timed out |
//! | [`Validation`](EngineError::Validation) | Configuration or request parameters are malformed |
//! | [`Internal`](EngineError::Internal) | Storage or other unexpected failures |
//!
//! A secure delete that matches nothing is not an error: it reports `false`.

use std::path::PathBuf;

use thiserror::Error;

use crate::access::Action;

/// Result alias for engine-facing operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("source not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("user '{user}' is not permitted to {action}")]
    Forbidden { user: String, action: Action },

    #[error("provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn provider(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// Only provider failures are worth retrying; everything else is
    /// deterministic for the same inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_provider_errors_are_retryable() {
        assert!(EngineError::provider("ollama", "timed out").is_retryable());
        assert!(!EngineError::validation("bad").is_retryable());
        assert!(!EngineError::NotFound {
            path: PathBuf::from("/nope")
        }
        .is_retryable());
    }

    #[test]
    fn test_forbidden_message_names_user_and_action() {
        let err = EngineError::Forbidden {
            user: "bob".into(),
            action: Action::Write,
        };
        assert_eq!(err.to_string(), "user 'bob' is not permitted to write");
    }
}
