//! Application error model
//!
//! Defines a typed error hierarchy using `thiserror` for internal error
//! handling. Each variant maps to one of the error kinds in `spec.md` §7;
//! only [`AppError::TzInvariant`] and [`AppError::Auth`] are fatal (exit
//! code 1). All other variants degrade the run (`partial=true`) and allow
//! it to complete.

use thiserror::Error;

/// Application error type
///
/// Covers every error kind the digest pipeline can encounter. Stage
/// functions return `AppResult<T>`; the runner decides whether a given
/// variant is fatal or merely sets `partial=true` on the envelope.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input (CLI flag, config value, malformed driver record)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Resource not found (account, output file, watermark)
    #[error("not found: {0}")]
    NotFound(String),
    /// Authentication failure reported by an external collaborator. Fatal.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Operation timeout (LLM call, mailbox fetch)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Conflict (idempotency window violated unexpectedly, state inconsistent)
    #[error("conflict: {0}")]
    Conflict(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
    /// Driver record missing required fields; the record is skipped
    #[error("input schema error: {0}")]
    InputSchema(String),
    /// HTML parse or cleaner regex failure; stage degrades locally
    #[error("parse error: {0}")]
    Parse(String),
    /// Naive datetime encountered with `fail_on_naive=true`. Fatal.
    #[error("timezone invariant violated: {0}")]
    TzInvariant(String),
    /// Per-call LLM timeout
    #[error("llm call timed out: {0}")]
    LlmTimeout(String),
    /// LLM transport failure (connection refused, bad gateway, etc.)
    #[error("llm transport error: {0}")]
    LlmTransport(String),
    /// LLM response failed schema validation after the repair retry
    #[error("llm schema error: {0}")]
    LlmSchema(String),
    /// Citation preview does not match the claimed body span
    #[error("citation mismatch: {0}")]
    CitationMismatch(String),
    /// Run-level token or cost budget exhausted before completion
    #[error("budget exhausted: {0}")]
    BudgetExhausted(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether this error terminates the run with exit code 1
    ///
    /// Only `TzInvariant` and `Auth` are fatal (`spec.md` §7); every other
    /// variant degrades the run but lets it complete and produce output.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TzInvariant(_) | Self::Auth(_))
    }

    /// The `degrade_reason` label recorded on the envelope when this error
    /// triggers a degrade rather than a hard failure
    pub fn degrade_reason(&self) -> &'static str {
        match self {
            Self::LlmTimeout(_) => "llm_timeout",
            Self::LlmTransport(_) => "llm_transport",
            Self::LlmSchema(_) => "llm_schema",
            Self::BudgetExhausted(_) => "budget_exhausted",
            Self::Parse(_) => "parse_error",
            Self::CitationMismatch(_) => "citation_mismatch",
            _ => "internal",
        }
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a
/// consistent error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn only_tz_invariant_and_auth_are_fatal() {
        assert!(AppError::TzInvariant("x".into()).is_fatal());
        assert!(AppError::Auth("x".into()).is_fatal());
        assert!(!AppError::LlmTimeout("x".into()).is_fatal());
        assert!(!AppError::CitationMismatch("x".into()).is_fatal());
        assert!(!AppError::Parse("x".into()).is_fatal());
    }

    #[test]
    fn degrade_reason_maps_known_variants() {
        assert_eq!(
            AppError::BudgetExhausted("x".into()).degrade_reason(),
            "budget_exhausted"
        );
        assert_eq!(AppError::LlmSchema("x".into()).degrade_reason(), "llm_schema");
    }
}
