// Error types
// Every failure the engine reports is one of these variants, so callers can
// match on the kind instead of parsing message strings.

use thiserror::Error;

/// Errors reported by the store, session, query engine and bulk mutator.
#[derive(Debug, Error)]
pub enum Error {
    /// Direct key lookup miss on get/update/delete.
    #[error("no {entity} with key {key}")]
    NotFound { entity: String, key: u64 },

    /// Any operation invoked on a session after `close()`.
    #[error("session is closed")]
    SessionClosed,

    /// Commit-time referential or constraint failure. The whole batch is
    /// rolled back; the store is left unchanged.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// Unknown entity/field/alias or malformed query expression, raised when
    /// the query is built, before anything is evaluated.
    #[error("query syntax error: {0}")]
    QuerySyntax(String),

    /// Invalid or unevaluable bulk-mutation expression. The statement is
    /// rejected as a whole with zero side effects.
    #[error("validation error: {0}")]
    Validation(String),
}

impl Error {
    pub fn not_found(entity: impl Into<String>, key: u64) -> Self {
        Self::NotFound {
            entity: entity.into(),
            key,
        }
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::IntegrityViolation(message.into())
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::QuerySyntax(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
