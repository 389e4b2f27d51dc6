//! Error types for the DM autopilot.

use std::time::Duration;

/// Errors that escape a contact pass or the engine loop.
///
/// Policy and notifier failures are handled where they happen and config
/// errors stop the binary before an engine exists, so only these two reach
/// callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Surface error: {0}")]
    Surface(#[from] SurfaceError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Kind of account/session problem reported by the message surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionProblem {
    /// The account is logged out (credentials expired, checkpoint).
    LoggedOut,
    /// The account is banned or restricted.
    Banned,
    /// The host session cannot be reached at all.
    Unreachable,
}

impl std::fmt::Display for SessionProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::LoggedOut => "logged_out",
            Self::Banned => "banned",
            Self::Unreachable => "unreachable",
        };
        write!(f, "{s}")
    }
}

/// Message surface errors.
#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    /// The surface returned nothing usable for one read. Retryable.
    #[error("Extraction failed for {contact}: {reason}")]
    Extraction { contact: String, reason: String },

    #[error("Send not confirmed: {reason}")]
    SendFailed { reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Logged out, banned, or unreachable. Fatal to the loop.
    #[error("Session problem ({kind}): {message}")]
    Session {
        kind: SessionProblem,
        message: String,
    },
}

impl SurfaceError {
    /// Whether this error means the surface can no longer be trusted.
    pub fn is_session(&self) -> bool {
        matches!(self, Self::Session { .. })
    }
}

/// Policy invoker errors.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The policy service could not be reached. The change stays unacknowledged.
    #[error("Policy service unavailable: {0}")]
    Unavailable(String),

    /// The policy answered with something we cannot use.
    #[error("Malformed policy response: {0}")]
    Malformed(String),
}

/// Escalation/notification errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
