// ── Lucy Atoms: Error Types ────────────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, Network, Model, Tool…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • Tool failures are OBSERVED, not raised: the executor turns them into
//     structured observations fed back to the model. Only infrastructure
//     errors (path traversal, config) terminate a run through this enum.
//   • No variant carries secret material (API keys, tokens) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// A relative path tried to escape its workspace root.
    #[error("Path traversal denied: {0}")]
    PathTraversal(String),

    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// A single model call failed (non-secret detail only).
    #[error("Model error: {model}: {message}")]
    Model { model: String, message: String },

    /// Every model in a tier's fallback chain failed.
    #[error("No model available for tier {tier}: {message}")]
    ModelUnavailable { tier: String, message: String },

    /// Tool execution failure that cannot be expressed as an observation.
    #[error("Tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    /// Chat platform (Slack) transport or API failure.
    #[error("Channel error: {0}")]
    Channel(String),

    /// A circuit breaker rejected the call before it was attempted.
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Engine configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// External process (cron script, condition script) failed.
    #[error("Process error: {0}")]
    Process(String),

    /// Cron definition or execution failure.
    #[error("Cron error: {slug}: {message}")]
    Cron { slug: String, message: String },

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    pub fn model(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Model { model: model.into(), message: message.into() }
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool { tool: tool.into(), message: message.into() }
    }

    pub fn cron(slug: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Cron { slug: slug.into(), message: message.into() }
    }
}

// ── Migration bridge: String → EngineError ─────────────────────────────────
// Allows `?` on functions still returning `Result<T, String>` inside
// functions that return `EngineResult<T>`.

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations should return this type.
pub type EngineResult<T> = Result<T, EngineError>;
