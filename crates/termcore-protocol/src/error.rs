//! Error taxonomy for the terminal core.
//!
//! Nothing here is fatal: every variant is rendered inline (an `error` output
//! entry) or mapped to a `false`/`None` return by the component that owns it.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TerminalError {
    /// Malformed input such as a plugin manifest or a search pattern.
    #[error("validation error: {0}")]
    Validation(String),
    /// A hard cap was hit (split count, only-tab close).
    #[error("resource limit: {0}")]
    ResourceLimit(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Persistent store is over capacity.
    #[error("quota exceeded: {0}")]
    Quota(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
    /// A collaborator (catalog, cloud store, code assistant) failed.
    #[error("collaborator error: {0}")]
    Collaborator(String),
    #[error("{0}")]
    Command(String),
}

impl From<serde_json::Error> for TerminalError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl TerminalError {
    /// The message without the category prefix, for inline rendering.
    pub fn detail(&self) -> &str {
        match self {
            Self::Validation(message)
            | Self::ResourceLimit(message)
            | Self::NotFound(message)
            | Self::Quota(message)
            | Self::InvalidState(message)
            | Self::Serialization(message)
            | Self::Storage(message)
            | Self::Collaborator(message)
            | Self::Command(message) => message,
        }
    }
}

/// Convenience result type for terminal-core operations.
pub type TerminalResult<T> = Result<T, TerminalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_errors_render_bare_message() {
        let error = TerminalError::Command("boom".into());
        assert_eq!(error.to_string(), "boom");
    }

    #[test]
    fn detail_drops_category_prefix() {
        let error = TerminalError::NotFound("cat: x: No such file".into());
        assert_eq!(error.to_string(), "not found: cat: x: No such file");
        assert_eq!(error.detail(), "cat: x: No such file");
    }

    #[test]
    fn serde_errors_convert_to_serialization() {
        let error: TerminalError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(error, TerminalError::Serialization(_)));
    }
}
