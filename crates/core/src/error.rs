//! Failure taxonomy for dialogue requests.
//!
//! Every variant corresponds to one wire status code (see
//! [`crate::message::status`]); the dispatcher is the only layer that turns
//! an error into a response.

/// Errors surfaced by the dialogue core.
#[derive(Debug, thiserror::Error)]
pub enum DialogueError {
    /// A required field is missing or has the wrong type. Raised before any
    /// state is touched.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The `cmd` field names no known command.
    #[error("Unsupported command: {0}")]
    UnsupportedCommand(String),

    /// The request references a speaker the registry does not know.
    #[error("Unknown speaker: {0}")]
    UnknownSpeaker(String),

    /// A script node failed validation: empty cue or script lines, an
    /// out-of-range threshold or expiry, or an unresolvable/cyclic parent.
    #[error("Invalid script node {0}: {1}")]
    InvalidScriptNode(String, String),

    /// A collaborator backend failed.
    #[error("Backend failure: {0}")]
    Backend(#[from] anyhow::Error),
}

impl DialogueError {
    /// The wire status code this error maps to (success is `0`).
    pub fn status_code(&self) -> u8 {
        match self {
            DialogueError::InvalidMessage(_) => crate::message::status::INVALID_MESSAGE,
            DialogueError::UnsupportedCommand(_) => crate::message::status::UNSUPPORTED_COMMAND,
            DialogueError::UnknownSpeaker(_) => crate::message::status::UNKNOWN_SPEAKER,
            DialogueError::InvalidScriptNode(_, _) => crate::message::status::INVALID_SCRIPT_NODE,
            DialogueError::Backend(_) => crate::message::status::INTERNAL_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, DialogueError>;
