//! Error taxonomy for the sync engine.
//!
//! Nothing here is fatal: every variant leaves the engine in a well-defined state
//! (idle assembler, disconnected channel, or a failed upload ready for retry).

use crate::upload::FileRejection;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Emit or submit attempted while the channel is not `connected`.
    #[error("not connected")]
    NotConnected,
    #[error("an upload is already in progress")]
    UploadInProgress,
    #[error("nothing to submit: provide text or a file")]
    EmptySubmission,
    #[error("file rejected: {0}")]
    FileRejected(FileRejection),
    /// A mutation would leave two streaming messages in the conversation.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// Target of a mutation is finalized history.
    #[error("message is no longer streaming and cannot be changed")]
    ImmutableMessage,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upload failed: {0}")]
    UploadFailure(String),
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
}

impl From<crate::transport::TransportError> for EngineError {
    fn from(e: crate::transport::TransportError) -> Self {
        EngineError::Transport(e.to_string())
    }
}

impl From<crate::upload::UploadError> for EngineError {
    fn from(e: crate::upload::UploadError) -> Self {
        match e {
            crate::upload::UploadError::Rejected(r) => EngineError::FileRejected(r),
            other => EngineError::UploadFailure(other.to_string()),
        }
    }
}
