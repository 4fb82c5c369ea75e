//! Lifecycle error taxonomy.

use crate::session::BuildState;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LifecycleError {
    /// Required input missing or a command issued in the wrong state. Raised
    /// before any collaborator is called.
    #[error("{0}")]
    Validation(String),
    /// The credential verifier rejected the bot credential.
    #[error("credential rejected: {0}")]
    Credential(String),
    /// The specification compiler failed while planning or generating.
    #[error("generation failed: {0}")]
    Generation(String),
    /// The build failed and no repair attempts are left.
    #[error("build failed: {0}")]
    Build(String),
    /// The repair call failed or produced no patch.
    #[error("debug service failed: {0}")]
    DebugService(String),
    /// The runtime controller refused to start the artifact.
    #[error("runtime failed to start: {0}")]
    RuntimeStart(String),
    /// The runtime log stream went away.
    #[error("runtime log stream disconnected: {0}")]
    StreamDisconnect(String),
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: BuildState, to: BuildState },
}

impl LifecycleError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        LifecycleError::Validation(msg.into())
    }
}
