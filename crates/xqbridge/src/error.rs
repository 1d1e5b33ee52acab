use std::path::PathBuf;

use thiserror::Error;

/// Every failure the bridge can surface to its caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("engine artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("engine artifact is not executable: {}", path.display())]
    ArtifactNotExecutable { path: PathBuf },

    #[error("failed to launch engine: {0}")]
    LaunchFailed(String),

    #[error("engine did not become ready within the handshake timeout")]
    HandshakeTimeout,

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("unparseable engine line: {0:?}")]
    UnparseableLine(String),

    #[error("command {command_id} timed out")]
    Timeout { command_id: u64 },

    #[error("engine crashed")]
    EngineCrashed,

    #[error("engine session is not running")]
    SessionDead,

    #[error("an engine session is already active")]
    SessionActive,

    #[error("command {command_id} was cancelled")]
    Cancelled { command_id: u64 },

    #[error("engine reported an error: {0}")]
    Engine(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// Errors after which the caller has to call `start()` again.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::EngineCrashed | Self::SessionDead | Self::LaunchFailed(_) | Self::HandshakeTimeout
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_fatal_classification() {
        assert!(BridgeError::EngineCrashed.is_session_fatal());
        assert!(BridgeError::SessionDead.is_session_fatal());
        assert!(BridgeError::HandshakeTimeout.is_session_fatal());
        assert!(!BridgeError::Timeout { command_id: 3 }.is_session_fatal());
        assert!(!BridgeError::InvalidCommand("x".into()).is_session_fatal());
        assert!(!BridgeError::Cancelled { command_id: 1 }.is_session_fatal());
    }

    #[test]
    fn messages_name_the_command() {
        assert_eq!(
            BridgeError::Timeout { command_id: 42 }.to_string(),
            "command 42 timed out"
        );
        assert_eq!(
            BridgeError::ArtifactNotExecutable {
                path: PathBuf::from("/data/lib/libpikafish.so")
            }
            .to_string(),
            "engine artifact is not executable: /data/lib/libpikafish.so"
        );
    }
}
