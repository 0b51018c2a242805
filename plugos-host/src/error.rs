//! Error types for the plugin host.

use plugos_storage::{QueryError, StorageError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginHostError {
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("plugin already loaded: {0}")]
    PluginAlreadyLoaded(String),

    #[error("function '{function}' not exported by plugin '{plugin}'")]
    FunctionNotFound { plugin: String, function: String },

    #[error("syscall not found: {0}")]
    SyscallNotFound(String),

    #[error("syscall already registered in an overlapping scope: {0}")]
    DuplicateSyscall(String),

    #[error("sandbox unloaded: {0}")]
    SandboxUnloaded(String),

    #[error("syscall failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("plugin crashed: {plugin}: {message}")]
    PluginCrashed { plugin: String, message: String },

    #[error("isolation failure in plugin '{plugin}': {message}")]
    IsolationFailure { plugin: String, message: String },

    #[error("timeout: plugin '{plugin}' exceeded {timeout_ms}ms deadline")]
    Timeout { plugin: String, timeout_ms: u64 },

    #[error("too many pending syscalls: plugin '{plugin}' has {limit} outstanding")]
    TooManyPendingCalls { plugin: String, limit: usize },

    #[error("plugin initialization failed: {0}")]
    InitializationFailed(String),
}

impl PluginHostError {
    /// True for the "no such thing" family: plugin, function or syscall.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::PluginNotFound(_) | Self::FunctionNotFound { .. } | Self::SyscallNotFound(_)
        )
    }
}

/// Failure reported by a syscall handler.
///
/// Delivered to the calling plugin as [`PluginHostError::Handler`]; the
/// plugin may recover from it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<StorageError> for HandlerError {
    fn from(err: StorageError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<QueryError> for HandlerError {
    fn from(err: QueryError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("invalid arguments: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_family() {
        assert!(PluginHostError::SyscallNotFound("x".into()).is_not_found());
        assert!(PluginHostError::PluginNotFound("x".into()).is_not_found());
        assert!(
            PluginHostError::FunctionNotFound {
                plugin: "p".into(),
                function: "f".into()
            }
            .is_not_found()
        );
        assert!(!PluginHostError::SandboxUnloaded("p".into()).is_not_found());
        assert!(!PluginHostError::Handler(HandlerError::new("boom")).is_not_found());
    }

    #[test]
    fn storage_error_becomes_handler_message() {
        let err: HandlerError = StorageError::InvalidTable("bad-name".into()).into();
        assert!(err.message.contains("bad-name"));
    }
}
