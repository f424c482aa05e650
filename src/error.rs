use std::path::PathBuf;

use thiserror::Error;

/// Exit code reported when the runtime itself fails.
pub const EXIT_RUNTIME_FAILURE: u8 = 125;
/// Exit code reported when the target command exists but cannot be executed.
pub const EXIT_NOT_EXECUTABLE: u8 = 126;
/// Exit code reported when the target command cannot be found.
pub const EXIT_NOT_FOUND: u8 = 127;

/// Errors produced by the runtime's own operations.
///
/// Workload failures (non-zero exits, OOM kills, failed forks inside the
/// container) are never represented here; they surface as the workload's
/// exit status.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration is malformed or incomplete.
    #[error("configuration error: {0}")]
    Config(String),

    /// Namespace setup, root switch or exec of the target failed.
    #[error("sandbox error: {message}")]
    Sandbox {
        message: String,
        /// Exit status the child used, when it reached the exec stage.
        exit_code: Option<u8>,
    },

    /// The invoking user lacks a privilege required for isolation.
    #[error("permission denied: missing {capability}: {message}")]
    Permission {
        capability: &'static str,
        message: String,
    },

    /// A cgroup could not be created, configured or removed.
    #[error("resource limit error: {0}")]
    ResourceLimit(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// I/O against the state directory failed.
    #[error("state store error at {path}: {source}")]
    StateStore {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("container '{0}' already exists")]
    DuplicateName(String),

    #[error("container '{0}' not found")]
    NotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// The requested operation does not apply to the container's current state.
    #[error("container '{name}' is {state}")]
    InvalidState { name: String, state: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    pub fn sandbox(message: impl Into<String>) -> Self {
        Error::Sandbox {
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Error::ResourceLimit(message.into())
    }

    pub fn state_store(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::StateStore {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Sandbox {
                exit_code: Some(code),
                ..
            } => *code,
            _ => EXIT_RUNTIME_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let exec_failure = Error::Sandbox {
            message: "no such file".into(),
            exit_code: Some(EXIT_NOT_FOUND),
        };
        assert_eq!(exec_failure.exit_code(), 127);
        assert_eq!(Error::sandbox("pivot_root").exit_code(), 125);
        assert_eq!(
            Error::from(LifecycleError::NotFound("web".into())).exit_code(),
            125
        );
    }

    #[test]
    fn test_lifecycle_messages() {
        let err = Error::from(LifecycleError::NotFound("test_sleep".into()));
        assert_eq!(err.to_string(), "container 'test_sleep' not found");

        let err = Error::from(LifecycleError::DuplicateName("web".into()));
        assert_eq!(err.to_string(), "container 'web' already exists");
    }
}
