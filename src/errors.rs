//! Structured error types for simoffload
//!
//! Uses thiserror for ergonomic error definitions with automatic Display
//! and Error trait implementations.

use std::path::PathBuf;

use thiserror::Error;

/// All possible errors raised by the remote-execution layer
#[derive(Error, Debug)]
pub enum OffloadError {
    /// Malformed registry/location file, missing or ambiguous attribute, unknown label
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Remote operation attempted on a location that is not Active
    #[error("Remote location {} is not active", .directory.as_ref().map_or_else(|| "(unassigned)".to_string(), |d| d.display().to_string()))]
    NotActive { directory: Option<PathBuf> },

    /// Delegated command exited nonzero
    #[error("Command failed with exit code {exit_code}: {command}{}", if .stderr.is_empty() { String::new() } else { format!("\n{}", .stderr) })]
    ExternalProcessFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// Mount/unmount, temp-dir or remote directory lifecycle failure
    #[error("Resource lifecycle error: {0}")]
    ResourceLifecycle(String),

    /// External program could not be started at all
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Local filesystem I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using OffloadError
pub type Result<T> = std::result::Result<T, OffloadError>;

impl OffloadError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        OffloadError::Configuration(msg.into())
    }

    pub(crate) fn lifecycle(msg: impl Into<String>) -> Self {
        OffloadError::ResourceLifecycle(msg.into())
    }

    pub(crate) fn spawn(program: impl Into<String>, source: std::io::Error) -> Self {
        OffloadError::Spawn {
            program: program.into(),
            source,
        }
    }
}

impl From<quick_xml::de::DeError> for OffloadError {
    fn from(e: quick_xml::de::DeError) -> Self {
        OffloadError::Configuration(format!("invalid XML: {e}"))
    }
}

impl From<quick_xml::se::SeError> for OffloadError {
    fn from(e: quick_xml::se::SeError) -> Self {
        OffloadError::Configuration(format!("cannot serialize XML: {e}"))
    }
}
