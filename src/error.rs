//! Error types for aurora-packer

use std::path::PathBuf;
use thiserror::Error;

/// Packing error types
#[derive(Debug, Error)]
pub enum PackError {
    /// External command exited with a non-zero status
    #[error("Command `{command}` failed with exit code {code:?}")]
    BuildCommandFailed {
        command: String,
        code: Option<i32>,
        /// Combined stdout/stderr of the failed run
        output: String,
    },

    /// External command could not be started
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Compiled-library archive could not be read
    #[error("Archive corrupt: {0}")]
    ArchiveCorrupt(String),

    /// Python source failed to compile
    #[error("Compile failed: {0}")]
    CompileError(String),

    /// Generated bundler spec file has an unexpected shape
    #[error("Unsupported spec file: {0}")]
    UnsupportedSpecFormat(String),

    /// Setup script required by the freezing tool is missing
    #[error("No setup script {} found, generate one with `{hint}`", path.display())]
    MissingSetupScript { path: PathBuf, hint: String },

    /// Protection step produced an unusable tree
    #[error("Protection failed: {0}")]
    Protection(String),

    /// File not found
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PackError {
    /// Captured output of a failed external command, if any
    pub fn command_output(&self) -> Option<&str> {
        match self {
            PackError::BuildCommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }

    /// `FileNotFound` for a missing `path`, any other I/O error unchanged
    pub(crate) fn from_io(path: &std::path::Path, error: std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::NotFound {
            PackError::FileNotFound(path.display().to_string())
        } else {
            PackError::Io(error)
        }
    }
}

/// Result type for packing operations
pub type PackResult<T> = Result<T, PackError>;
