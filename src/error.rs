//! Error types for wg-peerd
//!
//! This module defines the error hierarchy for the peer daemon.
//! Errors are categorized by subsystem (configuration, interface driver,
//! registry store, interface config file) and include recovery hints.
//!
//! Engine-level errors returned by peer operations live next to the engine
//! in [`crate::peer::manager::PeerError`].

use std::io;
use std::path::Path;

use thiserror::Error;

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Errors raised by the interface driver (`wg`, `wg-quick`, key generation)
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    /// The external command could not be started
    #[error("Failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    /// The external command exited unsuccessfully
    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// The external command did not finish in time
    #[error("`{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    /// Key material could not be produced or decoded
    #[error("Key error: {0}")]
    Key(String),

    /// The interface is not running
    #[error("Interface {0} is down")]
    InterfaceDown(String),

    /// Temporary file handling for secrets failed
    #[error("Driver I/O error: {0}")]
    Io(String),
}

impl DriverError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Spawn { .. } => false,
            Self::CommandFailed { .. } => true,
            Self::Timeout { .. } => true,
            Self::Key(_) => false,
            Self::InterfaceDown(_) => true,
            Self::Io(_) => true,
        }
    }

    /// Create a spawn error
    pub fn spawn(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Spawn {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Create a command failure error
    pub fn command_failed(
        command: impl Into<String>,
        status: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            command: command.into(),
            status: status.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(command: impl Into<String>, timeout_secs: u64) -> Self {
        Self::Timeout {
            command: command.into(),
            timeout_secs,
        }
    }
}

impl From<io::Error> for DriverError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Peer registry store errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Registry file exists but could not be read
    #[error("Failed to read registry {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Registry file exists but does not contain a valid peer list
    #[error("Registry {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    /// Registry could not be written
    #[error("Failed to write registry {path}: {reason}")]
    Write { path: String, reason: String },
}

impl RegistryError {
    /// Check if this error is recoverable
    ///
    /// Read and write failures may be transient (full disk, permissions being
    /// fixed); a corrupt file needs an operator.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Read { source, .. } => !matches!(source.kind(), io::ErrorKind::InvalidData),
            Self::Corrupt { .. } => false,
            Self::Write { .. } => true,
        }
    }

    /// Create a read error
    pub fn read(path: &Path, source: io::Error) -> Self {
        Self::Read {
            path: path.display().to_string(),
            source,
        }
    }

    /// Create a corrupt-file error
    pub fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    /// Create a write error
    pub fn write(path: &Path, reason: impl Into<String>) -> Self {
        Self::Write {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }
}

/// Interface config file (`wg0.conf`) errors
#[derive(Debug, Error)]
pub enum ConfFileError {
    /// File could not be read
    #[error("Failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    /// File could not be written
    #[error("Failed to write {path}: {reason}")]
    Write { path: String, reason: String },
}

impl ConfFileError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }

    /// Create a read error
    pub fn read(path: &Path, reason: impl Into<String>) -> Self {
        Self::Read {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    /// Create a write error
    pub fn write(path: &Path, reason: impl Into<String>) -> Self {
        Self::Write {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }
}
