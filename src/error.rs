//! Error taxonomy.
//!
//! Only [`ConfigurationError`] and [`MonitorError`] ever reach the operator.
//! The other two are contained inside the kill sequence: they get logged and
//! the next countermeasure runs anyway.

use std::path::PathBuf;
use thiserror::Error;

/// Missing or invalid settings. Fatal, prevents arming.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("no settings loaded; load a settings file before starting the monitor")]
    NotLoaded,

    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// The host device listing could not be observed.
///
/// Never interpreted as "zero devices".
#[derive(Debug, Error)]
pub enum EnumerationError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}")]
    Status { command: String, status: String },

    #[error("`{command}` produced non UTF-8 output")]
    Encoding { command: String },

    #[error("unrecognised device line: {line:?}")]
    Malformed { line: String },
}

/// A countermeasure could not be launched.
#[derive(Debug, Error)]
pub enum CommandExecutionError {
    #[error("empty command")]
    Empty,

    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("filesystem sync failed: {0}")]
    Sync(String),
}

/// The kill log could not be written.
#[derive(Debug, Error)]
#[error("failed to write kill log {path}: {source}")]
pub struct LogWriteError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Reasons the monitor refused to arm.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("could not capture the device baseline: {0}")]
    Baseline(#[from] EnumerationError),
}
