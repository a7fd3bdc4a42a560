//! Append-only kill log.
//!
//! # Format
//!
//! Every entry is a blank line, a UTC timestamp, the message, then the
//! literal `Current state:` followed by the raw device listing:
//!
//! ```text
//!
//! Thu, 16 Oct 2026 09:12:44 GMT Detected a USB change (unknown device appeared): 0781:5567
//! Current state:
//! Bus 001 Device 001: ID 1d6b:0002 Linux Foundation 2.0 root hub
//! Bus 001 Device 007: ID 0781:5567 SanDisk Corp. Cruzer Blade
//! ```
//!
//! The file is only ever opened in append mode; nothing here truncates or
//! rotates it.

use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::LogWriteError;

const TIMESTAMP_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Render a single entry.
pub fn format_entry(ts: DateTime<Utc>, message: &str, state: &str) -> String {
    let mut entry = format!(
        "\n{} {}\nCurrent state:\n{}",
        ts.format(TIMESTAMP_FORMAT),
        message,
        state
    );
    if !entry.ends_with('\n') {
        entry.push('\n');
    }
    entry
}

/// Append an entry stamped with the current time.
///
/// Creates the parent directory if needed.
pub fn append_entry(log_file: &Path, message: &str, state: &str) -> Result<(), LogWriteError> {
    let entry = format_entry(Utc::now(), message, state);
    append(log_file, &entry)
}

fn append(path: &Path, text: &str) -> Result<(), LogWriteError> {
    let err = |source| LogWriteError {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(err)?;
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(err)?;
    file.write_all(text.as_bytes()).map_err(err)?;
    Ok(())
}
