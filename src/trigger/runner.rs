//! Host capability used by the kill sequence.
//!
//! Everything destructive goes through [`CommandRunner`], so the engine can
//! be exercised against a recording fake instead of the real machine.

use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

use crate::error::CommandExecutionError;

#[cfg_attr(test, mockall::automock)]
pub trait CommandRunner: Send + Sync {
    /// Launch a shell command and return as soon as it is spawned.
    fn spawn(&self, command: &str) -> Result<(), CommandExecutionError>;

    /// Flush filesystem buffers; returns once the flush has been issued.
    fn sync(&self) -> Result<(), CommandExecutionError>;

    /// Recursively remove a file or directory in-process.
    fn remove_path(&self, path: &Path) -> Result<(), CommandExecutionError>;
}

/// Runs against the real host: `sh -c` for commands, sync(2), std::fs removal.
#[derive(Debug, Clone, Default)]
pub struct HostRunner;

impl CommandRunner for HostRunner {
    #[allow(clippy::zombie_processes)]
    fn spawn(&self, command: &str) -> Result<(), CommandExecutionError> {
        if command.trim().is_empty() {
            return Err(CommandExecutionError::Empty);
        }

        // Not waited on: the sequence must keep moving whatever the command does.
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| CommandExecutionError::Spawn {
                command: command.to_string(),
                source,
            })?;

        debug!("Spawned `{}` (pid {})", command, child.id());
        Ok(())
    }

    fn sync(&self) -> Result<(), CommandExecutionError> {
        #[cfg(unix)]
        {
            nix::unistd::sync();
            Ok(())
        }

        #[cfg(not(unix))]
        {
            Err(CommandExecutionError::Sync(
                "sync is not supported on this platform".to_string(),
            ))
        }
    }

    fn remove_path(&self, path: &Path) -> Result<(), CommandExecutionError> {
        let err = |source| CommandExecutionError::Remove {
            path: path.to_path_buf(),
            source,
        };

        let meta = std::fs::symlink_metadata(path).map_err(err)?;
        if meta.is_dir() {
            std::fs::remove_dir_all(path).map_err(err)
        } else {
            std::fs::remove_file(path).map_err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn remove_path_handles_files_and_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("secret.txt");
        let dir = tmp.path().join("vault");
        fs::write(&file, "x").unwrap();
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("nested").join("key"), "k").unwrap();

        HostRunner.remove_path(&file).unwrap();
        HostRunner.remove_path(&dir).unwrap();

        assert!(!file.exists());
        assert!(!dir.exists());
    }

    #[test]
    fn remove_missing_path_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            HostRunner.remove_path(&tmp.path().join("absent")),
            Err(CommandExecutionError::Remove { .. })
        ));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(
            HostRunner.spawn("   "),
            Err(CommandExecutionError::Empty)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn spawn_does_not_wait_for_completion() {
        let start = std::time::Instant::now();
        HostRunner.spawn("sleep 5").unwrap();
        assert!(start.elapsed() < std::time::Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn sync_succeeds() {
        HostRunner.sync().unwrap();
    }
}
