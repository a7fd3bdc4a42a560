//! Well-known locations.
//!
//! Each location is resolved through a fallback chain:
//! 1. usbkill-specific env var (USBKILL_CONFIG, USBKILL_RUNTIME_DIR)
//! 2. XDG_RUNTIME_DIR for runtime files
//! 3. System default (/etc/usbkill, /run/usbkill as root, /tmp/usbkill-$UID otherwise)
//!
//! Relative paths from env vars are ignored.

use anyhow::{Context, Result};
#[cfg(unix)]
use libc::geteuid;
use std::path::{Path, PathBuf};

/// System settings location.
pub const SYSTEM_CONFIG_FILE: &str = "/etc/usbkill/usbkill.toml";

#[derive(Debug, Clone)]
pub struct Paths {
    /// Settings file
    pub config_file: PathBuf,

    /// Runtime directory: PID file, instance lock, daemon output
    pub runtime_dir: PathBuf,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Self {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Self
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        let config_file = env_or(&env_fn, "USBKILL_CONFIG", || {
            PathBuf::from(SYSTEM_CONFIG_FILE)
        });

        let runtime_dir = env_or(&env_fn, "USBKILL_RUNTIME_DIR", || {
            resolve_runtime_dir(&env_fn)
        });

        Self {
            config_file,
            runtime_dir,
        }
    }

    /// Override the settings file (from `--config`).
    pub fn with_config_file(mut self, path: Option<&Path>) -> Self {
        if let Some(path) = path {
            self.config_file = path.to_path_buf();
        }
        self
    }

    /// PID file of the background daemon
    pub fn pid_file(&self) -> PathBuf {
        self.runtime_dir.join("usbkill.pid")
    }

    /// Single-instance lock
    pub fn instance_lock(&self) -> PathBuf {
        self.runtime_dir.join("usbkill.lock")
    }

    /// stdout/stderr of the background daemon
    pub fn daemon_log(&self) -> PathBuf {
        self.runtime_dir.join("usbkill.out")
    }

    /// Create the runtime directory with mode 0700.
    pub fn ensure_runtime_dir(&self) -> Result<()> {
        create_dir_with_mode(&self.runtime_dir)
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(default)
}

fn resolve_runtime_dir<F>(env_fn: &F) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    #[cfg(unix)]
    {
        let uid = unsafe { geteuid() };
        if uid == 0 {
            return PathBuf::from("/run/usbkill");
        }
    }

    if let Ok(dir) = env_fn("XDG_RUNTIME_DIR")
        && !dir.is_empty()
    {
        let path = PathBuf::from(&dir);
        if path.is_absolute() {
            return path.join("usbkill");
        }
    }

    #[cfg(unix)]
    {
        let uid = unsafe { geteuid() };
        let tmpdir = env_fn("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(tmpdir).join(format!("usbkill-{}", uid))
    }

    #[cfg(not(unix))]
    {
        let tmp = env_fn("TEMP").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(tmp).join("usbkill")
    }
}

fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}
