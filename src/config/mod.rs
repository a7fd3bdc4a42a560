use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::device::{DeviceSet, parse_vendor_product};
use crate::error::ConfigurationError;
use crate::paths::Paths;

/// Settings, loaded once before the monitor arms and read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// File these settings were read from (not serialized). Melt mode
    /// removes its directory.
    #[serde(skip)]
    pub source: Option<PathBuf>,

    pub logging: LoggingConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub kill: KillConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Kill log. Required.
    pub file: PathBuf,

    /// tracing filter used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Poll interval in milliseconds
    #[serde(default = "default_sleep_time_ms")]
    pub sleep_time_ms: u64,

    /// `vvvv:pppp` ids allowed to come and go. Repeat an entry to allow
    /// several identical devices.
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Consecutive enumeration failures tolerated before triggering (1 = first failure triggers)
    #[serde(default = "default_failure_threshold")]
    pub enumeration_failure_threshold: u32,

    /// Device listing command
    #[serde(default = "default_lsusb_command")]
    pub lsusb_command: String,
}

/// The kill sequence. Every step is gated by its own flag; an absent flag
/// skips the step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillConfig {
    /// Command used to remove paths, invoked as `<cmd> <path>`. When unset,
    /// paths are removed in-process.
    #[serde(default)]
    pub remove_file_cmd: Option<String>,

    /// Also destroy the log, settings and program directories
    #[serde(default)]
    pub melt_usbkill: bool,

    #[serde(default)]
    pub folders_to_remove: Vec<PathBuf>,

    /// Run in this order, fire-and-forget
    #[serde(default)]
    pub kill_commands: Vec<String>,

    #[serde(default)]
    pub do_sync: bool,

    #[serde(default)]
    pub do_wipe_ram: bool,

    #[serde(default)]
    pub wipe_ram_cmd: Option<String>,

    #[serde(default)]
    pub do_wipe_swap: bool,

    #[serde(default)]
    pub wipe_swap_cmd: Option<String>,

    #[serde(default)]
    pub shut_down: bool,

    #[serde(default = "default_power_off_cmd")]
    pub power_off_cmd: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_sleep_time_ms() -> u64 {
    250
}
fn default_failure_threshold() -> u32 {
    1
}
fn default_lsusb_command() -> String {
    "lsusb".to_string()
}
fn default_power_off_cmd() -> String {
    "poweroff -f".to_string()
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sleep_time_ms: default_sleep_time_ms(),
            whitelist: Vec::new(),
            enumeration_failure_threshold: default_failure_threshold(),
            lsusb_command: default_lsusb_command(),
        }
    }
}

impl Default for KillConfig {
    fn default() -> Self {
        Self {
            remove_file_cmd: None,
            melt_usbkill: false,
            folders_to_remove: Vec::new(),
            kill_commands: Vec::new(),
            do_sync: false,
            do_wipe_ram: false,
            wipe_ram_cmd: None,
            do_wipe_swap: false,
            wipe_swap_cmd: None,
            shut_down: false,
            power_off_cmd: default_power_off_cmd(),
        }
    }
}

impl Config {
    /// Minimal settings: just a kill log, every countermeasure off.
    pub fn with_log_file(file: impl Into<PathBuf>) -> Self {
        Self {
            source: None,
            logging: LoggingConfig {
                file: file.into(),
                level: default_log_level(),
            },
            monitor: MonitorConfig::default(),
            kill: KillConfig::default(),
        }
    }

    /// Load from the resolved default location.
    pub fn load() -> Result<Self, ConfigurationError> {
        let paths = Paths::resolve();
        Self::load_from(&paths.config_file)
    }

    /// Load, expand and validate a settings file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigurationError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: Config =
            toml::from_str(&content).map_err(|source| ConfigurationError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        // The daemon runs from `/`; a relative source would melt the wrong directory.
        config.source = Some(fs::canonicalize(path).unwrap_or_else(|_| absolute(path)));
        config.expand_paths();
        config.validate()?;

        debug!("Loaded settings from {}", path.display());
        Ok(config)
    }

    /// Parse settings from a string without touching the filesystem.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigurationError> {
        let mut config: Config =
            toml::from_str(content).map_err(|source| ConfigurationError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.logging.file.as_os_str().is_empty() {
            return Err(invalid("logging.file", "must not be empty"));
        }
        if self
            .kill
            .folders_to_remove
            .iter()
            .any(|p| p.as_os_str().is_empty())
        {
            return Err(invalid("kill.folders_to_remove", "entries must not be empty"));
        }
        if self.monitor.sleep_time_ms == 0 {
            return Err(invalid("monitor.sleep_time_ms", "must be greater than zero"));
        }
        if self.monitor.enumeration_failure_threshold == 0 {
            return Err(invalid(
                "monitor.enumeration_failure_threshold",
                "must be at least 1",
            ));
        }
        if self.monitor.lsusb_command.trim().is_empty() {
            return Err(invalid("monitor.lsusb_command", "must not be empty"));
        }
        if let Some(entry) = self
            .monitor
            .whitelist
            .iter()
            .find(|e| parse_vendor_product(e).is_none())
        {
            return Err(invalid(
                "monitor.whitelist",
                format!("{:?} is not a vvvv:pppp device id", entry),
            ));
        }
        if self.kill.do_wipe_ram && is_blank(&self.kill.wipe_ram_cmd) {
            return Err(invalid("kill.wipe_ram_cmd", "required when do_wipe_ram is set"));
        }
        if self.kill.do_wipe_swap && is_blank(&self.kill.wipe_swap_cmd) {
            return Err(invalid(
                "kill.wipe_swap_cmd",
                "required when do_wipe_swap is set",
            ));
        }
        if self.kill.shut_down && self.kill.power_off_cmd.trim().is_empty() {
            return Err(invalid("kill.power_off_cmd", "required when shut_down is set"));
        }
        Ok(())
    }

    /// Whitelist as device ids. Repeated entries become further instances.
    pub fn whitelist(&self) -> Result<DeviceSet, ConfigurationError> {
        let mut tokens = Vec::with_capacity(self.monitor.whitelist.len());
        for entry in &self.monitor.whitelist {
            let pair = parse_vendor_product(entry).ok_or_else(|| {
                invalid(
                    "monitor.whitelist",
                    format!("{:?} is not a vvvv:pppp device id", entry),
                )
            })?;
            tokens.push(pair);
        }
        Ok(DeviceSet::from_tokens(tokens))
    }

    /// Expand `~` and anchor relative paths at the current directory.
    fn expand_paths(&mut self) {
        self.logging.file = absolute(&expand_tilde(&self.logging.file));
        self.kill.folders_to_remove = self
            .kill
            .folders_to_remove
            .iter()
            .map(|p| absolute(&expand_tilde(p)))
            .collect();
    }

    /// Write the commented default template to `path`.
    pub fn write_template(path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, DEFAULT_CONFIG_TEMPLATE)
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::Invalid {
        key,
        reason: reason.into(),
    }
}

fn is_blank(cmd: &Option<String>) -> bool {
    cmd.as_deref().is_none_or(|c| c.trim().is_empty())
}

/// Empty paths are left alone for `validate` to reject.
fn absolute(path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() {
        return PathBuf::new();
    }
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn expand_tilde(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).into_owned())
}

/// Default settings template with comments (used by `config init`)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# usbkill settings
#
# usbkill shuts the computer down when a USB device is inserted or removed.
# Every countermeasure below is off unless its flag is set.

[logging]
# Kill log (required). Each trigger appends a timestamp, the reason and
# the device listing at that moment.
file = "/var/log/usbkill/kills.log"
level = "info"

[monitor]
# Poll interval in milliseconds
sleep_time_ms = 250

# Devices that may be inserted and removed freely, as printed by `lsusb`
# (the ID column) or `usbkill devices`. Repeat an id to allow several.
# whitelist = ["0781:5567", "04f2:b2ea"]
whitelist = []

# Consecutive failures of the device listing tolerated before triggering.
# 1 = the first failure triggers.
enumeration_failure_threshold = 1

lsusb_command = "lsusb"

[kill]
# Remove these paths on trigger. Uses remove_file_cmd when set, for
# example "srm -zr" from the secure-delete package.
# remove_file_cmd = "srm -zr"
folders_to_remove = []

# Also remove usbkill itself: the log, settings and program directories.
melt_usbkill = false

# Run in this order when triggered, e.g. ["umount -l /mnt/secret"].
kill_commands = []

# Flush filesystem buffers before wiping. Slower, but files written just
# before the trigger survive.
do_sync = true

# do_wipe_ram = true
# wipe_ram_cmd = "sdmem -fll"

# do_wipe_swap = true
# wipe_swap_cmd = "sswap -lf /dev/sda5"

shut_down = true
power_off_cmd = "poweroff -f"
"#;
