//! The kill sequence.
//!
//! Fixed order, fail-forward: a failed step is logged and the next one runs.
//! A half-completed sequence is worse than one with a failed step.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

use super::event::TriggerEvent;
use super::runner::CommandRunner;
use crate::audit;
use crate::config::Config;
use crate::error::CommandExecutionError;

/// Pause used instead of sync(2) so in-flight writes still get a chance to land.
const UNSYNCED_FLUSH_PAUSE: Duration = Duration::from_millis(5);

pub struct TriggerEngine {
    config: Arc<Config>,
    runner: Arc<dyn CommandRunner>,
    /// Directory of the running executable; removed in melt mode.
    program_dir: Option<PathBuf>,
    /// Cleared by `--no-shut-down`.
    allow_power_off: bool,
    fired: AtomicBool,
}

impl TriggerEngine {
    pub fn new(config: Arc<Config>, runner: Arc<dyn CommandRunner>) -> Self {
        let program_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));

        Self {
            config,
            runner,
            program_dir,
            allow_power_off: true,
            fired: AtomicBool::new(false),
        }
    }

    /// Run every destructive step but never power off.
    pub fn without_power_off(mut self) -> Self {
        self.allow_power_off = false;
        self
    }

    pub fn with_program_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.program_dir = dir;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Execute the kill sequence for `event`.
    ///
    /// `state` is the raw device listing that goes into the kill log. Runs at
    /// most once per engine; later calls are logged and ignored.
    pub fn execute(&self, event: &TriggerEvent, state: &str) {
        if self.fired.swap(true, Ordering::SeqCst) {
            warn!(
                "Kill sequence already executed, ignoring repeated trigger ({})",
                event.cause
            );
            return;
        }

        let kill = &self.config.kill;
        error!("{}. Killing the computer...", event.describe());

        // 1. Kill log, unless it is about to be destroyed anyway.
        if !kill.melt_usbkill {
            let message = format!(
                "{}. Dumping list of connected devices and killing the computer...",
                event.describe()
            );
            if let Err(e) = audit::append_entry(&self.config.logging.file, &message, state) {
                warn!("{}", e);
            }
        }

        // 2. Shred.
        for path in self.removal_list() {
            let result = match kill.remove_file_cmd.as_deref() {
                Some(cmd) if !cmd.trim().is_empty() => self
                    .runner
                    .spawn(&format!("{} {}", cmd.trim(), shell_quote(&path))),
                _ => self.runner.remove_path(&path),
            };
            report("remove", result);
        }

        // 3. Kill commands, in configured order.
        for cmd in &kill.kill_commands {
            report("kill command", self.runner.spawn(cmd));
        }

        // 4. Sync, or a short pause instead.
        if kill.do_sync {
            report("sync", self.runner.sync());
        } else {
            std::thread::sleep(UNSYNCED_FLUSH_PAUSE);
        }

        // 5. Wipe RAM and/or swap.
        if kill.do_wipe_ram
            && let Some(cmd) = kill.wipe_ram_cmd.as_deref()
        {
            report("wipe ram", self.runner.spawn(cmd));
        }
        if kill.do_wipe_swap
            && let Some(cmd) = kill.wipe_swap_cmd.as_deref()
        {
            report("wipe swap", self.runner.spawn(cmd));
        }

        // 6. Power off.
        if kill.shut_down {
            if self.allow_power_off {
                report("power off", self.runner.spawn(&kill.power_off_cmd));
            } else {
                info!("Power-off skipped (--no-shut-down)");
            }
        }
    }

    /// Paths the shred step removes: the configured folders, plus in melt
    /// mode the directories holding the kill log, the settings file and
    /// the program itself.
    ///
    /// Only absolute paths are returned; a relative one would resolve
    /// against whatever directory the process happens to run in.
    pub fn removal_list(&self) -> Vec<PathBuf> {
        let kill = &self.config.kill;
        let mut paths: Vec<PathBuf> = Vec::new();
        for path in &kill.folders_to_remove {
            if path.is_absolute() {
                paths.push(path.clone());
            } else {
                warn!("Not removing relative path {}", path.display());
            }
        }

        if kill.melt_usbkill {
            let melt = [
                self.config.logging.file.parent().map(Path::to_path_buf),
                self.config
                    .source
                    .as_deref()
                    .and_then(Path::parent)
                    .map(Path::to_path_buf),
                self.program_dir.clone(),
            ];
            for dir in melt.into_iter().flatten() {
                if dir.as_os_str().is_empty() || paths.contains(&dir) {
                    continue;
                }
                if dir.is_absolute() {
                    paths.push(dir);
                } else {
                    warn!("Not melting relative directory {}", dir.display());
                }
            }
        }

        paths
    }
}

fn report(step: &str, result: Result<(), CommandExecutionError>) {
    if let Err(e) = result {
        warn!("Kill sequence step `{}` failed, continuing: {}", step, e);
    }
}

/// Quote a path for `sh -c`.
fn shell_quote(path: &Path) -> String {
    let raw = path.to_string_lossy();
    format!("'{}'", raw.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceId;
    use crate::trigger::runner::MockCommandRunner;
    use crate::trigger::testing::{Call, RecordingRunner};
    use mockall::Sequence;
    use std::fs;

    fn event() -> TriggerEvent {
        TriggerEvent::unknown_device(DeviceId::new(0x0781, 0x5567))
    }

    fn full_config(log_file: PathBuf) -> Config {
        let mut config = Config::with_log_file(log_file);
        config.kill.folders_to_remove = vec![PathBuf::from("/secret/a"), PathBuf::from("/secret/b")];
        config.kill.kill_commands = vec!["umount -l /mnt/x".to_string(), "cryptsetup close x".to_string()];
        config.kill.do_sync = true;
        config.kill.do_wipe_ram = true;
        config.kill.wipe_ram_cmd = Some("sdmem -fll".to_string());
        config.kill.do_wipe_swap = true;
        config.kill.wipe_swap_cmd = Some("sswap -lf /dev/sda5".to_string());
        config.kill.shut_down = true;
        config
    }

    fn engine(config: Config, runner: Arc<dyn CommandRunner>) -> TriggerEngine {
        TriggerEngine::new(Arc::new(config), runner)
            .with_program_dir(Some(PathBuf::from("/opt/usbkill/bin")))
    }

    #[test]
    fn full_sequence_runs_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("kills.log");
        let runner = Arc::new(RecordingRunner::default());

        engine(full_config(log.clone()), runner.clone()).execute(&event(), "Bus 001 Device 001: ID 1d6b:0002 hub\n");

        assert_eq!(
            runner.calls(),
            vec![
                Call::Remove(PathBuf::from("/secret/a")),
                Call::Remove(PathBuf::from("/secret/b")),
                Call::Spawn("umount -l /mnt/x".to_string()),
                Call::Spawn("cryptsetup close x".to_string()),
                Call::Sync,
                Call::Spawn("sdmem -fll".to_string()),
                Call::Spawn("sswap -lf /dev/sda5".to_string()),
                Call::Spawn("poweroff -f".to_string()),
            ]
        );

        let content = fs::read_to_string(&log).unwrap();
        assert!(content.contains("unknown device appeared): 0781:5567"));
        assert!(content.contains("Current state:\nBus 001 Device 001: ID 1d6b:0002 hub\n"));
    }

    #[test]
    fn shut_down_false_runs_steps_one_to_five_only() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("kills.log");
        let mut config = full_config(log.clone());
        config.kill.shut_down = false;
        let runner = Arc::new(RecordingRunner::default());

        engine(config, runner.clone()).execute(&event(), "");

        let calls = runner.calls();
        assert_eq!(calls.len(), 7);
        assert_eq!(calls.last(), Some(&Call::Spawn("sswap -lf /dev/sda5".to_string())));
        assert!(!calls.contains(&Call::Spawn("poweroff -f".to_string())));
        assert!(log.exists());
    }

    #[test]
    fn no_shut_down_override_suppresses_power_off() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::default());

        engine(full_config(tmp.path().join("kills.log")), runner.clone())
            .without_power_off()
            .execute(&event(), "");

        let calls = runner.calls();
        assert_eq!(calls.len(), 7);
        assert!(!calls.contains(&Call::Spawn("poweroff -f".to_string())));
    }

    #[test]
    fn failing_kill_command_does_not_stop_later_steps() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::with_log_file(tmp.path().join("kills.log"));
        config.kill.kill_commands = vec!["broken".to_string(), "still runs".to_string()];
        config.kill.do_sync = true;
        config.kill.do_wipe_ram = true;
        config.kill.wipe_ram_cmd = Some("sdmem -fll".to_string());
        config.kill.shut_down = true;

        let mut seq = Sequence::new();
        let mut mock = MockCommandRunner::new();
        mock.expect_spawn()
            .withf(|cmd| cmd == "broken")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(CommandExecutionError::Empty));
        mock.expect_spawn()
            .withf(|cmd| cmd == "still runs")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_sync()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(CommandExecutionError::Sync("EIO".to_string())));
        mock.expect_spawn()
            .withf(|cmd| cmd == "sdmem -fll")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_spawn()
            .withf(|cmd| cmd == "poweroff -f")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_remove_path().never();

        engine(config, Arc::new(mock)).execute(&event(), "");
    }

    #[test]
    fn failing_removal_does_not_stop_later_steps() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::with_log_file(tmp.path().join("kills.log"));
        config.kill.folders_to_remove = vec![PathBuf::from("/missing"), PathBuf::from("/present")];
        config.kill.shut_down = true;
        let runner = Arc::new(RecordingRunner::failing_on(&["/missing"]));

        engine(config, runner.clone()).execute(&event(), "");

        assert_eq!(
            runner.calls(),
            vec![
                Call::Remove(PathBuf::from("/missing")),
                Call::Remove(PathBuf::from("/present")),
                Call::Spawn("poweroff -f".to_string()),
            ]
        );
    }

    #[test]
    fn unwritable_log_does_not_block_sequence() {
        let tmp = tempfile::tempdir().unwrap();
        // The log path is a directory, so the write fails.
        let mut config = Config::with_log_file(tmp.path().to_path_buf());
        config.kill.kill_commands = vec!["k".to_string()];
        config.kill.shut_down = true;
        let runner = Arc::new(RecordingRunner::default());

        engine(config, runner.clone()).execute(&event(), "");

        assert_eq!(
            runner.calls(),
            vec![Call::Spawn("k".to_string()), Call::Spawn("poweroff -f".to_string())]
        );
    }

    #[test]
    fn absent_flags_skip_their_steps() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("kills.log");
        let mut config = Config::with_log_file(log.clone());
        // Commands configured but their flags are off.
        config.kill.wipe_ram_cmd = Some("sdmem -fll".to_string());
        config.kill.wipe_swap_cmd = Some("sswap".to_string());
        let runner = Arc::new(RecordingRunner::default());

        engine(config, runner.clone()).execute(&event(), "");

        assert!(runner.calls().is_empty());
        assert!(log.exists());
    }

    #[test]
    fn melt_skips_log_and_removes_own_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let log_dir = tmp.path().join("log");
        let log = log_dir.join("kills.log");
        let mut config = Config::with_log_file(log.clone());
        config.source = Some(PathBuf::from("/etc/usbkill/usbkill.toml"));
        config.kill.melt_usbkill = true;
        config.kill.folders_to_remove = vec![PathBuf::from("/secret")];
        let runner = Arc::new(RecordingRunner::default());

        engine(config, runner.clone()).execute(&event(), "");

        assert!(!log.exists(), "melt mode must not write the kill log");
        assert_eq!(
            runner.calls(),
            vec![
                Call::Remove(PathBuf::from("/secret")),
                Call::Remove(log_dir),
                Call::Remove(PathBuf::from("/etc/usbkill")),
                Call::Remove(PathBuf::from("/opt/usbkill/bin")),
            ]
        );
    }

    #[test]
    fn melt_targets_from_relative_settings_are_absolute() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = tmp.path().join("u.toml");
        fs::write(
            &settings,
            "[logging]\nfile = \"./kills.log\"\n\n[kill]\nmelt_usbkill = true\nfolders_to_remove = [\"secret\"]\n",
        )
        .unwrap();
        let config = Config::load_from(&settings).unwrap();
        let engine = engine(config, Arc::new(RecordingRunner::default()));

        let paths = engine.removal_list();

        assert!(!paths.is_empty());
        assert!(paths.iter().all(|p| p.is_absolute()), "{:?}", paths);
        assert!(!paths.contains(&PathBuf::from(".")));
        assert!(paths.contains(&fs::canonicalize(tmp.path()).unwrap()));
    }

    #[test]
    fn relative_removal_entries_are_skipped() {
        let mut config = Config::with_log_file("./kills.log");
        config.source = Some(PathBuf::from("./u.toml"));
        config.kill.melt_usbkill = true;
        config.kill.folders_to_remove = vec![PathBuf::from("rel/dir"), PathBuf::from("/abs")];
        let runner = Arc::new(RecordingRunner::default());
        let engine = engine(config, runner.clone());

        assert_eq!(
            engine.removal_list(),
            vec![PathBuf::from("/abs"), PathBuf::from("/opt/usbkill/bin")]
        );

        engine.execute(&event(), "");
        assert_eq!(
            runner.calls(),
            vec![
                Call::Remove(PathBuf::from("/abs")),
                Call::Remove(PathBuf::from("/opt/usbkill/bin")),
            ]
        );
    }

    #[test]
    fn melt_does_not_mutate_configuration() {
        let mut config = Config::with_log_file("/var/log/usbkill/kills.log");
        config.kill.melt_usbkill = true;
        let engine = engine(config, Arc::new(RecordingRunner::default()));

        let first = engine.removal_list();
        let second = engine.removal_list();
        assert_eq!(first, second);
        assert!(engine.config().kill.folders_to_remove.is_empty());
    }

    #[test]
    fn remove_file_cmd_is_used_with_quoting() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::with_log_file(tmp.path().join("kills.log"));
        config.kill.remove_file_cmd = Some("srm -zr".to_string());
        config.kill.folders_to_remove = vec![PathBuf::from("/home/me/it's secret")];
        let runner = Arc::new(RecordingRunner::default());

        engine(config, runner.clone()).execute(&event(), "");

        assert_eq!(
            runner.calls(),
            vec![Call::Spawn(r"srm -zr '/home/me/it'\''s secret'".to_string())]
        );
    }

    #[test]
    fn executes_at_most_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::with_log_file(tmp.path().join("kills.log"));
        config.kill.kill_commands = vec!["k".to_string()];
        let runner = Arc::new(RecordingRunner::default());
        let engine = engine(config, runner.clone());

        assert!(!engine.has_fired());
        engine.execute(&event(), "");
        engine.execute(&event(), "");

        assert!(engine.has_fired());
        assert_eq!(runner.calls(), vec![Call::Spawn("k".to_string())]);
    }

    #[test]
    fn concurrent_execute_runs_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::with_log_file(tmp.path().join("kills.log"));
        config.kill.kill_commands = vec!["k".to_string()];
        let runner = Arc::new(RecordingRunner::default());
        let engine = Arc::new(engine(config, runner.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                std::thread::spawn(move || engine.execute(&event(), ""))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(runner.calls().len(), 1);
    }
}
