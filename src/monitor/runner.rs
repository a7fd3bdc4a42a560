//! Device-presence monitor.
//!
//! `Monitor` (uninitialized) → [`Monitor::start`] → `ArmedMonitor` (armed)
//! → triggered. The baseline is captured exactly once, inside `start`.

use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::audit;
use crate::config::Config;
use crate::device::DeviceEnumerator;
use crate::error::{ConfigurationError, MonitorError};
use crate::policy::BaselinePolicy;
use crate::trigger::{CommandRunner, TriggerEngine, TriggerEvent};

/// Whether a violation runs the kill sequence or only raises an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Alert and keep monitoring. Nothing destructive runs.
    Test,
    /// Run the kill sequence.
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MonitorState {
    Uninitialized = 0,
    Armed = 1,
    /// Terminal.
    Triggered = 2,
}

impl MonitorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Uninitialized,
            1 => Self::Armed,
            _ => Self::Triggered,
        }
    }
}

/// What a single poll did.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Snapshot matches policy.
    Clear,
    /// Test mode violation; still armed.
    Alert(TriggerEvent),
    /// This poll moved the monitor to `Triggered` and ran the kill sequence.
    Triggered(TriggerEvent),
    /// Enumeration failed but the failure threshold is not reached yet.
    EnumerationFailed { consecutive: u32, threshold: u32 },
    /// Already triggered; nothing was polled.
    Inactive,
}

pub struct Monitor {
    settings: Option<Arc<Config>>,
    enumerator: Arc<dyn DeviceEnumerator>,
    runner: Arc<dyn CommandRunner>,
    mode: Mode,
    allow_power_off: bool,
}

impl Monitor {
    pub fn new(
        enumerator: Arc<dyn DeviceEnumerator>,
        runner: Arc<dyn CommandRunner>,
        mode: Mode,
    ) -> Self {
        Self {
            settings: None,
            enumerator,
            runner,
            mode,
            allow_power_off: true,
        }
    }

    pub fn load_settings(&mut self, settings: Config) {
        self.settings = Some(Arc::new(settings));
    }

    pub fn with_settings(mut self, settings: Config) -> Self {
        self.load_settings(settings);
        self
    }

    /// Keep every other countermeasure but never power off.
    pub fn without_power_off(mut self) -> Self {
        self.allow_power_off = false;
        self
    }

    /// Capture the baseline and arm.
    pub fn start(self) -> Result<ArmedMonitor, MonitorError> {
        let settings = self.settings.ok_or(ConfigurationError::NotLoaded)?;
        let whitelist = settings.whitelist()?;
        let snapshot = self.enumerator.enumerate()?;

        let policy = BaselinePolicy::new(snapshot.devices, whitelist);
        for id in policy.shadowed_whitelist() {
            warn!(
                "Whitelist entry {} is already in the baseline and allows no further copy of it",
                id
            );
        }
        let mut engine = TriggerEngine::new(settings.clone(), self.runner);
        if !self.allow_power_off {
            engine = engine.without_power_off();
        }

        let interval = Duration::from_millis(settings.monitor.sleep_time_ms);
        let msg = format!(
            "[INFO] Started patrolling the USB ports every {} milliseconds...",
            settings.monitor.sleep_time_ms
        );
        if let Err(e) = audit::append_entry(&settings.logging.file, &msg, &snapshot.raw) {
            warn!("{}", e);
        }
        info!(
            "{} (baseline: {}, whitelist: {}, mode: {:?})",
            msg,
            policy.baseline(),
            policy.whitelist(),
            self.mode
        );

        let core = MonitorCore {
            failure_threshold: settings.monitor.enumeration_failure_threshold.max(1),
            policy,
            enumerator: self.enumerator,
            engine,
            mode: self.mode,
            state: AtomicU8::new(MonitorState::Armed as u8),
            consecutive_failures: AtomicU32::new(0),
            alerts: AtomicU64::new(0),
        };

        Ok(ArmedMonitor {
            core: Arc::new(core),
            interval,
        })
    }
}

/// Shared between the loop and the blocking poll.
struct MonitorCore {
    policy: BaselinePolicy,
    enumerator: Arc<dyn DeviceEnumerator>,
    engine: TriggerEngine,
    mode: Mode,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    failure_threshold: u32,
    alerts: AtomicU64,
}

impl MonitorCore {
    fn state(&self) -> MonitorState {
        MonitorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn poll_once(&self) -> PollOutcome {
        if self.state() != MonitorState::Armed {
            return PollOutcome::Inactive;
        }

        let (event, dump) = match self.enumerator.enumerate() {
            Ok(snapshot) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                match self.policy.evaluate(&snapshot.devices) {
                    None => return PollOutcome::Clear,
                    Some(event) => (event, snapshot.raw),
                }
            }
            Err(e) => {
                let consecutive = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    "Device enumeration failed ({}/{}): {}",
                    consecutive, self.failure_threshold, e
                );
                if consecutive < self.failure_threshold {
                    return PollOutcome::EnumerationFailed {
                        consecutive,
                        threshold: self.failure_threshold,
                    };
                }
                let dump = format!("(device listing unavailable: {})\n", e);
                (TriggerEvent::enumeration_failure(&e), dump)
            }
        };

        self.fire(event, &dump)
    }

    fn fire(&self, event: TriggerEvent, dump: &str) -> PollOutcome {
        match self.mode {
            Mode::Test => {
                self.alerts.fetch_add(1, Ordering::SeqCst);
                warn!("[TEST MODE] {}", event.describe());
                println!("[TEST MODE] {} -- would kill the computer now", event.describe());
                PollOutcome::Alert(event)
            }
            Mode::Live => {
                // Single transition; a second caller finds Triggered and backs off.
                if self
                    .state
                    .compare_exchange(
                        MonitorState::Armed as u8,
                        MonitorState::Triggered as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_err()
                {
                    return PollOutcome::Inactive;
                }
                self.engine.execute(&event, dump);
                PollOutcome::Triggered(event)
            }
        }
    }
}

/// An armed monitor. Dropping it stops polling.
pub struct ArmedMonitor {
    core: Arc<MonitorCore>,
    interval: Duration,
}

impl ArmedMonitor {
    pub fn state(&self) -> MonitorState {
        self.core.state()
    }

    pub fn mode(&self) -> Mode {
        self.core.mode
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn policy(&self) -> &BaselinePolicy {
        &self.core.policy
    }

    /// Test mode alerts raised so far.
    pub fn alerts(&self) -> u64 {
        self.core.alerts.load(Ordering::SeqCst)
    }

    /// One enumerate + evaluate cycle, run on the calling thread.
    pub fn poll_once(&self) -> PollOutcome {
        self.core.poll_once()
    }

    /// Poll until triggered.
    ///
    /// Each poll runs on the blocking pool and is awaited before the next
    /// tick, so polls never overlap; ticks missed while a poll runs are
    /// skipped. In test mode this only returns on error.
    pub async fn run(&self) -> Result<MonitorState> {
        info!("Monitor running with interval: {:?}", self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let core = self.core.clone();
            let outcome = tokio::task::spawn_blocking(move || core.poll_once()).await?;

            match outcome {
                PollOutcome::Clear
                | PollOutcome::Alert(_)
                | PollOutcome::EnumerationFailed { .. } => {}
                PollOutcome::Triggered(event) => {
                    info!("Monitor triggered ({}), polling stopped", event.cause);
                    break;
                }
                PollOutcome::Inactive => {
                    debug!("Monitor no longer armed, polling stopped");
                    break;
                }
            }
        }

        Ok(self.state())
    }
}
