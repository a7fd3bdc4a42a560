mod runner;

pub use runner::{ArmedMonitor, Mode, Monitor, MonitorState, PollOutcome};
