//! Trigger events and the kill sequence that consumes them.

mod engine;
mod event;
mod runner;

pub use engine::TriggerEngine;
pub use event::{TriggerCause, TriggerEvent};
pub use runner::{CommandRunner, HostRunner};
