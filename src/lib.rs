//! usbkill - shut the computer down when its USB devices change
//!
//! This crate provides:
//! - Device enumeration (`lsusb`) and stable device identities
//! - The baseline/whitelist policy deciding when to trigger
//! - The monitor state machine and polling loop
//! - The fail-forward kill sequence and its append-only kill log

pub mod audit;
pub mod concurrency;
pub mod config;
pub mod device;
pub mod error;
pub mod monitor;
pub mod paths;
pub mod policy;
pub mod trigger;

pub use config::Config;
