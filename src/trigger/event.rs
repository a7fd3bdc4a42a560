use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::device::DeviceId;

/// Which rule fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCause {
    /// A device outside baseline and whitelist is connected.
    UnknownDeviceAppeared,
    /// A device present at start is gone.
    BaselineDeviceRemoved,
    /// Device count left the `[|baseline|, |baseline ∪ whitelist|]` band.
    CountAnomaly,
    /// The host device listing could not be observed.
    EnumerationFailure,
}

impl fmt::Display for TriggerCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UnknownDeviceAppeared => "unknown device appeared",
            Self::BaselineDeviceRemoved => "baseline device removed",
            Self::CountAnomaly => "device count anomaly",
            Self::EnumerationFailure => "device enumeration failed",
        };
        f.write_str(s)
    }
}

/// A detected violation. Consumed once by the trigger engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerEvent {
    pub cause: TriggerCause,
    #[serde(serialize_with = "serialize_device")]
    pub offending_device: Option<DeviceId>,
    pub timestamp: DateTime<Utc>,
    /// Free-form context (enumeration error text, observed counts).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TriggerEvent {
    pub fn new(cause: TriggerCause, offending_device: Option<DeviceId>) -> Self {
        Self {
            cause,
            offending_device,
            timestamp: Utc::now(),
            detail: None,
        }
    }

    pub fn unknown_device(id: DeviceId) -> Self {
        Self::new(TriggerCause::UnknownDeviceAppeared, Some(id))
    }

    pub fn baseline_removed(id: DeviceId) -> Self {
        Self::new(TriggerCause::BaselineDeviceRemoved, Some(id))
    }

    pub fn count_anomaly(observed: usize, min: usize, max: usize) -> Self {
        Self::new(TriggerCause::CountAnomaly, None).with_detail(format!(
            "observed {} devices, allowed range {}..={}",
            observed, min, max
        ))
    }

    pub fn enumeration_failure(error: impl fmt::Display) -> Self {
        Self::new(TriggerCause::EnumerationFailure, None).with_detail(error.to_string())
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// One-line description for the kill log and console alerts.
    pub fn describe(&self) -> String {
        let mut line = format!("Detected a USB change ({})", self.cause);
        if let Some(id) = self.offending_device {
            line.push_str(&format!(": {}", id));
        }
        if let Some(ref detail) = self.detail {
            line.push_str(&format!(" [{}]", detail));
        }
        line
    }
}

fn serialize_device<S>(id: &Option<DeviceId>, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match id {
        Some(id) => s.serialize_some(&id.to_string()),
        None => s.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_includes_device_and_detail() {
        let event = TriggerEvent::unknown_device(DeviceId::new(0x0781, 0x5567));
        assert_eq!(
            event.describe(),
            "Detected a USB change (unknown device appeared): 0781:5567"
        );

        let event = TriggerEvent::count_anomaly(5, 2, 3);
        assert!(event.describe().contains("observed 5 devices, allowed range 2..=3"));
    }

    #[test]
    fn serializes_cause_snake_case() {
        let event = TriggerEvent::baseline_removed(DeviceId::new(0x1d6b, 0x0002));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"baseline_device_removed\""));
        assert!(json.contains("\"1d6b:0002\""));
        assert!(!json.contains("\"detail\""));
    }
}
