//! Baseline / whitelist comparison policy.
//!
//! Built once when the monitor arms and never mutated afterwards. The
//! allowed set is computed here, once, so device churn can never widen it.

use crate::device::{DeviceId, DeviceSet};
use crate::trigger::TriggerEvent;

#[derive(Debug, Clone)]
pub struct BaselinePolicy {
    baseline: DeviceSet,
    whitelist: DeviceSet,
    /// baseline ∪ whitelist
    allowed: DeviceSet,
}

impl BaselinePolicy {
    pub fn new(baseline: DeviceSet, whitelist: DeviceSet) -> Self {
        let allowed = baseline.union(&whitelist);
        Self {
            baseline,
            whitelist,
            allowed,
        }
    }

    pub fn baseline(&self) -> &DeviceSet {
        &self.baseline
    }

    pub fn whitelist(&self) -> &DeviceSet {
        &self.whitelist
    }

    pub fn allowed(&self) -> &DeviceSet {
        &self.allowed
    }

    /// Whitelist entries that name a device already in the baseline. They
    /// allow nothing extra: a further copy of that device needs another
    /// whitelist entry.
    pub fn shadowed_whitelist(&self) -> impl Iterator<Item = &DeviceId> {
        self.whitelist.iter().filter(|id| self.baseline.contains(id))
    }

    /// Decide whether `current` is a violation.
    ///
    /// Rules run in a fixed order and the first hit wins: unknown device,
    /// missing baseline device, count anomaly.
    pub fn evaluate(&self, current: &DeviceSet) -> Option<TriggerEvent> {
        if let Some(id) = self.unknown_device(current) {
            return Some(TriggerEvent::unknown_device(id));
        }
        if let Some(id) = self.missing_baseline_device(current) {
            return Some(TriggerEvent::baseline_removed(id));
        }
        self.count_anomaly(current)
    }

    /// Smallest id in `current` outside the allowed set.
    pub fn unknown_device(&self, current: &DeviceSet) -> Option<DeviceId> {
        current.difference(&self.allowed).next().copied()
    }

    /// Smallest baseline id absent from `current`.
    pub fn missing_baseline_device(&self, current: &DeviceSet) -> Option<DeviceId> {
        self.baseline.difference(current).next().copied()
    }

    /// Count check, independent of identity.
    pub fn count_anomaly(&self, current: &DeviceSet) -> Option<TriggerEvent> {
        let n = current.len();
        if n > self.allowed.len() || n < self.baseline.len() {
            Some(TriggerEvent::count_anomaly(
                n,
                self.baseline.len(),
                self.allowed.len(),
            ))
        } else {
            None
        }
    }
}
