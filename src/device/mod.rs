//! Device identities and the enumeration seam.
//!
//! A device is identified by the `vendor:product` token of its descriptor
//! line, never by the free text around it. Identical devices are told apart
//! by an instance ordinal, so two of the same keyboard enumerate as
//! `046d:c31c` and `046d:c31c#2`.

mod lsusb;

pub use lsusb::{LsusbEnumerator, parse_listing, parse_vendor_product};

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::error::EnumerationError;

/// Opaque, comparable identity of a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId {
    vendor: u16,
    product: u16,
    /// 1-based ordinal among devices sharing the same vendor:product.
    instance: u16,
}

impl DeviceId {
    /// First (or only) instance of a vendor:product pair.
    pub const fn new(vendor: u16, product: u16) -> Self {
        Self::nth(vendor, product, 1)
    }

    pub const fn nth(vendor: u16, product: u16, instance: u16) -> Self {
        Self {
            vendor,
            product,
            instance: if instance == 0 { 1 } else { instance },
        }
    }

    pub fn vendor(&self) -> u16 {
        self.vendor
    }

    pub fn product(&self) -> u16 {
        self.product
    }

    pub fn instance(&self) -> u16 {
        self.instance
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)?;
        if self.instance > 1 {
            write!(f, "#{}", self.instance)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid device id {0:?}, expected vvvv:pppp or vvvv:pppp#n")]
pub struct ParseDeviceIdError(pub String);

impl FromStr for DeviceId {
    type Err = ParseDeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseDeviceIdError(s.to_string());
        let (pair, instance) = match s.trim().split_once('#') {
            Some((pair, n)) => (pair, n.parse::<u16>().map_err(|_| err())?),
            None => (s.trim(), 1),
        };
        if instance == 0 {
            return Err(err());
        }
        let (vendor, product) = parse_vendor_product(pair).ok_or_else(err)?;
        Ok(Self::nth(vendor, product, instance))
    }
}

/// Deduplicated set of device identities, ordered so every decision over it
/// is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSet(BTreeSet<DeviceId>);

impl DeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from raw `(vendor, product)` tokens, numbering repeats.
    pub fn from_tokens<I>(tokens: I) -> Self
    where
        I: IntoIterator<Item = (u16, u16)>,
    {
        let mut seen: HashMap<(u16, u16), u16> = HashMap::new();
        let ids = tokens.into_iter().map(|(vendor, product)| {
            let n = seen.entry((vendor, product)).or_insert(0);
            *n = n.saturating_add(1);
            DeviceId::nth(vendor, product, *n)
        });
        Self(ids.collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.0.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceId> {
        self.0.iter()
    }

    pub fn union(&self, other: &DeviceSet) -> DeviceSet {
        Self(self.0.union(&other.0).copied().collect())
    }

    /// Ids in `self` that are absent from `other`, smallest first.
    pub fn difference<'a>(&'a self, other: &'a DeviceSet) -> impl Iterator<Item = &'a DeviceId> {
        self.0.difference(&other.0)
    }

    /// Copy of this set with `id` added.
    pub fn with(&self, id: DeviceId) -> DeviceSet {
        let mut set = self.0.clone();
        set.insert(id);
        Self(set)
    }

    /// Copy of this set with `id` removed.
    pub fn without(&self, id: &DeviceId) -> DeviceSet {
        let mut set = self.0.clone();
        set.remove(id);
        Self(set)
    }
}

impl FromIterator<DeviceId> for DeviceSet {
    fn from_iter<T: IntoIterator<Item = DeviceId>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for DeviceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.0.iter().map(|id| id.to_string()).collect();
        write!(f, "{{{}}}", ids.join(", "))
    }
}

/// Result of a single enumeration.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub devices: DeviceSet,
    /// Raw listing exactly as the host printed it; only used for the kill log.
    pub raw: String,
    pub captured_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(devices: DeviceSet, raw: impl Into<String>) -> Self {
        Self {
            devices,
            raw: raw.into(),
            captured_at: Utc::now(),
        }
    }
}

/// Source of device listings.
///
/// Must be synchronous and bounded; the monitor runs it on the blocking pool.
pub trait DeviceEnumerator: Send + Sync {
    fn enumerate(&self) -> Result<Snapshot, EnumerationError>;
}
