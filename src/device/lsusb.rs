//! `lsusb`-backed enumerator.

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Command;
use tracing::debug;

use super::{DeviceEnumerator, DeviceSet, Snapshot};
use crate::error::EnumerationError;

/// Matches the `ID vvvv:pppp` token of an lsusb line, e.g.
/// `Bus 001 Device 001: ID 1d6b:0002 Linux Foundation 2.0 root hub`.
static ID_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bID ([0-9a-fA-F]{4}):([0-9a-fA-F]{4})\b").expect("ID token regex is valid")
});

/// Parse a bare `vvvv:pppp` pair (exactly four hex digits each side).
pub fn parse_vendor_product(s: &str) -> Option<(u16, u16)> {
    let (vendor, product) = s.trim().split_once(':')?;
    let is_hex4 = |s: &str| s.len() == 4 && s.chars().all(|c| c.is_ascii_hexdigit());
    if !is_hex4(vendor) || !is_hex4(product) {
        return None;
    }
    let vendor = u16::from_str_radix(vendor, 16).ok()?;
    let product = u16::from_str_radix(product, 16).ok()?;
    Some((vendor, product))
}

/// Extract device identities from a raw listing.
///
/// Blank lines are ignored. Any other line without an ID token fails the
/// whole enumeration: output we cannot read is not evidence of absence.
pub fn parse_listing(raw: &str) -> Result<DeviceSet, EnumerationError> {
    let mut tokens = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let caps = ID_TOKEN
            .captures(line)
            .ok_or_else(|| EnumerationError::Malformed {
                line: line.to_string(),
            })?;
        let token = format!("{}:{}", &caps[1], &caps[2]);
        let pair = parse_vendor_product(&token).ok_or_else(|| EnumerationError::Malformed {
            line: line.to_string(),
        })?;
        tokens.push(pair);
    }
    Ok(DeviceSet::from_tokens(tokens))
}

/// Runs the configured listing command (default `lsusb`) on every poll.
#[derive(Debug, Clone)]
pub struct LsusbEnumerator {
    command: String,
}

impl LsusbEnumerator {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

impl Default for LsusbEnumerator {
    fn default() -> Self {
        Self::new("lsusb")
    }
}

impl DeviceEnumerator for LsusbEnumerator {
    fn enumerate(&self) -> Result<Snapshot, EnumerationError> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().ok_or_else(|| EnumerationError::Spawn {
            command: self.command.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;

        let output = Command::new(program)
            .args(parts)
            .output()
            .map_err(|source| EnumerationError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(EnumerationError::Status {
                command: self.command.clone(),
                status: output.status.to_string(),
            });
        }

        let raw = String::from_utf8(output.stdout).map_err(|_| EnumerationError::Encoding {
            command: self.command.clone(),
        })?;
        let devices = parse_listing(&raw)?;
        debug!("Enumerated {} devices: {}", devices.len(), devices);

        Ok(Snapshot::new(devices, raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceId;

    const LISTING: &str = "\
Bus 002 Device 001: ID 1d6b:0003 Linux Foundation 3.0 root hub
Bus 001 Device 003: ID 046d:c31c Logitech, Inc. Keyboard K120
Bus 001 Device 004: ID 046d:c31c Logitech, Inc. Keyboard K120
Bus 001 Device 001: ID 1d6b:0002 Linux Foundation 2.0 root hub
";

    #[test]
    fn parses_ids_and_numbers_duplicates() {
        let set = parse_listing(LISTING).unwrap();
        assert_eq!(set.len(), 4);
        assert!(set.contains(&DeviceId::new(0x1d6b, 0x0003)));
        assert!(set.contains(&DeviceId::new(0x1d6b, 0x0002)));
        assert!(set.contains(&DeviceId::new(0x046d, 0xc31c)));
        assert!(set.contains(&DeviceId::nth(0x046d, 0xc31c, 2)));
    }

    #[test]
    fn descriptor_text_does_not_affect_identity() {
        let a = parse_listing("Bus 001 Device 003: ID 046d:c31c Logitech, Inc. Keyboard K120").unwrap();
        let b = parse_listing("Bus 003 Device 009: ID 046d:c31c Logitech USB Keyboard").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn blank_lines_are_ignored() {
        let set = parse_listing("\n\nBus 001 Device 001: ID 1d6b:0002 root hub\n\n").unwrap();
        assert_eq!(set.len(), 1);
        assert!(parse_listing("").unwrap().is_empty());
    }

    #[test]
    fn unreadable_line_fails_enumeration() {
        let err = parse_listing("Bus 001 Device 001: ID 1d6b:0002 hub\nsomething odd\n").unwrap_err();
        assert!(matches!(err, EnumerationError::Malformed { line } if line == "something odd"));
    }

    #[test]
    fn vendor_product_requires_four_hex_digits() {
        assert_eq!(parse_vendor_product("1d6b:0002"), Some((0x1d6b, 0x0002)));
        assert_eq!(parse_vendor_product(" 1D6B:0002 "), Some((0x1d6b, 0x0002)));
        assert_eq!(parse_vendor_product("1d6b:002"), None);
        assert_eq!(parse_vendor_product("1d6b-0002"), None);
        assert_eq!(parse_vendor_product("+d6b:0002"), None);
    }

    #[test]
    fn missing_binary_is_an_error() {
        let enumerator = LsusbEnumerator::new("/nonexistent/usbkill-test-lsusb");
        assert!(matches!(
            enumerator.enumerate(),
            Err(EnumerationError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_is_an_error() {
        let enumerator = LsusbEnumerator::new("false");
        assert!(matches!(
            enumerator.enumerate(),
            Err(EnumerationError::Status { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn command_arguments_are_passed_through() {
        let enumerator = LsusbEnumerator::new("echo Bus 001 Device 001: ID 1d6b:0002 root hub");
        let snapshot = enumerator.enumerate().unwrap();
        assert_eq!(snapshot.devices.len(), 1);
        assert!(snapshot.raw.contains("root hub"));
    }
}
