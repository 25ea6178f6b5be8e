//! Utility functions for addresses, timestamps and formatting.
//!
//! This module provides helpers shared by the discovery, file and system
//! modules: subnet arithmetic for directed broadcasts, Windows FILETIME and
//! SYSTEMTIME conversion, and hex rendering.
//!
//! # Example
//!
//! ```
//! use ads_utilities::utils::{broadcast_address, format_hex_lower};
//! use std::net::Ipv4Addr;
//!
//! let broadcast = broadcast_address(
//!     Ipv4Addr::new(192, 168, 10, 17),
//!     Ipv4Addr::new(255, 255, 255, 0),
//! );
//! assert_eq!(broadcast, Ipv4Addr::new(192, 168, 10, 255));
//!
//! assert_eq!(format_hex_lower(&[0xAB, 0x01]), "ab01");
//! ```

use std::fmt::Write as _;
use std::net::Ipv4Addr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_OFFSET_SECS: i64 = 11_644_473_600;

/// FILETIME ticks per second (100 ns resolution).
const FILETIME_TICKS_PER_SEC: u64 = 10_000_000;

/// Returns the directed-broadcast address of the subnet `ip` lives in.
///
/// # Arguments
///
/// * `ip` - Any address in the subnet
/// * `mask` - Subnet mask
///
/// # Example
///
/// ```
/// use ads_utilities::utils::broadcast_address;
/// use std::net::Ipv4Addr;
///
/// let b = broadcast_address(Ipv4Addr::new(10, 1, 2, 3), Ipv4Addr::new(255, 255, 0, 0));
/// assert_eq!(b, Ipv4Addr::new(10, 1, 255, 255));
/// ```
pub fn broadcast_address(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(mask))
}

/// Converts a Windows FILETIME (100 ns ticks since 1601-01-01 UTC).
///
/// Returns `None` for zero, which the device uses for "not set", and for
/// values outside the representable range.
///
/// # Example
///
/// ```
/// use ads_utilities::utils::filetime_to_utc;
///
/// let t = filetime_to_utc(116_444_736_000_000_000).unwrap();
/// assert_eq!(t.timestamp(), 0);
/// assert!(filetime_to_utc(0).is_none());
/// ```
pub fn filetime_to_utc(ticks: u64) -> Option<DateTime<Utc>> {
    if ticks == 0 {
        return None;
    }
    let secs = (ticks / FILETIME_TICKS_PER_SEC) as i64 - FILETIME_UNIX_OFFSET_SECS;
    let nanos = ((ticks % FILETIME_TICKS_PER_SEC) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// Builds a date-time from SYSTEMTIME fields.
///
/// Returns `None` if the fields do not form a valid calendar date.
pub fn system_time_to_naive(
    year: u16,
    month: u16,
    day: u16,
    hour: u16,
    minute: u16,
    second: u16,
    millisecond: u16,
) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)?.and_hms_milli_opt(
        hour as u32,
        minute as u32,
        second as u32,
        millisecond as u32,
    )
}

/// Formats bytes as lowercase hex without separators.
///
/// # Example
///
/// ```
/// use ads_utilities::utils::format_hex_lower;
///
/// assert_eq!(format_hex_lower(&[0x00, 0xFF, 0x10]), "00ff10");
/// ```
pub fn format_hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_address() {
        assert_eq!(
            broadcast_address(Ipv4Addr::new(192, 168, 1, 7), Ipv4Addr::new(255, 255, 255, 0)),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            broadcast_address(Ipv4Addr::new(172, 16, 5, 4), Ipv4Addr::new(255, 240, 0, 0)),
            Ipv4Addr::new(172, 31, 255, 255)
        );
        assert_eq!(
            broadcast_address(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(0, 0, 0, 0)),
            Ipv4Addr::BROADCAST
        );
    }

    #[test]
    fn test_filetime_with_fraction() {
        let t = filetime_to_utc(116_444_736_000_000_000 + 15_000_000).unwrap();
        assert_eq!(t.timestamp(), 1);
        assert_eq!(t.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn test_system_time() {
        let t = system_time_to_naive(2024, 2, 29, 13, 45, 30, 250).unwrap();
        assert_eq!(t.to_string(), "2024-02-29 13:45:30.250");
        assert!(system_time_to_naive(2023, 2, 29, 0, 0, 0, 0).is_none());
        assert!(system_time_to_naive(2023, 13, 1, 0, 0, 0, 0).is_none());
    }

    #[test]
    fn test_format_hex_lower() {
        assert_eq!(format_hex_lower(&[]), "");
        assert_eq!(format_hex_lower(&[0xDE, 0xAD, 0xBE, 0xEF]), "deadbeef");
    }
}
