//! AMS addressing: Net IDs and port numbers.
//!
//! Every ADS request is routed to an [`AmsAddress`], the pair of a 6-byte
//! [`AmsNetId`] identifying the device and a port identifying the service on
//! that device.
//!
//! # Net ID format
//!
//! A Net ID is written as six dot-separated decimal octets. By convention the
//! first four octets are the device's IPv4 address followed by `.1.1`:
//!
//! | Bytes | Example | Description |
//! |-------|---------|-------------|
//! | 0..4 | `192.168.1.10` | Usually the device IPv4 address |
//! | 4..6 | `1.1` | Sub-address |
//!
//! # Example
//!
//! ```
//! use ads_utilities::{AmsAddress, AmsNetId, ports};
//!
//! let net_id: AmsNetId = "192.168.1.10.1.1".parse()?;
//! assert_eq!(net_id.to_string(), "192.168.1.10.1.1");
//!
//! let address = AmsAddress::new(net_id, ports::SYSTEM_SERVICE);
//! assert_eq!(address.to_string(), "192.168.1.10.1.1:10000");
//! # Ok::<(), ads_utilities::AdsError>(())
//! ```

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{AdsError, Result};

/// Net ID size in bytes.
pub const NET_ID_SIZE: usize = 6;

/// Well-known AMS ports.
pub mod ports {
    /// AMS router.
    pub const ROUTER: u16 = 1;
    /// License server.
    pub const LICENSE_SERVER: u16 = 30;
    /// Logger.
    pub const LOGGER: u16 = 100;
    /// Event logger.
    pub const EVENT_LOG: u16 = 110;
    /// Event log publisher, source of live diagnostic messages.
    pub const EVENT_LOG_PUBLISHER: u16 = 132;
    /// Real-time core.
    pub const REALTIME: u16 = 200;
    /// I/O runtime.
    pub const IO: u16 = 300;
    /// First PLC runtime.
    pub const PLC: u16 = 800;
    /// System service.
    pub const SYSTEM_SERVICE: u16 = 10000;
    /// EtherCAT master device, addressed on the master's own Net ID.
    pub const ETHERCAT_MASTER: u16 = 0xFFFF;
}

/// 6-byte AMS Net ID.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AmsNetId(pub [u8; NET_ID_SIZE]);

impl AmsNetId {
    /// Creates a Net ID from its six octets.
    pub fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        Self([a, b, c, d, e, f])
    }

    /// Builds the conventional `<ip>.1.1` Net ID for an IPv4 address.
    ///
    /// # Example
    ///
    /// ```
    /// use ads_utilities::AmsNetId;
    /// use std::net::Ipv4Addr;
    ///
    /// let id = AmsNetId::from_ip(Ipv4Addr::new(10, 0, 0, 5));
    /// assert_eq!(id.to_string(), "10.0.0.5.1.1");
    /// ```
    pub fn from_ip(ip: Ipv4Addr) -> Self {
        let [a, b, c, d] = ip.octets();
        Self([a, b, c, d, 1, 1])
    }

    /// Parses a Net ID from the first 6 bytes of `data`.
    ///
    /// # Errors
    ///
    /// Returns `AdsError::Decode` if fewer than 6 bytes are available.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let octets: [u8; NET_ID_SIZE] = data
            .get(..NET_ID_SIZE)
            .and_then(|slice| slice.try_into().ok())
            .ok_or_else(|| {
                AdsError::decode(format!(
                    "net id needs {} bytes, got {}",
                    NET_ID_SIZE,
                    data.len()
                ))
            })?;
        Ok(Self(octets))
    }

    /// Returns the raw octets.
    pub fn octets(&self) -> [u8; NET_ID_SIZE] {
        self.0
    }

    /// Returns `true` if every octet is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for AmsNetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{}.{}.{}.{}.{}.{}", a, b, c, d, e, g)
    }
}

impl fmt::Debug for AmsNetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AmsNetId({})", self)
    }
}

impl FromStr for AmsNetId {
    type Err = AdsError;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; NET_ID_SIZE];
        let mut parts = s.trim().split('.');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| AdsError::invalid_parameter("net_id", "expected 6 octets"))?;
            *octet = part.parse().map_err(|_| {
                AdsError::invalid_parameter("net_id", format!("'{}' is not an octet", part))
            })?;
        }
        if parts.next().is_some() {
            return Err(AdsError::invalid_parameter("net_id", "expected 6 octets"));
        }
        Ok(Self(octets))
    }
}

impl From<[u8; NET_ID_SIZE]> for AmsNetId {
    fn from(octets: [u8; NET_ID_SIZE]) -> Self {
        Self(octets)
    }
}

/// Full AMS address: Net ID plus port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AmsAddress {
    /// Target device.
    pub net_id: AmsNetId,
    /// Target service port.
    pub port: u16,
}

impl AmsAddress {
    /// Creates a new AMS address.
    pub fn new(net_id: AmsNetId, port: u16) -> Self {
        Self { net_id, port }
    }
}

impl fmt::Display for AmsAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.net_id, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_id_parse_and_display() {
        let id: AmsNetId = "5.80.201.232.1.1".parse().unwrap();
        assert_eq!(id.octets(), [5, 80, 201, 232, 1, 1]);
        assert_eq!(id.to_string(), "5.80.201.232.1.1");
    }

    #[test]
    fn test_net_id_parse_rejects_bad_input() {
        assert!("1.2.3.4.5".parse::<AmsNetId>().is_err());
        assert!("1.2.3.4.5.6.7".parse::<AmsNetId>().is_err());
        assert!("1.2.3.4.5.256".parse::<AmsNetId>().is_err());
        assert!("a.b.c.d.e.f".parse::<AmsNetId>().is_err());
    }

    #[test]
    fn test_net_id_from_bytes() {
        let id = AmsNetId::from_bytes(&[10, 0, 0, 1, 1, 1, 0xFF]).unwrap();
        assert_eq!(id, AmsNetId::new(10, 0, 0, 1, 1, 1));
    }

    #[test]
    fn test_net_id_from_bytes_too_short() {
        let err = AmsNetId::from_bytes(&[10, 0, 0]).unwrap_err();
        assert!(matches!(err, AdsError::Decode { .. }));
    }

    #[test]
    fn test_net_id_from_ip() {
        let id = AmsNetId::from_ip(Ipv4Addr::new(192, 168, 0, 2));
        assert_eq!(id, AmsNetId::new(192, 168, 0, 2, 1, 1));
        assert!(!id.is_zero());
        assert!(AmsNetId::default().is_zero());
    }

    #[test]
    fn test_address_display() {
        let address = AmsAddress::new(AmsNetId::new(1, 2, 3, 4, 1, 1), ports::EVENT_LOG_PUBLISHER);
        assert_eq!(address.to_string(), "1.2.3.4.1.1:132");
    }
}
