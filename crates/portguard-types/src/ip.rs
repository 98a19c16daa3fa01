//! IPv4 address type with safe parsing.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 address as leased to a client or assigned to the gateway.
///
/// The access plane is IPv4-only: DHCP on the client segment hands out
/// dotted-quad leases and every filter rule matches on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ipv4Address(Ipv4Addr);

impl Ipv4Address {
    pub const UNSPECIFIED: Self = Ipv4Address(Ipv4Addr::UNSPECIFIED);
    pub const BROADCAST: Self = Ipv4Address(Ipv4Addr::BROADCAST);
    pub const LOCALHOST: Self = Ipv4Address(Ipv4Addr::LOCALHOST);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ipv4Address(Ipv4Addr::new(a, b, c, d))
    }

    pub const fn inner(&self) -> Ipv4Addr {
        self.0
    }

    pub const fn octets(&self) -> [u8; 4] {
        self.0.octets()
    }

    /// Returns an error if this address cannot be a client lease.
    pub fn require_host(&self) -> Result<(), ParseError> {
        if self.0.is_unspecified()
            || self.0.is_broadcast()
            || self.0.is_multicast()
            || self.0.is_loopback()
        {
            Err(ParseError::InvalidIpAddress(self.to_string()))
        } else {
            Ok(())
        }
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Ipv4Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv4Addr>()
            .map(Ipv4Address)
            .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
    }
}

impl From<Ipv4Addr> for Ipv4Address {
    fn from(addr: Ipv4Addr) -> Self {
        Ipv4Address(addr)
    }
}

impl From<Ipv4Address> for Ipv4Addr {
    fn from(addr: Ipv4Address) -> Self {
        addr.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_and_display() {
        let ip: Ipv4Address = "192.168.4.10".parse().unwrap();
        assert_eq!(ip.octets(), [192, 168, 4, 10]);
        assert_eq!(ip.to_string(), "192.168.4.10");
    }

    #[test]
    fn test_parse_invalid() {
        assert!("192.168.4".parse::<Ipv4Address>().is_err());
        assert!("not-an-ip".parse::<Ipv4Address>().is_err());
        assert!("fe80::1".parse::<Ipv4Address>().is_err());
    }

    #[test]
    fn test_require_host() {
        assert!(Ipv4Address::UNSPECIFIED.require_host().is_err());
        assert!(Ipv4Address::BROADCAST.require_host().is_err());
        assert!(Ipv4Address::LOCALHOST.require_host().is_err());
        assert!("224.0.0.1".parse::<Ipv4Address>().unwrap().require_host().is_err());
        assert!("192.168.4.10".parse::<Ipv4Address>().unwrap().require_host().is_ok());
    }
}
