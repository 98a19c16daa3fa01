//! Common identity types for the portguard captive-portal gateway.
//!
//! This crate provides type-safe representations of the primitives the
//! access-control plane reasons about:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses, normalized lowercase
//! - [`Ipv4Address`]: IPv4 client/gateway addresses
//! - [`SessionId`], [`BindingId`], [`LedgerId`]: opaque record identifiers

mod ids;
mod ip;
mod mac;

pub use ids::{BindingId, LedgerId, SessionId};
pub use ip::Ipv4Address;
pub use mac::MacAddress;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("MAC address not usable for a client: {0}")]
    UnusableMacAddress(String),
}
