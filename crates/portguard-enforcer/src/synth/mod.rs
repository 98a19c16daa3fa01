//! Rule synthesizers.
//!
//! A synthesizer compiles one `(kind, client identity)` pair into the list
//! of [`FilterRule`]s that realize it, using the gateway's network profile
//! for portal endpoint, gateway identity and interface names. Synthesis is
//! pure: nothing here talks to a backend.

mod l2;
mod l3;

use crate::error::{EnforcerError, EnforcerResult};
use crate::rules::{FilterRule, RuleKind};
use portguard_types::{Ipv4Address, MacAddress};
use serde::{Deserialize, Serialize};

pub use l2::{arp_guard_rules, isolate_rules};
pub use l3::{bind_guard_rules, grant_egress_rules, portal_redirect_rules};

/// Immutable network addressing and interface layout of the gateway.
///
/// Built once from configuration and passed to constructors; rule
/// synthesis never consults mutable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkProfile {
    /// Client-facing interface name (opaque to the synthesizers).
    pub client_interface: String,
    /// Upstream interface name.
    pub uplink_interface: String,
    /// Portal endpoint unauthenticated web traffic is steered to.
    pub portal_ip: Ipv4Address,
    pub portal_port: u16,
    /// Gateway addressing used by the L2 guards.
    pub gateway_ip: Ipv4Address,
    pub gateway_mac: MacAddress,
    /// Whether TCP/443 is included in the portal redirect. Redirecting
    /// HTTPS produces certificate warnings on the client; some
    /// deployments prefer to let 443 fall through to the default deny.
    pub redirect_https: bool,
}

impl Default for NetworkProfile {
    fn default() -> Self {
        Self {
            client_interface: "wlan0".to_string(),
            uplink_interface: "eth0".to_string(),
            portal_ip: Ipv4Address::new(192, 168, 4, 1),
            portal_port: 8080,
            gateway_ip: Ipv4Address::new(192, 168, 4, 1),
            gateway_mac: MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
            redirect_https: true,
        }
    }
}

/// Compiles a rule set for the given kind and client identity.
///
/// `ip` is required for every kind except [`RuleKind::PortalRedirect`]
/// (which is installed before the client has an authenticated lease) and
/// [`RuleKind::IsolateL2`] (which matches on MAC alone).
pub fn compile(
    kind: RuleKind,
    mac: MacAddress,
    ip: Option<Ipv4Address>,
    net: &NetworkProfile,
) -> EnforcerResult<Vec<FilterRule>> {
    let need_ip = || {
        ip.ok_or_else(|| {
            EnforcerError::rejected(format!("{} requires a client IP for {}", kind, mac))
        })
    };

    match kind {
        RuleKind::PortalRedirect => Ok(portal_redirect_rules(mac, net)),
        RuleKind::GrantEgress => Ok(grant_egress_rules(mac, need_ip()?, net)),
        RuleKind::BindGuard => Ok(bind_guard_rules(mac, need_ip()?)),
        RuleKind::IsolateL2 => Ok(isolate_rules(mac, net)),
        RuleKind::ArpGuard => Ok(arp_guard_rules(mac, need_ip()?, net)),
    }
}

/// Computes a rule's chain priority from its kind and position.
pub(crate) fn priority(kind: RuleKind, seq: u16) -> u16 {
    u16::from(kind.precedence()) * 100 + seq
}
