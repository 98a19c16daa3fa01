//! Backend-agnostic packet-filter rule model.
//!
//! A [`FilterRule`] is the unit both backends consume: a chain, a list of
//! match predicates and a terminal action, plus a priority that fixes the
//! evaluation order regardless of the order rules were handed to the
//! backend. All enforcement for a client is expressed through the five
//! [`RuleKind`] families.

use portguard_types::{Ipv4Address, MacAddress};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The enforcement layer a rule lives at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleLayer {
    /// IP-layer filtering and NAT (iptables territory).
    L3,
    /// Frame-layer filtering on the bridge (ebtables territory).
    L2,
}

impl fmt::Display for RuleLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleLayer::L3 => write!(f, "L3"),
            RuleLayer::L2 => write!(f, "L2"),
        }
    }
}

/// The five rule families through which all enforcement is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleKind {
    /// Steer unauthenticated web traffic to the portal; allow DNS/DHCP;
    /// deny other forwarding.
    PortalRedirect,
    /// Permit forwarding between the client and the uplink.
    GrantEgress,
    /// Drop frames whose source IP does not match the client's lease.
    BindGuard,
    /// Drop frames to any L2 destination other than the gateway or
    /// broadcast/multicast.
    IsolateL2,
    /// Drop ARP whose sender pair does not match the client's identity.
    ArpGuard,
}

impl RuleKind {
    /// The layer this kind is enforced at.
    pub fn layer(&self) -> RuleLayer {
        match self {
            RuleKind::PortalRedirect | RuleKind::GrantEgress | RuleKind::BindGuard => RuleLayer::L3,
            RuleKind::IsolateL2 | RuleKind::ArpGuard => RuleLayer::L2,
        }
    }

    /// Evaluation precedence (lower = matched earlier).
    ///
    /// The guards must see a packet before any egress permit does, so a
    /// spoofed frame is dropped rather than forwarded. Backends position
    /// rules by this value, which frees callers to declare rules in any
    /// order.
    pub fn precedence(&self) -> u8 {
        match self {
            RuleKind::BindGuard => 10,
            RuleKind::ArpGuard => 10,
            RuleKind::IsolateL2 => 20,
            RuleKind::PortalRedirect => 30,
            RuleKind::GrantEgress => 40,
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleKind::PortalRedirect => "PORTAL_REDIRECT",
            RuleKind::GrantEgress => "GRANT_EGRESS",
            RuleKind::BindGuard => "BIND_GUARD",
            RuleKind::IsolateL2 => "ISOLATE_L2",
            RuleKind::ArpGuard => "ARP_GUARD",
        };
        write!(f, "{}", s)
    }
}

/// The chain a rule is installed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    /// NAT prerouting on the client-facing interface.
    NatPrerouting,
    /// IP forwarding between client segment and uplink.
    Forward,
    /// Bridge-level forwarding on the client segment.
    BridgeForward,
}

/// ARP predicate for L2 rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArpMatch {
    /// Any ARP frame.
    Any,
    /// ARP whose sender (IP, MAC) pair equals the given identity.
    Sender {
        ip: Ipv4Address,
        mac: MacAddress,
    },
}

/// A single match predicate. A rule matches when all its predicates do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Match {
    SrcMac(MacAddress),
    DstMac(MacAddress),
    SrcIp(Ipv4Address),
    NotSrcIp(Ipv4Address),
    DstIp(Ipv4Address),
    InInterface(String),
    OutInterface(String),
    TcpDstPorts(Vec<u16>),
    UdpDstPorts(Vec<u16>),
    /// Frame destination is broadcast or multicast.
    BroadcastOrMulticastDst,
    Arp(ArpMatch),
}

/// Terminal action taken when a rule matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleAction {
    Accept,
    Drop,
    /// Drop and record the frame for spoof analytics.
    DropLog,
    /// DNAT the connection to the given endpoint.
    RedirectTo { ip: Ipv4Address, port: u16 },
}

/// A backend-agnostic filter rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    /// The rule family this rule was synthesized for.
    pub kind: RuleKind,
    /// The client MAC the rule is scoped to.
    pub mac: MacAddress,
    pub chain: Chain,
    pub matches: Vec<Match>,
    pub action: RuleAction,
    /// Evaluation position within the chain: `precedence * 100 + seq`.
    pub priority: u16,
}

impl FilterRule {
    /// The enforcement layer, derived from the rule kind.
    pub fn layer(&self) -> RuleLayer {
        self.kind.layer()
    }
}

/// Opaque handle naming one installed rule inside a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleHandle(String);

impl RuleHandle {
    /// Generates a fresh handle. Only backends call this.
    pub fn generate() -> Self {
        RuleHandle(format!("rh-{}", uuid::Uuid::new_v4()))
    }

    /// Wraps a handle string read back from a ledger row.
    pub fn from_string(s: impl Into<String>) -> Self {
        RuleHandle(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A rule as currently installed in a backend, as reported by `snapshot`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledRule {
    pub handle: RuleHandle,
    pub rule: FilterRule,
}
