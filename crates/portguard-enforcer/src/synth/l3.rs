//! L3 rule synthesis: portal redirect, egress grant, IP bind guard.

use super::{priority, NetworkProfile};
use crate::rules::{Chain, FilterRule, Match, RuleAction, RuleKind};
use portguard_types::{Ipv4Address, MacAddress};

const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;
const DNS_PORT: u16 = 53;
const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

/// Rules steering an unauthenticated client to the portal.
///
/// Web traffic from the MAC is DNAT'd to the portal endpoint; DNS and
/// DHCP pass so the client can resolve and renew; everything else the
/// client tries to forward is dropped.
pub fn portal_redirect_rules(mac: MacAddress, net: &NetworkProfile) -> Vec<FilterRule> {
    let kind = RuleKind::PortalRedirect;
    let mut web_ports = vec![HTTP_PORT];
    if net.redirect_https {
        web_ports.push(HTTPS_PORT);
    }

    vec![
        FilterRule {
            kind,
            mac,
            chain: Chain::NatPrerouting,
            matches: vec![
                Match::InInterface(net.client_interface.clone()),
                Match::SrcMac(mac),
                Match::TcpDstPorts(web_ports),
            ],
            action: RuleAction::RedirectTo {
                ip: net.portal_ip,
                port: net.portal_port,
            },
            priority: priority(kind, 0),
        },
        FilterRule {
            kind,
            mac,
            chain: Chain::Forward,
            matches: vec![Match::SrcMac(mac), Match::UdpDstPorts(vec![DNS_PORT])],
            action: RuleAction::Accept,
            priority: priority(kind, 1),
        },
        FilterRule {
            kind,
            mac,
            chain: Chain::Forward,
            matches: vec![Match::SrcMac(mac), Match::TcpDstPorts(vec![DNS_PORT])],
            action: RuleAction::Accept,
            priority: priority(kind, 2),
        },
        FilterRule {
            kind,
            mac,
            chain: Chain::Forward,
            matches: vec![
                Match::SrcMac(mac),
                Match::UdpDstPorts(vec![DHCP_SERVER_PORT, DHCP_CLIENT_PORT]),
            ],
            action: RuleAction::Accept,
            priority: priority(kind, 3),
        },
        FilterRule {
            kind,
            mac,
            chain: Chain::Forward,
            matches: vec![Match::SrcMac(mac)],
            action: RuleAction::Drop,
            priority: priority(kind, 4),
        },
    ]
}

/// Rules permitting forwarding between an authenticated client and the
/// uplink. NAT masquerading on the uplink is installed by the network
/// bootstrap, not here.
pub fn grant_egress_rules(
    mac: MacAddress,
    ip: Ipv4Address,
    net: &NetworkProfile,
) -> Vec<FilterRule> {
    let kind = RuleKind::GrantEgress;
    vec![
        FilterRule {
            kind,
            mac,
            chain: Chain::Forward,
            matches: vec![
                Match::InInterface(net.client_interface.clone()),
                Match::OutInterface(net.uplink_interface.clone()),
                Match::SrcMac(mac),
                Match::SrcIp(ip),
            ],
            action: RuleAction::Accept,
            priority: priority(kind, 0),
        },
        FilterRule {
            kind,
            mac,
            chain: Chain::Forward,
            matches: vec![
                Match::InInterface(net.uplink_interface.clone()),
                Match::OutInterface(net.client_interface.clone()),
                Match::DstIp(ip),
            ],
            action: RuleAction::Accept,
            priority: priority(kind, 1),
        },
    ]
}

/// Rule dropping any frame from the MAC whose source IP is not its lease.
/// Frames carrying the leased IP fall through to later rules.
pub fn bind_guard_rules(mac: MacAddress, ip: Ipv4Address) -> Vec<FilterRule> {
    let kind = RuleKind::BindGuard;
    vec![FilterRule {
        kind,
        mac,
        chain: Chain::Forward,
        matches: vec![Match::SrcMac(mac), Match::NotSrcIp(ip)],
        action: RuleAction::DropLog,
        priority: priority(kind, 0),
    }]
}
