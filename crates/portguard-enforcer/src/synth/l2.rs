//! L2 rule synthesis: client isolation and ARP guarding on the bridge.

use super::{priority, NetworkProfile};
use crate::rules::{ArpMatch, Chain, FilterRule, Match, RuleAction, RuleKind};
use portguard_types::{Ipv4Address, MacAddress};

/// Rules confining a client's frames to the gateway.
///
/// The client may talk to the gateway MAC and emit broadcast/multicast
/// (ARP, DHCP); any other station-to-station frame is dropped.
pub fn isolate_rules(mac: MacAddress, net: &NetworkProfile) -> Vec<FilterRule> {
    let kind = RuleKind::IsolateL2;
    vec![
        FilterRule {
            kind,
            mac,
            chain: Chain::BridgeForward,
            matches: vec![Match::SrcMac(mac), Match::DstMac(net.gateway_mac)],
            action: RuleAction::Accept,
            priority: priority(kind, 0),
        },
        FilterRule {
            kind,
            mac,
            chain: Chain::BridgeForward,
            matches: vec![Match::SrcMac(mac), Match::BroadcastOrMulticastDst],
            action: RuleAction::Accept,
            priority: priority(kind, 1),
        },
        FilterRule {
            kind,
            mac,
            chain: Chain::BridgeForward,
            matches: vec![Match::SrcMac(mac)],
            action: RuleAction::Drop,
            priority: priority(kind, 2),
        },
    ]
}

/// Rules pinning the client's ARP announcements to its bound identity.
///
/// ARP from this MAC must carry the sender pair `(ip, mac)`; anything
/// else from it is dropped and logged. The gateway's own announcements
/// originate from the gateway MAC and never traverse these rules.
pub fn arp_guard_rules(mac: MacAddress, ip: Ipv4Address, net: &NetworkProfile) -> Vec<FilterRule> {
    let kind = RuleKind::ArpGuard;
    let _ = net.gateway_ip; // the gateway pair is implicit in the per-MAC scoping
    vec![
        FilterRule {
            kind,
            mac,
            chain: Chain::BridgeForward,
            matches: vec![Match::SrcMac(mac), Match::Arp(ArpMatch::Sender { ip, mac })],
            action: RuleAction::Accept,
            priority: priority(kind, 0),
        },
        FilterRule {
            kind,
            mac,
            chain: Chain::BridgeForward,
            matches: vec![Match::SrcMac(mac), Match::Arp(ArpMatch::Any)],
            action: RuleAction::DropLog,
            priority: priority(kind, 1),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mac() -> MacAddress {
        "aa:bb:cc:dd:ee:01".parse().unwrap()
    }

    fn ip() -> Ipv4Address {
        "192.168.4.10".parse().unwrap()
    }

    #[test]
    fn test_isolation_permits_gateway_and_broadcast_only() {
        let net = NetworkProfile::default();
        let rules = isolate_rules(mac(), &net);
        assert_eq!(rules.len(), 3);
        assert!(rules[0].matches.contains(&Match::DstMac(net.gateway_mac)));
        assert_eq!(rules[0].action, RuleAction::Accept);
        assert!(rules[1].matches.contains(&Match::BroadcastOrMulticastDst));
        assert_eq!(rules[2].action, RuleAction::Drop);
        assert!(rules[0].priority < rules[2].priority);
    }

    #[test]
    fn test_arp_guard_accepts_only_bound_sender_pair() {
        let rules = arp_guard_rules(mac(), ip(), &NetworkProfile::default());
        assert_eq!(rules.len(), 2);
        assert!(rules[0].matches.contains(&Match::Arp(ArpMatch::Sender {
            ip: ip(),
            mac: mac()
        })));
        assert_eq!(rules[1].action, RuleAction::DropLog);
    }

    #[test]
    fn test_arp_guard_evaluates_before_isolation() {
        let net = NetworkProfile::default();
        let arp = arp_guard_rules(mac(), ip(), &net);
        let iso = isolate_rules(mac(), &net);
        assert!(arp[1].priority < iso[0].priority);
    }
}
