//! Shell command builders for the netfilter backend.
//!
//! Every abstract [`FilterRule`] renders to one or more `iptables` /
//! `ebtables` invocations. Add and delete share the same match spec, so a
//! rule can always be removed with the exact arguments that installed it.

use crate::rules::{ArpMatch, Chain, FilterRule, Match, RuleAction, RuleLayer};
use crate::shell::{self, CONNTRACK_CMD, EBTABLES_CMD, IPTABLES_CMD};
use portguard_types::Ipv4Address;

/// Gateway-owned chain for portal DNAT rules (nat table).
pub const REDIRECT_CHAIN: &str = "PG_REDIRECT";

/// Gateway-owned chain for L3 forwarding decisions (filter table).
pub const FORWARD_CHAIN: &str = "PG_FORWARD";

/// Gateway-owned chain for bridge-level decisions (ebtables filter table).
pub const BRIDGE_CHAIN: &str = "PG_BRIDGE";

/// Log prefix attached to guard drops so spoof attempts can be harvested
/// from the kernel log.
pub const DROP_LOG_PREFIX: &str = "pg-spoof: ";

/// Commands that create the gateway-owned chains and jump the built-in
/// chains into them. Safe to run repeatedly: creation failures of
/// existing chains are swallowed and jumps are only appended when absent.
pub fn build_bootstrap_cmds() -> Vec<String> {
    vec![
        format!("{ipt} -t nat -N {c} 2>/dev/null || true", ipt = IPTABLES_CMD, c = REDIRECT_CHAIN),
        format!(
            "{ipt} -t nat -C PREROUTING -j {c} 2>/dev/null || {ipt} -t nat -A PREROUTING -j {c}",
            ipt = IPTABLES_CMD,
            c = REDIRECT_CHAIN
        ),
        format!("{ipt} -N {c} 2>/dev/null || true", ipt = IPTABLES_CMD, c = FORWARD_CHAIN),
        format!(
            "{ipt} -C FORWARD -j {c} 2>/dev/null || {ipt} -A FORWARD -j {c}",
            ipt = IPTABLES_CMD,
            c = FORWARD_CHAIN
        ),
        format!("{ebt} -N {c} 2>/dev/null || true", ebt = EBTABLES_CMD, c = BRIDGE_CHAIN),
        format!(
            "{ebt} -L FORWARD | grep -q {c} || {ebt} -A FORWARD -j {c}",
            ebt = EBTABLES_CMD,
            c = BRIDGE_CHAIN
        ),
    ]
}

/// Commands that install `rule` at 1-based `position` within its chain.
///
/// Most rules render to a single command; `DropLog` at L3 needs a LOG
/// rule in front of the DROP because the iptables LOG target does not
/// terminate.
pub fn build_add_cmds(rule: &FilterRule, position: usize) -> Vec<String> {
    match rule.layer() {
        RuleLayer::L3 => {
            let spec = l3_match_spec(rule);
            match &rule.action {
                RuleAction::DropLog => vec![
                    format!(
                        "{} -I {} {} {} -j LOG --log-prefix {}",
                        IPTABLES_CMD,
                        chain_name(rule.chain),
                        position,
                        spec,
                        shell::shellquote(DROP_LOG_PREFIX),
                    ),
                    format!(
                        "{} -I {} {} {} -j DROP",
                        IPTABLES_CMD,
                        chain_name(rule.chain),
                        position + 1,
                        spec,
                    ),
                ],
                action => vec![format!(
                    "{}{} -I {} {} {} {}",
                    IPTABLES_CMD,
                    table_flag(rule.chain),
                    chain_name(rule.chain),
                    position,
                    spec,
                    l3_target(action),
                )],
            }
        }
        RuleLayer::L2 => vec![format!(
            "{} -I {} {} {} {}",
            EBTABLES_CMD,
            chain_name(rule.chain),
            position,
            l2_match_spec(rule),
            l2_target(&rule.action),
        )],
    }
}

/// Commands that remove `rule`, mirroring [`build_add_cmds`].
pub fn build_del_cmds(rule: &FilterRule) -> Vec<String> {
    match rule.layer() {
        RuleLayer::L3 => {
            let spec = l3_match_spec(rule);
            match &rule.action {
                RuleAction::DropLog => vec![
                    format!(
                        "{} -D {} {} -j LOG --log-prefix {}",
                        IPTABLES_CMD,
                        chain_name(rule.chain),
                        spec,
                        shell::shellquote(DROP_LOG_PREFIX),
                    ),
                    format!(
                        "{} -D {} {} -j DROP",
                        IPTABLES_CMD,
                        chain_name(rule.chain),
                        spec,
                    ),
                ],
                action => vec![format!(
                    "{}{} -D {} {} {}",
                    IPTABLES_CMD,
                    table_flag(rule.chain),
                    chain_name(rule.chain),
                    spec,
                    l3_target(action),
                )],
            }
        }
        RuleLayer::L2 => vec![format!(
            "{} -D {} {} {}",
            EBTABLES_CMD,
            chain_name(rule.chain),
            l2_match_spec(rule),
            l2_target(&rule.action),
        )],
    }
}

/// Command flushing connection-tracking state for a client lease, so
/// established flows die with the egress grant instead of coasting on
/// conntrack. Exit status is ignored: no matching entries is not a
/// failure.
pub fn build_conntrack_flush_cmd(ip: Ipv4Address) -> String {
    format!("{} -D -s {} 2>/dev/null || true", CONNTRACK_CMD, ip)
}

fn chain_name(chain: Chain) -> &'static str {
    match chain {
        Chain::NatPrerouting => REDIRECT_CHAIN,
        Chain::Forward => FORWARD_CHAIN,
        Chain::BridgeForward => BRIDGE_CHAIN,
    }
}

fn table_flag(chain: Chain) -> &'static str {
    match chain {
        Chain::NatPrerouting => " -t nat",
        Chain::Forward | Chain::BridgeForward => "",
    }
}

fn l3_match_spec(rule: &FilterRule) -> String {
    let mut parts = Vec::new();
    for m in &rule.matches {
        match m {
            Match::SrcMac(mac) => parts.push(format!("-m mac --mac-source {}", mac)),
            Match::SrcIp(ip) => parts.push(format!("-s {}", ip)),
            Match::NotSrcIp(ip) => parts.push(format!("! -s {}", ip)),
            Match::DstIp(ip) => parts.push(format!("-d {}", ip)),
            Match::InInterface(name) => {
                parts.push(format!("-i {}", shell::shellquote(name)));
            }
            Match::OutInterface(name) => {
                parts.push(format!("-o {}", shell::shellquote(name)));
            }
            Match::TcpDstPorts(ports) => parts.push(ports_spec("tcp", ports)),
            Match::UdpDstPorts(ports) => parts.push(ports_spec("udp", ports)),
            // Frame-level predicates never reach the L3 renderer.
            Match::DstMac(_) | Match::BroadcastOrMulticastDst | Match::Arp(_) => {}
        }
    }
    parts.join(" ")
}

fn ports_spec(proto: &str, ports: &[u16]) -> String {
    match ports {
        [single] => format!("-p {} --dport {}", proto, single),
        many => {
            let list: Vec<String> = many.iter().map(|p| p.to_string()).collect();
            format!("-p {} -m multiport --dports {}", proto, list.join(","))
        }
    }
}

fn l3_target(action: &RuleAction) -> String {
    match action {
        RuleAction::Accept => "-j ACCEPT".to_string(),
        RuleAction::Drop => "-j DROP".to_string(),
        RuleAction::RedirectTo { ip, port } => {
            format!("-j DNAT --to-destination {}:{}", ip, port)
        }
        // Rendered as a LOG + DROP pair by the command builders.
        RuleAction::DropLog => "-j DROP".to_string(),
    }
}

fn l2_match_spec(rule: &FilterRule) -> String {
    let mut parts = Vec::new();
    for m in &rule.matches {
        match m {
            Match::SrcMac(mac) => parts.push(format!("-s {}", mac)),
            Match::DstMac(mac) => parts.push(format!("-d {}", mac)),
            Match::BroadcastOrMulticastDst => parts.push("-d Multicast".to_string()),
            Match::Arp(ArpMatch::Any) => parts.push("-p ARP".to_string()),
            Match::Arp(ArpMatch::Sender { ip, mac }) => parts.push(format!(
                "-p ARP --arp-ip-src {} --arp-mac-src {}",
                ip, mac
            )),
            // IP-level predicates never reach the L2 renderer.
            Match::SrcIp(_)
            | Match::NotSrcIp(_)
            | Match::DstIp(_)
            | Match::InInterface(_)
            | Match::OutInterface(_)
            | Match::TcpDstPorts(_)
            | Match::UdpDstPorts(_) => {}
        }
    }
    parts.join(" ")
}

fn l2_target(action: &RuleAction) -> String {
    match action {
        RuleAction::Accept => "-j ACCEPT".to_string(),
        RuleAction::Drop => "-j DROP".to_string(),
        // ebtables logging is a watcher, so log + drop fit in one rule.
        RuleAction::DropLog => format!(
            "--log-level info --log-prefix {} -j DROP",
            shell::shellquote(DROP_LOG_PREFIX.trim_end())
        ),
        RuleAction::RedirectTo { .. } => "-j DROP".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{self, NetworkProfile};
    use crate::rules::RuleKind;
    use portguard_types::MacAddress;

    fn mac() -> MacAddress {
        "aa:bb:cc:dd:ee:01".parse().unwrap()
    }

    fn net() -> NetworkProfile {
        NetworkProfile::default()
    }

    #[test]
    fn test_bootstrap_creates_all_three_chains() {
        let cmds = build_bootstrap_cmds();
        let joined = cmds.join("\n");
        assert!(joined.contains(REDIRECT_CHAIN));
        assert!(joined.contains(FORWARD_CHAIN));
        assert!(joined.contains(BRIDGE_CHAIN));
        assert!(joined.contains("PREROUTING"));
    }

    #[test]
    fn test_portal_redirect_renders_dnat() {
        let rules = synth::compile(RuleKind::PortalRedirect, mac(), None, &net()).unwrap();
        let cmds = build_add_cmds(&rules[0], 1);
        assert_eq!(cmds.len(), 1);
        assert!(cmds[0].contains("-t nat"));
        assert!(cmds[0].contains("-j DNAT --to-destination 192.168.4.1:8080"));
        assert!(cmds[0].contains("--mac-source aa:bb:cc:dd:ee:01"));
        assert!(cmds[0].contains("multiport --dports 80,443"));
    }

    #[test]
    fn test_bind_guard_renders_log_then_drop() {
        let ip = "192.168.4.10".parse().unwrap();
        let rules = synth::compile(RuleKind::BindGuard, mac(), Some(ip), &net()).unwrap();
        let cmds = build_add_cmds(&rules[0], 1);
        assert_eq!(cmds.len(), 2);
        assert!(cmds[0].contains("-j LOG"));
        assert!(cmds[0].contains("! -s 192.168.4.10"));
        assert!(cmds[1].contains("-j DROP"));

        let dels = build_del_cmds(&rules[0]);
        assert_eq!(dels.len(), 2);
        assert!(dels.iter().all(|c| c.contains("-D")));
    }

    #[test]
    fn test_isolation_renders_ebtables() {
        let rules = synth::compile(RuleKind::IsolateL2, mac(), None, &net()).unwrap();
        let cmds = build_add_cmds(&rules[0], 1);
        assert!(cmds[0].starts_with(EBTABLES_CMD));
        assert!(cmds[0].contains("-s aa:bb:cc:dd:ee:01"));
        assert!(cmds[0].contains("-d 02:00:00:00:00:01"));

        let broadcast = build_add_cmds(&rules[1], 2);
        assert!(broadcast[0].contains("-d Multicast"));
    }

    #[test]
    fn test_arp_guard_renders_sender_pair() {
        let ip = "192.168.4.10".parse().unwrap();
        let rules = synth::compile(RuleKind::ArpGuard, mac(), Some(ip), &net()).unwrap();
        let accept = build_add_cmds(&rules[0], 1);
        assert!(accept[0].contains("--arp-ip-src 192.168.4.10"));
        assert!(accept[0].contains("--arp-mac-src aa:bb:cc:dd:ee:01"));

        let drop = build_add_cmds(&rules[1], 2);
        assert!(drop[0].contains("--log-prefix"));
        assert!(drop[0].contains("-j DROP"));
    }

    #[test]
    fn test_delete_mirrors_add_spec() {
        let ip = "192.168.4.10".parse().unwrap();
        let rules = synth::compile(RuleKind::GrantEgress, mac(), Some(ip), &net()).unwrap();
        let add = build_add_cmds(&rules[0], 3);
        let del = build_del_cmds(&rules[0]);
        // Same spec modulo the operation and position.
        let add_spec = add[0].replace("-I PG_FORWARD 3", "-D PG_FORWARD");
        assert_eq!(add_spec, del[0]);
    }

    #[test]
    fn test_conntrack_flush_targets_lease() {
        let cmd = build_conntrack_flush_cmd("192.168.4.10".parse().unwrap());
        assert!(cmd.contains("-D -s 192.168.4.10"));
        assert!(cmd.ends_with("|| true"));
    }
}
