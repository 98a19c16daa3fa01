//! Host-mutating enforcement backend driving iptables and ebtables.

use super::commands;
use super::{ApplyOutcome, ApplyStatus, Enforcer, RetractOutcome};
use crate::error::{EnforcerError, EnforcerResult};
use crate::rules::{FilterRule, InstalledRule, Match, RuleAction, RuleHandle, RuleKind};
use crate::shell;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Default per-operation deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct NfEntry {
    seq: u64,
    handle: RuleHandle,
    rule: FilterRule,
}

#[derive(Debug, Default)]
struct NfState {
    installed: Vec<NfEntry>,
    seq: u64,
}

impl NfState {
    /// 1-based insert position for `rule` within its chain, honoring rule
    /// priority over arrival order.
    fn position_for(&self, rule: &FilterRule) -> usize {
        let ahead = self
            .installed
            .iter()
            .filter(|e| e.rule.chain == rule.chain && e.rule.priority <= rule.priority)
            .count();
        ahead + 1
    }
}

/// The host-mutating [`Enforcer`] implementation.
///
/// All shell invocations run under one mutex: the host tools are
/// single-writer and concurrent invocations from this process must never
/// interleave. Each operation carries a deadline; a timed-out command is
/// reported through the outcome so handles that already landed stay
/// accounted for.
pub struct NetfilterEnforcer {
    deadline: Duration,
    state: Mutex<NfState>,
}

impl NetfilterEnforcer {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            state: Mutex::new(NfState::default()),
        }
    }

    /// Creates the gateway-owned chains and wires them into the built-in
    /// chains. Must run once before the first apply.
    pub async fn bootstrap(&self) -> EnforcerResult<()> {
        let _guard = self.state.lock().await;
        for cmd in commands::build_bootstrap_cmds() {
            let result = self.run(&cmd).await?;
            if !result.success() {
                return Err(EnforcerError::unavailable(format!(
                    "chain bootstrap failed: {}",
                    result.combined_output()
                )));
            }
        }
        info!("netfilter chains bootstrapped");
        Ok(())
    }

    async fn run(&self, cmd: &str) -> EnforcerResult<shell::ExecResult> {
        match tokio::time::timeout(self.deadline, shell::exec(cmd)).await {
            Ok(result) => result,
            Err(_) => Err(EnforcerError::Timeout(self.deadline)),
        }
    }

    fn lease_of(rule: &FilterRule) -> Option<portguard_types::Ipv4Address> {
        rule.matches.iter().find_map(|m| match m {
            Match::SrcIp(ip) => Some(*ip),
            _ => None,
        })
    }
}

#[async_trait]
impl Enforcer for NetfilterEnforcer {
    async fn apply(&self, rules: &[FilterRule]) -> EnforcerResult<ApplyOutcome> {
        let mut state = self.state.lock().await;
        let mut handles = Vec::with_capacity(rules.len());
        let mut diagnostics = Vec::new();

        for rule in rules {
            let position = state.position_for(rule);
            let mut failed = None;
            for cmd in commands::build_add_cmds(rule, position) {
                match self.run(&cmd).await {
                    Ok(result) if result.success() => {}
                    Ok(result) => {
                        failed = Some(format!(
                            "{} rejected: {}",
                            rule.kind,
                            result.combined_output()
                        ));
                        break;
                    }
                    Err(e) if e.is_transient() => {
                        failed = Some(format!("RULE_BACKEND_TIMEOUT: {}", e));
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }

            match failed {
                None => {
                    let handle = RuleHandle::generate();
                    state.seq += 1;
                    let seq = state.seq;
                    state.installed.push(NfEntry {
                        seq,
                        handle: handle.clone(),
                        rule: rule.clone(),
                    });
                    handles.push(handle);
                }
                Some(diag) => {
                    warn!(kind = %rule.kind, mac = %rule.mac, detail = %diag, "rule apply failed");
                    diagnostics.push(diag);
                    // Stop at the first failure; the caller owns the
                    // retraction of whatever landed.
                    break;
                }
            }
        }

        let status = if diagnostics.is_empty() {
            ApplyStatus::Ok
        } else if handles.is_empty() {
            ApplyStatus::Failed
        } else {
            ApplyStatus::Partial
        };

        Ok(ApplyOutcome {
            handles,
            status,
            diagnostics,
        })
    }

    async fn retract(&self, handles: &[RuleHandle]) -> EnforcerResult<RetractOutcome> {
        let mut state = self.state.lock().await;
        let mut outcome = RetractOutcome::default();

        for handle in handles {
            let Some(index) = state.installed.iter().position(|e| &e.handle == handle) else {
                outcome.missing.push(handle.clone());
                continue;
            };

            let rule = state.installed[index].rule.clone();
            let mut removed = true;
            for cmd in commands::build_del_cmds(&rule) {
                match self.run(&cmd).await {
                    Ok(result) if result.success() => {}
                    Ok(result) => {
                        warn!(
                            kind = %rule.kind,
                            detail = %result.combined_output(),
                            "rule delete failed"
                        );
                        removed = false;
                        break;
                    }
                    Err(e) => {
                        warn!(kind = %rule.kind, error = %e, "rule delete errored");
                        removed = false;
                        break;
                    }
                }
            }

            if removed {
                state.installed.remove(index);
                outcome.retracted.push(handle.clone());

                // An egress grant leaving means the client's flows must
                // die now, not when conntrack ages them out.
                if rule.kind == RuleKind::GrantEgress
                    && rule.action == RuleAction::Accept
                {
                    if let Some(ip) = Self::lease_of(&rule) {
                        let _ = self.run(&commands::build_conntrack_flush_cmd(ip)).await;
                    }
                }
            } else {
                outcome.still_present.push(handle.clone());
            }
        }

        Ok(outcome)
    }

    async fn snapshot(&self) -> EnforcerResult<Vec<InstalledRule>> {
        let state = self.state.lock().await;
        let mut entries: Vec<_> = state.installed.clone();
        entries.sort_by_key(|e| (e.rule.priority, e.seq));
        Ok(entries
            .into_iter()
            .map(|e| InstalledRule {
                handle: e.handle,
                rule: e.rule,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Chain;
    use portguard_types::MacAddress;

    fn rule(priority: u16) -> FilterRule {
        FilterRule {
            kind: RuleKind::GrantEgress,
            mac: "aa:bb:cc:dd:ee:01".parse::<MacAddress>().unwrap(),
            chain: Chain::Forward,
            matches: vec![],
            action: RuleAction::Accept,
            priority,
        }
    }

    #[test]
    fn test_position_honors_priority() {
        let mut state = NfState::default();
        state.seq += 1;
        state.installed.push(NfEntry {
            seq: state.seq,
            handle: RuleHandle::generate(),
            rule: rule(4000),
        });

        // A guard-priority rule inserts ahead of the installed egress rule.
        assert_eq!(state.position_for(&rule(1000)), 1);
        // An equal-or-later priority rule appends after it.
        assert_eq!(state.position_for(&rule(4000)), 2);
    }

    #[test]
    fn test_position_is_per_chain() {
        let mut state = NfState::default();
        state.seq += 1;
        state.installed.push(NfEntry {
            seq: state.seq,
            handle: RuleHandle::generate(),
            rule: rule(1000),
        });

        let mut bridge_rule = rule(4000);
        bridge_rule.chain = Chain::BridgeForward;
        assert_eq!(state.position_for(&bridge_rule), 1);
    }
}
