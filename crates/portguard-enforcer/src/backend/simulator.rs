//! In-memory enforcement backend.
//!
//! The simulator records applied rules without touching the host. All
//! operations succeed unless a fault has been queued, which lets tests
//! exercise partial failures, timeouts and sticky retractions exactly
//! where they would occur against a real backend.

use super::{ApplyOutcome, ApplyStatus, Enforcer, RetractOutcome};
use crate::error::{EnforcerError, EnforcerResult};
use crate::rules::{FilterRule, InstalledRule, RuleHandle, RuleKind};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// How a queued fault manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// The apply installs nothing and reports FAILED.
    FailApply,
    /// The apply installs only the first rule and reports PARTIAL.
    PartialApply,
    /// The operation errors as a backend timeout.
    Timeout,
    /// The next retract reports every requested handle as still present
    /// without removing anything.
    StickyRetract,
}

/// A one-shot fault. `kind: None` arms the fault for the next matching
/// operation regardless of rule kind.
#[derive(Debug, Clone, Copy)]
pub struct Fault {
    pub kind: Option<RuleKind>,
    pub mode: FaultMode,
}

/// Mutation counters, used by tests and the reconciliation fixed-point
/// check. `snapshot` is a read and is deliberately not counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatorStats {
    pub apply_calls: u64,
    pub retract_calls: u64,
    pub rules_installed: u64,
    pub rules_retracted: u64,
}

#[derive(Debug, Default)]
struct SimState {
    installed: Vec<(u64, InstalledRule)>,
    seq: u64,
    faults: VecDeque<Fault>,
}

/// The in-memory [`Enforcer`] implementation.
#[derive(Debug, Default)]
pub struct SimulatorEnforcer {
    state: Mutex<SimState>,
    apply_calls: AtomicU64,
    retract_calls: AtomicU64,
    rules_installed: AtomicU64,
    rules_retracted: AtomicU64,
}

impl SimulatorEnforcer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a one-shot fault for a later apply/retract call.
    pub fn push_fault(&self, fault: Fault) {
        self.state
            .lock()
            .expect("simulator state poisoned")
            .faults
            .push_back(fault);
    }

    /// Returns the mutation counters.
    pub fn stats(&self) -> SimulatorStats {
        SimulatorStats {
            apply_calls: self.apply_calls.load(Ordering::Relaxed),
            retract_calls: self.retract_calls.load(Ordering::Relaxed),
            rules_installed: self.rules_installed.load(Ordering::Relaxed),
            rules_retracted: self.rules_retracted.load(Ordering::Relaxed),
        }
    }

    fn take_fault(state: &mut SimState, kind: Option<RuleKind>, retract: bool) -> Option<Fault> {
        let front = state.faults.front()?;
        let applies = match front.mode {
            FaultMode::StickyRetract => retract,
            _ => !retract && (front.kind.is_none() || front.kind == kind),
        };
        if applies {
            state.faults.pop_front()
        } else {
            None
        }
    }
}

#[async_trait]
impl Enforcer for SimulatorEnforcer {
    async fn apply(&self, rules: &[FilterRule]) -> EnforcerResult<ApplyOutcome> {
        self.apply_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().expect("simulator state poisoned");

        let kind = rules.first().map(|r| r.kind);
        if let Some(fault) = Self::take_fault(&mut state, kind, false) {
            match fault.mode {
                FaultMode::Timeout => {
                    return Err(EnforcerError::Timeout(Duration::from_secs(5)));
                }
                FaultMode::FailApply => {
                    return Ok(ApplyOutcome {
                        handles: Vec::new(),
                        status: ApplyStatus::Failed,
                        diagnostics: vec![format!(
                            "simulated backend failure for {}",
                            kind.map(|k| k.to_string()).unwrap_or_default()
                        )],
                    });
                }
                FaultMode::PartialApply => {
                    let mut handles = Vec::new();
                    if let Some(rule) = rules.first() {
                        let handle = RuleHandle::generate();
                        state.seq += 1;
                        let seq = state.seq;
                        state.installed.push((
                            seq,
                            InstalledRule {
                                handle: handle.clone(),
                                rule: rule.clone(),
                            },
                        ));
                        self.rules_installed.fetch_add(1, Ordering::Relaxed);
                        handles.push(handle);
                    }
                    return Ok(ApplyOutcome {
                        handles,
                        status: ApplyStatus::Partial,
                        diagnostics: vec!["simulated partial failure".to_string()],
                    });
                }
                FaultMode::StickyRetract => unreachable!("retract fault matched on apply"),
            }
        }

        let mut handles = Vec::with_capacity(rules.len());
        for rule in rules {
            let handle = RuleHandle::generate();
            state.seq += 1;
            let seq = state.seq;
            state.installed.push((
                seq,
                InstalledRule {
                    handle: handle.clone(),
                    rule: rule.clone(),
                },
            ));
            handles.push(handle);
        }
        self.rules_installed
            .fetch_add(rules.len() as u64, Ordering::Relaxed);
        debug!(count = rules.len(), "simulator installed rules");
        Ok(ApplyOutcome::ok(handles))
    }

    async fn retract(&self, handles: &[RuleHandle]) -> EnforcerResult<RetractOutcome> {
        self.retract_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().expect("simulator state poisoned");

        if let Some(fault) = Self::take_fault(&mut state, None, true) {
            debug_assert_eq!(fault.mode, FaultMode::StickyRetract);
            return Ok(RetractOutcome {
                retracted: Vec::new(),
                still_present: handles
                    .iter()
                    .filter(|h| state.installed.iter().any(|(_, r)| &r.handle == *h))
                    .cloned()
                    .collect(),
                missing: handles
                    .iter()
                    .filter(|h| !state.installed.iter().any(|(_, r)| &r.handle == *h))
                    .cloned()
                    .collect(),
            });
        }

        let mut outcome = RetractOutcome::default();
        for handle in handles {
            let before = state.installed.len();
            state.installed.retain(|(_, r)| &r.handle != handle);
            if state.installed.len() < before {
                outcome.retracted.push(handle.clone());
            } else {
                outcome.missing.push(handle.clone());
            }
        }
        self.rules_retracted
            .fetch_add(outcome.retracted.len() as u64, Ordering::Relaxed);
        Ok(outcome)
    }

    async fn snapshot(&self) -> EnforcerResult<Vec<InstalledRule>> {
        let state = self.state.lock().expect("simulator state poisoned");
        let mut rules: Vec<_> = state.installed.clone();
        rules.sort_by_key(|(seq, r)| (r.rule.priority, *seq));
        Ok(rules.into_iter().map(|(_, r)| r).collect())
    }
}
