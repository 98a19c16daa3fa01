//! The enforcement capability and its backends.
//!
//! [`Enforcer`] is the single seam between the access-control plane and
//! the host's packet filters. Two implementations exist: the
//! [`SimulatorEnforcer`] records intent in memory and is the default for
//! tests and simulation deployments; the [`NetfilterEnforcer`] drives
//! iptables/ebtables on the host. Which one a caller holds is decided at
//! process construction and never inspected afterwards.

pub mod commands;
mod netfilter;
mod simulator;

use crate::error::EnforcerResult;
use crate::rules::{FilterRule, InstalledRule, RuleHandle};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use netfilter::{NetfilterEnforcer, DEFAULT_DEADLINE};
pub use simulator::{Fault, FaultMode, SimulatorEnforcer, SimulatorStats};

/// Overall result of an apply call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyStatus {
    /// Every rule in the set landed.
    Ok,
    /// Some rules landed; the returned handles cover exactly those, and
    /// the caller owns their retraction.
    Partial,
    /// No rule landed.
    Failed,
}

impl ApplyStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ApplyStatus::Ok)
    }
}

/// Outcome of installing one rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    /// Handles for the rules that were actually installed.
    pub handles: Vec<RuleHandle>,
    pub status: ApplyStatus,
    /// Backend-specific failure detail, one entry per failed rule.
    pub diagnostics: Vec<String>,
}

impl ApplyOutcome {
    pub(crate) fn ok(handles: Vec<RuleHandle>) -> Self {
        Self {
            handles,
            status: ApplyStatus::Ok,
            diagnostics: Vec::new(),
        }
    }
}

/// Outcome of retracting a list of handles.
///
/// Retraction is idempotent: handles the backend no longer knows are
/// reported in `missing` and are not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetractOutcome {
    pub retracted: Vec<RuleHandle>,
    /// Handles the backend knows but failed to remove. The caller retries
    /// or hands them to reconciliation.
    pub still_present: Vec<RuleHandle>,
    pub missing: Vec<RuleHandle>,
}

impl RetractOutcome {
    /// True when nothing the backend knows about is left installed.
    pub fn is_clean(&self) -> bool {
        self.still_present.is_empty()
    }
}

/// Capability for installing and removing packet-filter rules.
///
/// Implementations keep no state across calls beyond the handles of the
/// rules they currently have installed; the durable record of intent is
/// the caller's ledger. Backends are internally serialized: concurrent
/// calls from the same process never interleave at the host-tool level.
#[async_trait]
pub trait Enforcer: Send + Sync {
    /// Installs a synthesized rule set and returns one handle per rule
    /// that landed. Rules are positioned by their declared priority, so
    /// guard rules match before egress permits regardless of call order.
    async fn apply(&self, rules: &[FilterRule]) -> EnforcerResult<ApplyOutcome>;

    /// Removes previously installed rules. Unknown handles are reported
    /// as missing, not failed.
    async fn retract(&self, handles: &[RuleHandle]) -> EnforcerResult<RetractOutcome>;

    /// Reports the rules currently installed, ordered by evaluation
    /// position. Consistent within one call; used by reconciliation.
    async fn snapshot(&self) -> EnforcerResult<Vec<InstalledRule>>;
}
