//! The rule ledger: a durable, append-mostly record of every rule the
//! gateway intends to have installed.
//!
//! A row is written *before* the backend is asked to install its rules
//! (write-ahead); the outcome is recorded afterwards. The ledger is the
//! source of truth for what should be installed; the backend's live state
//! is the source of truth for what is installed; reconciliation bridges
//! the two.

use chrono::{DateTime, Utc};
use portguard_enforcer::{FilterRule, RuleHandle, RuleKind, RuleLayer};
use portguard_types::{LedgerId, MacAddress, SessionId};
use serde::{Deserialize, Serialize};

/// Lifecycle of a ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerState {
    /// Intent recorded; the backend has not reported an outcome yet.
    /// Rows stuck here mark the crash window reconciliation resolves.
    Pending,
    /// The backend confirmed installation; `handles` names the rules.
    Applied,
    /// The rules are gone from the backend (or were never installed and
    /// the row is closed).
    Retracted,
    /// The last operation on this row failed; reconciliation retries it.
    Failed,
    /// Retries exhausted; requires operator intervention.
    Dead,
}

impl LedgerState {
    /// True when the row needs no further work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LedgerState::Retracted | LedgerState::Dead)
    }
}

/// The operation a row most recently attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerOp {
    Apply,
    Retract,
}

/// One ledger row: a rule set owed to (or being removed from) the
/// backend on behalf of a session, or of the gateway itself for portal
/// redirects that outlive the session that triggered them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub id: LedgerId,
    /// Owning session; `None` for gateway-owned portal redirects.
    pub session: Option<SessionId>,
    pub mac: MacAddress,
    pub kind: RuleKind,
    pub layer: RuleLayer,
    /// The synthesized rules this row stands for.
    pub rules: Vec<FilterRule>,
    /// Handles returned by the backend, empty until applied.
    pub handles: Vec<RuleHandle>,
    pub state: LedgerState,
    pub last_op: LedgerOp,
    /// Retry attempts consumed by reconciliation.
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retracted_at: Option<DateTime<Utc>>,
}

impl LedgerRecord {
    /// Creates a write-ahead row in `Pending` state.
    pub fn write_ahead(
        session: Option<SessionId>,
        mac: MacAddress,
        kind: RuleKind,
        rules: Vec<FilterRule>,
    ) -> Self {
        Self {
            id: LedgerId::generate(),
            session,
            mac,
            kind,
            layer: kind.layer(),
            rules,
            handles: Vec::new(),
            state: LedgerState::Pending,
            last_op: LedgerOp::Apply,
            attempts: 0,
            diagnostics: None,
            created_at: Utc::now(),
            retracted_at: None,
        }
    }

    /// Records a successful apply.
    pub fn mark_applied(&mut self, handles: Vec<RuleHandle>) {
        self.handles = handles;
        self.state = LedgerState::Applied;
        self.last_op = LedgerOp::Apply;
        self.diagnostics = None;
    }

    /// Records a failed apply. `handles` covers whatever landed before
    /// the failure, so retraction stays possible.
    pub fn mark_apply_failed(&mut self, handles: Vec<RuleHandle>, diagnostics: impl Into<String>) {
        self.handles = handles;
        self.state = LedgerState::Failed;
        self.last_op = LedgerOp::Apply;
        self.diagnostics = Some(diagnostics.into());
    }

    /// Records a completed retraction (or closes a row that never got
    /// anything installed).
    pub fn mark_retracted(&mut self) {
        self.handles.clear();
        self.state = LedgerState::Retracted;
        self.last_op = LedgerOp::Retract;
        self.retracted_at = Some(Utc::now());
    }

    /// Records a retraction that left rules behind.
    pub fn mark_retract_failed(
        &mut self,
        still_present: Vec<RuleHandle>,
        diagnostics: impl Into<String>,
    ) {
        self.handles = still_present;
        self.state = LedgerState::Failed;
        self.last_op = LedgerOp::Retract;
        self.diagnostics = Some(diagnostics.into());
    }

    /// Promotes the row to `Dead` after the retry budget is exhausted.
    pub fn mark_dead(&mut self, diagnostics: impl Into<String>) {
        self.state = LedgerState::Dead;
        self.diagnostics = Some(diagnostics.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row() -> LedgerRecord {
        LedgerRecord::write_ahead(
            Some(SessionId::generate()),
            "aa:bb:cc:dd:ee:01".parse().unwrap(),
            RuleKind::GrantEgress,
            Vec::new(),
        )
    }

    #[test]
    fn test_write_ahead_starts_pending() {
        let row = row();
        assert_eq!(row.state, LedgerState::Pending);
        assert_eq!(row.layer, RuleLayer::L3);
        assert!(row.handles.is_empty());
        assert!(!row.state.is_terminal());
    }

    #[test]
    fn test_apply_then_retract() {
        let mut row = row();
        let handle = RuleHandle::generate();
        row.mark_applied(vec![handle]);
        assert_eq!(row.state, LedgerState::Applied);
        assert_eq!(row.handles.len(), 1);

        row.mark_retracted();
        assert_eq!(row.state, LedgerState::Retracted);
        assert!(row.handles.is_empty());
        assert!(row.retracted_at.is_some());
        assert!(row.state.is_terminal());
    }

    #[test]
    fn test_failed_apply_keeps_partial_handles() {
        let mut row = row();
        let landed = RuleHandle::generate();
        row.mark_apply_failed(vec![landed.clone()], "second rule rejected");
        assert_eq!(row.state, LedgerState::Failed);
        assert_eq!(row.handles, vec![landed]);
        assert_eq!(row.last_op, LedgerOp::Apply);
    }

    #[test]
    fn test_retract_failure_then_dead() {
        let mut row = row();
        let stuck = RuleHandle::generate();
        row.mark_applied(vec![stuck.clone()]);
        row.mark_retract_failed(vec![stuck], "still present");
        assert_eq!(row.state, LedgerState::Failed);
        assert_eq!(row.last_op, LedgerOp::Retract);

        row.mark_dead("retry budget exhausted");
        assert!(row.state.is_terminal());
    }
}
