//! Reconciliation and cleanup.
//!
//! One owned background task closes the gap between what the ledger says
//! should be installed and what the backend actually has, expires
//! sessions whose clock ran out, and sweeps the binding table for
//! anomalies. It is the only component allowed to retry enforcement
//! operations on its own initiative.

use crate::audit::{AuditCategory, AuditRecord, AuditSeverity, AuditSink};
use crate::binding::{BindingRegistry, RetireReason, ValidateOutcome};
use crate::config::ReconciliationSettings;
use crate::error::AccessResult;
use crate::ledger::{LedgerOp, LedgerRecord, LedgerState};
use crate::session::{RevokeReason, SessionManager, SessionState};
use crate::store::{Store, WriteBatch};
use chrono::{Duration, Utc};
use portguard_enforcer::{Enforcer, RuleHandle, RuleKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What one cycle did. All zeros on a quiescent system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub expired_sessions: usize,
    pub conflict_repairs: usize,
    pub retired_bindings: usize,
    pub rows_retried: usize,
    pub rows_dead: usize,
    pub orphans_retracted: usize,
    pub ghosts_found: usize,
    pub anomalies: usize,
}

impl CycleReport {
    /// True when the cycle changed nothing.
    pub fn is_quiescent(&self) -> bool {
        *self == CycleReport::default()
    }
}

/// The reconciliation worker.
pub struct Reconciler {
    manager: Arc<SessionManager>,
    store: Arc<dyn Store>,
    enforcer: Arc<dyn Enforcer>,
    bindings: BindingRegistry,
    audit: AuditSink,
    settings: ReconciliationSettings,
    /// Guards against overlapping cycles; a cycle that finds this held
    /// skips instead of queueing.
    cycle_gate: tokio::sync::Mutex<()>,
}

impl Reconciler {
    pub fn new(
        manager: Arc<SessionManager>,
        store: Arc<dyn Store>,
        enforcer: Arc<dyn Enforcer>,
        bindings: BindingRegistry,
        audit: AuditSink,
        settings: ReconciliationSettings,
    ) -> Self {
        Self {
            manager,
            store,
            enforcer,
            bindings,
            audit,
            settings,
            cycle_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Spawns the periodic loop. Flipping the watch channel to `true`
    /// cancels it; an in-flight cycle finishes first.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let cadence = std::time::Duration::from_secs(self.settings.cadence_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.run_cycle().await {
                            Ok(report) if report.is_quiescent() => {
                                debug!("reconciliation cycle: quiescent");
                            }
                            Ok(report) => {
                                info!(?report, "reconciliation cycle complete");
                            }
                            Err(e) => {
                                error!(error = %e, "reconciliation cycle failed");
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("reconciliation loop stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Runs one cycle. Re-entrant-safe: a second caller returns an empty
    /// report instead of running concurrently.
    pub async fn run_cycle(&self) -> AccessResult<CycleReport> {
        let Ok(_gate) = self.cycle_gate.try_lock() else {
            debug!("reconciliation cycle already running; skipping");
            return Ok(CycleReport::default());
        };

        let mut report = CycleReport::default();
        let now = Utc::now();

        self.expire_sessions(&mut report, now).await?;
        self.repair_bindingless_sessions(&mut report).await?;
        self.retire_stale_bindings(&mut report, now).await?;
        self.resolve_stuck_pending(&mut report, now).await?;
        self.retry_failed_rows(&mut report).await?;
        if self.settings.drift_check {
            self.check_drift(&mut report).await?;
        }
        report.anomalies = self.bindings.scan_anomalies(now).await?.len();

        Ok(report)
    }

    /// Sweep 1: sessions whose expiry (plus grace) has passed.
    async fn expire_sessions(&self, report: &mut CycleReport, now: chrono::DateTime<Utc>) -> AccessResult<()> {
        let grace = Duration::seconds(self.settings.grace_secs as i64);
        for session in self.store.sessions_in_state(SessionState::Active).await? {
            if session.expires_at + grace < now {
                info!(session = %session.id, mac = %session.mac, "session expired");
                if self
                    .manager
                    .revoke_if_unfinished(&session.id, RevokeReason::Expired)
                    .await?
                {
                    report.expired_sessions += 1;
                    self.audit.emit(
                        AuditRecord::new(
                            AuditCategory::Session,
                            AuditSeverity::Info,
                            "session_expired",
                        )
                        .with_subject(session.id.clone()),
                    );
                }
            }
        }
        Ok(())
    }

    /// Sweep 2: active sessions whose binding no longer backs them
    /// (e.g. a conflict loser whose termination was deferred). Every
    /// active session must validate against its own identity.
    async fn repair_bindingless_sessions(&self, report: &mut CycleReport) -> AccessResult<()> {
        for session in self.store.sessions_in_state(SessionState::Active).await? {
            let outcome = self.bindings.validate(session.mac, session.ip).await?;
            // An expired binding is the expiry sweep's business (it honors
            // the grace period); only a missing or contradicted binding is
            // repaired here.
            if matches!(
                outcome,
                ValidateOutcome::NoBinding | ValidateOutcome::IpMismatch { .. }
            ) {
                warn!(
                    session = %session.id,
                    mac = %session.mac,
                    ?outcome,
                    "active session lost its binding; revoking"
                );
                if self
                    .manager
                    .revoke_if_unfinished(&session.id, RevokeReason::Conflict)
                    .await?
                {
                    report.conflict_repairs += 1;
                    let anomaly = crate::binding::Anomaly::new(
                        crate::binding::AnomalyKind::BindingMismatch,
                        vec![session.mac.to_string(), session.ip.to_string()],
                        format!("active session {} contradicted the binding table", session.id),
                    );
                    self.audit.emit(
                        AuditRecord::new(
                            AuditCategory::Anomaly,
                            AuditSeverity::Warn,
                            anomaly.kind.to_string(),
                        )
                        .with_subject(anomaly.subjects.join(","))
                        .with_details(serde_json::json!({ "detail": anomaly.detail })),
                    );
                }
            }
        }
        Ok(())
    }

    /// Sweep 3: active bindings past expiry whose owning session is gone.
    async fn retire_stale_bindings(&self, report: &mut CycleReport, now: chrono::DateTime<Utc>) -> AccessResult<()> {
        for binding in self.store.bindings(false).await? {
            if !binding.is_expired(now) {
                continue;
            }
            let owner_active = match &binding.session {
                Some(id) => self
                    .store
                    .session(id)
                    .await?
                    .map(|s| s.state != SessionState::Terminated)
                    .unwrap_or(false),
                None => false,
            };
            if !owner_active {
                self.bindings
                    .retire_by_mac(binding.mac, RetireReason::Expired)
                    .await?;
                report.retired_bindings += 1;
            }
        }
        Ok(())
    }

    /// Sweep 4: rows stuck in PENDING mark the crash window between
    /// write-ahead and outcome recording. Old ones are failed, and a
    /// session still waiting on them is terminated so the client can
    /// start over.
    async fn resolve_stuck_pending(&self, report: &mut CycleReport, now: chrono::DateTime<Utc>) -> AccessResult<()> {
        let grace = Duration::seconds(self.settings.pending_grace_secs as i64);
        for stale in self.store.ledger_in_state(LedgerState::Pending).await? {
            // Re-read: revoking one row's session below closes that
            // session's other rows, and this sweep must not resurrect
            // them from its own snapshot.
            let Some(mut row) = self.store.ledger_entry(&stale.id).await? else {
                continue;
            };
            if row.state != LedgerState::Pending || row.created_at + grace >= now {
                continue;
            }
            warn!(row = %row.id, kind = %row.kind, "pending ledger row outlived its grace; failing");
            row.mark_apply_failed(Vec::new(), "no outcome recorded before restart");
            self.store
                .commit(WriteBatch::default().ledger(row.clone()))
                .await?;
            report.rows_retried += 1;

            if let Some(session_id) = &row.session {
                if let Some(session) = self.store.session(session_id).await? {
                    if session.state == SessionState::Pending {
                        self.manager
                            .revoke_if_unfinished(session_id, RevokeReason::ApplyFailed)
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Sweep 5: FAILED rows get a bounded number of retries, then an
    /// operational alert and a promotion to DEAD.
    async fn retry_failed_rows(&self, report: &mut CycleReport) -> AccessResult<()> {
        for mut row in self.store.ledger_in_state(LedgerState::Failed).await? {
            if row.attempts >= self.settings.retry_budget {
                row.mark_dead(format!(
                    "retry budget of {} exhausted",
                    self.settings.retry_budget
                ));
                self.store
                    .commit(WriteBatch::default().ledger(row.clone()))
                    .await?;
                report.rows_dead += 1;
                self.audit.emit(
                    AuditRecord::new(AuditCategory::System, AuditSeverity::Critical, "ledger_row_dead")
                        .with_subject(row.id.clone())
                        .with_error("rules cannot be reconciled; operator intervention required"),
                );
                continue;
            }

            row.attempts += 1;
            report.rows_retried += 1;
            let attempted = self.retry_row(&mut row).await?;
            self.store
                .commit(WriteBatch::default().ledger(row.clone()))
                .await?;
            if !attempted {
                report.rows_retried -= 1;
            }
        }
        Ok(())
    }

    /// Retries one failed row in place. Returns false when the row
    /// needed no backend work and was just closed.
    async fn retry_row(&self, row: &mut LedgerRecord) -> AccessResult<bool> {
        // Leftover rules always come off, whatever the row was doing.
        if !row.handles.is_empty() {
            match self.enforcer.retract(&row.handles).await {
                Ok(outcome) if outcome.is_clean() => row.mark_retracted(),
                Ok(outcome) => {
                    row.mark_retract_failed(outcome.still_present, "still present on retry")
                }
                Err(e) => {
                    let handles = row.handles.clone();
                    row.mark_retract_failed(handles, e.to_string());
                }
            }
            return Ok(true);
        }

        // A gateway-owned portal redirect that never landed is re-applied:
        // without it an unauthenticated client has no path to the portal.
        if row.kind == RuleKind::PortalRedirect && row.session.is_none()
            && row.last_op == LedgerOp::Apply
        {
            match self.enforcer.apply(&row.rules).await {
                Ok(outcome) if outcome.status.is_ok() => row.mark_applied(outcome.handles),
                Ok(outcome) => {
                    row.mark_apply_failed(outcome.handles, outcome.diagnostics.join("; "))
                }
                Err(e) => row.mark_apply_failed(Vec::new(), e.to_string()),
            }
            return Ok(true);
        }

        // Nothing installed and nothing owed: close the row.
        row.mark_retracted();
        Ok(false)
    }

    /// Sweep 6: compare the backend snapshot against the ledger. Orphans
    /// (installed but not accounted for) are retracted; ghosts (accounted
    /// for but not installed) are re-applied for live sessions and failed
    /// otherwise.
    async fn check_drift(&self, report: &mut CycleReport) -> AccessResult<()> {
        let snapshot = self.enforcer.snapshot().await.map_err(|e| {
            crate::error::AccessError::EnforcerFailed(format!("snapshot: {}", e))
        })?;
        let installed: HashSet<&RuleHandle> = snapshot.iter().map(|r| &r.handle).collect();

        let mut known: HashSet<RuleHandle> = HashSet::new();
        let mut accounted_rows: Vec<LedgerRecord> = Vec::new();
        for state in [LedgerState::Applied, LedgerState::Failed] {
            for row in self.store.ledger_in_state(state).await? {
                known.extend(row.handles.iter().cloned());
                if state == LedgerState::Applied {
                    accounted_rows.push(row);
                }
            }
        }

        // Orphans: the backend has them, the ledger does not.
        let orphans: Vec<RuleHandle> = snapshot
            .iter()
            .filter(|r| !known.contains(&r.handle))
            .map(|r| r.handle.clone())
            .collect();
        if !orphans.is_empty() {
            warn!(count = orphans.len(), "retracting orphan rules");
            let outcome = self.enforcer.retract(&orphans).await.map_err(|e| {
                crate::error::AccessError::EnforcerFailed(format!("orphan retract: {}", e))
            })?;
            report.orphans_retracted = outcome.retracted.len();
        }

        // Ghosts: the ledger says applied, the backend disagrees.
        for mut row in accounted_rows {
            let missing = row.handles.iter().any(|h| !installed.contains(h));
            if !missing {
                continue;
            }
            report.ghosts_found += 1;

            let owner_active = match &row.session {
                Some(id) => self
                    .store
                    .session(id)
                    .await?
                    .map(|s| s.state == SessionState::Active)
                    .unwrap_or(false),
                // Gateway-owned redirects are always wanted.
                None => true,
            };

            if owner_active {
                warn!(row = %row.id, kind = %row.kind, "re-applying ghost rules");
                match self.enforcer.apply(&row.rules).await {
                    Ok(outcome) if outcome.status.is_ok() => row.mark_applied(outcome.handles),
                    Ok(outcome) => {
                        row.mark_apply_failed(outcome.handles, outcome.diagnostics.join("; "))
                    }
                    Err(e) => row.mark_apply_failed(Vec::new(), e.to_string()),
                }
            } else {
                row.mark_apply_failed(Vec::new(), "rules vanished from backend");
            }
            self.store
                .commit(WriteBatch::default().ledger(row))
                .await?;
        }

        Ok(())
    }
}
