//! The session lifecycle manager.
//!
//! Grants, revocations, extensions and operator disconnects all run
//! through here. The manager serializes on per-MAC (and per-IP) keys,
//! writes rule intent to the ledger before the backend is asked to act,
//! and records outcomes afterwards, so a crash anywhere in between
//! leaves a state reconciliation can resolve.

use super::types::{RevokeReason, SessionRecord, SessionState};
use crate::audit::{AuditCategory, AuditRecord, AuditSeverity, AuditSink};
use crate::binding::{Anomaly, BindingRegistry, RetireReason, ValidateOutcome};
use crate::config::SessionSettings;
use crate::device::DeviceRegistry;
use crate::error::{AccessError, AccessResult};
use crate::ledger::{LedgerRecord, LedgerState};
use crate::locks::KeyedLocks;
use crate::store::{Store, WriteBatch};
use chrono::{DateTime, Duration, Utc};
use portguard_enforcer::{synth, Enforcer, NetworkProfile, RuleHandle, RuleKind};
use portguard_types::{Ipv4Address, MacAddress, SessionId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// The rule kinds applied for a grant, in declaration order. The backend
/// orders matching by priority; this order only fixes which ledger row
/// fails first when the backend degrades.
const GRANT_KINDS: [RuleKind; 4] = [
    RuleKind::GrantEgress,
    RuleKind::BindGuard,
    RuleKind::IsolateL2,
    RuleKind::ArpGuard,
];

/// How long a grant waits for a conflict loser's MAC key before leaving
/// its termination to reconciliation.
const CONFLICT_LOCK_WAIT_MS: u64 = 500;

/// An authentication result handed to the access plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantRequest {
    pub mac: MacAddress,
    pub ip: Ipv4Address,
    /// Seconds of access; the configured default when absent.
    pub duration_secs: Option<u64>,
    /// How the client authenticated, e.g. `voucher`.
    pub auth_method: String,
    /// Caller-supplied session id, for facades that pre-allocate one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_hint: Option<SessionId>,
}

/// Per-kind summary of what a grant installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSummary {
    pub kind: RuleKind,
    pub rules: usize,
}

/// Result of a successful grant.
#[derive(Debug, Clone)]
pub struct GrantOutcome {
    pub session: SessionRecord,
    /// True when an identical active session was returned instead of a
    /// new one being created.
    pub reused: bool,
    /// Binding conflicts resolved on the way in.
    pub conflicts: Vec<Anomaly>,
    pub rule_summary: Vec<RuleSummary>,
}

/// Result of a revocation.
#[derive(Debug, Clone, Default)]
pub struct RevokeOutcome {
    pub retracted: Vec<RuleHandle>,
    /// Ledger rows whose rules could not be removed; reconciliation
    /// keeps retrying them.
    pub residual_failures: Vec<portguard_types::LedgerId>,
}

/// The session lifecycle manager. See the crate docs for the ownership
/// rules; in short, nothing else mutates sessions or bindings.
pub struct SessionManager {
    store: Arc<dyn Store>,
    enforcer: Arc<dyn Enforcer>,
    bindings: BindingRegistry,
    devices: DeviceRegistry,
    audit: AuditSink,
    net: NetworkProfile,
    settings: SessionSettings,
    locks: KeyedLocks<String>,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        enforcer: Arc<dyn Enforcer>,
        bindings: BindingRegistry,
        devices: DeviceRegistry,
        audit: AuditSink,
        net: NetworkProfile,
        settings: SessionSettings,
    ) -> Self {
        Self {
            store,
            enforcer,
            bindings,
            devices,
            audit,
            net,
            settings,
            locks: KeyedLocks::new(),
        }
    }

    pub fn binding_registry(&self) -> &BindingRegistry {
        &self.bindings
    }

    pub fn device_registry(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn network_profile(&self) -> &NetworkProfile {
        &self.net
    }

    /// Converts an authentication event into an active session with its
    /// enforcement rules installed.
    ///
    /// A grant for a MAC that already holds an identical active session
    /// returns that session; any other unfinished session for the MAC is
    /// revoked first and replaced. On any rule failure the grant is
    /// compensated: every installed rule is retracted, the session
    /// terminates, and the portal redirect stays so the client re-hits
    /// the portal.
    pub async fn grant_access(&self, request: GrantRequest) -> AccessResult<GrantOutcome> {
        request.mac.require_client()?;
        request.ip.require_host()?;
        let duration = self.resolve_duration(request.duration_secs)?;

        let _mac_guard = self.locks.acquire(format!("mac:{}", request.mac)).await;

        let device = self.devices.observe(request.mac).await?;
        if device.blocked {
            self.audit.emit(
                AuditRecord::new(AuditCategory::Auth, AuditSeverity::Warn, "grant_refused")
                    .with_subject(request.mac)
                    .with_error("device blocked"),
            );
            return Err(AccessError::BlockedDevice {
                mac: request.mac,
                reason: device.block_reason.unwrap_or_else(|| "blocked".to_string()),
            });
        }

        if let Some(hint) = &request.session_hint {
            if self.store.session(hint).await?.is_some() {
                return Err(AccessError::DuplicateSession(hint.clone()));
            }
        }

        if let Some(existing) = self.store.unfinished_session_by_mac(request.mac).await? {
            if existing.state == SessionState::Active
                && existing.ip == request.ip
                && existing.auth_method == request.auth_method
            {
                return Ok(GrantOutcome {
                    session: existing,
                    reused: true,
                    conflicts: Vec::new(),
                    rule_summary: Vec::new(),
                });
            }
            info!(
                mac = %request.mac,
                prior = %existing.id,
                "re-grant replaces unfinished session"
            );
            self.revoke_locked(existing, RevokeReason::Superseded).await?;
        }

        let _ip_guard = self.locks.acquire(format!("ip:{}", request.ip)).await;

        let now = Utc::now();
        let expires_at = now + Duration::seconds(duration as i64);
        let session_id = request
            .session_hint
            .clone()
            .unwrap_or_else(SessionId::generate);

        let binding_outcome = self
            .bindings
            .create_binding(request.mac, request.ip, Some(&session_id), expires_at)
            .await?;

        // If the IP takeover displaced another MAC's session, that
        // session has lost its identity and must come down too. Its MAC
        // differs, so its lock is free.
        for conflict in &binding_outcome.conflicts {
            self.terminate_conflict_loser(conflict, request.mac).await?;
        }

        let session = SessionRecord::pending(
            session_id,
            request.mac,
            request.ip,
            request.auth_method.clone(),
            now,
            expires_at,
        );

        // Write-ahead: every rule set this grant owes the backend is
        // ledgered before the backend hears about any of them.
        let mut rows = Vec::with_capacity(GRANT_KINDS.len());
        for kind in GRANT_KINDS {
            let rules = synth::compile(kind, request.mac, Some(request.ip), &self.net)
                .map_err(|e| AccessError::EnforcerRejected(e.to_string()))?;
            rows.push(LedgerRecord::write_ahead(
                Some(session.id.clone()),
                request.mac,
                kind,
                rules,
            ));
        }
        let mut batch = WriteBatch::default().session(session.clone());
        batch.ledger.extend(rows.iter().cloned());
        self.store.commit(batch).await?;

        self.retract_portal_redirect(request.mac).await?;

        let mut summary = Vec::with_capacity(rows.len());
        for mut row in rows {
            match self.apply_row(&mut row).await {
                Ok(()) => summary.push(RuleSummary {
                    kind: row.kind,
                    rules: row.rules.len(),
                }),
                Err(failure) => {
                    self.audit.emit(
                        AuditRecord::new(AuditCategory::Rule, AuditSeverity::Error, "apply_failed")
                            .with_subject(session.id.clone())
                            .with_error(failure.to_string()),
                    );
                    // Compensate: take down whatever landed, terminate the
                    // session, leave the portal redirect armed.
                    let current = self
                        .store
                        .session(&session.id)
                        .await?
                        .unwrap_or_else(|| session.clone());
                    self.revoke_locked(current, RevokeReason::ApplyFailed).await?;
                    return Err(failure);
                }
            }
        }

        let mut active = session;
        active.state = SessionState::Active;
        self.store
            .commit(WriteBatch::default().session(active.clone()))
            .await?;

        self.audit.emit(
            AuditRecord::new(AuditCategory::Session, AuditSeverity::Info, "session_activated")
                .with_subject(active.id.clone())
                .with_details(serde_json::json!({
                    "mac": active.mac.to_string(),
                    "ip": active.ip.to_string(),
                    "auth_method": active.auth_method,
                    "expires_at": active.expires_at,
                })),
        );
        info!(session = %active.id, mac = %active.mac, ip = %active.ip, "access granted");

        Ok(GrantOutcome {
            session: active,
            reused: false,
            conflicts: binding_outcome.conflicts,
            rule_summary: summary,
        })
    }

    /// Revokes a session: retracts its rules, retires its binding,
    /// re-arms the portal redirect and terminates it.
    pub async fn revoke_access(
        &self,
        id: &SessionId,
        reason: RevokeReason,
    ) -> AccessResult<RevokeOutcome> {
        let session = self
            .store
            .session(id)
            .await?
            .ok_or_else(|| AccessError::SessionNotFound(id.clone()))?;
        if session.state == SessionState::Terminated {
            return Err(AccessError::AlreadyTerminated(id.clone()));
        }

        let _guard = self.locks.acquire(format!("mac:{}", session.mac)).await;
        // Re-read under the lock; a concurrent revoke may have finished.
        let session = self
            .store
            .session(id)
            .await?
            .ok_or_else(|| AccessError::SessionNotFound(id.clone()))?;
        if session.state == SessionState::Terminated {
            return Err(AccessError::AlreadyTerminated(id.clone()));
        }

        self.revoke_locked(session, reason).await
    }

    /// Operator-initiated disconnect; identical to a revoke with the
    /// reason tagged as administrative, plus an admin audit record.
    pub async fn force_disconnect(
        &self,
        id: &SessionId,
        operator: &str,
        note: &str,
    ) -> AccessResult<RevokeOutcome> {
        let outcome = self.revoke_access(id, RevokeReason::Admin).await?;
        self.audit.emit(
            AuditRecord::new(AuditCategory::Admin, AuditSeverity::Warn, "force_disconnect")
                .with_subject(id.clone())
                .with_details(serde_json::json!({
                    "operator": operator,
                    "note": note,
                })),
        );
        Ok(outcome)
    }

    /// Pushes a session's expiry out. No enforcement change is needed:
    /// the installed rules do not encode the clock.
    pub async fn extend(
        &self,
        id: &SessionId,
        additional_secs: u64,
    ) -> AccessResult<DateTime<Utc>> {
        if additional_secs == 0 {
            return Err(AccessError::InvalidInput(
                "extension must be positive".to_string(),
            ));
        }

        let session = self
            .store
            .session(id)
            .await?
            .ok_or_else(|| AccessError::SessionNotFound(id.clone()))?;
        let _guard = self.locks.acquire(format!("mac:{}", session.mac)).await;

        let mut session = self
            .store
            .session(id)
            .await?
            .ok_or_else(|| AccessError::SessionNotFound(id.clone()))?;
        match session.state {
            SessionState::Active => {}
            SessionState::Terminated => {
                return Err(AccessError::AlreadyTerminated(id.clone()));
            }
            SessionState::Pending | SessionState::Revoking => {
                return Err(AccessError::InvalidInput(format!(
                    "session {} is not active",
                    id
                )));
            }
        }
        if session.is_expired(Utc::now()) {
            return Err(AccessError::SessionExpired(id.clone()));
        }

        let new_expiry = session.expires_at + Duration::seconds(additional_secs as i64);
        let total = new_expiry - session.started_at;
        if total > Duration::seconds(self.settings.max_duration_secs as i64) {
            return Err(AccessError::DurationCeiling);
        }

        session.expires_at = new_expiry;
        let mut batch = WriteBatch::default().session(session.clone());
        let mut extended_binding = false;
        for mut binding in self.store.bindings_for_session(id).await? {
            if binding.is_active() {
                binding.expires_at = new_expiry;
                batch.bindings.push(binding);
                extended_binding = true;
            }
        }
        if !extended_binding {
            // An active session always owns an active binding; the
            // reconciliation sweep revokes sessions that lose theirs.
            return Err(AccessError::Inconsistent(format!(
                "active session {} has no active binding",
                id
            )));
        }
        self.store.commit(batch).await?;

        self.audit.emit(
            AuditRecord::new(AuditCategory::Session, AuditSeverity::Info, "session_extended")
                .with_subject(id.clone())
                .with_details(serde_json::json!({ "expires_at": new_expiry })),
        );
        Ok(new_expiry)
    }

    /// Checks an observed identity pair; see [`BindingRegistry::validate`].
    pub async fn validate(
        &self,
        mac: MacAddress,
        ip: Ipv4Address,
    ) -> AccessResult<ValidateOutcome> {
        self.bindings.validate(mac, ip).await
    }

    /// The portal-detection predicate the facade binds to.
    pub async fn has_active_session(&self, mac: MacAddress) -> AccessResult<bool> {
        Ok(self
            .store
            .unfinished_session_by_mac(mac)
            .await?
            .map(|s| s.state == SessionState::Active)
            .unwrap_or(false))
    }

    /// Active sessions, optionally narrowed to one MAC.
    pub async fn list_active_sessions(
        &self,
        mac: Option<MacAddress>,
    ) -> AccessResult<Vec<SessionRecord>> {
        let sessions = self.store.sessions_in_state(SessionState::Active).await?;
        Ok(sessions
            .into_iter()
            .filter(|s| mac.map(|m| s.mac == m).unwrap_or(true))
            .collect())
    }

    /// Arms the portal redirect for a MAC outside any session, e.g. at
    /// first sight of an unauthenticated client. Idempotent per MAC.
    pub async fn arm_portal_redirect(&self, mac: MacAddress) -> AccessResult<()> {
        let existing = self
            .store
            .ledger_by_mac_kind(mac, RuleKind::PortalRedirect, LedgerState::Applied)
            .await?;
        if !existing.is_empty() {
            return Ok(());
        }

        let rules = synth::compile(RuleKind::PortalRedirect, mac, None, &self.net)
            .map_err(|e| AccessError::EnforcerRejected(e.to_string()))?;
        let mut row = LedgerRecord::write_ahead(None, mac, RuleKind::PortalRedirect, rules);
        self.store
            .commit(WriteBatch::default().ledger(row.clone()))
            .await?;

        if let Err(e) = self.apply_row(&mut row).await {
            // The row is FAILED in the ledger; reconciliation re-arms it.
            warn!(mac = %mac, error = %e, "portal redirect apply failed");
        }
        Ok(())
    }

    // ---- internals ----

    fn resolve_duration(&self, requested: Option<u64>) -> AccessResult<u64> {
        let duration = requested.unwrap_or(self.settings.default_duration_secs);
        if duration == 0 {
            return Err(AccessError::InvalidInput(
                "duration must be positive".to_string(),
            ));
        }
        if duration > self.settings.max_duration_secs {
            return Err(AccessError::InvalidInput(format!(
                "duration {}s exceeds the ceiling of {}s",
                duration, self.settings.max_duration_secs
            )));
        }
        Ok(duration)
    }

    /// Applies one write-ahead row and records the outcome. The returned
    /// error classifies the failure; the row is already committed as
    /// FAILED when it fires.
    async fn apply_row(&self, row: &mut LedgerRecord) -> AccessResult<()> {
        match self.enforcer.apply(&row.rules).await {
            Ok(outcome) if outcome.status.is_ok() => {
                row.mark_applied(outcome.handles);
                self.store
                    .commit(WriteBatch::default().ledger(row.clone()))
                    .await?;
                Ok(())
            }
            Ok(outcome) => {
                let diagnostics = outcome.diagnostics.join("; ");
                row.mark_apply_failed(outcome.handles, diagnostics.clone());
                self.store
                    .commit(WriteBatch::default().ledger(row.clone()))
                    .await?;
                Err(AccessError::EnforcerFailed(format!(
                    "{}: {}",
                    row.kind, diagnostics
                )))
            }
            Err(e) => {
                row.mark_apply_failed(Vec::new(), e.to_string());
                self.store
                    .commit(WriteBatch::default().ledger(row.clone()))
                    .await?;
                if e.is_transient() {
                    Err(AccessError::EnforcerFailed(format!("{}: {}", row.kind, e)))
                } else {
                    Err(AccessError::EnforcerRejected(format!("{}: {}", row.kind, e)))
                }
            }
        }
    }

    /// Retracts the applied portal redirect rows for a MAC, if any.
    /// Missing handles are fine; a redirect that will not come off is
    /// left FAILED for reconciliation and does not stop the grant.
    async fn retract_portal_redirect(&self, mac: MacAddress) -> AccessResult<()> {
        let rows = self
            .store
            .ledger_by_mac_kind(mac, RuleKind::PortalRedirect, LedgerState::Applied)
            .await?;
        for mut row in rows {
            let (_, residual) = self.retract_row_handles(&mut row).await?;
            if residual {
                warn!(mac = %mac, row = %row.id, "portal redirect retract left rules behind");
            }
        }
        Ok(())
    }

    /// Retracts a row's handles with one retry for stragglers, commits
    /// the outcome, and reports `(retracted, residual)`.
    async fn retract_row_handles(
        &self,
        row: &mut LedgerRecord,
    ) -> AccessResult<(Vec<RuleHandle>, bool)> {
        if row.handles.is_empty() {
            row.mark_retracted();
            self.store
                .commit(WriteBatch::default().ledger(row.clone()))
                .await?;
            return Ok((Vec::new(), false));
        }

        let mut retracted = Vec::new();
        let outcome = match self.enforcer.retract(&row.handles).await {
            Ok(outcome) => outcome,
            Err(e) => {
                row.mark_retract_failed(row.handles.clone(), e.to_string());
                self.store
                    .commit(WriteBatch::default().ledger(row.clone()))
                    .await?;
                return Ok((retracted, true));
            }
        };
        retracted.extend(outcome.retracted.iter().cloned());

        if outcome.is_clean() {
            row.mark_retracted();
            self.store
                .commit(WriteBatch::default().ledger(row.clone()))
                .await?;
            return Ok((retracted, false));
        }

        // One retry for rules the backend reported as still present.
        let retry = match self.enforcer.retract(&outcome.still_present).await {
            Ok(retry) => retry,
            Err(e) => {
                row.mark_retract_failed(outcome.still_present.clone(), e.to_string());
                self.store
                    .commit(WriteBatch::default().ledger(row.clone()))
                    .await?;
                return Ok((retracted, true));
            }
        };
        retracted.extend(retry.retracted.iter().cloned());

        if retry.is_clean() {
            row.mark_retracted();
            self.store
                .commit(WriteBatch::default().ledger(row.clone()))
                .await?;
            Ok((retracted, false))
        } else {
            row.mark_retract_failed(retry.still_present.clone(), "still present after retry");
            self.store
                .commit(WriteBatch::default().ledger(row.clone()))
                .await?;
            self.audit.emit(
                AuditRecord::new(AuditCategory::Rule, AuditSeverity::Error, "retract_stuck")
                    .with_subject(row.id.clone())
                    .with_error(format!(
                        "{} rules still present after retry",
                        retry.still_present.len()
                    )),
            );
            Ok((retracted, true))
        }
    }

    /// The shared revoke path. Callers hold the MAC lock.
    async fn revoke_locked(
        &self,
        mut session: SessionRecord,
        reason: RevokeReason,
    ) -> AccessResult<RevokeOutcome> {
        if session.state == SessionState::Terminated {
            return Ok(RevokeOutcome::default());
        }

        session.state = SessionState::Revoking;
        session.revoke_reason = Some(reason);
        self.store
            .commit(WriteBatch::default().session(session.clone()))
            .await?;

        let mut outcome = RevokeOutcome::default();
        for mut row in self.store.ledger_for_session(&session.id).await? {
            if row.state.is_terminal() {
                continue;
            }
            let (retracted, residual) = self.retract_row_handles(&mut row).await?;
            outcome.retracted.extend(retracted);
            if residual {
                outcome.residual_failures.push(row.id.clone());
            }
        }

        let retire_reason = match reason {
            RevokeReason::Expired => RetireReason::Expired,
            _ => RetireReason::SessionEnded,
        };
        self.bindings
            .retire_by_session(&session.id, retire_reason)
            .await?;

        // The client must re-authenticate before any future traffic
        // leaves the segment. This row belongs to the gateway, not the
        // terminating session.
        self.arm_portal_redirect(session.mac).await?;

        session.state = SessionState::Terminated;
        session.terminated_at = Some(Utc::now());
        self.store
            .commit(WriteBatch::default().session(session.clone()))
            .await?;

        self.audit.emit(
            AuditRecord::new(AuditCategory::Session, AuditSeverity::Info, "session_terminated")
                .with_subject(session.id.clone())
                .with_details(serde_json::json!({
                    "mac": session.mac.to_string(),
                    "reason": reason.to_string(),
                    "residual_failures": outcome.residual_failures.len(),
                })),
        );
        info!(session = %session.id, %reason, "session terminated");

        Ok(outcome)
    }

    /// Terminates the session on the losing side of an IP takeover. The
    /// loser's MAC differs from the grant in progress, so its lock is
    /// taken here — with a bound, because the loser may itself be mid
    /// grant and waiting on a key we hold. On timeout the loser is left
    /// to the reconciliation sweep, which revokes any active session
    /// whose binding is gone.
    async fn terminate_conflict_loser(
        &self,
        conflict: &Anomaly,
        winner: MacAddress,
    ) -> AccessResult<()> {
        use crate::binding::AnomalyKind;
        if conflict.kind != AnomalyKind::IpConflict {
            return Ok(());
        }
        for subject in &conflict.subjects {
            let Ok(mac) = subject.parse::<MacAddress>() else {
                continue;
            };
            if mac == winner {
                continue;
            }
            let Some(loser) = self.store.unfinished_session_by_mac(mac).await? else {
                continue;
            };
            let guard = tokio::time::timeout(
                std::time::Duration::from_millis(CONFLICT_LOCK_WAIT_MS),
                self.locks.acquire(format!("mac:{}", mac)),
            )
            .await;
            let Ok(_guard) = guard else {
                warn!(
                    loser = %loser.id,
                    mac = %mac,
                    "conflict loser busy; deferring termination to reconciliation"
                );
                continue;
            };
            let Some(loser) = self.store.session(&loser.id).await? else {
                continue;
            };
            if loser.state != SessionState::Terminated {
                warn!(loser = %loser.id, mac = %mac, "terminating session displaced by IP takeover");
                self.revoke_locked(loser, RevokeReason::Conflict).await?;
            }
        }
        Ok(())
    }

    /// Internal entry point for the reconciliation sweep: revoke without
    /// the not-found/terminated errors of the public path.
    pub(crate) async fn revoke_if_unfinished(
        &self,
        id: &SessionId,
        reason: RevokeReason,
    ) -> AccessResult<bool> {
        let Some(session) = self.store.session(id).await? else {
            return Ok(false);
        };
        if session.state == SessionState::Terminated {
            return Ok(false);
        }
        let _guard = self.locks.acquire(format!("mac:{}", session.mac)).await;
        let Some(session) = self.store.session(id).await? else {
            return Ok(false);
        };
        if session.state == SessionState::Terminated {
            return Ok(false);
        }
        self.revoke_locked(session, reason).await?;
        Ok(true)
    }
}
