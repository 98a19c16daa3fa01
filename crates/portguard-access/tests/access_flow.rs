//! End-to-end tests for the access-control plane against the simulator
//! backend and the in-memory store.

use portguard_access::config::{ReconciliationSettings, SessionSettings};
use portguard_access::{
    AuditCategory, AuditRecord, AuditSeverity, AuditSink, BindingRegistry, ControlApi,
    DeviceRegistry, EnforcerMode, ErrorCategory, GrantRequest, LedgerState, MemoryStore, Operator,
    Reconciler, RevokeReason, SessionManager, SessionState, Store, ValidateOutcome, WriteBatch,
};
use portguard_enforcer::{
    synth, Enforcer, Fault, FaultMode, FilterRule, NetworkProfile, RuleKind, SimulatorEnforcer,
};
use portguard_types::{Ipv4Address, MacAddress, SessionId};
use std::sync::Arc;
use std::time::Duration;

struct TestPlane {
    store: Arc<MemoryStore>,
    enforcer: Arc<SimulatorEnforcer>,
    manager: Arc<SessionManager>,
    reconciler: Arc<Reconciler>,
    audit: AuditSink,
    api: ControlApi,
    _pump: portguard_access::AuditPump,
}

fn plane() -> TestPlane {
    let store = Arc::new(MemoryStore::new());
    let enforcer = Arc::new(SimulatorEnforcer::new());
    let (audit, pump) = AuditSink::new(256);

    let bindings = BindingRegistry::new(store.clone() as Arc<dyn Store>, audit.clone(), 6);
    let devices = DeviceRegistry::new(store.clone() as Arc<dyn Store>, audit.clone());
    let manager = Arc::new(SessionManager::new(
        store.clone() as Arc<dyn Store>,
        enforcer.clone() as Arc<dyn Enforcer>,
        bindings.clone(),
        devices.clone(),
        audit.clone(),
        NetworkProfile::default(),
        SessionSettings::default(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        manager.clone(),
        store.clone() as Arc<dyn Store>,
        enforcer.clone() as Arc<dyn Enforcer>,
        bindings.clone(),
        audit.clone(),
        ReconciliationSettings {
            cadence_secs: 60,
            grace_secs: 0,
            retry_budget: 3,
            pending_grace_secs: 0,
            drift_check: true,
        },
    ));
    let api = ControlApi::new(
        manager.clone(),
        bindings,
        devices,
        reconciler.clone(),
        enforcer.clone() as Arc<dyn Enforcer>,
        EnforcerMode::Simulation,
    );

    TestPlane {
        store,
        enforcer,
        manager,
        reconciler,
        audit,
        api,
        _pump: pump,
    }
}

fn mac(n: u8) -> MacAddress {
    MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, n])
}

fn ip(n: u8) -> Ipv4Address {
    Ipv4Address::new(192, 168, 4, n)
}

fn request(mac: MacAddress, ip: Ipv4Address, duration_secs: u64) -> GrantRequest {
    GrantRequest {
        mac,
        ip,
        duration_secs: Some(duration_secs),
        auth_method: "voucher".to_string(),
        session_hint: None,
    }
}

fn operator() -> Operator {
    Operator::new("op-tests")
}

async fn snapshot_rules(enforcer: &SimulatorEnforcer) -> Vec<FilterRule> {
    enforcer
        .snapshot()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.rule)
        .collect()
}

/// Waits for an audit event matching the predicate.
async fn expect_event(
    rx: &mut tokio::sync::broadcast::Receiver<AuditRecord>,
    pred: impl Fn(&AuditRecord) -> bool,
) -> AuditRecord {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let record = rx.recv().await.expect("audit stream closed");
            if pred(&record) {
                return record;
            }
        }
    })
    .await
    .expect("expected audit event never arrived")
}

// ---- Scenario 1: clean grant and revoke ----

#[tokio::test]
async fn clean_grant_then_revoke_restores_portal_state() {
    let plane = plane();
    let client = mac(1);

    // An unauthenticated client starts behind the portal redirect.
    plane.manager.arm_portal_redirect(client).await.unwrap();
    let pre_grant = snapshot_rules(&plane.enforcer).await;
    assert!(pre_grant.iter().all(|r| r.kind == RuleKind::PortalRedirect));

    let outcome = plane
        .api
        .grant(&operator(), request(client, ip(10), 3600))
        .await
        .unwrap();
    let session = outcome.session.clone();
    assert_eq!(session.state, SessionState::Active);
    assert!(!outcome.reused);
    assert!(outcome.conflicts.is_empty());
    assert_eq!(outcome.rule_summary.len(), 4);

    let lifetime = session.expires_at - session.started_at;
    assert_eq!(lifetime.num_seconds(), 3600);

    // Four applied rows for the session, one retracted redirect row.
    let rows = plane.store.ledger_for_session(&session.id).await.unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| r.state == LedgerState::Applied));
    let kinds: Vec<RuleKind> = rows.iter().map(|r| r.kind).collect();
    for kind in [
        RuleKind::GrantEgress,
        RuleKind::BindGuard,
        RuleKind::IsolateL2,
        RuleKind::ArpGuard,
    ] {
        assert!(kinds.contains(&kind));
    }
    let retracted_redirects = plane
        .store
        .ledger_by_mac_kind(client, RuleKind::PortalRedirect, LedgerState::Retracted)
        .await
        .unwrap();
    assert_eq!(retracted_redirects.len(), 1);

    assert_eq!(
        plane.api.validate(client, ip(10)).await.unwrap(),
        ValidateOutcome::Ok
    );
    assert!(plane.api.has_active_session(client).await.unwrap());

    // Revoke: all rules come off and the redirect is re-armed.
    let revoke = plane
        .api
        .revoke(&operator(), &session.id, RevokeReason::UserLogout)
        .await
        .unwrap();
    assert!(revoke.residual_failures.is_empty());

    let rows = plane.store.ledger_for_session(&session.id).await.unwrap();
    assert!(rows.iter().all(|r| r.state == LedgerState::Retracted));

    let armed = plane
        .store
        .ledger_by_mac_kind(client, RuleKind::PortalRedirect, LedgerState::Applied)
        .await
        .unwrap();
    assert_eq!(armed.len(), 1);

    assert_eq!(
        plane.api.validate(client, ip(10)).await.unwrap(),
        ValidateOutcome::NoBinding
    );
    assert!(!plane.api.has_active_session(client).await.unwrap());

    // P5: the backend holds exactly the pre-grant redirect again.
    let post_revoke = snapshot_rules(&plane.enforcer).await;
    assert_eq!(post_revoke, pre_grant);
}

// ---- Scenario 2: IP conflict on grant ----

#[tokio::test]
async fn ip_takeover_terminates_the_displaced_session() {
    let plane = plane();

    let first = plane
        .manager
        .grant_access(request(mac(1), ip(10), 3600))
        .await
        .unwrap()
        .session;

    let outcome = plane
        .manager
        .grant_access(request(mac(2), ip(10), 3600))
        .await
        .unwrap();

    // The takeover is reported with both subjects.
    assert_eq!(outcome.conflicts.len(), 1);
    let conflict = &outcome.conflicts[0];
    assert_eq!(conflict.kind, portguard_access::AnomalyKind::IpConflict);
    assert!(conflict.subjects.contains(&mac(1).to_string()));
    assert!(conflict.subjects.contains(&mac(2).to_string()));

    // The loser is gone, the winner is live.
    let loser = plane.store.session(&first.id).await.unwrap().unwrap();
    assert_eq!(loser.state, SessionState::Terminated);
    assert_eq!(outcome.session.state, SessionState::Active);

    assert_eq!(
        plane.manager.validate(mac(2), ip(10)).await.unwrap(),
        ValidateOutcome::Ok
    );
    assert_eq!(
        plane.manager.validate(mac(1), ip(10)).await.unwrap(),
        ValidateOutcome::NoBinding
    );

    // P1 for the loser: nothing of it remains applied.
    let loser_rows = plane.store.ledger_for_session(&first.id).await.unwrap();
    assert!(loser_rows.iter().all(|r| r.state != LedgerState::Applied));
}

// ---- Scenario 3: spoof attempt detected ----

#[tokio::test]
async fn ip_mismatch_is_reported_and_audited() {
    let plane = plane();
    plane
        .manager
        .grant_access(request(mac(1), ip(10), 3600))
        .await
        .unwrap();

    let mut events = plane.audit.subscribe();
    let outcome = plane.api.validate(mac(1), ip(99)).await.unwrap();
    assert_eq!(outcome, ValidateOutcome::IpMismatch { expected: ip(10) });

    let event = expect_event(&mut events, |r| r.action == "ip_mismatch").await;
    assert_eq!(event.category, AuditCategory::Binding);
    assert_eq!(event.severity, AuditSeverity::Warn);
}

// ---- Scenario 4: expiry and cleanup ----

#[tokio::test]
async fn expired_session_is_cleaned_up_by_reconciliation() {
    let plane = plane();
    let client = mac(1);
    let session = plane
        .manager
        .grant_access(request(client, ip(10), 1))
        .await
        .unwrap()
        .session;

    tokio::time::sleep(Duration::from_millis(1300)).await;

    let mut events = plane.audit.subscribe();
    let report = plane.reconciler.run_cycle().await.unwrap();
    assert_eq!(report.expired_sessions, 1);

    let session = plane.store.session(&session.id).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Terminated);
    assert_eq!(session.revoke_reason, Some(RevokeReason::Expired));

    let rows = plane.store.ledger_for_session(&session.id).await.unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| r.state == LedgerState::Retracted));

    let armed = plane
        .store
        .ledger_by_mac_kind(client, RuleKind::PortalRedirect, LedgerState::Applied)
        .await
        .unwrap();
    assert_eq!(armed.len(), 1);

    let event = expect_event(&mut events, |r| r.action == "session_expired").await;
    assert_eq!(event.category, AuditCategory::Session);
}

// ---- Scenario 5: partial enforcement failure and recovery ----

#[tokio::test]
async fn partial_apply_failure_is_compensated() {
    let plane = plane();
    let client = mac(1);

    plane.manager.arm_portal_redirect(client).await.unwrap();
    let pre_grant = snapshot_rules(&plane.enforcer).await;

    // Fault the third rule step once.
    plane.enforcer.push_fault(Fault {
        kind: Some(RuleKind::IsolateL2),
        mode: FaultMode::FailApply,
    });

    let error = plane
        .api
        .grant(&operator(), request(client, ip(10), 3600))
        .await
        .unwrap_err();
    assert_eq!(error.category, ErrorCategory::EnforcerTransient);

    // The compensating revoke leaves the session terminated with zero
    // applied rows.
    let sessions = plane
        .store
        .sessions_in_state(SessionState::Terminated)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].revoke_reason, Some(RevokeReason::ApplyFailed));

    let rows = plane
        .store
        .ledger_for_session(&sessions[0].id)
        .await
        .unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| r.state != LedgerState::Applied));

    // The client is back behind the same portal redirect.
    let post_failure = snapshot_rules(&plane.enforcer).await;
    assert_eq!(post_failure, pre_grant);
    assert_eq!(
        plane.manager.validate(client, ip(10)).await.unwrap(),
        ValidateOutcome::NoBinding
    );
}

// ---- Scenario 6: concurrent re-grant on the same MAC ----

#[tokio::test]
async fn concurrent_grants_for_one_mac_leave_one_session() {
    let plane = plane();
    let client = mac(1);

    let (a, b) = tokio::join!(
        plane.manager.grant_access(request(client, ip(10), 3600)),
        plane.manager.grant_access(request(client, ip(20), 3600)),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    // P2: exactly one active session for the MAC at quiescence.
    let active = plane.manager.list_active_sessions(Some(client)).await.unwrap();
    assert_eq!(active.len(), 1);
    let winner = &active[0];
    assert!(winner.id == a.session.id || winner.id == b.session.id);

    // The loser's rows are retracted, the winner's applied.
    for granted in [&a.session, &b.session] {
        let rows = plane.store.ledger_for_session(&granted.id).await.unwrap();
        if granted.id == winner.id {
            assert!(rows.iter().all(|r| r.state == LedgerState::Applied));
        } else {
            assert!(rows.iter().all(|r| r.state == LedgerState::Retracted));
        }
    }

    // No orphan rules: everything installed belongs to the winner.
    let installed = plane.enforcer.snapshot().await.unwrap();
    let winner_rows = plane.store.ledger_for_session(&winner.id).await.unwrap();
    let winner_handles: Vec<_> = winner_rows.iter().flat_map(|r| r.handles.clone()).collect();
    for rule in &installed {
        assert!(winner_handles.contains(&rule.handle));
    }

    // P3: the survivor validates.
    assert_eq!(
        plane.manager.validate(client, winner.ip).await.unwrap(),
        ValidateOutcome::Ok
    );
}

// ---- P4: grant/revoke idempotence ----

#[tokio::test]
async fn identical_regrant_reuses_the_session() {
    let plane = plane();
    let first = plane
        .manager
        .grant_access(request(mac(1), ip(10), 3600))
        .await
        .unwrap();
    let second = plane
        .manager
        .grant_access(request(mac(1), ip(10), 3600))
        .await
        .unwrap();

    assert!(second.reused);
    assert_eq!(second.session.id, first.session.id);

    // A second revoke reports the session as already terminated.
    plane
        .manager
        .revoke_access(&first.session.id, RevokeReason::UserLogout)
        .await
        .unwrap();
    let error = plane
        .manager
        .revoke_access(&first.session.id, RevokeReason::UserLogout)
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        portguard_access::AccessError::AlreadyTerminated(_)
    ));
}

#[tokio::test]
async fn regrant_with_new_ip_replaces_the_session() {
    let plane = plane();
    let first = plane
        .manager
        .grant_access(request(mac(1), ip(10), 3600))
        .await
        .unwrap()
        .session;
    let second = plane
        .manager
        .grant_access(request(mac(1), ip(20), 3600))
        .await
        .unwrap()
        .session;

    assert_ne!(first.id, second.id);
    let first = plane.store.session(&first.id).await.unwrap().unwrap();
    assert_eq!(first.state, SessionState::Terminated);
    assert_eq!(first.revoke_reason, Some(RevokeReason::Superseded));
    assert_eq!(
        plane.manager.validate(mac(1), ip(20)).await.unwrap(),
        ValidateOutcome::Ok
    );
}

// ---- P6: reconciliation is a fixed point ----

#[tokio::test]
async fn reconciliation_on_a_quiescent_system_changes_nothing() {
    let plane = plane();
    plane
        .manager
        .grant_access(request(mac(1), ip(10), 3600))
        .await
        .unwrap();

    // First cycle settles anything the grant left over.
    plane.reconciler.run_cycle().await.unwrap();
    let stats_before = plane.enforcer.stats();

    let report = plane.reconciler.run_cycle().await.unwrap();
    assert!(report.is_quiescent(), "unexpected work: {:?}", report);

    // No mutating backend calls happened (snapshot reads are fine).
    let stats_after = plane.enforcer.stats();
    assert_eq!(stats_before.apply_calls, stats_after.apply_calls);
    assert_eq!(stats_before.retract_calls, stats_after.retract_calls);
}

// ---- P7: crash between write-ahead and outcome ----

#[tokio::test]
async fn crashed_grant_is_resolved_to_terminated_with_no_rules() {
    let plane = plane();
    let client = mac(1);
    let lease = ip(10);

    // Reproduce the on-disk state of a process that died right after
    // the write-ahead commit: a pending session and pending rows, with
    // nothing in the backend.
    let session_id = SessionId::generate();
    let now = chrono::Utc::now();
    let session = portguard_access::SessionRecord::pending(
        session_id.clone(),
        client,
        lease,
        "voucher",
        now,
        now + chrono::Duration::seconds(3600),
    );
    let net = NetworkProfile::default();
    let mut batch = WriteBatch::default().session(session);
    for kind in [
        RuleKind::GrantEgress,
        RuleKind::BindGuard,
        RuleKind::IsolateL2,
        RuleKind::ArpGuard,
    ] {
        let rules = synth::compile(kind, client, Some(lease), &net).unwrap();
        batch.ledger.push(portguard_access::LedgerRecord::write_ahead(
            Some(session_id.clone()),
            client,
            kind,
            rules,
        ));
    }
    plane.store.commit(batch).await.unwrap();

    // Startup resync.
    plane.reconciler.run_cycle().await.unwrap();
    let session = plane.store.session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Terminated);

    // A follow-up cycle closes the failed rows; nothing is installed for
    // the session and the redirect is armed again.
    plane.reconciler.run_cycle().await.unwrap();
    let rows = plane.store.ledger_for_session(&session_id).await.unwrap();
    assert!(rows
        .iter()
        .all(|r| matches!(r.state, LedgerState::Retracted | LedgerState::Failed)));
    assert!(rows.iter().all(|r| r.handles.is_empty()));

    let installed = snapshot_rules(&plane.enforcer).await;
    assert!(installed.iter().all(|r| r.kind == RuleKind::PortalRedirect));
}

// ---- Revocation with a sticky backend ----

#[tokio::test]
async fn stuck_retraction_is_retried_and_reported() {
    let plane = plane();
    let session = plane
        .manager
        .grant_access(request(mac(1), ip(10), 3600))
        .await
        .unwrap()
        .session;

    // First retract attempt reports everything still present; the
    // manager's single retry then succeeds.
    plane.enforcer.push_fault(Fault {
        kind: None,
        mode: FaultMode::StickyRetract,
    });

    let outcome = plane
        .manager
        .revoke_access(&session.id, RevokeReason::UserLogout)
        .await
        .unwrap();
    assert!(outcome.residual_failures.is_empty());
    assert!(!outcome.retracted.is_empty());

    let rows = plane.store.ledger_for_session(&session.id).await.unwrap();
    assert!(rows.iter().all(|r| r.state == LedgerState::Retracted));
}

#[tokio::test]
async fn partial_apply_returns_its_handles_for_compensation() {
    let plane = plane();

    // The first rule of the egress set lands, the rest do not.
    plane.enforcer.push_fault(Fault {
        kind: Some(RuleKind::GrantEgress),
        mode: FaultMode::PartialApply,
    });

    let fault = plane
        .api
        .grant(&operator(), request(mac(1), ip(10), 3600))
        .await
        .unwrap_err();
    assert_eq!(fault.category, ErrorCategory::EnforcerTransient);

    // The compensating revoke found and removed the stray rule.
    let installed = snapshot_rules(&plane.enforcer).await;
    assert!(installed.iter().all(|r| r.kind == RuleKind::PortalRedirect));
}

#[tokio::test]
async fn exhausted_retries_promote_the_row_to_dead() {
    let plane = plane();
    let session = plane
        .manager
        .grant_access(request(mac(1), ip(10), 3600))
        .await
        .unwrap()
        .session;

    // The backend refuses every retraction: each of the four rows burns
    // two faults during the revoke (attempt plus retry) and one per
    // reconciliation retry afterwards.
    for _ in 0..25 {
        plane.enforcer.push_fault(Fault {
            kind: None,
            mode: FaultMode::StickyRetract,
        });
    }

    let outcome = plane
        .manager
        .revoke_access(&session.id, RevokeReason::UserLogout)
        .await
        .unwrap();
    assert_eq!(outcome.residual_failures.len(), 4);

    let mut events = plane.audit.subscribe();
    // Budget is 3: three retry cycles, then the promotion cycle.
    for _ in 0..4 {
        plane.reconciler.run_cycle().await.unwrap();
    }

    let rows = plane.store.ledger_for_session(&session.id).await.unwrap();
    assert!(rows.iter().any(|r| r.state == LedgerState::Dead));

    let alert = expect_event(&mut events, |r| r.action == "ledger_row_dead").await;
    assert_eq!(alert.severity, AuditSeverity::Critical);
}

// ---- Operator surface ----

#[tokio::test]
async fn blocked_device_cannot_authenticate() {
    let plane = plane();
    let client = mac(1);

    plane
        .api
        .block_device(&operator(), client, "abuse report")
        .await
        .unwrap();

    let fault = plane
        .api
        .grant(&operator(), request(client, ip(10), 3600))
        .await
        .unwrap_err();
    assert_eq!(fault.category, ErrorCategory::PolicyDenied);

    plane.api.unblock_device(&operator(), client).await.unwrap();
    assert!(plane
        .api
        .grant(&operator(), request(client, ip(10), 3600))
        .await
        .is_ok());
}

#[tokio::test]
async fn blocking_a_live_device_disconnects_it() {
    let plane = plane();
    let client = mac(1);
    let session = plane
        .api
        .grant(&operator(), request(client, ip(10), 3600))
        .await
        .unwrap()
        .session;

    plane
        .api
        .block_device(&operator(), client, "operator order")
        .await
        .unwrap();

    let session = plane.store.session(&session.id).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Terminated);
    assert!(!plane.api.has_active_session(client).await.unwrap());
}

#[tokio::test]
async fn extend_moves_expiry_within_the_ceiling() {
    let plane = plane();
    let session = plane
        .api
        .grant(&operator(), request(mac(1), ip(10), 3600))
        .await
        .unwrap()
        .session;

    let new_expiry = plane
        .api
        .extend(&operator(), &session.id, 1800)
        .await
        .unwrap();
    assert_eq!((new_expiry - session.expires_at).num_seconds(), 1800);

    // The binding clock follows the session clock.
    let bindings = plane.store.bindings_for_session(&session.id).await.unwrap();
    assert!(bindings.iter().all(|b| b.expires_at == new_expiry));

    // Extending past the configured ceiling is refused.
    let fault = plane
        .api
        .extend(&operator(), &session.id, 90 * 86_400)
        .await
        .unwrap_err();
    assert_eq!(fault.category, ErrorCategory::InvalidInput);
}

#[tokio::test]
async fn manual_bindings_follow_the_same_conflict_rules() {
    let plane = plane();
    let binding = plane
        .api
        .manual_bind(&operator(), mac(1), ip(10), 3600)
        .await
        .unwrap();
    assert!(binding.session.is_none());
    assert_eq!(
        plane.api.validate(mac(1), ip(10)).await.unwrap(),
        ValidateOutcome::Ok
    );

    plane.api.manual_unbind(&operator(), mac(1)).await.unwrap();
    assert_eq!(
        plane.api.validate(mac(1), ip(10)).await.unwrap(),
        ValidateOutcome::NoBinding
    );
}

#[tokio::test]
async fn snapshot_rules_reports_simulation_and_filters_by_layer() {
    let plane = plane();
    plane
        .api
        .grant(&operator(), request(mac(1), ip(10), 3600))
        .await
        .unwrap();

    let all = plane.api.snapshot_rules(None).await.unwrap();
    assert!(all.simulated);
    assert!(!all.rules.is_empty());

    let l2 = plane
        .api
        .snapshot_rules(Some(portguard_enforcer::RuleLayer::L2))
        .await
        .unwrap();
    assert!(l2
        .rules
        .iter()
        .all(|r| r.rule.layer() == portguard_enforcer::RuleLayer::L2));
    assert!(l2.rules.len() < all.rules.len());

    let report = plane.api.trigger_cleanup(&operator()).await.unwrap();
    assert!(report.is_quiescent());
}
