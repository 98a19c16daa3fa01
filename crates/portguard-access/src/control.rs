//! Operator-facing control and inspection surface.
//!
//! The HTTP facade maps onto these operations one-to-one. Write
//! operations require an [`Operator`] capability; reads do not. Failures
//! cross this boundary as structured [`ControlFault`] values, never as
//! panics.

use crate::binding::{BindingRecord, BindingRegistry, RetireReason, ValidateOutcome};
use crate::config::EnforcerMode;
use crate::device::{DeviceRecord, DeviceRegistry};
use crate::error::{AccessError, ErrorCategory};
use crate::reconcile::{CycleReport, Reconciler};
use crate::session::{
    GrantOutcome, GrantRequest, RevokeOutcome, RevokeReason, SessionManager, SessionRecord,
};
use chrono::{DateTime, Duration, Utc};
use portguard_enforcer::{Enforcer, InstalledRule, RuleLayer};
use portguard_types::{Ipv4Address, MacAddress, SessionId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Proof that the caller acted through the operator console. The facade
/// authenticates operators; the access plane only records who acted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub id: String,
}

impl Operator {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Structured failure returned over the control boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFault {
    pub category: ErrorCategory,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
}

impl From<AccessError> for ControlFault {
    fn from(error: AccessError) -> Self {
        ControlFault {
            category: error.category(),
            session: error.session().cloned(),
            detail: error.to_string(),
        }
    }
}

/// Result type for control operations.
pub type ControlResult<T> = Result<T, ControlFault>;

/// A backend snapshot as reported to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSnapshot {
    /// True when the snapshot comes from the simulator rather than the
    /// host.
    pub simulated: bool,
    pub rules: Vec<InstalledRule>,
}

/// The control/inspection API.
pub struct ControlApi {
    manager: Arc<SessionManager>,
    bindings: BindingRegistry,
    devices: DeviceRegistry,
    reconciler: Arc<Reconciler>,
    enforcer: Arc<dyn Enforcer>,
    mode: EnforcerMode,
}

impl ControlApi {
    pub fn new(
        manager: Arc<SessionManager>,
        bindings: BindingRegistry,
        devices: DeviceRegistry,
        reconciler: Arc<Reconciler>,
        enforcer: Arc<dyn Enforcer>,
        mode: EnforcerMode,
    ) -> Self {
        Self {
            manager,
            bindings,
            devices,
            reconciler,
            enforcer,
            mode,
        }
    }

    // ---- writes (operator capability required) ----

    /// Grants access for an authenticated client.
    pub async fn grant(
        &self,
        _operator: &Operator,
        request: GrantRequest,
    ) -> ControlResult<GrantOutcome> {
        Ok(self.manager.grant_access(request).await?)
    }

    /// Revokes a session.
    pub async fn revoke(
        &self,
        _operator: &Operator,
        session: &SessionId,
        reason: RevokeReason,
    ) -> ControlResult<RevokeOutcome> {
        Ok(self.manager.revoke_access(session, reason).await?)
    }

    /// Disconnects a client on operator initiative.
    pub async fn force_disconnect(
        &self,
        operator: &Operator,
        session: &SessionId,
        note: &str,
    ) -> ControlResult<RevokeOutcome> {
        Ok(self
            .manager
            .force_disconnect(session, &operator.id, note)
            .await?)
    }

    /// Extends a session and returns the new expiry.
    pub async fn extend(
        &self,
        _operator: &Operator,
        session: &SessionId,
        additional_secs: u64,
    ) -> ControlResult<DateTime<Utc>> {
        Ok(self.manager.extend(session, additional_secs).await?)
    }

    /// Creates a binding by hand, outside any session.
    pub async fn manual_bind(
        &self,
        _operator: &Operator,
        mac: MacAddress,
        ip: Ipv4Address,
        duration_secs: u64,
    ) -> ControlResult<BindingRecord> {
        mac.require_client().map_err(AccessError::from)?;
        ip.require_host().map_err(AccessError::from)?;
        if duration_secs == 0 {
            return Err(AccessError::InvalidInput("duration must be positive".into()).into());
        }
        let expires_at = Utc::now() + Duration::seconds(duration_secs as i64);
        let outcome = self
            .bindings
            .create_binding(mac, ip, None, expires_at)
            .await?;
        Ok(outcome.binding)
    }

    /// Retires the active binding for a MAC.
    pub async fn manual_unbind(&self, _operator: &Operator, mac: MacAddress) -> ControlResult<()> {
        Ok(self.bindings.retire_by_mac(mac, RetireReason::Manual).await?)
    }

    /// Blocks a device; a live session for it is disconnected.
    pub async fn block_device(
        &self,
        _operator: &Operator,
        mac: MacAddress,
        reason: &str,
    ) -> ControlResult<()> {
        self.devices.block(mac, reason).await?;
        if let Some(session) = self.manager.list_active_sessions(Some(mac)).await?.pop() {
            self.manager
                .revoke_access(&session.id, RevokeReason::Blocked)
                .await?;
        }
        Ok(())
    }

    /// Unblocks a device.
    pub async fn unblock_device(&self, _operator: &Operator, mac: MacAddress) -> ControlResult<()> {
        Ok(self.devices.unblock(mac).await?)
    }

    /// Runs one reconciliation cycle immediately.
    pub async fn trigger_cleanup(&self, _operator: &Operator) -> ControlResult<CycleReport> {
        Ok(self.reconciler.run_cycle().await?)
    }

    // ---- reads ----

    /// Active sessions, optionally narrowed to one MAC.
    pub async fn list_active_sessions(
        &self,
        mac: Option<MacAddress>,
    ) -> ControlResult<Vec<SessionRecord>> {
        Ok(self.manager.list_active_sessions(mac).await?)
    }

    /// Bindings; retired history included on request.
    pub async fn list_bindings(&self, include_retired: bool) -> ControlResult<Vec<BindingRecord>> {
        Ok(self.bindings.list(include_retired).await?)
    }

    /// Known devices.
    pub async fn list_devices(&self) -> ControlResult<Vec<DeviceRecord>> {
        Ok(self.devices.list().await?)
    }

    /// Checks an observed identity pair.
    pub async fn validate(
        &self,
        mac: MacAddress,
        ip: Ipv4Address,
    ) -> ControlResult<ValidateOutcome> {
        Ok(self.manager.validate(mac, ip).await?)
    }

    /// The portal-detection predicate.
    pub async fn has_active_session(&self, mac: MacAddress) -> ControlResult<bool> {
        Ok(self.manager.has_active_session(mac).await?)
    }

    /// What the backend has installed, optionally narrowed to one layer.
    pub async fn snapshot_rules(&self, layer: Option<RuleLayer>) -> ControlResult<RuleSnapshot> {
        let rules = self
            .enforcer
            .snapshot()
            .await
            .map_err(|e| AccessError::EnforcerFailed(format!("snapshot: {}", e)))?;
        Ok(RuleSnapshot {
            simulated: self.mode == EnforcerMode::Simulation,
            rules: rules
                .into_iter()
                .filter(|r| layer.map(|l| r.rule.layer() == l).unwrap_or(true))
                .collect(),
        })
    }
}
