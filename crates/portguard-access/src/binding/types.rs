//! Binding records and anomaly types.

use chrono::{DateTime, Utc};
use portguard_types::{BindingId, Ipv4Address, MacAddress, SessionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BindingState {
    Active,
    Retired,
}

/// Why a binding was retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetireReason {
    /// The owning session ended.
    SessionEnded,
    /// The same MAC bound a different IP.
    MacRebound,
    /// A different MAC claimed the same IP.
    IpConflict,
    /// The lease ran out.
    Expired,
    /// An operator removed it.
    Manual,
}

/// A live (or historical) MAC-to-IP association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRecord {
    pub id: BindingId,
    pub mac: MacAddress,
    pub ip: Ipv4Address,
    /// Owning session; `None` for operator-created bindings.
    pub session: Option<SessionId>,
    pub state: BindingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retire_reason: Option<RetireReason>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retired_at: Option<DateTime<Utc>>,
}

impl BindingRecord {
    /// Creates an active binding.
    pub fn new(
        mac: MacAddress,
        ip: Ipv4Address,
        session: Option<SessionId>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: BindingId::generate(),
            mac,
            ip,
            session,
            state: BindingState::Active,
            retire_reason: None,
            created_at: Utc::now(),
            expires_at,
            retired_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == BindingState::Active
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Retires the binding. Retiring an already retired binding keeps the
    /// original reason and timestamp.
    pub fn retire(&mut self, reason: RetireReason) {
        if self.state == BindingState::Retired {
            return;
        }
        self.state = BindingState::Retired;
        self.retire_reason = Some(reason);
        self.retired_at = Some(Utc::now());
    }
}

/// Result of validating an observed (MAC, IP) pair against the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidateOutcome {
    Ok,
    NoBinding,
    IpMismatch { expected: Ipv4Address },
    Expired,
}

impl ValidateOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ValidateOutcome::Ok)
    }
}

/// Kinds of identity anomalies the registry surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyKind {
    /// Two MACs claimed the same IP.
    IpConflict,
    /// One MAC moved to a different IP.
    MacRebound,
    /// A MAC rebound more often than the configured threshold allows.
    RapidRebind,
    /// Observed traffic contradicts the active binding.
    BindingMismatch,
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnomalyKind::IpConflict => "IP_CONFLICT",
            AnomalyKind::MacRebound => "MAC_REBOUND",
            AnomalyKind::RapidRebind => "RAPID_REBIND",
            AnomalyKind::BindingMismatch => "BINDING_MISMATCH",
        };
        write!(f, "{}", s)
    }
}

/// A detected identity anomaly. Derived, not stored: anomalies travel
/// through the audit sink only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    /// The identities involved (MACs, IPs), rendered as strings.
    pub subjects: Vec<String>,
    pub observed_at: DateTime<Utc>,
    pub detail: String,
}

impl Anomaly {
    pub fn new(kind: AnomalyKind, subjects: Vec<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            subjects,
            observed_at: Utc::now(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_retire_is_idempotent() {
        let mut binding = BindingRecord::new(
            "aa:bb:cc:dd:ee:01".parse().unwrap(),
            "192.168.4.10".parse().unwrap(),
            Some(SessionId::generate()),
            Utc::now() + chrono::Duration::hours(1),
        );
        assert!(binding.is_active());

        binding.retire(RetireReason::MacRebound);
        let first_retired_at = binding.retired_at;
        assert_eq!(binding.retire_reason, Some(RetireReason::MacRebound));

        binding.retire(RetireReason::Expired);
        assert_eq!(binding.retire_reason, Some(RetireReason::MacRebound));
        assert_eq!(binding.retired_at, first_retired_at);
    }

    #[test]
    fn test_expiry_check() {
        let now = Utc::now();
        let binding = BindingRecord::new(
            "aa:bb:cc:dd:ee:01".parse().unwrap(),
            "192.168.4.10".parse().unwrap(),
            None,
            now - chrono::Duration::seconds(1),
        );
        assert!(binding.is_expired(now));
        assert!(!binding.is_expired(now - chrono::Duration::seconds(5)));
    }
}
