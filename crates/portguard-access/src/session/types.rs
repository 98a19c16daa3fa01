//! Session records and state machine.

use chrono::{DateTime, Utc};
use portguard_types::{Ipv4Address, MacAddress, SessionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Session lifecycle states. Transitions only move forward:
/// `Pending -> Active -> Revoking -> Terminated`, with `Pending ->
/// Terminated` permitted when rule application fails. `Terminated` is
/// absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Pending,
    Active,
    Revoking,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Pending => "PENDING",
            SessionState::Active => "ACTIVE",
            SessionState::Revoking => "REVOKING",
            SessionState::Terminated => "TERMINATED",
        };
        write!(f, "{}", s)
    }
}

/// Why a session left the active path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RevokeReason {
    /// The session clock ran out.
    Expired,
    /// The client logged out through the portal.
    UserLogout,
    /// An operator disconnected the client.
    Admin,
    /// A newer grant for the same MAC replaced it.
    Superseded,
    /// Rule application failed and the grant was compensated.
    ApplyFailed,
    /// The session lost its binding to a conflicting claim.
    Conflict,
    /// The device was blocked while the session was live.
    Blocked,
}

impl fmt::Display for RevokeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RevokeReason::Expired => "EXPIRED",
            RevokeReason::UserLogout => "USER_LOGOUT",
            RevokeReason::Admin => "ADMIN",
            RevokeReason::Superseded => "SUPERSEDED",
            RevokeReason::ApplyFailed => "APPLY_FAILED",
            RevokeReason::Conflict => "CONFLICT",
            RevokeReason::Blocked => "BLOCKED",
        };
        write!(f, "{}", s)
    }
}

/// One access session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub mac: MacAddress,
    pub ip: Ipv4Address,
    /// How the client authenticated, e.g. `voucher` or `account`.
    pub auth_method: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoke_reason: Option<RevokeReason>,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Creates a pending session for a fresh grant.
    pub fn pending(
        id: SessionId,
        mac: MacAddress,
        ip: Ipv4Address,
        auth_method: impl Into<String>,
        started_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            mac,
            ip,
            auth_method: auth_method.into(),
            state: SessionState::Pending,
            revoke_reason: None,
            started_at,
            expires_at,
            terminated_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pending_session() {
        let now = Utc::now();
        let session = SessionRecord::pending(
            SessionId::generate(),
            "aa:bb:cc:dd:ee:01".parse().unwrap(),
            "192.168.4.10".parse().unwrap(),
            "voucher",
            now,
            now + chrono::Duration::seconds(3600),
        );
        assert_eq!(session.state, SessionState::Pending);
        assert!(!session.is_active());
        assert!(!session.is_expired(now));
        assert!(session.is_expired(now + chrono::Duration::seconds(3601)));
    }

    #[test]
    fn test_reason_wire_format() {
        assert_eq!(
            serde_json::to_string(&RevokeReason::UserLogout).unwrap(),
            "\"USER_LOGOUT\""
        );
        assert_eq!(RevokeReason::Expired.to_string(), "EXPIRED");
    }
}
