//! Persistence capability.
//!
//! The access plane needs a transactional record of sessions, bindings,
//! ledger rows and devices, but not any particular engine. [`Store`] is
//! the seam: the [`MemoryStore`] backs tests and simulation deployments,
//! the [`RedisStore`] backs real gateways. Which one a caller holds is a
//! construction-time choice, mirroring the enforcement backends.
//!
//! Multi-entity mutations go through [`WriteBatch`] and land atomically
//! in one [`Store::commit`] call. Reads may be non-transactional.

mod memory;
mod redis;

use crate::binding::BindingRecord;
use crate::device::DeviceRecord;
use crate::ledger::{LedgerRecord, LedgerState};
use crate::session::{SessionRecord, SessionState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use portguard_enforcer::RuleKind;
use portguard_types::{BindingId, Ipv4Address, LedgerId, MacAddress, SessionId};
use thiserror::Error;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Errors from the persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("stored record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        StoreError::Backend(message.into())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A set of upserts that commit atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub sessions: Vec<SessionRecord>,
    pub bindings: Vec<BindingRecord>,
    pub ledger: Vec<LedgerRecord>,
    pub devices: Vec<DeviceRecord>,
}

impl WriteBatch {
    pub fn session(mut self, record: SessionRecord) -> Self {
        self.sessions.push(record);
        self
    }

    pub fn binding(mut self, record: BindingRecord) -> Self {
        self.bindings.push(record);
        self
    }

    pub fn ledger(mut self, record: LedgerRecord) -> Self {
        self.ledger.push(record);
        self
    }

    pub fn device(mut self, record: DeviceRecord) -> Self {
        self.devices.push(record);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
            && self.bindings.is_empty()
            && self.ledger.is_empty()
            && self.devices.is_empty()
    }
}

/// Capability over the persistence engine.
///
/// Implementations index sessions by MAC and expiry, bindings by MAC and
/// by IP, and ledger rows by session and by state, so the queries below
/// stay cheap at gateway scale.
#[async_trait]
pub trait Store: Send + Sync {
    // ---- sessions ----

    async fn session(&self, id: &SessionId) -> StoreResult<Option<SessionRecord>>;

    /// The at-most-one session in `ACTIVE` (or `PENDING`) state for a MAC.
    async fn unfinished_session_by_mac(&self, mac: MacAddress)
        -> StoreResult<Option<SessionRecord>>;

    async fn sessions_in_state(&self, state: SessionState) -> StoreResult<Vec<SessionRecord>>;

    // ---- bindings ----

    async fn binding(&self, id: &BindingId) -> StoreResult<Option<BindingRecord>>;

    async fn active_binding_by_mac(&self, mac: MacAddress) -> StoreResult<Option<BindingRecord>>;

    async fn active_binding_by_ip(&self, ip: Ipv4Address) -> StoreResult<Option<BindingRecord>>;

    async fn bindings_for_session(&self, id: &SessionId) -> StoreResult<Vec<BindingRecord>>;

    /// All bindings; retired rows included only on request.
    async fn bindings(&self, include_retired: bool) -> StoreResult<Vec<BindingRecord>>;

    /// Bindings (any state) created for a MAC since the given instant.
    /// Feeds the rapid-rebind analysis.
    async fn bindings_created_since(
        &self,
        mac: MacAddress,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<BindingRecord>>;

    // ---- ledger ----

    async fn ledger_entry(&self, id: &LedgerId) -> StoreResult<Option<LedgerRecord>>;

    async fn ledger_for_session(&self, id: &SessionId) -> StoreResult<Vec<LedgerRecord>>;

    async fn ledger_in_state(&self, state: LedgerState) -> StoreResult<Vec<LedgerRecord>>;

    /// Rows of one kind for a MAC in the given state. Used to find the
    /// portal redirect owed to (or retired from) a client.
    async fn ledger_by_mac_kind(
        &self,
        mac: MacAddress,
        kind: RuleKind,
        state: LedgerState,
    ) -> StoreResult<Vec<LedgerRecord>>;

    // ---- devices ----

    async fn device(&self, mac: MacAddress) -> StoreResult<Option<DeviceRecord>>;

    async fn devices(&self) -> StoreResult<Vec<DeviceRecord>>;

    // ---- writes ----

    /// Applies every upsert in the batch atomically.
    async fn commit(&self, batch: WriteBatch) -> StoreResult<()>;
}
