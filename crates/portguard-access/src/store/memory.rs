//! In-memory store backend.
//!
//! The default for tests and simulation deployments. A single `RwLock`
//! over the four tables makes every commit trivially atomic; queries
//! scan, which is fine at the scale of one gateway's client population.

use super::{Store, StoreResult, WriteBatch};
use crate::binding::{BindingRecord, BindingState};
use crate::device::DeviceRecord;
use crate::ledger::{LedgerRecord, LedgerState};
use crate::session::{SessionRecord, SessionState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use portguard_enforcer::RuleKind;
use portguard_types::{BindingId, Ipv4Address, LedgerId, MacAddress, SessionId};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Tables {
    sessions: HashMap<SessionId, SessionRecord>,
    bindings: HashMap<BindingId, BindingRecord>,
    ledger: HashMap<LedgerId, LedgerRecord>,
    devices: HashMap<MacAddress, DeviceRecord>,
}

/// The in-memory [`Store`] implementation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn session(&self, id: &SessionId) -> StoreResult<Option<SessionRecord>> {
        Ok(self.tables.read().await.sessions.get(id).cloned())
    }

    async fn unfinished_session_by_mac(
        &self,
        mac: MacAddress,
    ) -> StoreResult<Option<SessionRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .sessions
            .values()
            .find(|s| {
                s.mac == mac
                    && matches!(s.state, SessionState::Pending | SessionState::Active)
            })
            .cloned())
    }

    async fn sessions_in_state(&self, state: SessionState) -> StoreResult<Vec<SessionRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .sessions
            .values()
            .filter(|s| s.state == state)
            .cloned()
            .collect())
    }

    async fn binding(&self, id: &BindingId) -> StoreResult<Option<BindingRecord>> {
        Ok(self.tables.read().await.bindings.get(id).cloned())
    }

    async fn active_binding_by_mac(&self, mac: MacAddress) -> StoreResult<Option<BindingRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .bindings
            .values()
            .find(|b| b.mac == mac && b.state == BindingState::Active)
            .cloned())
    }

    async fn active_binding_by_ip(&self, ip: Ipv4Address) -> StoreResult<Option<BindingRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .bindings
            .values()
            .find(|b| b.ip == ip && b.state == BindingState::Active)
            .cloned())
    }

    async fn bindings_for_session(&self, id: &SessionId) -> StoreResult<Vec<BindingRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .bindings
            .values()
            .filter(|b| b.session.as_ref() == Some(id))
            .cloned()
            .collect())
    }

    async fn bindings(&self, include_retired: bool) -> StoreResult<Vec<BindingRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .bindings
            .values()
            .filter(|b| include_retired || b.state == BindingState::Active)
            .cloned()
            .collect())
    }

    async fn bindings_created_since(
        &self,
        mac: MacAddress,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<BindingRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .bindings
            .values()
            .filter(|b| b.mac == mac && b.created_at >= since)
            .cloned()
            .collect())
    }

    async fn ledger_entry(&self, id: &LedgerId) -> StoreResult<Option<LedgerRecord>> {
        Ok(self.tables.read().await.ledger.get(id).cloned())
    }

    async fn ledger_for_session(&self, id: &SessionId) -> StoreResult<Vec<LedgerRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .ledger
            .values()
            .filter(|r| r.session.as_ref() == Some(id))
            .cloned()
            .collect())
    }

    async fn ledger_in_state(&self, state: LedgerState) -> StoreResult<Vec<LedgerRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .ledger
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect())
    }

    async fn ledger_by_mac_kind(
        &self,
        mac: MacAddress,
        kind: RuleKind,
        state: LedgerState,
    ) -> StoreResult<Vec<LedgerRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .ledger
            .values()
            .filter(|r| r.mac == mac && r.kind == kind && r.state == state)
            .cloned()
            .collect())
    }

    async fn device(&self, mac: MacAddress) -> StoreResult<Option<DeviceRecord>> {
        Ok(self.tables.read().await.devices.get(&mac).cloned())
    }

    async fn devices(&self) -> StoreResult<Vec<DeviceRecord>> {
        Ok(self.tables.read().await.devices.values().cloned().collect())
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        for session in batch.sessions {
            tables.sessions.insert(session.id.clone(), session);
        }
        for binding in batch.bindings {
            tables.bindings.insert(binding.id.clone(), binding);
        }
        for row in batch.ledger {
            tables.ledger.insert(row.id.clone(), row);
        }
        for device in batch.devices {
            tables.devices.insert(device.mac, device);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mac() -> MacAddress {
        "aa:bb:cc:dd:ee:01".parse().unwrap()
    }

    fn ip() -> Ipv4Address {
        "192.168.4.10".parse().unwrap()
    }

    #[tokio::test]
    async fn test_commit_is_atomic_upsert() {
        let store = MemoryStore::new();
        let session = SessionRecord::pending(
            SessionId::generate(),
            mac(),
            ip(),
            "voucher",
            Utc::now(),
            Utc::now() + chrono::Duration::hours(1),
        );
        let binding = BindingRecord::new(mac(), ip(), Some(session.id.clone()), session.expires_at);

        store
            .commit(
                WriteBatch::default()
                    .session(session.clone())
                    .binding(binding.clone()),
            )
            .await
            .unwrap();

        assert_eq!(store.session(&session.id).await.unwrap(), Some(session.clone()));
        assert_eq!(
            store.active_binding_by_mac(mac()).await.unwrap(),
            Some(binding.clone())
        );
        assert_eq!(
            store.active_binding_by_ip(ip()).await.unwrap(),
            Some(binding)
        );

        // Upsert: a later commit replaces the record wholesale.
        let mut updated = session.clone();
        updated.state = SessionState::Active;
        store
            .commit(WriteBatch::default().session(updated))
            .await
            .unwrap();
        assert_eq!(
            store.session(&session.id).await.unwrap().unwrap().state,
            SessionState::Active
        );
    }

    #[tokio::test]
    async fn test_unfinished_session_lookup_covers_pending_and_active() {
        let store = MemoryStore::new();
        let mut session = SessionRecord::pending(
            SessionId::generate(),
            mac(),
            ip(),
            "voucher",
            Utc::now(),
            Utc::now() + chrono::Duration::hours(1),
        );
        store
            .commit(WriteBatch::default().session(session.clone()))
            .await
            .unwrap();
        assert!(store
            .unfinished_session_by_mac(mac())
            .await
            .unwrap()
            .is_some());

        session.state = SessionState::Terminated;
        store
            .commit(WriteBatch::default().session(session))
            .await
            .unwrap();
        assert!(store
            .unfinished_session_by_mac(mac())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_retired_bindings_hidden_by_default() {
        let store = MemoryStore::new();
        let mut binding = BindingRecord::new(mac(), ip(), None, Utc::now());
        binding.retire(crate::binding::RetireReason::Manual);
        store
            .commit(WriteBatch::default().binding(binding))
            .await
            .unwrap();

        assert!(store.bindings(false).await.unwrap().is_empty());
        assert_eq!(store.bindings(true).await.unwrap().len(), 1);
        assert!(store.active_binding_by_mac(mac()).await.unwrap().is_none());
    }
}
