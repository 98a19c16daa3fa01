//! Device history and operator blocks.
//!
//! Every MAC that ever authenticated leaves a device record. Blocking a
//! device refuses new sessions for that MAC regardless of credential
//! validity.

use crate::audit::{AuditCategory, AuditRecord, AuditSeverity, AuditSink};
use crate::error::AccessResult;
use crate::store::{Store, WriteBatch};
use chrono::{DateTime, Utc};
use portguard_types::MacAddress;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Per-MAC device history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub mac: MacAddress,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
}

impl DeviceRecord {
    pub fn new(mac: MacAddress, now: DateTime<Utc>) -> Self {
        Self {
            mac,
            first_seen: now,
            last_seen: now,
            blocked: false,
            block_reason: None,
        }
    }
}

/// Registry over the device table.
#[derive(Clone)]
pub struct DeviceRegistry {
    store: Arc<dyn Store>,
    audit: AuditSink,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn Store>, audit: AuditSink) -> Self {
        Self { store, audit }
    }

    /// Records that the MAC was seen now and returns its record.
    pub async fn observe(&self, mac: MacAddress) -> AccessResult<DeviceRecord> {
        let now = Utc::now();
        let mut device = self
            .store
            .device(mac)
            .await?
            .unwrap_or_else(|| DeviceRecord::new(mac, now));
        device.last_seen = now;
        self.store
            .commit(WriteBatch::default().device(device.clone()))
            .await?;
        Ok(device)
    }

    /// Returns true if the MAC is currently blocked.
    pub async fn is_blocked(&self, mac: MacAddress) -> AccessResult<bool> {
        Ok(self
            .store
            .device(mac)
            .await?
            .map(|d| d.blocked)
            .unwrap_or(false))
    }

    /// Blocks the MAC. Idempotent; the most recent reason wins.
    pub async fn block(&self, mac: MacAddress, reason: impl Into<String>) -> AccessResult<()> {
        let reason = reason.into();
        let now = Utc::now();
        let mut device = self
            .store
            .device(mac)
            .await?
            .unwrap_or_else(|| DeviceRecord::new(mac, now));
        device.blocked = true;
        device.block_reason = Some(reason.clone());
        self.store
            .commit(WriteBatch::default().device(device))
            .await?;

        self.audit.emit(
            AuditRecord::new(AuditCategory::Admin, AuditSeverity::Warn, "device_blocked")
                .with_subject(mac)
                .with_details(serde_json::json!({ "reason": reason })),
        );
        Ok(())
    }

    /// Unblocks the MAC. Idempotent.
    pub async fn unblock(&self, mac: MacAddress) -> AccessResult<()> {
        let Some(mut device) = self.store.device(mac).await? else {
            return Ok(());
        };
        if !device.blocked {
            return Ok(());
        }
        device.blocked = false;
        device.block_reason = None;
        self.store
            .commit(WriteBatch::default().device(device))
            .await?;

        self.audit.emit(
            AuditRecord::new(AuditCategory::Admin, AuditSeverity::Info, "device_unblocked")
                .with_subject(mac),
        );
        Ok(())
    }

    /// Lists every known device.
    pub async fn list(&self) -> AccessResult<Vec<DeviceRecord>> {
        Ok(self.store.devices().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry() -> DeviceRegistry {
        let (audit, _pump) = AuditSink::new(16);
        DeviceRegistry::new(Arc::new(MemoryStore::new()), audit)
    }

    fn mac() -> MacAddress {
        "aa:bb:cc:dd:ee:01".parse().unwrap()
    }

    #[tokio::test]
    async fn test_observe_tracks_first_and_last_seen() {
        let registry = registry();
        let first = registry.observe(mac()).await.unwrap();
        let second = registry.observe(mac()).await.unwrap();
        assert_eq!(first.first_seen, second.first_seen);
        assert!(second.last_seen >= first.last_seen);
    }

    #[tokio::test]
    async fn test_block_and_unblock() {
        let registry = registry();
        assert!(!registry.is_blocked(mac()).await.unwrap());

        registry.block(mac(), "abuse report").await.unwrap();
        assert!(registry.is_blocked(mac()).await.unwrap());

        // Blocking again just refreshes the reason.
        registry.block(mac(), "second report").await.unwrap();
        let devices = registry.list().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].block_reason.as_deref(), Some("second report"));

        registry.unblock(mac()).await.unwrap();
        assert!(!registry.is_blocked(mac()).await.unwrap());

        // Unblocking an unknown MAC is a no-op.
        registry
            .unblock("aa:bb:cc:dd:ee:99".parse().unwrap())
            .await
            .unwrap();
    }
}
