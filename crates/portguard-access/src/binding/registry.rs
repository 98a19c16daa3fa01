//! The binding registry: authoritative MAC-to-IP map with conflict
//! resolution and spoof analytics.

use super::types::{
    Anomaly, AnomalyKind, BindingRecord, RetireReason, ValidateOutcome,
};
use crate::audit::{AuditCategory, AuditRecord, AuditSeverity, AuditSink};
use crate::error::AccessResult;
use crate::store::{Store, WriteBatch};
use chrono::{DateTime, Duration, Utc};
use portguard_types::{Ipv4Address, MacAddress, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Result of installing a binding.
#[derive(Debug, Clone)]
pub struct CreateBindingOutcome {
    pub binding: BindingRecord,
    /// Conflicts resolved on the way in, already emitted to the sink.
    pub conflicts: Vec<Anomaly>,
}

/// Authoritative MAC-to-IP registry.
///
/// All mutations land in a single store commit. The registry never calls
/// up into session management; anomalies travel through the audit sink
/// and whoever cares subscribes there.
#[derive(Clone)]
pub struct BindingRegistry {
    store: Arc<dyn Store>,
    audit: AuditSink,
    /// Rebinds per MAC within the last hour above which the anomaly
    /// sweep reports RAPID_REBIND.
    rebind_threshold: u32,
}

impl BindingRegistry {
    /// Window examined by the rapid-rebind analysis.
    fn rebind_window() -> Duration {
        Duration::hours(1)
    }

    pub fn new(store: Arc<dyn Store>, audit: AuditSink, rebind_threshold: u32) -> Self {
        Self {
            store,
            audit,
            rebind_threshold,
        }
    }

    /// Installs a binding for `(mac, ip)`, retiring whatever it displaces.
    ///
    /// An existing active binding with the same MAC and a different IP is
    /// retired as MAC_REBOUND; an existing active binding with the same
    /// IP and a different MAC is retired as IP_CONFLICT. Both retirements
    /// surface as anomalies. Afterwards the invariant holds again: at
    /// most one active binding per MAC and per IP.
    pub async fn create_binding(
        &self,
        mac: MacAddress,
        ip: Ipv4Address,
        session: Option<&SessionId>,
        expires_at: DateTime<Utc>,
    ) -> AccessResult<CreateBindingOutcome> {
        let mut batch = WriteBatch::default();
        let mut conflicts = Vec::new();

        if let Some(mut existing) = self.store.active_binding_by_mac(mac).await? {
            if existing.ip != ip {
                conflicts.push(Anomaly::new(
                    AnomalyKind::MacRebound,
                    vec![mac.to_string(), existing.ip.to_string(), ip.to_string()],
                    format!("{} moved from {} to {}", mac, existing.ip, ip),
                ));
                existing.retire(RetireReason::MacRebound);
            } else {
                // Same pair, new owner: the old binding makes way quietly.
                existing.retire(RetireReason::SessionEnded);
            }
            batch.bindings.push(existing);
        }

        if let Some(mut claimed) = self.store.active_binding_by_ip(ip).await? {
            if claimed.mac != mac {
                conflicts.push(Anomaly::new(
                    AnomalyKind::IpConflict,
                    vec![claimed.mac.to_string(), mac.to_string()],
                    format!("{} taken over from {} by {}", ip, claimed.mac, mac),
                ));
                claimed.retire(RetireReason::IpConflict);
                batch.bindings.push(claimed);
            }
        }

        let binding = BindingRecord::new(mac, ip, session.cloned(), expires_at);
        batch.bindings.push(binding.clone());
        self.store.commit(batch).await?;

        for anomaly in &conflicts {
            warn!(kind = %anomaly.kind, detail = %anomaly.detail, "binding conflict resolved");
            self.emit_anomaly(anomaly);
        }

        Ok(CreateBindingOutcome { binding, conflicts })
    }

    /// Checks an observed `(mac, ip)` pair against the registry. Pure
    /// read; a mismatch is audited as a spoof indicator.
    pub async fn validate(&self, mac: MacAddress, ip: Ipv4Address) -> AccessResult<ValidateOutcome> {
        let Some(binding) = self.store.active_binding_by_mac(mac).await? else {
            return Ok(ValidateOutcome::NoBinding);
        };

        if binding.is_expired(Utc::now()) {
            return Ok(ValidateOutcome::Expired);
        }

        if binding.ip != ip {
            self.audit.emit(
                AuditRecord::new(AuditCategory::Binding, AuditSeverity::Warn, "ip_mismatch")
                    .with_subject(mac)
                    .with_details(serde_json::json!({
                        "observed": ip.to_string(),
                        "expected": binding.ip.to_string(),
                    })),
            );
            return Ok(ValidateOutcome::IpMismatch {
                expected: binding.ip,
            });
        }

        Ok(ValidateOutcome::Ok)
    }

    /// Lists bindings; retired history included on request.
    pub async fn list(&self, include_retired: bool) -> AccessResult<Vec<BindingRecord>> {
        Ok(self.store.bindings(include_retired).await?)
    }

    /// Retires the active binding for a MAC, if any. Idempotent.
    pub async fn retire_by_mac(&self, mac: MacAddress, reason: RetireReason) -> AccessResult<()> {
        if let Some(mut binding) = self.store.active_binding_by_mac(mac).await? {
            binding.retire(reason);
            self.store
                .commit(WriteBatch::default().binding(binding))
                .await?;
        }
        Ok(())
    }

    /// Retires every binding owned by a session. Idempotent.
    pub async fn retire_by_session(
        &self,
        session: &SessionId,
        reason: RetireReason,
    ) -> AccessResult<()> {
        let mut batch = WriteBatch::default();
        for mut binding in self.store.bindings_for_session(session).await? {
            if binding.is_active() {
                binding.retire(reason);
                batch.bindings.push(binding);
            }
        }
        if !batch.is_empty() {
            self.store.commit(batch).await?;
        }
        Ok(())
    }

    /// Periodic analysis over the whole table.
    ///
    /// Reports (i) any IP held by two or more active MACs, which the
    /// create path makes impossible and therefore indicates a bug or a
    /// lost race, and (ii) MACs rebinding faster than the configured
    /// threshold.
    pub async fn scan_anomalies(&self, now: DateTime<Utc>) -> AccessResult<Vec<Anomaly>> {
        let mut anomalies = Vec::new();

        let active = self.store.bindings(false).await?;
        let mut by_ip: HashMap<Ipv4Address, Vec<MacAddress>> = HashMap::new();
        for binding in &active {
            by_ip.entry(binding.ip).or_default().push(binding.mac);
        }
        for (ip, macs) in by_ip {
            if macs.len() > 1 {
                anomalies.push(Anomaly::new(
                    AnomalyKind::IpConflict,
                    macs.iter().map(|m| m.to_string()).collect(),
                    format!("{} is actively bound to {} MACs", ip, macs.len()),
                ));
            }
        }

        let mut seen: Vec<MacAddress> = active.iter().map(|b| b.mac).collect();
        seen.sort();
        seen.dedup();
        for mac in seen {
            let recent = self
                .store
                .bindings_created_since(mac, now - Self::rebind_window())
                .await?;
            if recent.len() as u32 > self.rebind_threshold {
                anomalies.push(Anomaly::new(
                    AnomalyKind::RapidRebind,
                    vec![mac.to_string()],
                    format!(
                        "{} bound {} times in the last hour (threshold {})",
                        mac,
                        recent.len(),
                        self.rebind_threshold
                    ),
                ));
            }
        }

        for anomaly in &anomalies {
            self.emit_anomaly(anomaly);
        }
        Ok(anomalies)
    }

    fn emit_anomaly(&self, anomaly: &Anomaly) {
        let severity = match anomaly.kind {
            // A duplicate-IP observation contradicts the registry's own
            // invariant and needs eyes on it.
            AnomalyKind::IpConflict if anomaly.subjects.len() > 2 => AuditSeverity::Critical,
            _ => AuditSeverity::Warn,
        };
        self.audit.emit(
            AuditRecord::new(AuditCategory::Anomaly, severity, anomaly.kind.to_string())
                .with_subject(anomaly.subjects.join(","))
                .with_details(serde_json::json!({
                    "detail": anomaly.detail,
                    "observed_at": anomaly.observed_at,
                })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn registry() -> (BindingRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let (audit, _pump) = AuditSink::new(64);
        (
            BindingRegistry::new(store.clone() as Arc<dyn Store>, audit, 5),
            store,
        )
    }

    fn mac(n: u8) -> MacAddress {
        MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, n])
    }

    fn ip(n: u8) -> Ipv4Address {
        Ipv4Address::new(192, 168, 4, n)
    }

    fn expiry() -> DateTime<Utc> {
        Utc::now() + Duration::hours(1)
    }

    #[tokio::test]
    async fn test_create_binding_clean() {
        let (registry, _store) = registry();
        let session = SessionId::generate();
        let outcome = registry
            .create_binding(mac(1), ip(10), Some(&session), expiry())
            .await
            .unwrap();
        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.binding.mac, mac(1));
        assert!(registry.validate(mac(1), ip(10)).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_mac_rebound_retires_old_ip() {
        let (registry, store) = registry();
        registry
            .create_binding(mac(1), ip(10), None, expiry())
            .await
            .unwrap();
        let outcome = registry
            .create_binding(mac(1), ip(20), None, expiry())
            .await
            .unwrap();

        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].kind, AnomalyKind::MacRebound);

        // Only the new pair survives.
        assert!(store.active_binding_by_ip(ip(10)).await.unwrap().is_none());
        assert_eq!(
            registry.validate(mac(1), ip(20)).await.unwrap(),
            ValidateOutcome::Ok
        );
    }

    #[tokio::test]
    async fn test_ip_conflict_retires_losing_mac() {
        let (registry, store) = registry();
        registry
            .create_binding(mac(1), ip(10), None, expiry())
            .await
            .unwrap();
        let outcome = registry
            .create_binding(mac(2), ip(10), None, expiry())
            .await
            .unwrap();

        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].kind, AnomalyKind::IpConflict);
        assert!(outcome.conflicts[0]
            .subjects
            .contains(&mac(1).to_string()));
        assert!(outcome.conflicts[0]
            .subjects
            .contains(&mac(2).to_string()));

        assert!(store.active_binding_by_mac(mac(1)).await.unwrap().is_none());
        assert_eq!(
            registry.validate(mac(2), ip(10)).await.unwrap(),
            ValidateOutcome::Ok
        );
    }

    #[tokio::test]
    async fn test_validate_outcomes() {
        let (registry, _store) = registry();
        assert_eq!(
            registry.validate(mac(1), ip(10)).await.unwrap(),
            ValidateOutcome::NoBinding
        );

        registry
            .create_binding(mac(1), ip(10), None, expiry())
            .await
            .unwrap();
        assert_eq!(
            registry.validate(mac(1), ip(99)).await.unwrap(),
            ValidateOutcome::IpMismatch { expected: ip(10) }
        );

        // Expired lease.
        registry
            .create_binding(mac(2), ip(20), None, Utc::now() - Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(
            registry.validate(mac(2), ip(20)).await.unwrap(),
            ValidateOutcome::Expired
        );
    }

    #[tokio::test]
    async fn test_validate_mismatch_emits_binding_audit() {
        let store = Arc::new(MemoryStore::new());
        let (audit, _pump) = AuditSink::new(64);
        let registry = BindingRegistry::new(store as Arc<dyn Store>, audit.clone(), 5);
        let mut events = audit.subscribe();

        registry
            .create_binding(mac(1), ip(10), None, expiry())
            .await
            .unwrap();
        registry.validate(mac(1), ip(99)).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.category, AuditCategory::Binding);
        assert_eq!(event.severity, AuditSeverity::Warn);
        assert_eq!(event.action, "ip_mismatch");
    }

    #[tokio::test]
    async fn test_retirement_is_idempotent() {
        let (registry, _store) = registry();
        let session = SessionId::generate();
        registry
            .create_binding(mac(1), ip(10), Some(&session), expiry())
            .await
            .unwrap();

        registry
            .retire_by_session(&session, RetireReason::SessionEnded)
            .await
            .unwrap();
        registry
            .retire_by_session(&session, RetireReason::SessionEnded)
            .await
            .unwrap();
        registry
            .retire_by_mac(mac(1), RetireReason::Manual)
            .await
            .unwrap();

        assert_eq!(
            registry.validate(mac(1), ip(10)).await.unwrap(),
            ValidateOutcome::NoBinding
        );
    }

    #[tokio::test]
    async fn test_rapid_rebind_detection() {
        let (registry, _store) = registry();
        for n in 0..7u8 {
            registry
                .create_binding(mac(1), ip(10 + n), None, expiry())
                .await
                .unwrap();
        }
        let anomalies = registry.scan_anomalies(Utc::now()).await.unwrap();
        assert!(anomalies
            .iter()
            .any(|a| a.kind == AnomalyKind::RapidRebind));
    }

    #[tokio::test]
    async fn test_quiet_table_scans_clean() {
        let (registry, _store) = registry();
        registry
            .create_binding(mac(1), ip(10), None, expiry())
            .await
            .unwrap();
        let anomalies = registry.scan_anomalies(Utc::now()).await.unwrap();
        assert!(anomalies.is_empty());
    }
}
