//! Redis store backend.
//!
//! Records are stored as one JSON value per key under the `pg:` prefix,
//! with set-based secondary indexes for the lookups the access plane
//! needs (active binding per MAC and per IP, ledger rows per session and
//! per state). A commit executes as one `MULTI`/`EXEC` pipeline, so a
//! batch lands atomically.

use super::{Store, StoreError, StoreResult, WriteBatch};
use crate::binding::{BindingRecord, BindingState};
use crate::device::DeviceRecord;
use crate::ledger::{LedgerRecord, LedgerState};
use crate::session::{SessionRecord, SessionState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use portguard_enforcer::RuleKind;
use portguard_types::{BindingId, Ipv4Address, LedgerId, MacAddress, SessionId};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

const SESSION_KEY: &str = "pg:sessions";
const BINDING_KEY: &str = "pg:bindings";
const LEDGER_KEY: &str = "pg:ledger";
const DEVICE_KEY: &str = "pg:devices";

const LEDGER_STATES: [LedgerState; 5] = [
    LedgerState::Pending,
    LedgerState::Applied,
    LedgerState::Retracted,
    LedgerState::Failed,
    LedgerState::Dead,
];

fn state_tag(state: LedgerState) -> &'static str {
    match state {
        LedgerState::Pending => "PENDING",
        LedgerState::Applied => "APPLIED",
        LedgerState::Retracted => "RETRACTED",
        LedgerState::Failed => "FAILED",
        LedgerState::Dead => "DEAD",
    }
}

/// The Redis-backed [`Store`] implementation.
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connects to the given Redis endpoint.
    pub async fn connect(host: &str, port: u16) -> StoreResult<Self> {
        let uri = format!("redis://{}:{}/", host, port);
        let client = redis::Client::open(uri.clone())
            .map_err(|e| StoreError::backend(format!("{}: {}", uri, e)))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::backend(format!("connection manager: {}", e)))?;
        info!(host, port, "connected to redis store");
        Ok(Self { conn })
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| StoreError::backend(format!("GET {}: {}", key, e)))?;
        raw.map(|s| serde_json::from_str(&s).map_err(StoreError::from))
            .transpose()
    }

    async fn get_members<T: DeserializeOwned>(
        &self,
        index_key: &str,
        record_key: impl Fn(&str) -> String,
    ) -> StoreResult<Vec<T>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(index_key)
            .await
            .map_err(|e| StoreError::backend(format!("SMEMBERS {}: {}", index_key, e)))?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get_json(&record_key(&id)).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn encode<T: Serialize>(record: &T) -> StoreResult<String> {
        serde_json::to_string(record).map_err(StoreError::from)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn session(&self, id: &SessionId) -> StoreResult<Option<SessionRecord>> {
        self.get_json(&format!("{}:{}", SESSION_KEY, id)).await
    }

    async fn unfinished_session_by_mac(
        &self,
        mac: MacAddress,
    ) -> StoreResult<Option<SessionRecord>> {
        let mut conn = self.conn.clone();
        let key = format!("{}:unfinished:{}", SESSION_KEY, mac);
        let id: Option<String> = conn
            .get(&key)
            .await
            .map_err(|e| StoreError::backend(format!("GET {}: {}", key, e)))?;
        let Some(id) = id else { return Ok(None) };

        let session: Option<SessionRecord> =
            self.get_json(&format!("{}:{}", SESSION_KEY, id)).await?;
        Ok(session.filter(|s| {
            matches!(s.state, SessionState::Pending | SessionState::Active)
        }))
    }

    async fn sessions_in_state(&self, state: SessionState) -> StoreResult<Vec<SessionRecord>> {
        let sessions: Vec<SessionRecord> = self
            .get_members(SESSION_KEY, |id| format!("{}:{}", SESSION_KEY, id))
            .await?;
        Ok(sessions.into_iter().filter(|s| s.state == state).collect())
    }

    async fn binding(&self, id: &BindingId) -> StoreResult<Option<BindingRecord>> {
        self.get_json(&format!("{}:{}", BINDING_KEY, id)).await
    }

    async fn active_binding_by_mac(&self, mac: MacAddress) -> StoreResult<Option<BindingRecord>> {
        let mut conn = self.conn.clone();
        let key = format!("{}:active_mac:{}", BINDING_KEY, mac);
        let id: Option<String> = conn
            .get(&key)
            .await
            .map_err(|e| StoreError::backend(format!("GET {}: {}", key, e)))?;
        let Some(id) = id else { return Ok(None) };
        let binding: Option<BindingRecord> =
            self.get_json(&format!("{}:{}", BINDING_KEY, id)).await?;
        Ok(binding.filter(|b| b.state == BindingState::Active))
    }

    async fn active_binding_by_ip(&self, ip: Ipv4Address) -> StoreResult<Option<BindingRecord>> {
        let mut conn = self.conn.clone();
        let key = format!("{}:active_ip:{}", BINDING_KEY, ip);
        let id: Option<String> = conn
            .get(&key)
            .await
            .map_err(|e| StoreError::backend(format!("GET {}: {}", key, e)))?;
        let Some(id) = id else { return Ok(None) };
        let binding: Option<BindingRecord> =
            self.get_json(&format!("{}:{}", BINDING_KEY, id)).await?;
        Ok(binding.filter(|b| b.state == BindingState::Active))
    }

    async fn bindings_for_session(&self, id: &SessionId) -> StoreResult<Vec<BindingRecord>> {
        self.get_members(&format!("{}:session:{}", BINDING_KEY, id), |bid| {
            format!("{}:{}", BINDING_KEY, bid)
        })
        .await
    }

    async fn bindings(&self, include_retired: bool) -> StoreResult<Vec<BindingRecord>> {
        let bindings: Vec<BindingRecord> = self
            .get_members(BINDING_KEY, |id| format!("{}:{}", BINDING_KEY, id))
            .await?;
        Ok(bindings
            .into_iter()
            .filter(|b| include_retired || b.state == BindingState::Active)
            .collect())
    }

    async fn bindings_created_since(
        &self,
        mac: MacAddress,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<BindingRecord>> {
        let bindings: Vec<BindingRecord> = self
            .get_members(&format!("{}:mac:{}", BINDING_KEY, mac), |id| {
                format!("{}:{}", BINDING_KEY, id)
            })
            .await?;
        Ok(bindings
            .into_iter()
            .filter(|b| b.created_at >= since)
            .collect())
    }

    async fn ledger_entry(&self, id: &LedgerId) -> StoreResult<Option<LedgerRecord>> {
        self.get_json(&format!("{}:{}", LEDGER_KEY, id)).await
    }

    async fn ledger_for_session(&self, id: &SessionId) -> StoreResult<Vec<LedgerRecord>> {
        self.get_members(&format!("{}:session:{}", LEDGER_KEY, id), |lid| {
            format!("{}:{}", LEDGER_KEY, lid)
        })
        .await
    }

    async fn ledger_in_state(&self, state: LedgerState) -> StoreResult<Vec<LedgerRecord>> {
        self.get_members(
            &format!("{}:state:{}", LEDGER_KEY, state_tag(state)),
            |id| format!("{}:{}", LEDGER_KEY, id),
        )
        .await
    }

    async fn ledger_by_mac_kind(
        &self,
        mac: MacAddress,
        kind: RuleKind,
        state: LedgerState,
    ) -> StoreResult<Vec<LedgerRecord>> {
        let rows = self.ledger_in_state(state).await?;
        Ok(rows
            .into_iter()
            .filter(|r| r.mac == mac && r.kind == kind)
            .collect())
    }

    async fn device(&self, mac: MacAddress) -> StoreResult<Option<DeviceRecord>> {
        self.get_json(&format!("{}:{}", DEVICE_KEY, mac)).await
    }

    async fn devices(&self) -> StoreResult<Vec<DeviceRecord>> {
        self.get_members(DEVICE_KEY, |mac| format!("{}:{}", DEVICE_KEY, mac))
            .await
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();

        for session in &batch.sessions {
            pipe.set(
                format!("{}:{}", SESSION_KEY, session.id),
                Self::encode(session)?,
            )
            .ignore();
            pipe.sadd(SESSION_KEY, session.id.as_str()).ignore();

            let mac_key = format!("{}:unfinished:{}", SESSION_KEY, session.mac);
            if matches!(session.state, SessionState::Pending | SessionState::Active) {
                pipe.set(mac_key, session.id.as_str()).ignore();
            } else {
                // The lookup re-validates state, so an unconditional DEL of
                // a pointer that might already name a newer session is
                // avoided by checking first.
                let current: Option<String> = conn
                    .get(&mac_key)
                    .await
                    .map_err(|e| StoreError::backend(format!("GET {}: {}", mac_key, e)))?;
                if current.as_deref() == Some(session.id.as_str()) {
                    pipe.del(mac_key).ignore();
                }
            }
        }

        for binding in &batch.bindings {
            pipe.set(
                format!("{}:{}", BINDING_KEY, binding.id),
                Self::encode(binding)?,
            )
            .ignore();
            pipe.sadd(BINDING_KEY, binding.id.as_str()).ignore();
            pipe.sadd(
                format!("{}:mac:{}", BINDING_KEY, binding.mac),
                binding.id.as_str(),
            )
            .ignore();
            if let Some(session) = &binding.session {
                pipe.sadd(
                    format!("{}:session:{}", BINDING_KEY, session),
                    binding.id.as_str(),
                )
                .ignore();
            }

            let mac_key = format!("{}:active_mac:{}", BINDING_KEY, binding.mac);
            let ip_key = format!("{}:active_ip:{}", BINDING_KEY, binding.ip);
            if binding.state == BindingState::Active {
                pipe.set(mac_key, binding.id.as_str()).ignore();
                pipe.set(ip_key, binding.id.as_str()).ignore();
            } else {
                for key in [mac_key, ip_key] {
                    let current: Option<String> = conn
                        .get(&key)
                        .await
                        .map_err(|e| StoreError::backend(format!("GET {}: {}", key, e)))?;
                    if current.as_deref() == Some(binding.id.as_str()) {
                        pipe.del(key).ignore();
                    }
                }
            }
        }

        for row in &batch.ledger {
            pipe.set(format!("{}:{}", LEDGER_KEY, row.id), Self::encode(row)?)
                .ignore();
            pipe.sadd(LEDGER_KEY, row.id.as_str()).ignore();
            if let Some(session) = &row.session {
                pipe.sadd(
                    format!("{}:session:{}", LEDGER_KEY, session),
                    row.id.as_str(),
                )
                .ignore();
            }
            // State index: drop the row from every state set except its
            // current one, then add it there.
            for state in LEDGER_STATES {
                let key = format!("{}:state:{}", LEDGER_KEY, state_tag(state));
                if state == row.state {
                    pipe.sadd(key, row.id.as_str()).ignore();
                } else {
                    pipe.srem(key, row.id.as_str()).ignore();
                }
            }
        }

        for device in &batch.devices {
            pipe.set(
                format!("{}:{}", DEVICE_KEY, device.mac),
                Self::encode(device)?,
            )
            .ignore();
            pipe.sadd(DEVICE_KEY, device.mac.to_string()).ignore();
        }

        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StoreError::backend(format!("EXEC: {}", e)))?;
        Ok(())
    }
}
