//! Structured audit event sink.
//!
//! Producers on the hot path never block: records go through a bounded
//! channel and are rendered to `tracing` by a drain task. When the buffer
//! is full the newest record is dropped and counted, which keeps grant
//! latency independent of log throughput. A broadcast side-channel lets
//! consumers (the operator console, anomaly watchers, tests) subscribe to
//! the event stream without any producer knowing about them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Audit event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCategory {
    /// Authentication results reaching the access plane.
    Auth,
    /// Session lifecycle transitions.
    Session,
    /// Binding creation, retirement and validation.
    Binding,
    /// Rule apply/retract outcomes.
    Rule,
    /// Spoof and conflict detections.
    Anomaly,
    /// Operator actions.
    Admin,
    /// Process lifecycle and reconciliation.
    System,
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditCategory::Auth => "AUTH",
            AuditCategory::Session => "SESSION",
            AuditCategory::Binding => "BINDING",
            AuditCategory::Rule => "RULE",
            AuditCategory::Anomaly => "ANOMALY",
            AuditCategory::Admin => "ADMIN",
            AuditCategory::System => "SYSTEM",
        };
        write!(f, "{}", s)
    }
}

/// Severity of an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditSeverity {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

/// A structured audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    pub severity: AuditSeverity,
    /// What happened, e.g. `session_activated`.
    pub action: String,
    /// Primary subject identifier (MAC, session id, ledger id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Free-form structured context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Failure detail when the record describes one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditRecord {
    /// Creates a record stamped with the current time.
    pub fn new(
        category: AuditCategory,
        severity: AuditSeverity,
        action: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            severity,
            action: action.into(),
            subject: None,
            details: None,
            error: None,
        }
    }

    /// Sets the primary subject identifier.
    pub fn with_subject(mut self, subject: impl fmt::Display) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    /// Attaches structured context.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Records a failure detail.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Serializes the record for sinks that want one line of JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"error":"serialization_failed","message":"{}"}}"#, e))
    }
}

struct SinkInner {
    tx: mpsc::Sender<AuditRecord>,
    events: broadcast::Sender<AuditRecord>,
    dropped: AtomicU64,
}

/// Handle for emitting audit records. Cheap to clone; every component
/// holds one.
#[derive(Clone)]
pub struct AuditSink {
    inner: Arc<SinkInner>,
}

impl AuditSink {
    /// Creates a sink with the given buffer capacity and the drain task
    /// that renders records to `tracing`.
    pub fn new(buffer: usize) -> (AuditSink, AuditPump) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (events, _) = broadcast::channel(buffer.max(1));
        let sink = AuditSink {
            inner: Arc::new(SinkInner {
                tx,
                events,
                dropped: AtomicU64::new(0),
            }),
        };
        (sink, AuditPump { rx })
    }

    /// Emits a record without blocking. On a full buffer the record is
    /// dropped and counted.
    pub fn emit(&self, record: AuditRecord) {
        // Subscribers see the record even when the drain buffer is full;
        // a lagging subscriber only loses its own backlog.
        let _ = self.inner.events.send(record.clone());

        if self.inner.tx.try_send(record).is_err() {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Subscribes to the live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.inner.events.subscribe()
    }

    /// Number of records dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// Drain half of the sink: renders queued records through `tracing`.
pub struct AuditPump {
    rx: mpsc::Receiver<AuditRecord>,
}

impl AuditPump {
    /// Runs until every sink handle is dropped and the queue is empty.
    pub async fn run(mut self) {
        while let Some(record) = self.rx.recv().await {
            let json = record.to_json();
            match record.severity {
                AuditSeverity::Debug => debug!(
                    target: "audit",
                    category = %record.category,
                    action = %record.action,
                    audit_json = %json,
                    "AUDIT: {} - {}", record.category, record.action
                ),
                AuditSeverity::Info => info!(
                    target: "audit",
                    category = %record.category,
                    action = %record.action,
                    audit_json = %json,
                    "AUDIT: {} - {}", record.category, record.action
                ),
                AuditSeverity::Warn => warn!(
                    target: "audit",
                    category = %record.category,
                    action = %record.action,
                    audit_json = %json,
                    "AUDIT: {} - {}", record.category, record.action
                ),
                AuditSeverity::Error | AuditSeverity::Critical => error!(
                    target: "audit",
                    category = %record.category,
                    action = %record.action,
                    audit_json = %json,
                    "AUDIT: {} - {}", record.category, record.action
                ),
            }
        }
    }
}
