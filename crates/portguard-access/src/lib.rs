//! Access-control plane for the portguard captive-portal gateway.
//!
//! This crate turns authentication events into coordinated packet-filter
//! transitions and keeps three mutable stores consistent with each other
//! and with the enforcement backend:
//!
//! - [`session`]: the session lifecycle manager and its state machine
//! - [`binding`]: the authoritative MAC-to-IP map with spoof analytics
//! - [`ledger`]: the write-ahead record of every rule the gateway intends
//!   to have installed
//! - [`device`]: per-MAC device history and operator blocks
//! - [`reconcile`]: the periodic loop that expires sessions and closes
//!   the gap between ledger intent and backend reality
//! - [`audit`]: the bounded, non-blocking event sink
//! - [`control`]: the operator-facing API surface the HTTP facade binds to
//! - [`store`]: the persistence capability (in-memory and Redis backends)
//!
//! # Ownership
//!
//! The [`session::SessionManager`] exclusively owns mutation of session
//! and binding state. The enforcement backend owns the live rule plane.
//! The ledger is written by both sides of an operation: the manager
//! records intent before the backend is asked to act, and the outcome is
//! recorded after. Reconciliation bridges the two when a step in between
//! fails or the process dies.

pub mod audit;
pub mod binding;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod reconcile;
pub mod session;
pub mod store;

pub use audit::{AuditCategory, AuditPump, AuditRecord, AuditSeverity, AuditSink};
pub use binding::{Anomaly, AnomalyKind, BindingRecord, BindingRegistry, BindingState, ValidateOutcome};
pub use config::{Config, ConfigError, EnforcerMode, StoreMode};
pub use control::{ControlApi, ControlFault, Operator};
pub use device::{DeviceRecord, DeviceRegistry};
pub use error::{AccessError, AccessResult, ErrorCategory};
pub use ledger::{LedgerOp, LedgerRecord, LedgerState};
pub use reconcile::{CycleReport, Reconciler};
pub use session::{
    GrantOutcome, GrantRequest, RevokeOutcome, RevokeReason, RuleSummary, SessionManager,
    SessionRecord, SessionState,
};
pub use store::{MemoryStore, RedisStore, Store, StoreError, WriteBatch};
