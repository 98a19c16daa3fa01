//! MAC-to-IP binding registry.
//!
//! A binding asserts that a MAC currently owns an IP lease, and the
//! guard rules enforce exactly that pair on the wire. The registry is
//! the authoritative map and the place conflicts and spoof indicators
//! are detected.

mod registry;
mod types;

pub use registry::{BindingRegistry, CreateBindingOutcome};
pub use types::{Anomaly, AnomalyKind, BindingRecord, BindingState, RetireReason, ValidateOutcome};
