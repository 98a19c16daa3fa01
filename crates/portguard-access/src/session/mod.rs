//! Session lifecycle management.
//!
//! A session is the authenticated right of a MAC to egress for a bounded
//! duration. The [`SessionManager`] here is the only component that
//! mutates session and binding state; everything else reads.

mod manager;
mod types;

pub use manager::{GrantOutcome, GrantRequest, RevokeOutcome, RuleSummary, SessionManager};
pub use types::{RevokeReason, SessionRecord, SessionState};
