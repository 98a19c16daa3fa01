//! Packet-filter rule model and enforcement backends for the portguard
//! captive-portal gateway.
//!
//! The crate is organized into several modules:
//!
//! - [`rules`]: Backend-agnostic filter rules, rule kinds and handles
//! - [`synth`]: Synthesizers that compile a client identity into rule lists
//! - [`backend`]: The [`Enforcer`] capability with its two implementations,
//!   an in-memory [`SimulatorEnforcer`] and a host-mutating
//!   [`NetfilterEnforcer`]
//! - [`shell`]: Quoted shell execution for the netfilter backend
//! - [`error`]: Error types shared across backends
//!
//! # Architecture
//!
//! Callers never branch on which backend they hold: both implement
//! [`Enforcer`], selected once at process construction. A backend keeps no
//! state across calls beyond the handles of rules it currently has
//! installed, so the durable record of intent lives entirely with the
//! caller.
//!
//! # Example
//!
//! ```
//! use portguard_enforcer::{synth, Enforcer, NetworkProfile, RuleKind, SimulatorEnforcer};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let net = NetworkProfile::default();
//! let mac = "aa:bb:cc:dd:ee:01".parse()?;
//! let rules = synth::compile(RuleKind::PortalRedirect, mac, None, &net)?;
//!
//! let enforcer = SimulatorEnforcer::new();
//! let outcome = enforcer.apply(&rules).await?;
//! assert!(outcome.status.is_ok());
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod error;
pub mod rules;
pub mod shell;
pub mod synth;

pub use backend::{
    ApplyOutcome, ApplyStatus, Enforcer, Fault, FaultMode, NetfilterEnforcer, RetractOutcome,
    SimulatorEnforcer, SimulatorStats, DEFAULT_DEADLINE,
};
pub use error::{EnforcerError, EnforcerResult};
pub use rules::{
    ArpMatch, Chain, FilterRule, InstalledRule, Match, RuleAction, RuleHandle, RuleKind, RuleLayer,
};
pub use synth::NetworkProfile;
