//! Opaque record identifiers.
//!
//! All identifiers are random (UUIDv4) behind a short type prefix, so ids
//! from different tables can never be confused in logs or store keys, and
//! nothing downstream can rely on allocation order.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generates a fresh random identifier.
            pub fn generate() -> Self {
                $name(format!("{}-{}", $prefix, uuid::Uuid::new_v4()))
            }

            /// Wraps an identifier read back from the store.
            pub fn from_string(s: impl Into<String>) -> Self {
                $name(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

opaque_id!(
    /// Identifier of an access session.
    SessionId,
    "ses"
);

opaque_id!(
    /// Identifier of a MAC-to-IP binding.
    BindingId,
    "bnd"
);

opaque_id!(
    /// Identifier of a rule-ledger row.
    LedgerId,
    "led"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_unique_and_prefixed() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("ses-"));
        assert!(BindingId::generate().as_str().starts_with("bnd-"));
        assert!(LedgerId::generate().as_str().starts_with("led-"));
    }

    #[test]
    fn test_round_trip_through_store_form() {
        let id = LedgerId::generate();
        let copy = LedgerId::from_string(id.as_str());
        assert_eq!(id, copy);
    }
}
