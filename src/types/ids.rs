//! Newtype wrappers for domain identifiers.
//!
//! Tenants, leads and payment intents are all UUIDs on the wire. Wrapping them
//! keeps a lead id from being passed where an org id is expected, which matters
//! for every tenant-scoped lookup in the ingestion path.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Error returned when a string is not a valid UUID for the named field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {value:?}")]
pub struct InvalidId {
    pub field: &'static str,
    pub value: String,
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $field:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Parses the identifier from its textual form, trimming whitespace.
            pub fn parse(s: &str) -> Result<Self, InvalidId> {
                Uuid::parse_str(s.trim()).map($name).map_err(|_| InvalidId {
                    field: $field,
                    value: s.to_string(),
                })
            }

            pub fn new_v4() -> Self {
                $name(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                $name(id)
            }
        }
    };
}

uuid_id!(
    /// A clinic tenant.
    OrgId,
    "org_id"
);

uuid_id!(
    /// A prospective patient record owned by a tenant.
    LeadId,
    "lead_id"
);

uuid_id!(
    /// A deposit intent (the local payment row a checkout was created for).
    PaymentId,
    "booking_intent_id"
);

/// A provider-assigned event identifier, trimmed of surrounding whitespace.
///
/// Providers redeliver the same event with the same id, so this is the input
/// to the idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Creates an event id, returning `None` when the trimmed value is empty.
    pub fn new(s: impl AsRef<str>) -> Option<Self> {
        let trimmed = s.as_ref().trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(EventId(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_padded_uuid() {
        let raw = " 0b5e8c6a-3a4d-4f7e-9b61-2f8a4a1f3c11 ";
        let id = LeadId::parse(raw).unwrap();
        assert_eq!(id.to_string(), raw.trim());
    }

    #[test]
    fn parse_error_names_field() {
        let err = OrgId::parse("not-a-uuid").unwrap_err();
        assert_eq!(err.field, "org_id");
        assert_eq!(err.value, "not-a-uuid");
        assert!(err.to_string().contains("org_id"));
    }

    #[test]
    fn payment_id_reports_booking_intent_field() {
        let err = PaymentId::parse("").unwrap_err();
        assert_eq!(err.field, "booking_intent_id");
    }

    #[test]
    fn event_id_rejects_blank() {
        assert!(EventId::new("").is_none());
        assert!(EventId::new("   ").is_none());
        assert_eq!(EventId::new(" evt_1 ").unwrap().as_str(), "evt_1");
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = OrgId::new_v4();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: OrgId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
