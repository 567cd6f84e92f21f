//! Identifiers and caller identity.
//!
//! Ids are validated on construction so that malformed input is caught at the
//! edge as [`AdmissionError::Validation`] instead of being stored.

use crate::error::AdmissionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Longest accepted textual id, in bytes.
pub const MAX_ID_LEN: usize = 128;

fn check_id(field: &'static str, raw: &str) -> Result<(), AdmissionError> {
    if raw.is_empty() {
        return Err(AdmissionError::validation(field, "must not be empty"));
    }
    if raw.len() > MAX_ID_LEN {
        return Err(AdmissionError::validation(
            field,
            format!("must be at most {MAX_ID_LEN} bytes (got {})", raw.len()),
        ));
    }
    if raw.chars().any(|c| c.is_control() || c.is_whitespace()) {
        let reason = "must not contain whitespace or control characters";
        return Err(AdmissionError::validation(field, reason));
    }
    Ok(())
}

macro_rules! text_id {
    ($(#[$meta:meta])* $name:ident, $field:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap a raw id.
            pub fn new(raw: impl Into<String>) -> Result<Self, AdmissionError> {
                let raw = raw.into();
                check_id($field, &raw)?;
                Ok(Self(raw))
            }

            /// Borrow the raw id.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = AdmissionError;

            fn try_from(raw: String) -> Result<Self, Self::Error> {
                Self::new(raw)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = AdmissionError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Self::new(raw)
            }
        }
    };
}

text_id!(
    /// Tenant (care circle) boundary. Every stored record is partitioned by it.
    TenantId,
    "tenant_id"
);
text_id!(
    /// A human or service account acting inside a tenant.
    ActorId,
    "actor_id"
);
text_id!(
    /// Metered resource kind, e.g. `video_storage_bytes`.
    ResourceType,
    "resource_type"
);
text_id!(
    /// Rate-limited endpoint name, e.g. `upload.create`.
    Endpoint,
    "endpoint"
);

/// Reservation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationId(Uuid);

impl ReservationId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse the hyphenated form.
    pub fn parse(raw: &str) -> Result<Self, AdmissionError> {
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|e| AdmissionError::validation("reservation_id", e.to_string()))
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Access token identifier (not the secret).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId(Uuid);

impl TokenId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse the hyphenated form.
    pub fn parse(raw: &str) -> Result<Self, AdmissionError> {
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|e| AdmissionError::validation("token_id", e.to_string()))
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who is calling.
///
/// Trusted internal callers (janitors, webhooks finishing an upload) must say
/// so with [`Actor::System`]; there is no "anonymous means trusted" path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    /// An end user or service account, subject to ownership checks.
    User(ActorId),
    /// The trusted system actor. Bypasses ownership checks on Confirm/Release.
    System,
}

impl Actor {
    /// Shorthand for a validated user actor.
    pub fn user(raw: impl Into<String>) -> Result<Self, AdmissionError> {
        ActorId::new(raw).map(Actor::User)
    }

    /// Check if this is the explicit system actor.
    pub fn is_system(&self) -> bool {
        matches!(self, Actor::System)
    }

    /// The user id, if any.
    pub fn user_id(&self) -> Option<&ActorId> {
        match self {
            Actor::User(id) => Some(id),
            Actor::System => None,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user:{}", id),
            Actor::System => f.write_str("system"),
        }
    }
}
