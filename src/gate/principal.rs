//! Authenticated principal and its verification state.
//!
//! Verification is a two-state enum instead of a nullable flag: there is no
//! value that means "unknown", so an unset field can only ever land on
//! `Unverified`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Whether the principal completed the out-of-band contact verification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Verification {
    #[default]
    Unverified,
    Verified,
}

impl Verification {
    /// Map a nullable database flag. Only `Some(true)` verifies.
    #[must_use]
    pub const fn from_flag(flag: Option<bool>) -> Self {
        match flag {
            Some(true) => Self::Verified,
            Some(false) | None => Self::Unverified,
        }
    }

    /// Map an arbitrary JSON value. Only the literal `true` verifies; strings,
    /// numbers, `null` and objects are all unverified.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(true) => Self::Verified,
            _ => Self::Unverified,
        }
    }

    #[must_use]
    pub const fn is_verified(self) -> bool {
        matches!(self, Self::Verified)
    }
}

impl Serialize for Verification {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(self.is_verified())
    }
}

impl<'de> Deserialize<'de> for Verification {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(Self::from_json(&value))
    }
}

/// Snapshot of the identity attached to a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Uuid,
    pub session_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub verification: Verification,
}

impl Principal {
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.verification.is_verified()
    }
}
