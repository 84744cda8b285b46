//! Backing identity lookups used when a session is established or refreshed.

use sqlx::{PgPool, Row};
use std::{collections::HashMap, sync::RwLock};
use tracing::Instrument;
use uuid::Uuid;

use super::principal::Verification;
use crate::store::{StoreError, StoreFuture};

/// Identity row as stored. `email_verified` stays nullable here; it is only
/// interpreted through `Verification::from_flag`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityRecord {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub email_verified: Option<bool>,
}

impl IdentityRecord {
    #[must_use]
    pub fn verification(&self) -> Verification {
        Verification::from_flag(self.email_verified)
    }
}

pub trait IdentityStore: Send + Sync {
    fn lookup(&self, user_id: Uuid) -> StoreFuture<'_, Option<IdentityRecord>>;
}

#[derive(Clone, Debug)]
pub struct PostgresIdentityStore {
    pool: PgPool,
}

impl PostgresIdentityStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl IdentityStore for PostgresIdentityStore {
    fn lookup(&self, user_id: Uuid) -> StoreFuture<'_, Option<IdentityRecord>> {
        Box::pin(async move {
            let query = "SELECT id, email, display_name, email_verified FROM users WHERE id = $1";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SELECT",
                db.statement = query
            );
            let row = sqlx::query(query)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .instrument(span)
                .await?;

            row.map(|row| -> Result<IdentityRecord, StoreError> {
                Ok(IdentityRecord {
                    user_id: row.try_get("id")?,
                    email: row.try_get("email")?,
                    display_name: row.try_get("display_name")?,
                    email_verified: row.try_get("email_verified")?,
                })
            })
            .transpose()
        })
    }
}

/// Identity table kept in memory; used by tests and embedded setups.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    records: RwLock<HashMap<Uuid, IdentityRecord>>,
}

impl MemoryIdentityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    pub fn upsert(&self, record: IdentityRecord) {
        if let Ok(mut records) = self.records.write() {
            records.insert(record.user_id, record);
        }
    }

    /// Mark a user as verified; returns `false` for unknown users.
    pub fn mark_verified(&self, user_id: Uuid) -> bool {
        self.records.write().is_ok_and(|mut records| {
            records
                .get_mut(&user_id)
                .map(|record| record.email_verified = Some(true))
                .is_some()
        })
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn lookup(&self, user_id: Uuid) -> StoreFuture<'_, Option<IdentityRecord>> {
        Box::pin(async move {
            let records = self
                .records
                .read()
                .map_err(|_| StoreError::Unavailable("identity store lock poisoned".to_string()))?;
            Ok(records.get(&user_id).cloned())
        })
    }
}
