//! `PostgreSQL` backed `TokenStore`.
//!
//! Scaling: every instance of the service points at the same database, so the
//! atomic statements below are what keep limits and tokens consistent across
//! the cluster. No statement is split into read-then-write.

use chrono::{DateTime, Utc};
use sqlx::{Connection, PgPool, Row};
use std::time::Duration;
use tracing::{Instrument, info_span};

use super::{
    CounterState, PurgeReport, StoreError, StoreFuture, StoreKey, TokenRecord, TokenStore,
    deadline,
};

#[derive(Clone, Debug)]
pub struct PostgresTokenStore {
    pool: PgPool,
}

impl PostgresTokenStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_span(operation: &'static str, statement: &'static str) -> tracing::Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn counter_from_row(row: &sqlx::postgres::PgRow) -> Result<CounterState, StoreError> {
    let count: i32 = row.try_get("count")?;
    Ok(CounterState {
        count: u32::try_from(count).unwrap_or(0),
        window_start: row.try_get("window_start")?,
        reset_at: row.try_get("reset_at")?,
    })
}

fn token_from_row(row: &sqlx::postgres::PgRow) -> Result<TokenRecord, StoreError> {
    Ok(TokenRecord {
        value: row.try_get("value")?,
        issued_at: row.try_get("issued_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

impl TokenStore for PostgresTokenStore {
    fn get_token<'a>(&'a self, key: &'a StoreKey) -> StoreFuture<'a, Option<TokenRecord>> {
        Box::pin(async move {
            let query = "SELECT value, issued_at, expires_at FROM gate_tokens WHERE key = $1";
            let row = sqlx::query(query)
                .bind(key.to_string())
                .fetch_optional(&self.pool)
                .instrument(db_span("SELECT", query))
                .await?;
            row.as_ref().map(token_from_row).transpose()
        })
    }

    fn get_or_insert_token<'a>(
        &'a self,
        key: &'a StoreKey,
        candidate: &'a TokenRecord,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, TokenRecord> {
        Box::pin(async move {
            // The conflict branch keeps a live row untouched and swaps in the
            // candidate only when the stored token has expired.
            let query = r"
                INSERT INTO gate_tokens AS t (key, value, issued_at, expires_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (key) DO UPDATE SET
                    value = CASE WHEN t.expires_at <= $5 THEN EXCLUDED.value ELSE t.value END,
                    issued_at = CASE WHEN t.expires_at <= $5 THEN EXCLUDED.issued_at ELSE t.issued_at END,
                    expires_at = CASE WHEN t.expires_at <= $5 THEN EXCLUDED.expires_at ELSE t.expires_at END
                RETURNING value, issued_at, expires_at
            ";
            let row = sqlx::query(query)
                .bind(key.to_string())
                .bind(&candidate.value)
                .bind(candidate.issued_at)
                .bind(candidate.expires_at)
                .bind(now)
                .fetch_one(&self.pool)
                .instrument(db_span("UPSERT", query))
                .await?;
            token_from_row(&row)
        })
    }

    fn put_token<'a>(&'a self, key: &'a StoreKey, record: &'a TokenRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let query = r"
                INSERT INTO gate_tokens (key, value, issued_at, expires_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (key) DO UPDATE SET
                    value = EXCLUDED.value,
                    issued_at = EXCLUDED.issued_at,
                    expires_at = EXCLUDED.expires_at
            ";
            sqlx::query(query)
                .bind(key.to_string())
                .bind(&record.value)
                .bind(record.issued_at)
                .bind(record.expires_at)
                .execute(&self.pool)
                .instrument(db_span("UPSERT", query))
                .await?;
            Ok(())
        })
    }

    fn delete_token<'a>(&'a self, key: &'a StoreKey) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let query = "DELETE FROM gate_tokens WHERE key = $1";
            let result = sqlx::query(query)
                .bind(key.to_string())
                .execute(&self.pool)
                .instrument(db_span("DELETE", query))
                .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn hit_counter<'a>(
        &'a self,
        key: &'a StoreKey,
        window: Duration,
        max: u32,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, CounterState> {
        Box::pin(async move {
            // ON CONFLICT takes a row lock, so concurrent hits for the same key
            // serialize here instead of racing on a read.
            let query = r"
                INSERT INTO gate_counters AS c (key, count, window_start, reset_at)
                VALUES ($1, 1, $2, $3)
                ON CONFLICT (key) DO UPDATE SET
                    count = CASE WHEN c.reset_at <= $2 THEN 1 ELSE LEAST(c.count + 1, $4) END,
                    window_start = CASE WHEN c.reset_at <= $2 THEN $2 ELSE c.window_start END,
                    reset_at = CASE WHEN c.reset_at <= $2 THEN $3 ELSE c.reset_at END
                RETURNING count, window_start, reset_at
            ";
            let ceiling = i32::try_from(max.saturating_add(1)).unwrap_or(i32::MAX);
            let row = sqlx::query(query)
                .bind(key.to_string())
                .bind(now)
                .bind(deadline(now, window))
                .bind(ceiling)
                .fetch_one(&self.pool)
                .instrument(db_span("UPSERT", query))
                .await?;
            counter_from_row(&row)
        })
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> StoreFuture<'_, PurgeReport> {
        Box::pin(async move {
            let tokens_query = "DELETE FROM gate_tokens WHERE expires_at <= $1";
            let tokens = sqlx::query(tokens_query)
                .bind(now)
                .execute(&self.pool)
                .instrument(db_span("DELETE", tokens_query))
                .await?
                .rows_affected();

            let counters_query = "DELETE FROM gate_counters WHERE reset_at <= $1";
            let counters = sqlx::query(counters_query)
                .bind(now)
                .execute(&self.pool)
                .instrument(db_span("DELETE", counters_query))
                .await?
                .rows_affected();

            Ok(PurgeReport { tokens, counters })
        })
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let acquire_span = info_span!(
                "db.acquire",
                db.system = "postgresql",
                db.operation = "ACQUIRE"
            );
            let mut conn = self.pool.acquire().instrument(acquire_span).await?;
            let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
            conn.ping().instrument(ping_span).await?;
            Ok(())
        })
    }
}
