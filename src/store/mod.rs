//! Backing key/value store shared by the CSRF guard and the rate limiter.
//!
//! Flow Overview:
//! - Components never talk to a database directly; they receive an
//!   `Arc<dyn TokenStore>` at construction time.
//! - Every key is namespaced (`csrf:` / `ratelimit:`) so the two subsystems
//!   can share one table space without collisions.
//! - Read-check-write sequences that must be race-free across processes
//!   (`get_or_insert_token`, `hit_counter`) are single store operations.
//!
//! Each call is bounded by `with_timeout`; callers decide whether a
//! `StoreError` fails open or closed.

pub mod memory;
pub mod postgres;

use chrono::{DateTime, TimeDelta, Utc};
use std::{fmt, future::Future, pin::Pin, time::Duration};

pub use memory::MemoryTokenStore;
pub use postgres::PostgresTokenStore;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Subsystem owning a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Namespace {
    Csrf,
    RateLimit,
}

impl Namespace {
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Csrf => "csrf",
            Self::RateLimit => "ratelimit",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StoreKey {
    namespace: Namespace,
    id: String,
}

impl StoreKey {
    #[must_use]
    pub fn new(namespace: Namespace, id: impl Into<String>) -> Self {
        Self {
            namespace,
            id: id.into(),
        }
    }

    #[must_use]
    pub fn csrf(session_id: &str) -> Self {
        Self::new(Namespace::Csrf, session_id)
    }

    #[must_use]
    pub fn rate_limit(identifier: &str) -> Self {
        Self::new(Namespace::RateLimit, identifier)
    }

    #[must_use]
    pub fn namespace(&self) -> Namespace {
        self.namespace
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace.prefix(), self.id)
    }
}

/// A stored secret with a lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenRecord {
    pub value: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TokenRecord {
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Counter state returned by `hit_counter` after the atomic update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterState {
    pub count: u32,
    pub window_start: DateTime<Utc>,
    pub reset_at: DateTime<Utc>,
}

/// Rows removed by a sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub tokens: u64,
    pub counters: u64,
}

pub trait TokenStore: Send + Sync {
    /// Fetch a token record, expired or not.
    fn get_token<'a>(&'a self, key: &'a StoreKey) -> StoreFuture<'a, Option<TokenRecord>>;

    /// Return the live record for `key`, or store `candidate` when the key is
    /// absent or expired. Atomic with respect to concurrent callers.
    fn get_or_insert_token<'a>(
        &'a self,
        key: &'a StoreKey,
        candidate: &'a TokenRecord,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, TokenRecord>;

    /// Replace whatever is stored under `key`.
    fn put_token<'a>(&'a self, key: &'a StoreKey, record: &'a TokenRecord) -> StoreFuture<'a, ()>;

    /// Returns `true` when a record was removed.
    fn delete_token<'a>(&'a self, key: &'a StoreKey) -> StoreFuture<'a, bool>;

    /// Atomic upsert-and-increment for fixed window counting.
    ///
    /// A missing or expired counter restarts at 1 with `reset_at = now + window`.
    /// A live counter is incremented but saturates at `max + 1`, so the caller
    /// admits the request iff the returned `count <= max`.
    fn hit_counter<'a>(
        &'a self,
        key: &'a StoreKey,
        window: Duration,
        max: u32,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, CounterState>;

    /// Delete expired tokens and counters.
    fn purge_expired(&self, now: DateTime<Utc>) -> StoreFuture<'_, PurgeReport>;

    fn ping(&self) -> StoreFuture<'_, ()>;
}

/// Bound a store call; elapsed deadlines become `StoreError::Timeout`.
///
/// # Errors
/// Returns the inner error or `StoreError::Timeout`.
pub async fn with_timeout<T, F>(limit: Duration, future: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// Longest window or TTL accepted anywhere in the gate (ten years).
pub const MAX_WINDOW: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Convert a configured window into a chrono delta, capped at `MAX_WINDOW`.
#[must_use]
pub fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration.min(MAX_WINDOW)).unwrap_or(TimeDelta::zero())
}

/// `now + duration`, saturating at the largest representable instant.
#[must_use]
pub fn deadline(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now.checked_add_signed(delta(duration)).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
