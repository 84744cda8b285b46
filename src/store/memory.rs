//! In-process `TokenStore` for single-instance deployments and tests.
//!
//! Atomicity comes from a `std::sync::Mutex`; the lock is never held across
//! an await point. It does not coordinate across processes.

use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use super::{
    CounterState, PurgeReport, StoreError, StoreFuture, StoreKey, TokenRecord, TokenStore,
    deadline,
};

#[derive(Debug, Default)]
struct State {
    tokens: HashMap<StoreKey, TokenRecord>,
    counters: HashMap<StoreKey, CounterState>,
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    state: Mutex<State>,
    offline: AtomicBool,
}

impl MemoryTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `StoreError::Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of counters currently held, expired ones included.
    #[must_use]
    pub fn counter_len(&self) -> usize {
        self.lock().map_or(0, |state| state.counters.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl TokenStore for MemoryTokenStore {
    fn get_token<'a>(&'a self, key: &'a StoreKey) -> StoreFuture<'a, Option<TokenRecord>> {
        Box::pin(async move {
            let state = self.lock()?;
            Ok(state.tokens.get(key).cloned())
        })
    }

    fn get_or_insert_token<'a>(
        &'a self,
        key: &'a StoreKey,
        candidate: &'a TokenRecord,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, TokenRecord> {
        Box::pin(async move {
            let mut state = self.lock()?;
            if let Some(existing) = state.tokens.get(key)
                && existing.is_live(now)
            {
                return Ok(existing.clone());
            }
            state.tokens.insert(key.clone(), candidate.clone());
            Ok(candidate.clone())
        })
    }

    fn put_token<'a>(&'a self, key: &'a StoreKey, record: &'a TokenRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.lock()?;
            state.tokens.insert(key.clone(), record.clone());
            Ok(())
        })
    }

    fn delete_token<'a>(&'a self, key: &'a StoreKey) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.lock()?;
            Ok(state.tokens.remove(key).is_some())
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
            let mut state = self.lock()?;
            let next = match state.counters.get(key) {
                Some(counter) if counter.reset_at > now => CounterState {
                    count: counter.count.saturating_add(1).min(max.saturating_add(1)),
                    ..*counter
                },
                _ => CounterState {
                    count: 1,
                    window_start: now,
                    reset_at: deadline(now, window),
                },
            };
            state.counters.insert(key.clone(), next);
            Ok(next)
        })
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> StoreFuture<'_, PurgeReport> {
        Box::pin(async move {
            let mut state = self.lock()?;
            let tokens_before = state.tokens.len();
            let counters_before = state.counters.len();
            state.tokens.retain(|_, record| record.is_live(now));
            state.counters.retain(|_, counter| counter.reset_at > now);
            Ok(PurgeReport {
                tokens: (tokens_before - state.tokens.len()) as u64,
                counters: (counters_before - state.counters.len()) as u64,
            })
        })
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.lock()?;
            Ok(())
        })
    }
}
