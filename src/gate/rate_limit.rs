//! Fixed-window rate limiting keyed by route class and client identity.
//!
//! Counting happens in the token store with one atomic upsert per request,
//! so concurrent workers and instances sharing the store agree on the count.
//! Store failures fail open: the request is admitted and logged as degraded.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, Utc};
use std::{fmt, net::IpAddr, sync::Arc, time::Duration};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    extract,
    policy::{PolicyTable, RatePolicy, RouteClass},
};
use crate::store::{StoreKey, TokenStore, deadline, with_timeout};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Who a counter belongs to. Authenticated callers are counted per user so a
/// shared address does not throttle unrelated accounts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientKey {
    User(Uuid),
    Ip(IpAddr),
    Unknown,
}

impl ClientKey {
    /// Pick the most specific key available. Proxy headers are only honoured
    /// when `trust_proxy` is set; otherwise they are caller controlled.
    #[must_use]
    pub fn resolve(
        user: Option<Uuid>,
        headers: &HeaderMap,
        peer: Option<IpAddr>,
        trust_proxy: bool,
    ) -> Self {
        if let Some(user) = user {
            return Self::User(user);
        }
        let forwarded = if trust_proxy {
            extract::forwarded_ip(headers)
        } else {
            None
        };
        forwarded.or(peer).map_or(Self::Unknown, Self::Ip)
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Ip(addr) => write!(f, "ip:{addr}"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Zero when allowed, at least 1 when denied.
    pub retry_after_seconds: u64,
    /// Set when the store failed and the request was admitted anyway.
    pub degraded: bool,
}

impl RateLimitOutcome {
    /// Attach `X-RateLimit-*` headers. `Retry-After` is added by the 429
    /// response only.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(
            X_RATELIMIT_RESET,
            HeaderValue::from(self.reset_at.timestamp()),
        );
    }
}

/// Seconds until `reset_at`, rounded up, never below 1.
fn retry_after(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (reset_at - now).num_milliseconds().max(0);
    let seconds = u64::try_from(millis).unwrap_or(0).div_ceil(1000);
    seconds.max(1)
}

pub struct RateLimiter {
    store: Arc<dyn TokenStore>,
    policies: PolicyTable,
    store_timeout: Duration,
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn TokenStore>, policies: PolicyTable) -> Self {
        Self {
            store,
            policies,
            store_timeout: Duration::from_secs(3),
        }
    }

    #[must_use]
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    #[must_use]
    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Count a request for `client` against the policy of `class`.
    pub async fn check_class(&self, class: RouteClass, client: &ClientKey) -> RateLimitOutcome {
        let identifier = format!("{class}:{client}");
        self.check(&identifier, self.policies.get(class)).await
    }

    pub async fn check(&self, identifier: &str, policy: &RatePolicy) -> RateLimitOutcome {
        self.check_at(identifier, policy, Utc::now()).await
    }

    /// `check` with an explicit clock.
    pub async fn check_at(
        &self,
        identifier: &str,
        policy: &RatePolicy,
        now: DateTime<Utc>,
    ) -> RateLimitOutcome {
        let key = StoreKey::rate_limit(identifier);
        let result = with_timeout(
            self.store_timeout,
            self.store.hit_counter(&key, policy.window, policy.max_requests, now),
        )
        .await;

        match result {
            Ok(counter) => {
                let allowed = counter.count <= policy.max_requests;
                let outcome = RateLimitOutcome {
                    allowed,
                    limit: policy.max_requests,
                    remaining: policy.max_requests.saturating_sub(counter.count),
                    reset_at: counter.reset_at,
                    retry_after_seconds: if allowed {
                        0
                    } else {
                        retry_after(counter.reset_at, now)
                    },
                    degraded: false,
                };
                if !allowed {
                    debug!(
                        identifier,
                        retry_after = outcome.retry_after_seconds,
                        "Rate limit exceeded"
                    );
                }
                outcome
            }
            Err(err) => {
                warn!(identifier, "Rate limiter store failure, admitting request: {err}");
                RateLimitOutcome {
                    allowed: true,
                    limit: policy.max_requests,
                    remaining: policy.max_requests,
                    reset_at: deadline(now, policy.window),
                    retry_after_seconds: 0,
                    degraded: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTokenStore;
    use anyhow::Result;
    use chrono::TimeDelta;

    fn limiter() -> (Arc<MemoryTokenStore>, RateLimiter) {
        let store = Arc::new(MemoryTokenStore::new());
        let limiter = RateLimiter::new(store.clone(), PolicyTable::default());
        (store, limiter)
    }

    fn policy(max: u32, window_secs: u64) -> RatePolicy {
        RatePolicy::new(max, Duration::from_secs(window_secs), "slow down")
    }

    #[tokio::test]
    async fn admits_up_to_max_then_denies() {
        let (_, limiter) = limiter();
        let policy = policy(5, 60);
        let now = Utc::now();
        for expected_remaining in (0..5).rev() {
            let outcome = limiter.check_at("api:ip:10.0.0.1", &policy, now).await;
            assert!(outcome.allowed);
            assert_eq!(outcome.remaining, expected_remaining);
        }
        let denied = limiter.check_at("api:ip:10.0.0.1", &policy, now).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after_seconds > 0);
        assert!(!denied.degraded);
    }

    #[tokio::test]
    async fn window_reset_behaves_as_fresh_without_sweep() {
        let (_, limiter) = limiter();
        let policy = policy(1, 60);
        let now = Utc::now();
        assert!(limiter.check_at("k", &policy, now).await.allowed);
        assert!(!limiter.check_at("k", &policy, now).await.allowed);

        let later = now + TimeDelta::seconds(61);
        let outcome = limiter.check_at("k", &policy, later).await;
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 0);
    }

    #[tokio::test]
    async fn huge_window_saturates_reset_time() {
        let (_, limiter) = limiter();
        let policy = RatePolicy::new(1, Duration::MAX, "slow down");
        let now = Utc::now();
        let first = limiter.check_at("k", &policy, now).await;
        assert!(first.allowed);
        assert!(first.reset_at > now);
        assert!(!limiter.check_at("k", &policy, now).await.allowed);
    }

    #[tokio::test]
    async fn login_policy_reports_full_window_retry() -> Result<()> {
        let (_, limiter) = limiter();
        let client = ClientKey::Ip("203.0.113.9".parse()?);
        for _ in 0..10 {
            assert!(limiter.check_class(RouteClass::Login, &client).await.allowed);
        }
        let denied = limiter.check_class(RouteClass::Login, &client).await;
        assert!(!denied.allowed);
        assert!((899..=900).contains(&denied.retry_after_seconds));
        Ok(())
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let (store, limiter) = limiter();
        store.set_offline(true);
        let policy = policy(1, 60);
        for _ in 0..3 {
            let outcome = limiter.check("k", &policy).await;
            assert!(outcome.allowed);
            assert!(outcome.degraded);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_admit_exactly_max() -> Result<()> {
        let (_, limiter) = limiter();
        let limiter = Arc::new(limiter);
        let policy = Arc::new(policy(10, 60));
        let handles: Vec<_> = (0..15)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let policy = Arc::clone(&policy);
                tokio::spawn(async move { limiter.check("burst", &policy).await.allowed })
            })
            .collect();

        let mut allowed = 0;
        let mut denied = 0;
        for handle in handles {
            if handle.await? {
                allowed += 1;
            } else {
                denied += 1;
            }
        }
        assert_eq!(allowed, 10);
        assert_eq!(denied, 5);
        Ok(())
    }

    #[test]
    fn client_key_prefers_user_then_trusted_proxy_then_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        let peer: Option<IpAddr> = "10.0.0.1".parse().ok();
        let user = Uuid::new_v4();

        assert_eq!(
            ClientKey::resolve(Some(user), &headers, peer, true),
            ClientKey::User(user)
        );
        assert_eq!(
            ClientKey::resolve(None, &headers, peer, true).to_string(),
            "ip:1.2.3.4"
        );
        assert_eq!(
            ClientKey::resolve(None, &headers, peer, false).to_string(),
            "ip:10.0.0.1"
        );
        assert_eq!(
            ClientKey::resolve(None, &HeaderMap::new(), None, false),
            ClientKey::Unknown
        );
    }

    #[test]
    fn retry_after_rounds_up_with_floor_of_one() {
        let now = Utc::now();
        assert_eq!(retry_after(now + TimeDelta::milliseconds(1500), now), 2);
        assert_eq!(retry_after(now + TimeDelta::seconds(900), now), 900);
        assert_eq!(retry_after(now, now), 1);
        assert_eq!(retry_after(now - TimeDelta::seconds(5), now), 1);
    }

    #[test]
    fn headers_carry_limit_remaining_and_reset() -> Result<()> {
        let reset_at = Utc::now();
        let outcome = RateLimitOutcome {
            allowed: true,
            limit: 60,
            remaining: 59,
            reset_at,
            retry_after_seconds: 0,
            degraded: false,
        };
        let mut headers = HeaderMap::new();
        outcome.apply_headers(&mut headers);
        assert_eq!(headers.get(X_RATELIMIT_LIMIT), Some(&HeaderValue::from(60u32)));
        assert_eq!(headers.get(X_RATELIMIT_REMAINING), Some(&HeaderValue::from(59u32)));
        assert_eq!(
            headers
                .get(X_RATELIMIT_RESET)
                .map(HeaderValue::to_str)
                .transpose()?,
            Some(reset_at.timestamp().to_string().as_str())
        );
        Ok(())
    }
}
