//! Anti-forgery tokens using the double-submit cookie pattern.
//!
//! Flow Overview:
//! 1) `issue` returns the live token for a subject or stores a fresh one
//!    (atomic get-or-insert in the token store).
//! 2) The fetch endpoint hands the token back in the body, an `X-CSRF-Token`
//!    header and two cookies (`HttpOnly` and script readable).
//! 3) Unsafe requests must echo the token (header, JSON or form field). When
//!    the cookie accompanies the request it has to match as well.
//! 4) `rotate` replaces the token after a privilege change; `revoke` drops it
//!    on logout.
//!
//! Security boundary: comparisons are constant time, and the reason a check
//! failed is only logged. Callers see one generic 403.

use axum::http::{HeaderMap, HeaderValue, Method, header::InvalidHeaderValue};
use chrono::Utc;
use rand::{RngCore, rngs::OsRng};
use std::{fmt, sync::Arc, time::Duration};
use subtle::ConstantTimeEq;
use tracing::{debug, error};

use super::extract;
use crate::store::{StoreError, StoreKey, TokenRecord, TokenStore, deadline, with_timeout};

pub const CSRF_COOKIE: &str = "gate_csrf";
pub const CSRF_PUBLIC_COOKIE: &str = "gate_csrf_public";
/// Opaque subject for callers without a session.
pub const ANON_COOKIE: &str = "gate_anon";
pub const CSRF_RESPONSE_HEADER: &str = "x-csrf-token";

const TOKEN_BYTES: usize = 32;

/// Internal reason a verification failed. Logged, never returned to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CsrfFailure {
    Missing,
    Mismatch,
    Expired,
    NoStoredToken,
    StoreUnavailable,
}

impl CsrfFailure {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Mismatch => "mismatch",
            Self::Expired => "expired",
            Self::NoStoredToken => "no_stored_token",
            Self::StoreUnavailable => "store_unavailable",
        }
    }
}

impl fmt::Display for CsrfFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to generate csrf token: {0}")]
    Entropy(#[from] rand::Error),
}

#[derive(Clone, Debug)]
pub struct CsrfConfig {
    ttl: Duration,
    excluded_prefixes: Vec<String>,
    cookie_secure: bool,
    store_timeout: Duration,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            excluded_prefixes: [
                "/v1/auth/register",
                "/v1/auth/login",
                "/v1/auth/verify-email",
                "/health",
                "/v1/csrf",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            cookie_secure: true,
            store_timeout: Duration::from_secs(3),
        }
    }
}

impl CsrfConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Replace the excluded prefixes.
    #[must_use]
    pub fn with_excluded_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_cookie_secure(mut self, secure: bool) -> Self {
        self.cookie_secure = secure;
        self
    }

    #[must_use]
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn excluded_prefixes(&self) -> &[String] {
        &self.excluded_prefixes
    }

    #[must_use]
    pub fn cookie_secure(&self) -> bool {
        self.cookie_secure
    }
}

/// Read-only methods never need a token.
#[must_use]
pub fn is_safe_method(method: &Method) -> bool {
    [Method::GET, Method::HEAD, Method::OPTIONS, Method::TRACE].contains(method)
}

/// Constant-time token equality.
pub(crate) fn tokens_match(expected: &str, supplied: &str) -> bool {
    expected.as_bytes().ct_eq(supplied.as_bytes()).into()
}

fn generate_token() -> Result<String, rand::Error> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(hex::encode(bytes))
}

pub struct CsrfGuard {
    store: Arc<dyn TokenStore>,
    config: CsrfConfig,
}

impl CsrfGuard {
    #[must_use]
    pub fn new(store: Arc<dyn TokenStore>, config: CsrfConfig) -> Self {
        Self { store, config }
    }

    #[must_use]
    pub fn config(&self) -> &CsrfConfig {
        &self.config
    }

    #[must_use]
    pub fn is_excluded(&self, path: &str) -> bool {
        self.config
            .excluded_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    fn fresh_record(&self) -> Result<TokenRecord, rand::Error> {
        let now = Utc::now();
        Ok(TokenRecord {
            value: generate_token()?,
            issued_at: now,
            expires_at: deadline(now, self.config.ttl),
        })
    }

    /// Return the live token for `session_id`, creating one when absent or
    /// expired.
    ///
    /// # Errors
    /// Returns `IssueError` when the store is unavailable or the OS RNG fails.
    pub async fn issue(&self, session_id: &str) -> Result<String, IssueError> {
        let key = StoreKey::csrf(session_id);
        let candidate = self.fresh_record()?;
        let record = with_timeout(
            self.config.store_timeout,
            self.store.get_or_insert_token(&key, &candidate, candidate.issued_at),
        )
        .await?;
        Ok(record.value)
    }

    /// Replace the token for `session_id`. The previous token stops verifying
    /// immediately.
    ///
    /// # Errors
    /// Returns `IssueError` when the store is unavailable or the OS RNG fails.
    pub async fn rotate(&self, session_id: &str) -> Result<String, IssueError> {
        let key = StoreKey::csrf(session_id);
        let record = self.fresh_record()?;
        with_timeout(self.config.store_timeout, self.store.put_token(&key, &record)).await?;
        debug!("Rotated csrf token");
        Ok(record.value)
    }

    /// Drop the token for `session_id`.
    ///
    /// # Errors
    /// Returns `StoreError` when the store is unavailable.
    pub async fn revoke(&self, session_id: &str) -> Result<bool, StoreError> {
        let key = StoreKey::csrf(session_id);
        with_timeout(self.config.store_timeout, self.store.delete_token(&key)).await
    }

    /// Check a supplied token against the stored one.
    ///
    /// # Errors
    /// Returns the internal `CsrfFailure` reason; store errors fail closed.
    pub async fn verify(
        &self,
        session_id: &str,
        supplied: Option<&str>,
        method: &Method,
    ) -> Result<(), CsrfFailure> {
        if is_safe_method(method) {
            return Ok(());
        }
        let Some(supplied) = supplied else {
            return Err(CsrfFailure::Missing);
        };
        let key = StoreKey::csrf(session_id);
        let stored = with_timeout(self.config.store_timeout, self.store.get_token(&key))
            .await
            .map_err(|err| {
                error!("Failed to load csrf token: {err}");
                CsrfFailure::StoreUnavailable
            })?;
        let Some(stored) = stored else {
            return Err(CsrfFailure::NoStoredToken);
        };
        if !stored.is_live(Utc::now()) {
            return Err(CsrfFailure::Expired);
        }
        if tokens_match(&stored.value, supplied) {
            Ok(())
        } else {
            Err(CsrfFailure::Mismatch)
        }
    }

    /// Verify a whole request: extract the supplied token, enforce the
    /// double-submit cookie when present, then check the store.
    ///
    /// # Errors
    /// Returns the internal `CsrfFailure` reason.
    pub async fn verify_request(
        &self,
        subject: Option<&str>,
        method: &Method,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<(), CsrfFailure> {
        if is_safe_method(method) {
            return Ok(());
        }
        let supplied = extract::csrf_token(headers, body);
        let Some(subject) = subject else {
            return Err(if supplied.is_some() {
                CsrfFailure::NoStoredToken
            } else {
                CsrfFailure::Missing
            });
        };
        if let (Some(supplied), Some(cookie)) = (&supplied, extract::cookie(headers, CSRF_COOKIE))
            && !tokens_match(&cookie, supplied)
        {
            return Err(CsrfFailure::Mismatch);
        }
        self.verify(subject, supplied.as_deref(), method).await
    }

    fn cookie(&self, name: &str, value: &str, http_only: bool, max_age: u64) -> String {
        let mut cookie = format!("{name}={value}; Path=/; SameSite=Strict; Max-Age={max_age}");
        if http_only {
            cookie.push_str("; HttpOnly");
        }
        if self.config.cookie_secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// `Set-Cookie` values carrying `token`: the `HttpOnly` copy read by the
    /// double-submit check and the script-readable copy.
    ///
    /// # Errors
    /// Returns `InvalidHeaderValue` if the token contains invalid characters.
    pub fn token_cookies(&self, token: &str) -> Result<[HeaderValue; 2], InvalidHeaderValue> {
        let ttl = self.config.ttl.as_secs();
        Ok([
            HeaderValue::from_str(&self.cookie(CSRF_COOKIE, token, true, ttl))?,
            HeaderValue::from_str(&self.cookie(CSRF_PUBLIC_COOKIE, token, false, ttl))?,
        ])
    }

    /// `Set-Cookie` value for the anonymous CSRF subject.
    ///
    /// # Errors
    /// Returns `InvalidHeaderValue` if the id contains invalid characters.
    pub fn anon_cookie(&self, subject: &str) -> Result<HeaderValue, InvalidHeaderValue> {
        HeaderValue::from_str(&self.cookie(ANON_COOKIE, subject, true, self.config.ttl.as_secs()))
    }

    /// Expired `Set-Cookie` values for every cookie the guard sets.
    ///
    /// # Errors
    /// Returns `InvalidHeaderValue` on invalid cookie attributes.
    pub fn clear_cookies(&self) -> Result<[HeaderValue; 3], InvalidHeaderValue> {
        Ok([
            HeaderValue::from_str(&self.cookie(CSRF_COOKIE, "", true, 0))?,
            HeaderValue::from_str(&self.cookie(CSRF_PUBLIC_COOKIE, "", false, 0))?,
            HeaderValue::from_str(&self.cookie(ANON_COOKIE, "", true, 0))?,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTokenStore;
    use anyhow::Result;
    use axum::http::header::{CONTENT_TYPE, COOKIE};
    use chrono::TimeDelta;
    use std::time::Instant;

    fn guard() -> (Arc<MemoryTokenStore>, CsrfGuard) {
        let store = Arc::new(MemoryTokenStore::new());
        let guard = CsrfGuard::new(store.clone(), CsrfConfig::default());
        (store, guard)
    }

    #[tokio::test]
    async fn issued_token_verifies_for_unsafe_methods() -> Result<()> {
        let (_, guard) = guard();
        let token = guard.issue("session-1").await?;
        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

        for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
            assert_eq!(guard.verify("session-1", Some(&token), &method).await, Ok(()));
        }
        Ok(())
    }

    #[tokio::test]
    async fn huge_ttl_saturates_expiry() -> Result<()> {
        let store = Arc::new(MemoryTokenStore::new());
        let guard = CsrfGuard::new(
            store,
            CsrfConfig::default().with_ttl(Duration::from_secs(u64::MAX / 2)),
        );
        let token = guard.issue("s").await?;
        assert_eq!(guard.verify("s", Some(&token), &Method::POST).await, Ok(()));
        Ok(())
    }

    #[tokio::test]
    async fn issue_returns_the_live_token() -> Result<()> {
        let (_, guard) = guard();
        let first = guard.issue("s").await?;
        let second = guard.issue("s").await?;
        assert_eq!(first, second);
        assert_ne!(first, guard.issue("other").await?);
        Ok(())
    }

    #[tokio::test]
    async fn rotation_invalidates_previous_token() -> Result<()> {
        let (_, guard) = guard();
        let old = guard.issue("s").await?;
        let new = guard.rotate("s").await?;
        assert_ne!(old, new);
        assert_eq!(
            guard.verify("s", Some(&old), &Method::POST).await,
            Err(CsrfFailure::Mismatch)
        );
        assert_eq!(guard.verify("s", Some(&new), &Method::POST).await, Ok(()));
        Ok(())
    }

    #[tokio::test]
    async fn failure_reasons_are_distinguished_internally() -> Result<()> {
        let (store, guard) = guard();
        assert_eq!(
            guard.verify("s", None, &Method::POST).await,
            Err(CsrfFailure::Missing)
        );
        assert_eq!(
            guard.verify("s", Some("abc"), &Method::POST).await,
            Err(CsrfFailure::NoStoredToken)
        );

        let now = Utc::now();
        let stale = TokenRecord {
            value: "abc".to_string(),
            issued_at: now - TimeDelta::hours(25),
            expires_at: now - TimeDelta::hours(1),
        };
        store.put_token(&StoreKey::csrf("s"), &stale).await?;
        assert_eq!(
            guard.verify("s", Some("abc"), &Method::POST).await,
            Err(CsrfFailure::Expired)
        );

        store.set_offline(true);
        assert_eq!(
            guard.verify("s", Some("abc"), &Method::POST).await,
            Err(CsrfFailure::StoreUnavailable)
        );
        Ok(())
    }

    #[tokio::test]
    async fn safe_methods_always_pass() {
        let (store, guard) = guard();
        store.set_offline(true);
        for method in [Method::GET, Method::HEAD, Method::OPTIONS, Method::TRACE] {
            assert_eq!(guard.verify("s", None, &method).await, Ok(()));
        }
    }

    #[tokio::test]
    async fn revoke_drops_the_token() -> Result<()> {
        let (_, guard) = guard();
        let token = guard.issue("s").await?;
        assert!(guard.revoke("s").await?);
        assert_eq!(
            guard.verify("s", Some(&token), &Method::POST).await,
            Err(CsrfFailure::NoStoredToken)
        );
        assert!(!guard.revoke("s").await?);
        Ok(())
    }

    #[tokio::test]
    async fn double_submit_cookie_must_match() -> Result<()> {
        let (_, guard) = guard();
        let token = guard.issue("s").await?;

        let mut headers = HeaderMap::new();
        headers.insert(extract::CSRF_HEADER, HeaderValue::from_str(&token)?);
        headers.insert(COOKIE, HeaderValue::from_str(&format!("{CSRF_COOKIE}={token}"))?);
        assert_eq!(
            guard
                .verify_request(Some("s"), &Method::POST, &headers, b"")
                .await,
            Ok(())
        );

        headers.insert(COOKIE, HeaderValue::from_static("gate_csrf=forged"));
        assert_eq!(
            guard
                .verify_request(Some("s"), &Method::POST, &headers, b"")
                .await,
            Err(CsrfFailure::Mismatch)
        );
        Ok(())
    }

    #[tokio::test]
    async fn verify_request_reads_json_body() -> Result<()> {
        let (_, guard) = guard();
        let token = guard.issue("s").await?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let body = serde_json::to_vec(&serde_json::json!({ "csrfToken": token }))?;
        assert_eq!(
            guard
                .verify_request(Some("s"), &Method::POST, &headers, &body)
                .await,
            Ok(())
        );
        assert_eq!(
            guard
                .verify_request(None, &Method::POST, &headers, &body)
                .await,
            Err(CsrfFailure::NoStoredToken)
        );
        Ok(())
    }

    #[test]
    fn excluded_prefixes_match_auth_and_health() {
        let (_, guard) = guard();
        assert!(guard.is_excluded("/v1/auth/login"));
        assert!(guard.is_excluded("/v1/auth/register/start"));
        assert!(guard.is_excluded("/health"));
        assert!(!guard.is_excluded("/v1/posts"));
        assert!(!guard.is_excluded("/v1/auth/logout"));
    }

    #[test]
    fn cookies_carry_expected_attributes() -> Result<()> {
        let store = Arc::new(MemoryTokenStore::new());
        let guard = CsrfGuard::new(store, CsrfConfig::default().with_cookie_secure(false));
        let [private, public] = guard.token_cookies("abc")?;
        assert_eq!(
            private.to_str()?,
            "gate_csrf=abc; Path=/; SameSite=Strict; Max-Age=86400; HttpOnly"
        );
        assert_eq!(
            public.to_str()?,
            "gate_csrf_public=abc; Path=/; SameSite=Strict; Max-Age=86400"
        );

        let (_, secure) = self::guard();
        let [private, _] = secure.token_cookies("abc")?;
        assert!(private.to_str()?.ends_with("; HttpOnly; Secure"));
        let cleared = secure.clear_cookies()?;
        assert!(cleared.iter().all(|value| {
            value.to_str().is_ok_and(|v| v.contains("Max-Age=0"))
        }));
        Ok(())
    }

    fn median_nanos(expected: &str, supplied: &str) -> u128 {
        let mut samples: Vec<u128> = (0..201)
            .map(|_| {
                let start = Instant::now();
                for _ in 0..200 {
                    std::hint::black_box(tokens_match(
                        std::hint::black_box(expected),
                        std::hint::black_box(supplied),
                    ));
                }
                start.elapsed().as_nanos()
            })
            .collect();
        samples.sort_unstable();
        samples[samples.len() / 2]
    }

    #[test]
    fn comparison_time_does_not_depend_on_first_difference() -> Result<()> {
        let expected = generate_token()?;
        let mut early = expected.clone().into_bytes();
        early[0] = if early[0] == b'0' { b'1' } else { b'0' };
        let mut late = expected.clone().into_bytes();
        let last = late.len() - 1;
        late[last] = if late[last] == b'0' { b'1' } else { b'0' };
        let early = String::from_utf8(early)?;
        let late = String::from_utf8(late)?;

        assert!(!tokens_match(&expected, &early));
        assert!(!tokens_match(&expected, &late));

        // Warm up, then compare medians of batched samples.
        median_nanos(&expected, &late);
        let early_time = median_nanos(&expected, &early).max(1);
        let late_time = median_nanos(&expected, &late).max(1);
        let ratio = early_time.max(late_time) as f64 / early_time.min(late_time) as f64;
        assert!(ratio < 3.0, "early={early_time}ns late={late_time}ns");
        Ok(())
    }
}
