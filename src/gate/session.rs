//! Signed session tokens and the verified-principal gate.
//!
//! Flow Overview:
//! 1) `establish` reads the identity, refuses unverified principals, and mints
//!    a token `base64url(claims).base64url(hmac)`.
//! 2) `resolve` checks the signature and expiry. Once the last re-derivation
//!    is older than the refresh interval it re-reads the identity and hands
//!    back a re-issued token.
//! 3) `refresh` does the same on demand, so a principal who verifies
//!    mid-session picks it up without signing in again.
//!
//! Security boundary: identity store failures fail closed. Verification is
//! only ever `Verified` when the stored flag is exactly `true`.

use axum::http::{HeaderMap, HeaderValue, header::InvalidHeaderValue};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, warn};
use ulid::Ulid;
use uuid::Uuid;

use super::{
    error::GateError,
    extract,
    identity::{IdentityRecord, IdentityStore},
    principal::{Principal, Verification},
};
use crate::store::{StoreError, deadline, delta, with_timeout};

pub const SESSION_COOKIE: &str = "gate_session";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionTokenError {
    #[error("session token is malformed")]
    Malformed,
    #[error("session token signature is invalid")]
    BadSignature,
    #[error("session token has expired")]
    Expired,
    #[error("failed to encode session claims: {0}")]
    Encoding(String),
    #[error("invalid signing key")]
    InvalidKey,
}

/// Claims embedded in the session token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: Uuid,
    pub sid: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub verified: Verification,
    pub iat: i64,
    pub exp: i64,
    /// Last time the claims were re-derived from the identity store.
    pub rat: i64,
}

impl SessionClaims {
    #[must_use]
    pub fn principal(&self) -> Principal {
        Principal {
            user_id: self.sub,
            session_id: self.sid.clone(),
            email: self.email.clone(),
            display_name: self.name.clone(),
            verification: self.verified,
        }
    }
}

/// HMAC-SHA256 signer for session tokens.
pub struct SessionSigner {
    key: SecretString,
}

impl SessionSigner {
    #[must_use]
    pub fn new(key: SecretString) -> Self {
        Self { key }
    }

    fn mac(&self) -> Result<HmacSha256, SessionTokenError> {
        HmacSha256::new_from_slice(self.key.expose_secret().as_bytes())
            .map_err(|_| SessionTokenError::InvalidKey)
    }

    /// # Errors
    /// Returns `SessionTokenError` if the claims cannot be encoded.
    pub fn sign(&self, claims: &SessionClaims) -> Result<String, SessionTokenError> {
        let json = serde_json::to_vec(claims)
            .map_err(|err| SessionTokenError::Encoding(err.to_string()))?;
        let payload = URL_SAFE_NO_PAD.encode(json);
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{payload}.{signature}"))
    }

    /// Check the signature, then decode and check expiry.
    ///
    /// # Errors
    /// Returns `SessionTokenError` for malformed, forged or expired tokens.
    pub fn verify(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionClaims, SessionTokenError> {
        let (payload, signature) = token.split_once('.').ok_or(SessionTokenError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| SessionTokenError::Malformed)?;
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| SessionTokenError::BadSignature)?;

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| SessionTokenError::Malformed)?;
        let claims: SessionClaims =
            serde_json::from_slice(&json).map_err(|_| SessionTokenError::Malformed)?;
        if claims.exp <= now.timestamp() {
            return Err(SessionTokenError::Expired);
        }
        Ok(claims)
    }
}

/// Why a request did not resolve to a principal. Logged, never returned.
#[derive(Debug, thiserror::Error)]
pub enum SessionRejection {
    #[error("no session token")]
    Absent,
    #[error(transparent)]
    Token(#[from] SessionTokenError),
    #[error("session user no longer exists")]
    UnknownUser,
    #[error("identity store unavailable: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug)]
pub struct ResolvedSession {
    pub principal: Principal,
    /// Set when the claims were re-derived and the client must store a new
    /// token.
    pub reissued: Option<String>,
}

#[derive(Clone, Debug)]
pub struct IssuedSession {
    pub principal: Principal,
    pub token: String,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    ttl: Duration,
    refresh_interval: Duration,
    cookie_secure: bool,
    store_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 24 * 60 * 60),
            refresh_interval: Duration::from_secs(24 * 60 * 60),
            cookie_secure: true,
            store_timeout: Duration::from_secs(3),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
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
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    #[must_use]
    pub fn cookie_secure(&self) -> bool {
        self.cookie_secure
    }
}

/// Deny unless the principal is `Verified`.
///
/// # Errors
/// Returns `GateError::Unverified` for every other state.
pub fn require_verified(principal: &Principal) -> Result<(), GateError> {
    match principal.verification {
        Verification::Verified => Ok(()),
        Verification::Unverified => Err(GateError::Unverified),
    }
}

/// Session token from `Authorization: Bearer`, then the session cookie.
#[must_use]
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    extract::bearer_token(headers).or_else(|| extract::cookie(headers, SESSION_COOKIE))
}

pub struct SessionGate {
    signer: SessionSigner,
    identities: Arc<dyn IdentityStore>,
    config: SessionConfig,
}

impl SessionGate {
    #[must_use]
    pub fn new(
        signer: SessionSigner,
        identities: Arc<dyn IdentityStore>,
        config: SessionConfig,
    ) -> Self {
        Self {
            signer,
            identities,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// User id from a validly signed, unexpired token. No I/O.
    #[must_use]
    pub fn peek_subject(&self, token: &str) -> Option<Uuid> {
        self.signer.verify(token, Utc::now()).ok().map(|claims| claims.sub)
    }

    async fn lookup(&self, user_id: Uuid) -> Result<IdentityRecord, SessionRejection> {
        with_timeout(self.config.store_timeout, self.identities.lookup(user_id))
            .await?
            .ok_or(SessionRejection::UnknownUser)
    }

    fn mint(
        &self,
        record: &IdentityRecord,
        session_id: String,
        now: DateTime<Utc>,
    ) -> Result<IssuedSession, SessionTokenError> {
        let claims = SessionClaims {
            sub: record.user_id,
            sid: session_id,
            email: record.email.clone(),
            name: record.display_name.clone(),
            verified: record.verification(),
            iat: now.timestamp(),
            exp: deadline(now, self.config.ttl).timestamp(),
            rat: now.timestamp(),
        };
        let token = self.signer.sign(&claims)?;
        Ok(IssuedSession {
            principal: claims.principal(),
            token,
        })
    }

    /// Resolve a request token into a principal, re-deriving the claims when
    /// they are older than the refresh interval.
    ///
    /// # Errors
    /// Returns the `SessionRejection` reason; every variant means
    /// unauthenticated.
    pub async fn resolve(&self, token: Option<&str>) -> Result<ResolvedSession, SessionRejection> {
        let token = token.ok_or(SessionRejection::Absent)?;
        let now = Utc::now();
        let claims = self.signer.verify(token, now)?;

        let refresh_after = delta(self.config.refresh_interval).num_seconds();
        if now.timestamp().saturating_sub(claims.rat) < refresh_after {
            return Ok(ResolvedSession {
                principal: claims.principal(),
                reissued: None,
            });
        }

        let record = self.lookup(claims.sub).await?;
        let issued = self.mint(&record, claims.sid, now)?;
        debug!(user_id = %record.user_id, "Re-derived session claims");
        Ok(ResolvedSession {
            principal: issued.principal,
            reissued: Some(issued.token),
        })
    }

    /// Sign-in: re-read the identity and issue a new session. Unverified
    /// principals are rejected every time.
    ///
    /// # Errors
    /// `Unauthenticated` for unknown users or store failures, `Unverified`
    /// when the identity has not completed verification.
    pub async fn establish(&self, user_id: Uuid) -> Result<IssuedSession, GateError> {
        let record = self.lookup(user_id).await.map_err(|err| {
            log_rejection(&err);
            GateError::Unauthenticated
        })?;
        if !record.verification().is_verified() {
            warn!(user_id = %user_id, "Sign-in refused for unverified principal");
            return Err(GateError::Unverified);
        }
        self.mint(&record, Ulid::new().to_string(), Utc::now())
            .map_err(|err| {
                error!("Failed to sign session token: {err}");
                GateError::Unavailable("session signing failed".to_string())
            })
    }

    /// Explicit update trigger: re-read verification and display fields and
    /// re-issue the token for the same session id.
    ///
    /// # Errors
    /// `Unauthenticated` when the identity is gone or the store fails.
    pub async fn refresh(&self, principal: &Principal) -> Result<IssuedSession, GateError> {
        let record = self.lookup(principal.user_id).await.map_err(|err| {
            log_rejection(&err);
            GateError::Unauthenticated
        })?;
        self.mint(&record, principal.session_id.clone(), Utc::now())
            .map_err(|err| {
                error!("Failed to sign session token: {err}");
                GateError::Unavailable("session signing failed".to_string())
            })
    }

    /// Build a secure `HttpOnly` cookie for the session token.
    ///
    /// # Errors
    /// Returns `InvalidHeaderValue` if the token contains invalid characters.
    pub fn session_cookie(&self, token: &str) -> Result<HeaderValue, InvalidHeaderValue> {
        let ttl_seconds = self.config.ttl.as_secs();
        let mut cookie = format!(
            "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={ttl_seconds}"
        );
        if self.config.cookie_secure {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie)
    }

    /// # Errors
    /// Returns `InvalidHeaderValue` on invalid cookie attributes.
    pub fn clear_session_cookie(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut cookie = format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
        if self.config.cookie_secure {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie)
    }
}

/// Store faults are errors; everything else is an ordinary anonymous request.
pub(crate) fn log_rejection(rejection: &SessionRejection) {
    match rejection {
        SessionRejection::Store(err) => error!("Failed to resolve session: {err}"),
        SessionRejection::Absent => {}
        other => debug!("Session rejected: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::identity::MemoryIdentityStore;
    use anyhow::{Context, Result};
    use chrono::TimeDelta;

    fn signer() -> SessionSigner {
        SessionSigner::new(SecretString::from("test-signing-key".to_string()))
    }

    fn identities(verified: Option<bool>) -> (Arc<MemoryIdentityStore>, Uuid) {
        let store = Arc::new(MemoryIdentityStore::new());
        let user_id = Uuid::new_v4();
        store.upsert(IdentityRecord {
            user_id,
            email: "alice@example.com".to_string(),
            display_name: Some("Alice".to_string()),
            email_verified: verified,
        });
        (store, user_id)
    }

    fn gate(store: Arc<MemoryIdentityStore>, config: SessionConfig) -> SessionGate {
        SessionGate::new(signer(), store, config)
    }

    fn claims(user_id: Uuid, rat: DateTime<Utc>) -> SessionClaims {
        SessionClaims {
            sub: user_id,
            sid: "sid".to_string(),
            email: "alice@example.com".to_string(),
            name: None,
            verified: Verification::Unverified,
            iat: rat.timestamp(),
            exp: (rat + TimeDelta::days(30)).timestamp(),
            rat: rat.timestamp(),
        }
    }

    #[test]
    fn signer_rejects_tampering_and_expiry() -> Result<()> {
        let now = Utc::now();
        let token = signer().sign(&claims(Uuid::new_v4(), now))?;
        assert!(signer().verify(&token, now).is_ok());

        let other = SessionSigner::new(SecretString::from("other-key".to_string()));
        assert_eq!(
            other.verify(&token, now),
            Err(SessionTokenError::BadSignature)
        );

        let (payload, signature) = token.split_once('.').context("no separator")?;
        let mut forged_claims = claims(Uuid::new_v4(), now);
        forged_claims.verified = Verification::Verified;
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims)?);
        assert_ne!(payload, forged_payload);
        assert_eq!(
            signer().verify(&format!("{forged_payload}.{signature}"), now),
            Err(SessionTokenError::BadSignature)
        );

        assert_eq!(signer().verify("garbage", now), Err(SessionTokenError::Malformed));
        assert_eq!(
            signer().verify(&token, now + TimeDelta::days(31)),
            Err(SessionTokenError::Expired)
        );
        Ok(())
    }

    #[test]
    fn verified_claim_must_be_literal_true() -> Result<()> {
        let key = signer();
        let now = Utc::now();
        for raw in [
            serde_json::json!(false),
            serde_json::json!(null),
            serde_json::json!("true"),
            serde_json::json!(1),
        ] {
            let mut value = serde_json::to_value(claims(Uuid::new_v4(), now))?;
            value["verified"] = raw;
            let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&value)?);
            let mut mac = key.mac()?;
            mac.update(payload.as_bytes());
            let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
            let decoded = key.verify(&format!("{payload}.{signature}"), now)?;
            assert_eq!(decoded.verified, Verification::Unverified);
            assert!(require_verified(&decoded.principal()).is_err());
        }
        Ok(())
    }

    #[tokio::test]
    async fn establish_rejects_unverified_every_time() -> Result<()> {
        for flag in [None, Some(false)] {
            let (store, user_id) = identities(flag);
            let gate = gate(store, SessionConfig::default());
            for _ in 0..3 {
                assert!(matches!(
                    gate.establish(user_id).await,
                    Err(GateError::Unverified)
                ));
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn establish_then_resolve_round_trips() -> Result<()> {
        let (store, user_id) = identities(Some(true));
        let gate = gate(store, SessionConfig::default());
        let issued = gate.establish(user_id).await?;
        assert!(issued.principal.is_verified());

        let resolved = gate.resolve(Some(&issued.token)).await?;
        assert_eq!(resolved.principal, issued.principal);
        assert!(resolved.reissued.is_none());
        assert_eq!(gate.peek_subject(&issued.token), Some(user_id));
        assert!(matches!(
            gate.establish(Uuid::new_v4()).await,
            Err(GateError::Unauthenticated)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn refresh_picks_up_verification() -> Result<()> {
        let (store, user_id) = identities(None);
        let gate = gate(store.clone(), SessionConfig::default());
        let stale = signer().sign(&claims(user_id, Utc::now()))?;
        let resolved = gate.resolve(Some(&stale)).await?;
        assert!(require_verified(&resolved.principal).is_err());

        store.mark_verified(user_id);
        let refreshed = gate.refresh(&resolved.principal).await?;
        assert!(refreshed.principal.is_verified());
        assert_eq!(refreshed.principal.session_id, resolved.principal.session_id);
        assert_eq!(refreshed.principal.display_name.as_deref(), Some("Alice"));
        Ok(())
    }

    #[tokio::test]
    async fn resolve_rederives_after_refresh_interval() -> Result<()> {
        let (store, user_id) = identities(None);
        store.mark_verified(user_id);
        let gate = gate(store, SessionConfig::default());
        let old = signer().sign(&claims(user_id, Utc::now() - TimeDelta::hours(25)))?;

        let resolved = gate.resolve(Some(&old)).await?;
        assert!(resolved.principal.is_verified());
        let reissued = resolved.reissued.context("expected a re-issued token")?;
        let fresh = gate.resolve(Some(&reissued)).await?;
        assert!(fresh.reissued.is_none());
        assert!(fresh.principal.is_verified());
        Ok(())
    }

    #[tokio::test]
    async fn rederivation_of_deleted_user_is_unauthenticated() -> Result<()> {
        let store = Arc::new(MemoryIdentityStore::new());
        let gate = gate(store, SessionConfig::default());
        let old = signer().sign(&claims(Uuid::new_v4(), Utc::now() - TimeDelta::hours(25)))?;
        assert!(matches!(
            gate.resolve(Some(&old)).await,
            Err(SessionRejection::UnknownUser)
        ));
        assert!(matches!(gate.resolve(None).await, Err(SessionRejection::Absent)));
        Ok(())
    }

    #[test]
    fn token_prefers_bearer_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", HeaderValue::from_static("gate_session=from-cookie"));
        assert_eq!(session_token(&headers), Some("from-cookie".to_string()));
        headers.insert("authorization", HeaderValue::from_static("Bearer from-header"));
        assert_eq!(session_token(&headers), Some("from-header".to_string()));
    }

    #[test]
    fn session_cookie_format() -> Result<()> {
        let (store, _) = identities(None);
        let gate = gate(
            store,
            SessionConfig::default().with_ttl(Duration::from_secs(60)),
        );
        assert_eq!(
            gate.session_cookie("tok")?.to_str()?,
            "gate_session=tok; Path=/; HttpOnly; SameSite=Lax; Max-Age=60; Secure"
        );
        assert_eq!(
            gate.clear_session_cookie()?.to_str()?,
            "gate_session=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0; Secure"
        );
        Ok(())
    }
}
