//! Request-security gate: rate limiting, session resolution and CSRF checks.
//!
//! Flow Overview:
//! 1) `pipeline::enforce` classifies the route and counts the request against
//!    its rate policy (fail open).
//! 2) The session token is resolved into a `Principal` and the route's access
//!    level is enforced (fail closed).
//! 3) Unsafe methods on non-excluded routes must carry the CSRF token
//!    (fail closed).
//! 4) The principal is attached to the request and the handler runs.
//!
//! All persistent state lives behind the injected `TokenStore` and
//! `IdentityStore`; the gate holds no process-wide singletons.

pub mod csrf;
pub mod error;
pub mod extract;
pub mod identity;
pub mod pipeline;
pub mod policy;
pub mod principal;
pub mod rate_limit;
pub mod session;
pub mod sweeper;

use secrecy::SecretString;
use std::{sync::Arc, time::Duration};
use tracing::error;
use uuid::Uuid;

pub use csrf::{CsrfConfig, CsrfFailure, CsrfGuard};
pub use error::{BodyFailure, GateError};
pub use identity::{IdentityStore, MemoryIdentityStore, PostgresIdentityStore};
pub use pipeline::{Admission, GateRequest, enforce};
pub use policy::{Access, PolicyTable, RatePolicy, RouteClass, RouteRule, RouteTable};
pub use principal::{Principal, Verification};
pub use rate_limit::{ClientKey, RateLimitOutcome, RateLimiter};
pub use session::{IssuedSession, SessionConfig, SessionGate, SessionSigner};

use crate::store::TokenStore;

/// Everything configurable about the gate, resolved once at startup.
pub struct GateConfig {
    signing_key: SecretString,
    csrf: CsrfConfig,
    session: SessionConfig,
    policies: PolicyTable,
    routes: RouteTable,
    trust_proxy: bool,
    store_timeout: Duration,
}

impl GateConfig {
    #[must_use]
    pub fn new(signing_key: SecretString) -> Self {
        Self {
            signing_key,
            csrf: CsrfConfig::default(),
            session: SessionConfig::default(),
            policies: PolicyTable::default(),
            routes: RouteTable::default(),
            trust_proxy: false,
            store_timeout: Duration::from_secs(3),
        }
    }

    #[must_use]
    pub fn with_csrf(mut self, csrf: CsrfConfig) -> Self {
        self.csrf = csrf;
        self
    }

    #[must_use]
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    #[must_use]
    pub fn with_policies(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        self
    }

    #[must_use]
    pub fn with_routes(mut self, routes: RouteTable) -> Self {
        self.routes = routes;
        self
    }

    /// Honour `x-forwarded-for` / `x-real-ip` when deriving client keys.
    #[must_use]
    pub fn with_trust_proxy(mut self, trust_proxy: bool) -> Self {
        self.trust_proxy = trust_proxy;
        self
    }

    /// Bound applied to every store call made by the gate.
    #[must_use]
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }
}

/// Result of a successful sign-in.
#[derive(Clone, Debug)]
pub struct SignedIn {
    pub session: IssuedSession,
    pub csrf_token: String,
}

pub struct Gate {
    store: Arc<dyn TokenStore>,
    csrf: CsrfGuard,
    limiter: RateLimiter,
    sessions: SessionGate,
    routes: RouteTable,
    trust_proxy: bool,
    store_timeout: Duration,
}

impl Gate {
    #[must_use]
    pub fn new(
        store: Arc<dyn TokenStore>,
        identities: Arc<dyn IdentityStore>,
        config: GateConfig,
    ) -> Self {
        let timeout = config.store_timeout;
        Self {
            csrf: CsrfGuard::new(
                Arc::clone(&store),
                config.csrf.with_store_timeout(timeout),
            ),
            limiter: RateLimiter::new(Arc::clone(&store), config.policies)
                .with_store_timeout(timeout),
            sessions: SessionGate::new(
                SessionSigner::new(config.signing_key),
                identities,
                config.session.with_store_timeout(timeout),
            ),
            routes: config.routes,
            trust_proxy: config.trust_proxy,
            store_timeout: timeout,
            store,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    #[must_use]
    pub fn csrf(&self) -> &CsrfGuard {
        &self.csrf
    }

    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionGate {
        &self.sessions
    }

    #[must_use]
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    #[must_use]
    pub fn trust_proxy(&self) -> bool {
        self.trust_proxy
    }

    /// Upper bound applied to every store call made on behalf of a request.
    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    /// Establish a session and rotate its CSRF token.
    ///
    /// # Errors
    /// `Unverified` / `Unauthenticated` from the session gate, or
    /// `Unavailable` when the CSRF token cannot be stored.
    pub async fn sign_in(&self, user_id: Uuid) -> Result<SignedIn, GateError> {
        let session = self.sessions.establish(user_id).await?;
        let csrf_token = self
            .csrf
            .rotate(&session.principal.session_id)
            .await
            .map_err(|err| {
                error!("Failed to rotate csrf token: {err}");
                GateError::Unavailable("Unable to issue a CSRF token. Please retry.".to_string())
            })?;
        Ok(SignedIn {
            session,
            csrf_token,
        })
    }
}
