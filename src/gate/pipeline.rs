//! Ordered per-request chain: rate limit, then session, then CSRF.
//!
//! Each stage is cheaper than the next and short-circuits on denial, so a
//! request that would fail several checks always reports the earliest one.

use axum::{
    body::{Body, Bytes, to_bytes},
    extract::{ConnectInfo, FromRequestParts, OptionalFromRequestParts, Request, State},
    http::{HeaderMap, Method, header::{CONTENT_LENGTH, SET_COOKIE}, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{convert::Infallible, net::IpAddr, net::SocketAddr, sync::Arc};
use tracing::{debug, error, warn};

use super::{
    Gate,
    csrf::{ANON_COOKIE, is_safe_method},
    error::{BodyFailure, GateError},
    extract,
    policy::Access,
    principal::Principal,
    rate_limit::{ClientKey, RateLimitOutcome},
    session::{log_rejection, require_verified, session_token},
};

/// Largest body buffered for CSRF token extraction.
pub const MAX_BUFFERED_BODY: usize = 1024 * 1024;

/// The parts of a request the gate looks at.
#[derive(Clone, Copy, Debug)]
pub struct GateRequest<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    /// Buffered body; empty for safe methods and CSRF-excluded paths.
    pub body: &'a [u8],
    pub peer: Option<IpAddr>,
}

/// What an admitted request carries forward.
#[derive(Clone, Debug)]
pub struct Admission {
    pub principal: Option<Principal>,
    /// New session token to hand back after a periodic re-derivation.
    pub reissued: Option<String>,
    pub rate: RateLimitOutcome,
}

impl Gate {
    /// Run the three checks in order.
    ///
    /// # Errors
    /// Returns the first `GateError` encountered.
    pub async fn evaluate(&self, request: GateRequest<'_>) -> Result<Admission, GateError> {
        let rate = self.check_rate(request.path, request.headers, request.peer).await?;
        self.admit(request, rate).await
    }

    /// Count the request against its route's policy.
    ///
    /// Only headers are needed, so this runs before any body is read.
    ///
    /// # Errors
    /// Returns `GateError::RateLimited` once the client is over its limit.
    pub async fn check_rate(
        &self,
        path: &str,
        headers: &HeaderMap,
        peer: Option<IpAddr>,
    ) -> Result<RateLimitOutcome, GateError> {
        let rule = self.routes().classify(path);
        // keyed by the signed subject when there is one
        let subject = session_token(headers)
            .as_deref()
            .and_then(|token| self.sessions().peek_subject(token));
        let client = ClientKey::resolve(subject, headers, peer, self.trust_proxy());
        let rate = self.limiter().check_class(rule.class, &client).await;
        if !rate.allowed {
            warn!(
                class = %rule.class,
                client = %client,
                path,
                "Rate limit rejected request"
            );
            return Err(GateError::RateLimited {
                message: self.limiter().policies().get(rule.class).message.clone(),
                outcome: rate,
            });
        }
        Ok(rate)
    }

    /// Session and CSRF checks for a request that passed `check_rate`.
    ///
    /// # Errors
    /// Returns the first `GateError` encountered.
    pub async fn admit(
        &self,
        request: GateRequest<'_>,
        rate: RateLimitOutcome,
    ) -> Result<Admission, GateError> {
        let rule = self.routes().classify(request.path);
        let token = session_token(request.headers);

        let (principal, reissued) = match self.sessions().resolve(token.as_deref()).await {
            Ok(resolved) => (Some(resolved.principal), resolved.reissued),
            Err(rejection) => {
                log_rejection(&rejection);
                (None, None)
            }
        };
        match (rule.access, &principal) {
            (Access::Public, _) => {}
            (Access::Authenticated | Access::Verified, None) => {
                return Err(GateError::Unauthenticated);
            }
            (Access::Authenticated, Some(_)) => {}
            (Access::Verified, Some(principal)) => {
                if let Err(err) = require_verified(principal) {
                    warn!(
                        user_id = %principal.user_id,
                        path = request.path,
                        "Unverified principal denied"
                    );
                    return Err(err);
                }
            }
        }

        if !is_safe_method(request.method) && !self.csrf().is_excluded(request.path) {
            let anon = extract::cookie(request.headers, ANON_COOKIE);
            let csrf_subject = principal
                .as_ref()
                .map(|principal| principal.session_id.as_str())
                .or(anon.as_deref());
            if let Err(reason) = self
                .csrf()
                .verify_request(csrf_subject, request.method, request.headers, request.body)
                .await
            {
                warn!(
                    reason = %reason,
                    method = %request.method,
                    path = request.path,
                    "CSRF validation failed"
                );
                return Err(GateError::Csrf(reason));
            }
        }

        debug!(path = request.path, class = %rule.class, "Request admitted");
        Ok(Admission {
            principal,
            reissued,
            rate,
        })
    }
}

/// Content-Length above `MAX_BUFFERED_BODY`, when the client declared one.
fn declares_oversized_body(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .is_some_and(|length| length > MAX_BUFFERED_BODY as u64)
}

/// Axum middleware running the gate in front of every route.
pub async fn enforce(State(gate): State<Arc<Gate>>, request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let rate = match gate.check_rate(parts.uri.path(), &parts.headers, peer).await {
        Ok(rate) => rate,
        Err(err) => return err.into_response(),
    };

    // Only bodies the CSRF check will read are buffered.
    let needs_body = !is_safe_method(&parts.method) && !gate.csrf().is_excluded(parts.uri.path());
    let (body, buffered) = if !needs_body {
        (body, Bytes::new())
    } else if declares_oversized_body(&parts.headers) {
        warn!(path = parts.uri.path(), "Request body exceeds buffer limit");
        return GateError::Body(BodyFailure::TooLarge).into_response();
    } else {
        match to_bytes(body, MAX_BUFFERED_BODY).await {
            Ok(bytes) => (Body::from(bytes.clone()), bytes),
            Err(err) => {
                warn!(path = parts.uri.path(), "Failed to buffer request body: {err}");
                return GateError::Body(BodyFailure::Unreadable).into_response();
            }
        }
    };

    let request = GateRequest {
        method: &parts.method,
        path: parts.uri.path(),
        headers: &parts.headers,
        body: &buffered,
        peer,
    };
    let admission = match gate.admit(request, rate).await {
        Ok(admission) => admission,
        Err(err) => return err.into_response(),
    };

    let mut request = Request::from_parts(parts, body);
    if let Some(principal) = admission.principal {
        request.extensions_mut().insert(principal);
    }
    let mut response = next.run(request).await;
    admission.rate.apply_headers(response.headers_mut());
    if let Some(token) = admission.reissued {
        match gate.sessions().session_cookie(&token) {
            Ok(cookie) => {
                response.headers_mut().append(SET_COOKIE, cookie);
            }
            Err(err) => error!("Failed to build session cookie: {err}"),
        }
    }
    response
}

impl<S: Send + Sync> FromRequestParts<S> for Principal {
    type Rejection = GateError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Self>()
            .cloned()
            .ok_or(GateError::Unauthenticated)
    }
}

impl<S: Send + Sync> OptionalFromRequestParts<S> for Principal {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<Self>().cloned())
    }
}
