//! CSRF token fetch and rotation endpoints.
//!
//! Authenticated callers get the token bound to their session id. Anonymous
//! callers are bound to an opaque `gate_anon` id, minted here on first use.
//! Rotation sits outside the excluded `/v1/csrf` prefix, so it needs the
//! current token before a new one is handed out.

use crate::gate::{
    Gate, GateError, Principal,
    csrf::{ANON_COOKIE, CSRF_RESPONSE_HEADER},
    extract,
};
use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use ulid::Ulid;
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CsrfTokenResponse {
    pub token: String,
}

#[utoipa::path(
    get,
    path = "/v1/csrf",
    responses(
        (status = 200, description = "Current or newly issued CSRF token", body = CsrfTokenResponse),
        (status = 503, description = "Token store unavailable", body = crate::gate::error::MessageErrorBody)
    ),
    tag = "csrf"
)]
pub async fn csrf_token(
    headers: HeaderMap,
    gate: Extension<Arc<Gate>>,
    principal: Option<Principal>,
) -> Response {
    // Only ids we minted are accepted as anonymous subjects.
    let anon = extract::cookie(&headers, ANON_COOKIE).filter(|id| Ulid::from_string(id).is_ok());
    let (subject, mint_anon) = match (principal, anon) {
        (Some(principal), _) => (principal.session_id, false),
        (None, Some(anon)) => (anon, false),
        (None, None) => (Ulid::new().to_string(), true),
    };

    let token = match gate.csrf().issue(&subject).await {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to issue csrf token: {err}");
            return GateError::Unavailable("Unable to issue a CSRF token. Please retry.".to_string())
                .into_response();
        }
    };

    token_response(&gate, token, mint_anon.then_some(subject.as_str()))
}

#[utoipa::path(
    post,
    path = "/v1/auth/csrf/rotate",
    responses(
        (status = 200, description = "Previous token revoked, new token issued", body = CsrfTokenResponse),
        (status = 403, description = "CSRF validation failed", body = crate::gate::error::MessageErrorBody),
        (status = 503, description = "Token store unavailable", body = crate::gate::error::MessageErrorBody)
    ),
    tag = "csrf"
)]
pub async fn rotate(
    headers: HeaderMap,
    gate: Extension<Arc<Gate>>,
    principal: Option<Principal>,
) -> Response {
    // Same subject the gate just verified the submitted token against.
    let Some(subject) = principal
        .map(|principal| principal.session_id)
        .or_else(|| extract::cookie(&headers, ANON_COOKIE))
    else {
        return GateError::Forbidden.into_response();
    };

    let token = match gate.csrf().rotate(&subject).await {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to rotate csrf token: {err}");
            return GateError::Unavailable("Unable to issue a CSRF token. Please retry.".to_string())
                .into_response();
        }
    };

    token_response(&gate, token, None)
}

fn token_response(gate: &Gate, token: String, anon: Option<&str>) -> Response {
    match build_headers(gate, &token, anon) {
        Ok(headers) => {
            (StatusCode::OK, headers, Json(CsrfTokenResponse { token })).into_response()
        }
        Err(err) => {
            error!("Failed to build csrf headers: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn build_headers(
    gate: &Gate,
    token: &str,
    anon: Option<&str>,
) -> Result<HeaderMap, axum::http::header::InvalidHeaderValue> {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static(CSRF_RESPONSE_HEADER),
        HeaderValue::from_str(token)?,
    );
    for cookie in gate.csrf().token_cookies(token)? {
        headers.append(SET_COOKIE, cookie);
    }
    if let Some(anon) = anon {
        headers.append(SET_COOKIE, gate.csrf().anon_cookie(anon)?);
    }
    Ok(headers)
}
