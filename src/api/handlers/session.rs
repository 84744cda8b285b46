//! Session endpoints: inspect, refresh and logout.

use crate::gate::{Gate, GateError, Principal, csrf::ANON_COOKIE, extract};
use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionResponse {
    pub user_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub verified: bool,
}

impl From<&Principal> for SessionResponse {
    fn from(principal: &Principal) -> Self {
        Self {
            user_id: principal.user_id.to_string(),
            email: principal.email.clone(),
            display_name: principal.display_name.clone(),
            verified: principal.is_verified(),
        }
    }
}

#[utoipa::path(
    get,
    path = "/v1/auth/session",
    responses(
        (status = 200, description = "Session is active", body = SessionResponse),
        (status = 204, description = "No active session")
    ),
    tag = "auth"
)]
pub async fn session(principal: Option<Principal>) -> Response {
    // Missing or invalid sessions are "no session" to avoid leaking auth state.
    match principal {
        Some(principal) => {
            (StatusCode::OK, Json(SessionResponse::from(&principal))).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/session/refresh",
    responses(
        (status = 200, description = "Session re-derived from the identity store", body = SessionResponse),
        (status = 401, description = "No valid session", body = crate::gate::error::AuthErrorBody),
        (status = 403, description = "CSRF validation failed", body = crate::gate::error::MessageErrorBody)
    ),
    tag = "auth"
)]
pub async fn refresh(
    gate: Extension<Arc<Gate>>,
    principal: Principal,
) -> Result<Response, GateError> {
    let issued = gate.sessions().refresh(&principal).await?;
    debug!(user_id = %issued.principal.user_id, "Session refreshed");

    let mut headers = HeaderMap::new();
    match gate.sessions().session_cookie(&issued.token) {
        Ok(cookie) => {
            headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => {
            error!("Failed to build session cookie: {err}");
            return Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
    }
    Ok((
        StatusCode::OK,
        headers,
        Json(SessionResponse::from(&issued.principal)),
    )
        .into_response())
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 204, description = "Session and CSRF token cleared"),
        (status = 403, description = "CSRF validation failed", body = crate::gate::error::MessageErrorBody)
    ),
    tag = "auth"
)]
pub async fn logout(
    headers: HeaderMap,
    gate: Extension<Arc<Gate>>,
    principal: Option<Principal>,
) -> impl IntoResponse {
    let subject = principal
        .map(|principal| principal.session_id)
        .or_else(|| extract::cookie(&headers, ANON_COOKIE));
    if let Some(subject) = subject
        && let Err(err) = gate.csrf().revoke(&subject).await
    {
        error!("Failed to revoke csrf token: {err}");
    }

    // Always clear the cookies, even if nothing was stored.
    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = gate.sessions().clear_session_cookie() {
        response_headers.append(SET_COOKIE, cookie);
    }
    if let Ok(cookies) = gate.csrf().clear_cookies() {
        for cookie in cookies {
            response_headers.append(SET_COOKIE, cookie);
        }
    }
    (StatusCode::NO_CONTENT, response_headers).into_response()
}
