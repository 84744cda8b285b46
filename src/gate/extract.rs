//! Request parsing helpers: cookies, bearer tokens, client address and the
//! ordered CSRF token extractors.

use axum::http::{
    HeaderMap,
    header::{AUTHORIZATION, CONTENT_TYPE, COOKIE},
};
use std::net::IpAddr;

/// Header carrying the CSRF token.
pub const CSRF_HEADER: &str = "x-csrf-token";
/// Body field names accepted for the CSRF token, in priority order.
pub const CSRF_BODY_FIELDS: [&str; 3] = ["csrf-token", "csrfToken", "_csrf"];

/// Where a supplied CSRF token may live. Each extractor returns the first
/// non-empty value it finds, or `None`.
type CsrfExtractor = fn(&HeaderMap, &[u8]) -> Option<String>;

const CSRF_EXTRACTORS: [CsrfExtractor; 3] = [from_header, from_json_body, from_form_body];

/// Run the extractors in order and return the first token found.
#[must_use]
pub fn csrf_token(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    CSRF_EXTRACTORS
        .iter()
        .find_map(|extractor| extractor(headers, body))
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn content_type_contains(headers: &HeaderMap, needle: &str) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains(needle))
}

fn from_header(headers: &HeaderMap, _body: &[u8]) -> Option<String> {
    headers
        .get(CSRF_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(non_empty)
}

fn from_json_body(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    if body.is_empty() || !content_type_contains(headers, "json") {
        return None;
    }
    // Unparseable bodies are treated as "no token"; the business handler
    // reports the malformed payload itself.
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let object = value.as_object()?;
    CSRF_BODY_FIELDS.iter().find_map(|field| {
        object
            .get(*field)
            .and_then(serde_json::Value::as_str)
            .and_then(non_empty)
    })
}

fn from_form_body(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    if body.is_empty() || !content_type_contains(headers, "application/x-www-form-urlencoded") {
        return None;
    }
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(body).into_owned().collect();
    CSRF_BODY_FIELDS.iter().find_map(|field| {
        pairs
            .iter()
            .find(|(key, _)| key == field)
            .and_then(|(_, value)| non_empty(value))
    })
}

/// Read a cookie value by name.
#[must_use]
pub fn cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|header| header.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let (key, val) = pair.trim().split_once('=')?;
            (key.trim() == name).then(|| val.trim().to_string())
        })
        .filter(|value| !value.is_empty())
}

/// Read an `Authorization: Bearer` token.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Extract a client IP from common proxy headers.
#[must_use]
pub fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .and_then(|value| value.parse().ok());
    if forwarded.is_some() {
        return forwarded;
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .and_then(|value| value.parse().ok())
}
