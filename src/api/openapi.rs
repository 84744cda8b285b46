use super::handlers::{csrf, health, session};
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Add new endpoints here via `.routes(routes!(...))` so they are both served
/// and included in the generated `OpenAPI` spec.
pub(crate) fn api_router() -> OpenApiRouter {
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(csrf::csrf_token))
        .routes(routes!(csrf::rotate))
        .routes(routes!(session::session))
        .routes(routes!(session::refresh))
        .routes(routes!(session::logout));

    let mut health_tag = Tag::new("health");
    health_tag.description = Some("Service and token store health".to_string());

    let mut csrf_tag = Tag::new("csrf");
    csrf_tag.description = Some("Anti-forgery token issuance and rotation".to_string());

    let mut auth_tag = Tag::new("auth");
    auth_tag.description = Some("Session inspection, refresh and logout".to_string());

    router.get_openapi_mut().tags = Some(vec![health_tag, csrf_tag, auth_tag]);

    router
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    // Use Cargo.toml metadata instead of the utoipa-axum crate info defaults.
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = cargo_license();

    OpenApiBuilder::new().info(info).build()
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `;` separated and may include "Name <email>".
    let primary = env!("CARGO_PKG_AUTHORS").split(';').next().map(str::trim)?;
    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &'static str) -> Option<&'static str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    fn non_empty(value: &str) -> Option<&str> {
        let value = value.trim();
        (!value.is_empty()).then_some(value)
    }

    match author.split_once('<') {
        Some((name, email)) => (non_empty(name), non_empty(email.trim_end_matches('>'))),
        None => (non_empty(author), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_info_from_cargo() {
        let spec = openapi();
        assert_eq!(spec.info.title, env!("CARGO_PKG_NAME"));
        assert_eq!(spec.info.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(
            spec.info.description.as_deref(),
            Some(env!("CARGO_PKG_DESCRIPTION"))
        );
        let license = spec.info.license.map(|license| license.name);
        assert_eq!(license.as_deref(), Some(env!("CARGO_PKG_LICENSE")));
    }

    #[test]
    fn openapi_documents_gate_endpoints() {
        let spec = openapi();
        let tags = spec.tags.clone().unwrap_or_default();
        for name in ["health", "csrf", "auth"] {
            assert!(tags.iter().any(|tag| tag.name == name), "missing tag {name}");
        }
        for path in [
            "/health",
            "/v1/csrf",
            "/v1/auth/csrf/rotate",
            "/v1/auth/session",
            "/v1/auth/session/refresh",
            "/v1/auth/logout",
        ] {
            assert!(spec.paths.paths.contains_key(path), "missing path {path}");
        }
    }

    #[test]
    fn parse_author_splits_name_and_email() {
        assert_eq!(
            parse_author("Jane Doe <jane@example.com>"),
            (Some("Jane Doe"), Some("jane@example.com"))
        );
        assert_eq!(parse_author("Solo"), (Some("Solo"), None));
        assert_eq!(parse_author(" "), (None, None));
    }
}
