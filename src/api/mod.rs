use crate::{
    gate::{Gate, GateConfig, PostgresIdentityStore, enforce, sweeper},
    store::PostgresTokenStore,
};
use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    middleware,
};
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;
use utoipa_axum::router::OpenApiRouter;

pub(crate) mod handlers;
// OpenAPI router wiring and route registration live in openapi.rs.
mod openapi;

pub use handlers::{health::Health, session::SessionResponse};
pub use openapi::openapi;

/// Build the API router with all documented routes registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    openapi::api_router()
}

/// Gatehouse endpoints behind the gate.
#[must_use]
pub fn app(gate: Arc<Gate>) -> Router {
    app_with(gate, Router::new())
}

/// Gatehouse endpoints plus `routes`, all behind the gate.
///
/// Business handlers can take `Principal` or `Option<Principal>` as
/// extractors; the gate has already enforced the route's access level.
#[must_use]
pub fn app_with(gate: Arc<Gate>, routes: Router) -> Router {
    let (router, _openapi) = router().split_for_parts();
    router
        .merge(routes)
        .layer(middleware::from_fn_with_state(gate.clone(), enforce))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(gate)),
        )
}

/// Server settings resolved from the CLI.
pub struct ServerConfig {
    pub port: u16,
    pub dsn: String,
    pub gate: GateConfig,
    pub sweep_interval: Duration,
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(config: ServerConfig) -> Result<()> {
    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&config.dsn)
        .await
        .context("Failed to connect to database")?;

    let store_timeout = config.gate.store_timeout();
    let store = Arc::new(PostgresTokenStore::new(pool.clone()));
    let identities = Arc::new(PostgresIdentityStore::new(pool));
    let gate = Arc::new(Gate::new(store.clone(), identities, config.gate));

    // Expired counters and tokens are purged off the request path.
    let sweeper = sweeper::spawn_sweeper(store, config.sweep_interval, store_timeout);

    let app = app(gate);

    let listener = TcpListener::bind(format!("::0:{}", config.port)).await?;

    info!("Listening on [::]:{}", config.port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {err}");
        }
        info!("Gracefully shutdown");
    })
    .await?;

    sweeper.abort();

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
