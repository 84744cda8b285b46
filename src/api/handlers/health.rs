use crate::{GIT_COMMIT_HASH, gate::Gate, store::with_timeout};
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    store: String,
}

#[utoipa::path(
    get,
    path= "/health",
    responses (
        (status = 200, description = "Token store is reachable", body = [Health]),
        (status = 503, description = "Token store is unreachable", body = [Health])
    ),
    tag= "health"
)]
// axum handler for health
pub async fn health(method: Method, gate: Extension<Arc<Gate>>) -> impl IntoResponse {
    let result = with_timeout(gate.store_timeout(), gate.store().ping()).await;
    if let Err(err) = &result {
        error!("Failed to ping token store: {err}");
    }

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: if result.is_ok() {
            "ok".to_string()
        } else {
            "error".to_string()
        },
    };

    let body = if method == Method::GET {
        Json(&health).into_response()
    } else {
        Body::empty().into_response()
    };

    let short_hash = health.commit.get(0..7).unwrap_or_default();

    let mut headers = HeaderMap::new();
    match format!("{}:{}:{}", health.name, health.version, short_hash).parse::<HeaderValue>() {
        Ok(x_app_header_value) => {
            debug!("X-App header: {:?}", x_app_header_value);
            headers.insert("X-App", x_app_header_value);
        }
        Err(err) => error!("Failed to parse X-App header: {}", err),
    }

    if result.is_ok() {
        debug!("Token store is healthy");
        (StatusCode::OK, headers, body)
    } else {
        debug!("Token store is unhealthy");
        (StatusCode::SERVICE_UNAVAILABLE, headers, body)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::TestApp;
    use crate::{
        api,
        gate::{Gate, GateConfig, MemoryIdentityStore},
        store::{
            CounterState, MemoryTokenStore, PurgeReport, StoreFuture, StoreKey, TokenRecord,
            TokenStore,
        },
    };
    use anyhow::Result;
    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode},
    };
    use chrono::{DateTime, Utc};
    use secrecy::SecretString;
    use serde_json::Value;
    use std::{
        sync::Arc,
        time::{Duration, Instant},
    };
    use tower::ServiceExt;

    /// Answers everything from memory except `ping`, which hangs.
    struct StalledPing(MemoryTokenStore);

    impl TokenStore for StalledPing {
        fn get_token<'a>(&'a self, key: &'a StoreKey) -> StoreFuture<'a, Option<TokenRecord>> {
            self.0.get_token(key)
        }

        fn get_or_insert_token<'a>(
            &'a self,
            key: &'a StoreKey,
            candidate: &'a TokenRecord,
            now: DateTime<Utc>,
        ) -> StoreFuture<'a, TokenRecord> {
            self.0.get_or_insert_token(key, candidate, now)
        }

        fn put_token<'a>(
            &'a self,
            key: &'a StoreKey,
            record: &'a TokenRecord,
        ) -> StoreFuture<'a, ()> {
            self.0.put_token(key, record)
        }

        fn delete_token<'a>(&'a self, key: &'a StoreKey) -> StoreFuture<'a, bool> {
            self.0.delete_token(key)
        }

        fn hit_counter<'a>(
            &'a self,
            key: &'a StoreKey,
            window: Duration,
            max: u32,
            now: DateTime<Utc>,
        ) -> StoreFuture<'a, CounterState> {
            self.0.hit_counter(key, window, max, now)
        }

        fn purge_expired(&self, now: DateTime<Utc>) -> StoreFuture<'_, PurgeReport> {
            self.0.purge_expired(now)
        }

        fn ping(&self) -> StoreFuture<'_, ()> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn health_ping_honours_configured_store_timeout() -> Result<()> {
        let gate = Arc::new(Gate::new(
            Arc::new(StalledPing(MemoryTokenStore::new())),
            Arc::new(MemoryIdentityStore::new()),
            GateConfig::new(SecretString::from("health-test-key".to_string()))
                .with_store_timeout(Duration::from_millis(50)),
        ));
        assert_eq!(gate.store_timeout(), Duration::from_millis(50));

        let started = Instant::now();
        let response = api::app(gate)
            .oneshot(Request::builder().uri("/health").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(started.elapsed() < Duration::from_secs(2));
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let body: Value = serde_json::from_slice(&bytes)?;
        assert_eq!(body["store"], "error");
        Ok(())
    }

    #[tokio::test]
    async fn health_reports_store_status() -> Result<()> {
        let test = TestApp::new();
        let response = test
            .app()
            .oneshot(Request::builder().uri("/health").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-app"));
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let body: Value = serde_json::from_slice(&bytes)?;
        assert_eq!(body["store"], "ok");
        assert_eq!(body["name"], env!("CARGO_PKG_NAME"));

        test.store.set_offline(true);
        let response = test
            .app()
            .oneshot(Request::builder().uri("/health").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        Ok(())
    }

    #[tokio::test]
    async fn head_returns_empty_body() -> Result<()> {
        let test = TestApp::new();
        let response = test
            .app()
            .oneshot(
                Request::builder()
                    .method(Method::HEAD)
                    .uri("/health")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        assert!(bytes.is_empty());
        Ok(())
    }
}
