use crate::{
    api,
    gate::{
        CsrfConfig, Gate, GateConfig, MemoryIdentityStore, SessionConfig, identity::IdentityRecord,
    },
    store::MemoryTokenStore,
};
use axum::Router;
use secrecy::SecretString;
use std::sync::Arc;
use uuid::Uuid;

/// Gate wired to in-memory stores with insecure cookies.
pub(crate) struct TestApp {
    pub store: Arc<MemoryTokenStore>,
    pub identities: Arc<MemoryIdentityStore>,
    pub gate: Arc<Gate>,
}

impl TestApp {
    pub fn new() -> Self {
        let store = Arc::new(MemoryTokenStore::new());
        let identities = Arc::new(MemoryIdentityStore::new());
        let config = GateConfig::new(SecretString::from("handler-test-key".to_string()))
            .with_csrf(CsrfConfig::default().with_cookie_secure(false))
            .with_session(SessionConfig::default().with_cookie_secure(false));
        let gate = Arc::new(Gate::new(store.clone(), identities.clone(), config));
        Self {
            store,
            identities,
            gate,
        }
    }

    pub fn app(&self) -> Router {
        api::app(self.gate.clone())
    }

    pub fn user(&self, verified: Option<bool>) -> Uuid {
        let user_id = Uuid::new_v4();
        self.identities.upsert(IdentityRecord {
            user_id,
            email: format!("{user_id}@example.com"),
            display_name: Some("Test User".to_string()),
            email_verified: verified,
        });
        user_id
    }
}
