pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod secure;
pub mod services;
pub mod workers;

use chrono::Duration;
use service_core::axum::{routing::get, Router};
use std::sync::Arc;

use crate::db::RecordStore;
use crate::secure::{CanonicalSigner, FieldEncryptor, SecuredStore};
use crate::services::{ConsumerRegistry, IssuerKeys, SessionManager, SigninTokenIssuer};

/// The wired trust components over one record store.
#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn RecordStore>,
    pub store: SecuredStore,
    pub consumers: ConsumerRegistry,
    pub sessions: SessionManager,
    pub signin: SigninTokenIssuer,
}

impl AppState {
    pub fn new(
        records: Arc<dyn RecordStore>,
        signer: CanonicalSigner,
        encryptor: FieldEncryptor,
        keys: IssuerKeys,
        session_duration: Duration,
        max_validity_periods: usize,
    ) -> Self {
        let store = SecuredStore::new(records.clone(), Arc::new(signer), Arc::new(encryptor));
        let keys = Arc::new(keys);
        let sessions = SessionManager::new(store.clone(), keys.clone(), session_duration);
        let signin = SigninTokenIssuer::new(store.clone(), keys);
        let consumers = ConsumerRegistry::new(
            store.clone(),
            signin.clone(),
            sessions.clone(),
            max_validity_periods,
        );

        Self {
            records,
            store,
            consumers,
            sessions,
            signin,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
}
