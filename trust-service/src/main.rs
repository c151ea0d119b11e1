use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use trust_service::{
    build_router,
    config::TrustConfig,
    db::{self, PgRecordStore},
    secure::{CanonicalSigner, FieldEncryptor},
    services::IssuerKeys,
    workers::SessionReaper,
    AppState,
};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = TrustConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );
    trust_service::services::metrics::init_metrics().map_err(AppError::ConfigError)?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting trust service"
    );

    let pool = db::create_pool(&config.database)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::Error::new(e)))?;
    db::run_migrations(&pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::Error::new(e)))?;

    // Key material problems are fatal at startup
    let signer = CanonicalSigner::from_base64_keys(&config.storage_keys.signing_keys)
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("DB_SIGNING_KEYS: {}", e)))?;
    let encryptor = FieldEncryptor::from_base64_keys(&config.storage_keys.encryption_keys)
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("DB_ENCRYPTION_KEYS: {}", e)))?;
    let keys = IssuerKeys::load(&config.token).map_err(AppError::ConfigError)?;
    tracing::info!(
        signing_keys = config.storage_keys.signing_keys.len(),
        encryption_keys = config.storage_keys.encryption_keys.len(),
        "Record keys loaded"
    );

    let state = AppState::new(
        Arc::new(PgRecordStore::new(pool)),
        signer,
        encryptor,
        keys,
        config.token.session_duration(),
        config.consumers.max_validity_periods,
    );

    let reaper = SessionReaper::new(state.sessions.clone(), config.reaper.interval());
    let reaper_shutdown = reaper.shutdown_token();
    let reaper_handle = reaper.spawn();

    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    service_core::axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reaper_shutdown.cancel();
    if let Err(e) = reaper_handle.await {
        tracing::error!(error = %e, "Session reaper task failed");
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
