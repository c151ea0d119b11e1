use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::services::error::ServiceError;
use crate::services::metrics::{SESSION_REAPER_DELETED, SESSION_REAPER_FAILURES};
use crate::services::SessionManager;

/// Sessions deleted concurrently per pass.
const REAP_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub deleted: usize,
    pub failed: usize,
}

/// Periodically deletes expired sessions until cancelled.
pub struct SessionReaper {
    sessions: SessionManager,
    interval: Duration,
    shutdown_token: CancellationToken,
}

impl SessionReaper {
    pub fn new(sessions: SessionManager, interval: Duration) -> Self {
        Self {
            sessions,
            interval,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Session reaper started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Session reaper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_once().await {
                        tracing::error!(error = %e, "Session reaper pass failed");
                    }
                }
            }
        }
    }

    /// One pass: deletes every session expired now. A failed delete is
    /// logged and counted, and does not stop the pass.
    pub async fn reap_once(&self) -> Result<ReapReport, ServiceError> {
        let expired = self.sessions.load_expired_sessions(Utc::now()).await?;
        if expired.is_empty() {
            return Ok(ReapReport::default());
        }

        let outcomes: Vec<Result<bool, ServiceError>> = stream::iter(expired)
            .map(|session| async move {
                let result = self.sessions.delete_session(&session.id).await;
                if let Err(e) = &result {
                    tracing::warn!(
                        session_id = %session.id,
                        consumer_id = %session.consumer_id,
                        error = %e,
                        "Failed to delete expired session"
                    );
                }
                result
            })
            .buffer_unordered(REAP_CONCURRENCY)
            .collect()
            .await;

        let mut report = ReapReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(true) => report.deleted += 1,
                Ok(false) => {}
                Err(_) => report.failed += 1,
            }
        }

        metrics::counter!(SESSION_REAPER_DELETED).increment(report.deleted as u64);
        metrics::counter!(SESSION_REAPER_FAILURES).increment(report.failed as u64);
        tracing::info!(deleted = report.deleted, failed = report.failed, "Expired sessions reaped");
        Ok(report)
    }
}
