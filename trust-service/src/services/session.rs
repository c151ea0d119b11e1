use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::consumer::check_duration;
use super::error::ServiceError;
use super::keys::IssuerKeys;
use super::metrics::SESSION_TOKENS_REJECTED;
use crate::db::Query;
use crate::models::{self, AuthConsumer, AuthSession, GroupId, ScopeDetails};
use crate::secure::{LoadOptions, SecuredStore, Signable};

/// Claims of a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub iss: String,
    /// Consumer id
    pub sub: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub session_id: String,
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
    #[serde(default)]
    pub scopes: ScopeDetails,
}

/// Opens sessions for consumers and issues the tokens that carry them.
#[derive(Clone)]
pub struct SessionManager {
    store: SecuredStore,
    keys: Arc<IssuerKeys>,
    default_duration: Duration,
}

impl SessionManager {
    pub fn new(store: SecuredStore, keys: Arc<IssuerKeys>, default_duration: Duration) -> Self {
        Self {
            store,
            keys,
            default_duration,
        }
    }

    /// Lifetime of sessions opened without an explicit duration.
    pub fn default_duration(&self) -> Duration {
        self.default_duration
    }

    /// Opens a session lasting the configured default duration.
    pub async fn open_default_session(
        &self,
        consumer: &AuthConsumer,
        mfa: bool,
    ) -> Result<AuthSession, ServiceError> {
        self.open_session(consumer, self.default_duration, mfa).await
    }

    /// Persists a session copying the consumer's current groups and scopes.
    pub async fn open_session(
        &self,
        consumer: &AuthConsumer,
        duration: Duration,
        mfa: bool,
    ) -> Result<AuthSession, ServiceError> {
        if consumer.disabled {
            return Err(ServiceError::Unauthorized(format!(
                "Consumer {} is disabled",
                consumer.id
            )));
        }
        if duration <= Duration::zero() {
            return Err(ServiceError::InvalidRequest(
                "Session duration must be positive".to_string(),
            ));
        }
        check_duration("Session duration", duration)?;

        let created = models::now();
        let expire_at = created.checked_add_signed(duration).ok_or_else(|| {
            ServiceError::InvalidRequest("Session duration is out of range".to_string())
        })?;
        let mut session = AuthSession {
            id: Uuid::new_v4().to_string(),
            consumer_id: consumer.id.clone(),
            group_ids: consumer.group_ids.clone(),
            scopes: consumer.scopes.clone(),
            created,
            expire_at,
            mfa,
        };
        self.store.insert(&mut session).await?;

        tracing::info!(
            session_id = %session.id,
            consumer_id = %session.consumer_id,
            expire_at = %session.expire_at,
            mfa = session.mfa,
            "Session opened"
        );
        Ok(session)
    }

    /// Signs a token carrying the session's identity and grants.
    pub fn issue_session_token(&self, session: &AuthSession) -> Result<String, ServiceError> {
        let claims = SessionClaims {
            iss: self.keys.issuer().to_string(),
            sub: session.consumer_id.clone(),
            jti: Uuid::new_v4().to_string(),
            iat: session.created.timestamp(),
            exp: session.expire_at.timestamp(),
            session_id: session.id.clone(),
            group_ids: session.group_ids.clone(),
            scopes: session.scopes.clone(),
        };
        self.keys.sign(&claims)
    }

    /// Checks signature, algorithm, issuer and expiry. Touches no state.
    pub fn verify_session_token(&self, token: &str) -> Result<SessionClaims, ServiceError> {
        self.verify_session_token_at(token, Utc::now())
    }

    pub fn verify_session_token_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionClaims, ServiceError> {
        let claims: SessionClaims = self.keys.verify(token).inspect_err(|e| {
            tracing::warn!(error = %e, "Session token rejected");
            metrics::counter!(SESSION_TOKENS_REJECTED, "reason" => "invalid").increment(1);
        })?;

        if claims.exp <= now.timestamp() {
            tracing::debug!(session_id = %claims.session_id, "Session token expired");
            metrics::counter!(SESSION_TOKENS_REJECTED, "reason" => "expired").increment(1);
            return Err(ServiceError::TokenExpired);
        }
        Ok(claims)
    }

    /// Verifies the token and requires its session to still exist.
    pub async fn authenticate(
        &self,
        token: &str,
    ) -> Result<(SessionClaims, AuthSession), ServiceError> {
        let claims = self.verify_session_token(token)?;
        let session = match self.load_session(&claims.session_id).await {
            Ok(session) => session,
            Err(ServiceError::NotFound(_)) => {
                metrics::counter!(SESSION_TOKENS_REJECTED, "reason" => "revoked").increment(1);
                return Err(ServiceError::Unauthorized(format!(
                    "Session {} no longer exists",
                    claims.session_id
                )));
            }
            Err(e) => return Err(e),
        };

        if session.consumer_id != claims.sub || session.is_expired_at(Utc::now()) {
            return Err(ServiceError::Unauthorized(format!(
                "Session {} does not match its token",
                session.id
            )));
        }
        Ok((claims, session))
    }

    pub async fn load_session(&self, id: &str) -> Result<AuthSession, ServiceError> {
        self.store
            .load_one(&Query::by_id(AuthSession::KIND, id), LoadOptions::default())
            .await
    }

    pub async fn load_sessions_by_consumer_ids(
        &self,
        consumer_ids: &[String],
    ) -> Result<Vec<AuthSession>, ServiceError> {
        if consumer_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .load_all(
                &Query::all(AuthSession::KIND).any_of("consumer_id", consumer_ids),
                LoadOptions::default(),
            )
            .await
    }

    /// Sessions whose expiry is strictly before `now`.
    pub async fn load_expired_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AuthSession>, ServiceError> {
        self.store
            .load_all(
                &Query::all(AuthSession::KIND).before("expire_at", now),
                LoadOptions::default(),
            )
            .await
    }

    /// Returns whether the session existed.
    pub async fn delete_session(&self, id: &str) -> Result<bool, ServiceError> {
        let deleted = self.store.delete::<AuthSession>(id).await?;
        if deleted {
            tracing::info!(session_id = %id, "Session deleted");
        }
        Ok(deleted)
    }

    /// Deletes every session of the consumer, returning how many went.
    pub async fn delete_sessions_by_consumer(
        &self,
        consumer_id: &str,
    ) -> Result<usize, ServiceError> {
        let sessions = self
            .load_sessions_by_consumer_ids(&[consumer_id.to_string()])
            .await?;
        let mut deleted = 0;
        for session in &sessions {
            if self.delete_session(&session.id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
