use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::ServiceError;
use super::keys::IssuerKeys;
use crate::db::Query;
use crate::models::AuthConsumer;
use crate::secure::{LoadOptions, SecuredStore, Signable};

/// Claims of a consumer signin token. `issued_at` is in microseconds and
/// names the validity period the token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigninClaims {
    pub iss: String,
    pub consumer_id: String,
    pub issued_at: i64,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

/// Issues and checks the long-lived tokens a consumer trades for sessions.
/// Revocation happens by shortening or dropping validity periods, so the
/// token itself is never stored.
#[derive(Clone)]
pub struct SigninTokenIssuer {
    store: SecuredStore,
    keys: Arc<IssuerKeys>,
}

impl SigninTokenIssuer {
    pub fn new(store: SecuredStore, keys: Arc<IssuerKeys>) -> Self {
        Self { store, keys }
    }

    /// Token bound to the consumer's latest validity period.
    pub fn issue(&self, consumer: &AuthConsumer) -> Result<String, ServiceError> {
        let period = consumer.validity_periods.latest().ok_or_else(|| {
            ServiceError::InvalidRequest(format!(
                "Consumer {} has no validity period",
                consumer.id
            ))
        })?;

        let claims = SigninClaims {
            iss: self.keys.issuer().to_string(),
            consumer_id: consumer.id.clone(),
            issued_at: period.issued_at.timestamp_micros(),
            iat: period.issued_at.timestamp(),
            exp: period.expires_at().map(|end| end.timestamp()),
        };
        self.keys.sign(&claims)
    }

    /// Recovers the consumer id from a token still covered by a validity
    /// period of that consumer.
    pub async fn verify(&self, token: &str) -> Result<String, ServiceError> {
        Ok(self.verify_consumer(token, Utc::now()).await?.id)
    }

    pub async fn verify_consumer(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthConsumer, ServiceError> {
        let claims: SigninClaims = self
            .keys
            .verify(token)
            .map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;

        let consumer: AuthConsumer = self
            .store
            .load_one(
                &Query::by_id(AuthConsumer::KIND, &claims.consumer_id),
                LoadOptions::default(),
            )
            .await
            .map_err(|e| match e {
                ServiceError::NotFound(_) => ServiceError::InvalidRequest(format!(
                    "Unknown consumer {}",
                    claims.consumer_id
                )),
                other => other,
            })?;

        check_claims(&claims, &consumer, now)?;
        Ok(consumer)
    }
}

/// Ordered match of the token's issue date against the consumer's periods.
pub fn check_claims(
    claims: &SigninClaims,
    consumer: &AuthConsumer,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    if let Some(exp) = claims.exp {
        if exp < now.timestamp() {
            return Err(ServiceError::InvalidRequest(
                "Signin token expired".to_string(),
            ));
        }
    }

    if consumer
        .validity_periods
        .find_active(claims.issued_at, now)
        .is_none()
    {
        tracing::warn!(
            consumer_id = %consumer.id,
            issued_at = claims.issued_at,
            "Signin token matches no active validity period"
        );
        return Err(ServiceError::InvalidRequest(format!(
            "Signin token for consumer {} has been revoked or expired",
            consumer.id
        )));
    }

    if consumer.disabled {
        return Err(ServiceError::Unauthorized(format!(
            "Consumer {} is disabled",
            consumer.id
        )));
    }
    Ok(())
}
