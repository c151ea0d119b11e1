use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{join_ids, GroupId, ScopeDetails};
use crate::secure::Signable;

/// A time-boxed authentication derived from a consumer. Group ids and
/// scopes are copied from the consumer when the session is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub id: String,
    pub consumer_id: String,
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
    #[serde(default)]
    pub scopes: ScopeDetails,
    pub created: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    #[serde(default)]
    pub mfa: bool,
}

impl AuthSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_at <= now
    }
}

impl Signable for AuthSession {
    const KIND: &'static str = "auth_session";

    fn id(&self) -> &str {
        &self.id
    }

    fn canonical_forms(&self) -> Vec<String> {
        let v2 = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.id,
            self.consumer_id,
            self.created.to_rfc3339(),
            self.expire_at.to_rfc3339(),
            self.mfa,
            join_ids(&self.group_ids),
            serde_json::to_string(&self.scopes).unwrap_or_default(),
        );
        let v1 = format!(
            "{}|{}|{}|{}",
            self.id,
            self.consumer_id,
            self.created.to_rfc3339(),
            self.expire_at.to_rfc3339(),
        );
        vec![v2, v1]
    }
}
