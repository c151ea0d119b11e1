pub mod consumer;
pub mod scope;
pub mod session;
pub mod warning;

pub use consumer::{
    AuthConsumer, ConsumerData, ConsumerType, GroupId, GroupRef, ValidityPeriod, ValidityPeriods,
};
pub use scope::{AuthConsumerScope, ScopeDetail, ScopeDetails, ScopeEndpoint, ScopeError};
pub use session::AuthSession;
pub use warning::{ConsumerWarning, ConsumerWarnings, WarningType};

use chrono::{DateTime, SubsecRound, Utc};

/// Current time truncated to microseconds, the precision every persisted
/// timestamp and every signin token carries.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Serde adapter storing a `chrono::Duration` as whole microseconds.
pub(crate) mod duration_micros {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_microseconds().unwrap_or(i64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let micros = i64::deserialize(deserializer)?;
        Ok(Duration::microseconds(micros))
    }
}

pub(crate) fn join_ids(ids: &[GroupId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn length_prefixed(value: &str) -> String {
    format!("{}:{}", value.len(), value)
}
