use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::{
    duration_micros, join_ids, length_prefixed, ConsumerWarning, ConsumerWarnings, ScopeDetails,
    WarningType,
};
use crate::secure::{SecretField, Sealed, Signable};

pub type GroupId = i64;

/// A group as seen by the group lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRef {
    pub id: GroupId,
    #[serde(default)]
    pub name: Option<String>,
}

impl GroupRef {
    pub fn new(id: GroupId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: Some(name.into()),
        }
    }

    pub fn id_only(id: GroupId) -> Self {
        Self { id, name: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsumerType {
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "ldap")]
    Ldap,
    #[serde(rename = "corporate-sso")]
    CorporateSso,
    #[serde(rename = "github")]
    Github,
    #[serde(rename = "gitlab")]
    Gitlab,
    #[serde(rename = "openid-connect")]
    OpenIdConnect,
    #[serde(rename = "builtin")]
    Builtin,
    #[serde(rename = "service")]
    Service,
    #[serde(rename = "hatchery")]
    Hatchery,
}

impl ConsumerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerType::Local => "local",
            ConsumerType::Ldap => "ldap",
            ConsumerType::CorporateSso => "corporate-sso",
            ConsumerType::Github => "github",
            ConsumerType::Gitlab => "gitlab",
            ConsumerType::OpenIdConnect => "openid-connect",
            ConsumerType::Builtin => "builtin",
            ConsumerType::Service => "service",
            ConsumerType::Hatchery => "hatchery",
        }
    }

    /// Root consumers created by an interactive signin driver.
    pub fn is_interactive(&self) -> bool {
        !self.is_delegated()
    }

    /// Types that may only exist as the child of another consumer.
    pub fn is_delegated(&self) -> bool {
        matches!(
            self,
            ConsumerType::Builtin | ConsumerType::Service | ConsumerType::Hatchery
        )
    }

    /// Types whose signin token can be rotated.
    pub fn is_regenerable(&self) -> bool {
        self.is_delegated()
    }
}

impl fmt::Display for ConsumerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A window during which signin tokens issued at `issued_at` are accepted.
/// A zero duration never expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityPeriod {
    pub issued_at: DateTime<Utc>,
    #[serde(with = "duration_micros")]
    pub duration: Duration,
}

impl ValidityPeriod {
    pub fn new(issued_at: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            issued_at,
            duration,
        }
    }

    pub fn is_open_ended(&self) -> bool {
        self.duration == Duration::zero()
    }

    /// Saturates at the latest representable instant.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        (!self.is_open_ended()).then(|| saturating_add(self.issued_at, self.duration))
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map_or(true, |end| now <= end)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidityPeriods(Vec<ValidityPeriod>);

impl ValidityPeriods {
    pub fn single(period: ValidityPeriod) -> Self {
        Self(vec![period])
    }

    /// Period with the greatest issue date.
    pub fn latest(&self) -> Option<&ValidityPeriod> {
        self.0.iter().max_by_key(|p| p.issued_at)
    }

    /// First period, in stored order, issued at `issued_at_micros` and still
    /// active at `now`.
    pub fn find_active(
        &self,
        issued_at_micros: i64,
        now: DateTime<Utc>,
    ) -> Option<&ValidityPeriod> {
        self.0
            .iter()
            .find(|p| p.issued_at.timestamp_micros() == issued_at_micros && p.is_active_at(now))
    }

    /// Caps every period that would outlive `now + overlap` and appends a
    /// fresh one. The new issue date is strictly after every existing one.
    pub fn rotate(
        &mut self,
        now: DateTime<Utc>,
        overlap: Duration,
        new_duration: Duration,
    ) -> &ValidityPeriod {
        let cutoff = saturating_add(now, overlap);
        for period in &mut self.0 {
            if period.expires_at().map_or(true, |end| end > cutoff) {
                period.duration = (cutoff - period.issued_at).max(Duration::microseconds(1));
            }
        }

        let issued_at = match self.latest() {
            Some(latest) if latest.issued_at >= now => {
                latest.issued_at + Duration::microseconds(1)
            }
            _ => now,
        };
        self.0.push(ValidityPeriod::new(issued_at, new_duration));
        &self.0[self.0.len() - 1]
    }

    /// Drops the oldest periods until at most `max` remain. The latest
    /// period is always kept.
    pub fn prune(&mut self, max: usize) {
        let max = max.max(1);
        if self.0.len() <= max {
            return;
        }
        self.0.sort_by_key(|p| p.issued_at);
        let excess = self.0.len() - max;
        self.0.drain(..excess);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidityPeriod> {
        self.0.iter()
    }
}

fn saturating_add(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    at.checked_add_signed(duration)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Driver-specific data, stored encrypted.
pub type ConsumerData = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConsumer {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub consumer_type: ConsumerType,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub owner_id: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub scopes: ScopeDetails,
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
    #[serde(default)]
    pub invalid_group_ids: Vec<GroupId>,
    #[serde(default)]
    pub validity_periods: ValidityPeriods,
    #[serde(default)]
    pub warnings: ConsumerWarnings,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub last_authentication: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing)]
    pub data: Sealed<ConsumerData>,
}

impl AuthConsumer {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Moves `group` to the invalid list. Returns whether anything changed.
    pub fn invalidate_group(&mut self, group: &GroupRef) -> bool {
        let Some(pos) = self.group_ids.iter().position(|id| *id == group.id) else {
            return false;
        };
        self.group_ids.remove(pos);
        if !self.invalid_group_ids.contains(&group.id) {
            self.invalid_group_ids.push(group.id);
        }
        self.warnings
            .push(ConsumerWarning::group_invalid(group.id, group.name.clone()));
        self.sync_disabled();
        true
    }

    /// Moves `group_id` back from the invalid list, appended at the end.
    pub fn restore_group(&mut self, group_id: GroupId) -> bool {
        let Some(pos) = self.invalid_group_ids.iter().position(|id| *id == group_id) else {
            return false;
        };
        self.invalid_group_ids.remove(pos);
        if !self.group_ids.contains(&group_id) {
            self.group_ids.push(group_id);
        }
        self.warnings
            .remove(WarningType::GroupInvalid, Some(group_id));
        self.sync_disabled();
        true
    }

    /// Drops `group` from both lists for good.
    pub fn remove_group(&mut self, group: &GroupRef) -> bool {
        let was_valid = self.group_ids.contains(&group.id);
        let was_invalid = self.invalid_group_ids.contains(&group.id);
        if !was_valid && !was_invalid {
            return false;
        }

        self.group_ids.retain(|id| *id != group.id);
        if was_invalid {
            self.invalid_group_ids.retain(|id| *id != group.id);
            self.warnings
                .remove(WarningType::GroupInvalid, Some(group.id));
        }
        self.warnings
            .push(ConsumerWarning::group_removed(group.id, group.name.clone()));
        self.sync_disabled();
        true
    }

    fn sync_disabled(&mut self) {
        if self.group_ids.is_empty() {
            self.disabled = true;
            if !self.warnings.contains(WarningType::LastGroupRemoved) {
                self.warnings.push(ConsumerWarning::last_group_removed());
            }
        } else {
            self.disabled = false;
            self.warnings.remove(WarningType::LastGroupRemoved, None);
        }
    }

    /// Free-form strings are length-prefixed so no field can absorb its
    /// neighbour's characters.
    fn form_v3(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            length_prefixed(&self.id),
            self.consumer_type,
            length_prefixed(&self.owner_id),
            self.parent_id.as_deref().map(length_prefixed).unwrap_or_default(),
            self.created.to_rfc3339(),
            self.disabled,
            join_ids(&self.group_ids),
            join_ids(&self.invalid_group_ids),
            serde_json::to_string(&self.scopes).unwrap_or_default(),
            serde_json::to_string(&self.validity_periods).unwrap_or_default(),
            serde_json::to_string(&self.warnings).unwrap_or_default(),
        )
    }

    fn form_v2(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.id,
            self.consumer_type,
            self.owner_id,
            self.created.to_rfc3339(),
            self.disabled,
            join_ids(&self.group_ids),
            serde_json::to_string(&self.scopes).unwrap_or_default(),
        )
    }

    fn form_v1(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.id,
            self.consumer_type,
            self.created.to_rfc3339(),
            self.disabled
        )
    }
}

impl Signable for AuthConsumer {
    const KIND: &'static str = "auth_consumer";

    fn id(&self) -> &str {
        &self.id
    }

    fn canonical_forms(&self) -> Vec<String> {
        vec![self.form_v3(), self.form_v2(), self.form_v1()]
    }

    fn secret_fields(&mut self) -> Vec<SecretField<'_>> {
        vec![SecretField::new("data", &mut self.data)]
    }
}
