use serde::{Deserialize, Serialize};

use super::GroupId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarningType {
    GroupInvalid,
    GroupRemoved,
    LastGroupRemoved,
}

/// Audit note attached to a consumer when a group transition touched it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerWarning {
    #[serde(rename = "type")]
    pub kind: WarningType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
}

impl ConsumerWarning {
    pub fn group_invalid(group_id: GroupId, group_name: Option<String>) -> Self {
        Self {
            kind: WarningType::GroupInvalid,
            group_id: Some(group_id),
            group_name,
        }
    }

    pub fn group_removed(group_id: GroupId, group_name: Option<String>) -> Self {
        Self {
            kind: WarningType::GroupRemoved,
            group_id: Some(group_id),
            group_name,
        }
    }

    pub fn last_group_removed() -> Self {
        Self {
            kind: WarningType::LastGroupRemoved,
            group_id: None,
            group_name: None,
        }
    }
}

/// Ordered warning list. Order is part of the signed record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerWarnings(Vec<ConsumerWarning>);

impl ConsumerWarnings {
    pub fn push(&mut self, warning: ConsumerWarning) {
        self.0.push(warning);
    }

    pub fn contains(&self, kind: WarningType) -> bool {
        self.0.iter().any(|w| w.kind == kind)
    }

    pub fn contains_for_group(&self, kind: WarningType, group_id: GroupId) -> bool {
        self.0
            .iter()
            .any(|w| w.kind == kind && w.group_id == Some(group_id))
    }

    /// Removes every warning of `kind`, scoped to `group_id` when given.
    pub fn remove(&mut self, kind: WarningType, group_id: Option<GroupId>) {
        self.0
            .retain(|w| !(w.kind == kind && (group_id.is_none() || w.group_id == group_id)));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConsumerWarning> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[ConsumerWarning] {
        &self.0
    }
}
