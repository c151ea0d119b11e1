use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use super::error::ServiceError;
use super::session::SessionManager;
use super::signin::SigninTokenIssuer;
use crate::db::Query;
use crate::models::{
    self, AuthConsumer, ConsumerData, ConsumerType, ConsumerWarnings, GroupId, GroupRef,
    ScopeDetails, ValidityPeriod, ValidityPeriods,
};
use crate::secure::{LoadOptions, Sealed, SecuredStore, Signable};

/// Longest validity period, overlap or session a request may ask for.
pub const MAX_REQUESTED_DAYS: i64 = 3650;

/// Rejects negative durations and durations beyond `MAX_REQUESTED_DAYS`.
pub(crate) fn check_duration(what: &str, duration: Duration) -> Result<(), ServiceError> {
    if duration < Duration::zero() {
        return Err(ServiceError::InvalidRequest(format!(
            "{} cannot be negative",
            what
        )));
    }
    if duration > Duration::days(MAX_REQUESTED_DAYS) {
        return Err(ServiceError::InvalidRequest(format!(
            "{} cannot exceed {} days",
            what, MAX_REQUESTED_DAYS
        )));
    }
    Ok(())
}

/// The user acting on consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub group_ids: Vec<GroupId>,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default = "default_delegated_type")]
    pub consumer_type: ConsumerType,
    /// Empty inherits the parent's groups.
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
    pub scopes: ScopeDetails,
    /// Lifetime of the first validity period; `None` never expires.
    #[serde(default, with = "optional_duration_micros")]
    pub duration: Option<Duration>,
}

fn default_delegated_type() -> ConsumerType {
    ConsumerType::Builtin
}

mod optional_duration_micros {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value.and_then(|d| d.num_microseconds()) {
            Some(micros) => serializer.serialize_some(&micros),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<i64>::deserialize(deserializer)?.map(Duration::microseconds))
    }
}

/// Signin token rotation.
#[derive(Debug, Clone, Default)]
pub struct RegenRequest {
    /// Delete every open session of the consumer.
    pub revoke_sessions: bool,
    /// How long the previous signin token keeps working.
    pub overlap: Duration,
    /// Lifetime of the new period; `None` never expires.
    pub new_duration: Option<Duration>,
}

/// Reactions to group membership changes.
#[async_trait]
pub trait GroupLifecycleListener: Send + Sync {
    async fn on_user_removed_from_group(
        &self,
        group: &GroupRef,
        user: &Principal,
    ) -> Result<usize, ServiceError>;

    async fn on_user_added_to_group(
        &self,
        group: &GroupRef,
        user: &Principal,
    ) -> Result<usize, ServiceError>;

    async fn on_group_deleted(&self, group: &GroupRef) -> Result<usize, ServiceError>;
}

/// Owns consumer records: creation, delegation, group transitions,
/// token rotation and deletion.
#[derive(Clone)]
pub struct ConsumerRegistry {
    store: SecuredStore,
    signin: SigninTokenIssuer,
    sessions: SessionManager,
    max_validity_periods: usize,
}

impl ConsumerRegistry {
    pub fn new(
        store: SecuredStore,
        signin: SigninTokenIssuer,
        sessions: SessionManager,
        max_validity_periods: usize,
    ) -> Self {
        Self {
            store,
            signin,
            sessions,
            max_validity_periods,
        }
    }

    /// Root consumer for an interactive signin. It carries the principal's
    /// groups and unrestricted scopes.
    pub async fn create_root(
        &self,
        principal: &Principal,
        consumer_type: ConsumerType,
        data: ConsumerData,
    ) -> Result<AuthConsumer, ServiceError> {
        if !consumer_type.is_interactive() {
            return Err(ServiceError::InvalidRequest(format!(
                "{} consumers must be delegated from another consumer",
                consumer_type
            )));
        }

        let created = models::now();
        let mut consumer = AuthConsumer {
            id: Uuid::new_v4().to_string(),
            name: consumer_type.to_string(),
            description: String::new(),
            consumer_type,
            parent_id: None,
            owner_id: principal.id.clone(),
            created,
            scopes: ScopeDetails::unrestricted(),
            group_ids: principal.group_ids.clone(),
            invalid_group_ids: Vec::new(),
            validity_periods: ValidityPeriods::single(ValidityPeriod::new(
                created,
                Duration::zero(),
            )),
            warnings: ConsumerWarnings::default(),
            disabled: principal.group_ids.is_empty(),
            last_authentication: None,
            data: Sealed::Clear(data),
        };
        self.store.insert(&mut consumer).await?;

        tracing::info!(
            consumer_id = %consumer.id,
            owner_id = %consumer.owner_id,
            consumer_type = %consumer.consumer_type,
            "Root consumer created"
        );
        Ok(consumer)
    }

    /// Child of the stored parent that can never hold more than it. Returns
    /// the child and its first signin token.
    pub async fn create_delegated(
        &self,
        parent_id: &str,
        principal: &Principal,
        request: DelegationRequest,
    ) -> Result<(AuthConsumer, String), ServiceError> {
        let parent = self.load_consumer(parent_id, LoadOptions::default()).await?;
        if parent.owner_id != principal.id && !principal.admin {
            return Err(ServiceError::Unauthorized(format!(
                "Consumer {} does not belong to {}",
                parent.id, principal.id
            )));
        }
        if parent.disabled {
            return Err(ServiceError::InvalidRequest(format!(
                "Consumer {} is disabled",
                parent.id
            )));
        }
        if !request.consumer_type.is_delegated() {
            return Err(ServiceError::InvalidRequest(format!(
                "{} consumers cannot be delegated",
                request.consumer_type
            )));
        }

        let group_ids = if request.group_ids.is_empty() {
            parent.group_ids.clone()
        } else {
            if !principal.admin {
                if let Some(outside) = request
                    .group_ids
                    .iter()
                    .find(|id| !parent.group_ids.contains(id))
                {
                    return Err(ServiceError::InvalidRequest(format!(
                        "Group {} is not granted to consumer {}",
                        outside, parent.id
                    )));
                }
            }
            dedup(request.group_ids)
        };

        if request.scopes.is_unrestricted() {
            return Err(models::ScopeError::Empty.into());
        }
        request.scopes.validate()?;
        request.scopes.ensure_attenuates(&parent.scopes)?;

        let duration = request.duration.unwrap_or_else(Duration::zero);
        check_duration("Validity duration", duration)?;

        let created = models::now();
        let mut child = AuthConsumer {
            id: Uuid::new_v4().to_string(),
            name: request.name,
            description: request.description,
            consumer_type: request.consumer_type,
            parent_id: Some(parent.id.clone()),
            owner_id: parent.owner_id.clone(),
            created,
            scopes: request.scopes,
            disabled: group_ids.is_empty(),
            group_ids,
            invalid_group_ids: Vec::new(),
            validity_periods: ValidityPeriods::single(ValidityPeriod::new(created, duration)),
            warnings: ConsumerWarnings::default(),
            last_authentication: None,
            data: Sealed::Placeholder,
        };
        self.store.insert(&mut child).await?;
        let token = self.signin.issue(&child)?;

        tracing::info!(
            consumer_id = %child.id,
            parent_id = %parent.id,
            owner_id = %child.owner_id,
            groups = child.group_ids.len(),
            "Delegated consumer created"
        );
        Ok((child, token))
    }

    pub async fn load_consumer(
        &self,
        id: &str,
        opts: LoadOptions,
    ) -> Result<AuthConsumer, ServiceError> {
        self.store
            .load_one(&Query::by_id(AuthConsumer::KIND, id), opts)
            .await
    }

    pub async fn load_consumers_by_owner(
        &self,
        owner_id: &str,
    ) -> Result<Vec<AuthConsumer>, ServiceError> {
        self.store
            .load_all(
                &Query::all(AuthConsumer::KIND).eq("owner_id", owner_id),
                LoadOptions::default(),
            )
            .await
    }

    pub async fn load_children(&self, parent_id: &str) -> Result<Vec<AuthConsumer>, ServiceError> {
        self.store
            .load_all(
                &Query::all(AuthConsumer::KIND).eq("parent_id", parent_id),
                LoadOptions::default(),
            )
            .await
    }

    /// Applies the caller's name, description and driver data to the
    /// stored consumer. A masked `data` keeps the stored value. Groups,
    /// scopes, warnings and the disabled flag always come from storage.
    /// `consumer` is replaced with the stored result.
    pub async fn update_consumer(&self, consumer: &mut AuthConsumer) -> Result<(), ServiceError> {
        let name = consumer.name.clone();
        let description = consumer.description.clone();
        let data = consumer.data.clone();

        let updated = self
            .store
            .update(&consumer.id, move |stored: &mut AuthConsumer| {
                stored.name = name;
                stored.description = description;
                if let Sealed::Clear(data) = data {
                    stored.data = Sealed::Clear(data);
                }
                Ok(())
            })
            .await?;

        tracing::debug!(consumer_id = %updated.id, "Consumer updated");
        *consumer = updated;
        Ok(())
    }

    /// Records a successful authentication on the consumer.
    pub async fn touch_last_authentication(&self, id: &str) -> Result<AuthConsumer, ServiceError> {
        self.store
            .mutate(id, |consumer: &mut AuthConsumer| {
                consumer.last_authentication = Some(models::now());
                Ok(true)
            })
            .await
    }

    /// Moves `group` to the invalid list of every consumer the principal
    /// owns. Admins keep their groups.
    pub async fn invalidate_group_for_user(
        &self,
        group: &GroupRef,
        principal: &Principal,
    ) -> Result<usize, ServiceError> {
        if principal.admin {
            tracing::debug!(user_id = %principal.id, group_id = group.id, "Admin consumers keep their groups");
            return Ok(0);
        }

        let candidates: Vec<String> = self
            .load_consumers_by_owner(&principal.id)
            .await?
            .into_iter()
            .filter(|c| c.group_ids.contains(&group.id))
            .map(|c| c.id)
            .collect();

        let group = group.clone();
        let changed = self
            .apply_to_each(&candidates, move |consumer| {
                consumer.invalidate_group(&group)
            })
            .await?;

        tracing::info!(user_id = %principal.id, changed, "Group invalidated on user consumers");
        Ok(changed)
    }

    /// Invalidates every group of the principal's consumers that is not in
    /// `current_group_ids`.
    pub async fn invalidate_groups_for_user(
        &self,
        principal: &Principal,
        current_group_ids: &[GroupId],
    ) -> Result<usize, ServiceError> {
        if principal.admin {
            return Ok(0);
        }

        let keep: HashSet<GroupId> = current_group_ids.iter().copied().collect();
        let candidates: Vec<String> = self
            .load_consumers_by_owner(&principal.id)
            .await?
            .into_iter()
            .filter(|c| c.group_ids.iter().any(|id| !keep.contains(id)))
            .map(|c| c.id)
            .collect();

        let changed = self
            .apply_to_each(&candidates, move |consumer| {
                let lost: Vec<GroupId> = consumer
                    .group_ids
                    .iter()
                    .copied()
                    .filter(|id| !keep.contains(id))
                    .collect();
                let mut changed = false;
                for id in lost {
                    changed |= consumer.invalidate_group(&GroupRef::id_only(id));
                }
                changed
            })
            .await?;

        tracing::info!(user_id = %principal.id, changed, "Lost groups invalidated on user consumers");
        Ok(changed)
    }

    /// Moves `group_id` back to the valid list of the user's consumers.
    pub async fn restore_invalidated_group_for_user(
        &self,
        group_id: GroupId,
        user_id: &str,
    ) -> Result<usize, ServiceError> {
        let candidates: Vec<String> = self
            .load_consumers_by_owner(user_id)
            .await?
            .into_iter()
            .filter(|c| c.invalid_group_ids.contains(&group_id))
            .map(|c| c.id)
            .collect();

        let changed = self
            .apply_to_each(&candidates, move |consumer| consumer.restore_group(group_id))
            .await?;

        tracing::info!(user_id = %user_id, group_id, changed, "Group restored on user consumers");
        Ok(changed)
    }

    /// Restores every invalidated group of the user's consumers.
    pub async fn restore_invalidated_groups_for_user(
        &self,
        user_id: &str,
    ) -> Result<usize, ServiceError> {
        let candidates: Vec<String> = self
            .load_consumers_by_owner(user_id)
            .await?
            .into_iter()
            .filter(|c| !c.invalid_group_ids.is_empty())
            .map(|c| c.id)
            .collect();

        self.apply_to_each(&candidates, |consumer| {
            let mut changed = false;
            for id in consumer.invalid_group_ids.clone() {
                changed |= consumer.restore_group(id);
            }
            changed
        })
        .await
    }

    /// Drops a deleted group from every consumer that references it.
    pub async fn remove_group(&self, group: &GroupRef) -> Result<usize, ServiceError> {
        let candidates: Vec<String> = self
            .store
            .load_all::<AuthConsumer>(&Query::all(AuthConsumer::KIND), LoadOptions::default())
            .await?
            .into_iter()
            .filter(|c| c.group_ids.contains(&group.id) || c.invalid_group_ids.contains(&group.id))
            .map(|c| c.id)
            .collect();

        let group = group.clone();
        let changed = self
            .apply_to_each(&candidates, move |consumer| consumer.remove_group(&group))
            .await?;

        tracing::info!(changed, "Group removed from consumers");
        Ok(changed)
    }

    /// Rotates the signin token of a delegated consumer.
    pub async fn regen(
        &self,
        consumer_id: &str,
        request: RegenRequest,
    ) -> Result<(AuthConsumer, String), ServiceError> {
        check_duration("Overlap", request.overlap)?;
        let new_duration = request.new_duration.unwrap_or_else(Duration::zero);
        check_duration("Validity duration", new_duration)?;

        let max = self.max_validity_periods;
        let overlap = request.overlap;
        let consumer = self
            .store
            .mutate(consumer_id, move |consumer: &mut AuthConsumer| {
                if !consumer.consumer_type.is_regenerable() {
                    return Err(ServiceError::InvalidRequest(format!(
                        "{} consumers cannot be regenerated",
                        consumer.consumer_type
                    )));
                }
                consumer
                    .validity_periods
                    .rotate(models::now(), overlap, new_duration);
                consumer.validity_periods.prune(max);
                Ok(true)
            })
            .await?;

        if request.revoke_sessions {
            let revoked = self.sessions.delete_sessions_by_consumer(&consumer.id).await?;
            tracing::info!(consumer_id = %consumer.id, revoked, "Sessions revoked on regen");
        }

        let token = self.signin.issue(&consumer)?;
        tracing::info!(
            consumer_id = %consumer.id,
            periods = consumer.validity_periods.len(),
            "Signin token regenerated"
        );
        Ok((consumer, token))
    }

    /// Deletes the consumer, its descendants and all their sessions.
    pub async fn delete_consumer(&self, id: &str) -> Result<usize, ServiceError> {
        let mut pending = vec![id.to_string()];
        let mut doomed = Vec::new();
        let mut seen = HashSet::new();
        while let Some(current) = pending.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            for child in self.load_children(&current).await? {
                pending.push(child.id);
            }
            doomed.push(current);
        }

        let mut deleted = 0;
        for consumer_id in doomed.iter().rev() {
            self.sessions.delete_sessions_by_consumer(consumer_id).await?;
            if self.store.delete::<AuthConsumer>(consumer_id).await? {
                deleted += 1;
            }
        }

        tracing::info!(consumer_id = %id, deleted, "Consumer deleted");
        Ok(deleted)
    }

    /// Applies a transition to each consumer under its row lock. Consumers
    /// gone or corrupted since listing are skipped.
    async fn apply_to_each<F>(&self, ids: &[String], transition: F) -> Result<usize, ServiceError>
    where
        F: Fn(&mut AuthConsumer) -> bool + Send + Sync,
    {
        let mut changed = 0;
        for id in ids {
            let mut did_change = false;
            let result = self
                .store
                .mutate(id, |consumer: &mut AuthConsumer| {
                    did_change = transition(consumer);
                    Ok(did_change)
                })
                .await;

            match result {
                Ok(_) if did_change => changed += 1,
                Ok(_) => {}
                Err(ServiceError::NotFound(e)) => {
                    tracing::warn!(consumer_id = %id, error = %e, "Consumer vanished during group transition");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(changed)
    }
}

#[async_trait]
impl GroupLifecycleListener for ConsumerRegistry {
    async fn on_user_removed_from_group(
        &self,
        group: &GroupRef,
        user: &Principal,
    ) -> Result<usize, ServiceError> {
        self.invalidate_group_for_user(group, user).await
    }

    async fn on_user_added_to_group(
        &self,
        group: &GroupRef,
        user: &Principal,
    ) -> Result<usize, ServiceError> {
        self.restore_invalidated_group_for_user(group.id, &user.id)
            .await
    }

    async fn on_group_deleted(&self, group: &GroupRef) -> Result<usize, ServiceError> {
        self.remove_group(group).await
    }
}

fn dedup(ids: Vec<GroupId>) -> Vec<GroupId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}
