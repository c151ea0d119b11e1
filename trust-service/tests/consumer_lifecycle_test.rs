//! Group invalidation, restoration and removal across a user's consumers.

mod common;

use chrono::Duration;
use common::{admin, driver_data, principal, TestApp, ROOT_TYPE};
use trust_service::models::{
    AuthConsumer, AuthConsumerScope, ConsumerWarning, GroupRef, ScopeDetails, WarningType,
};
use trust_service::secure::LoadOptions;
use trust_service::services::{DelegationRequest, GroupLifecycleListener, ServiceError};

fn run_scopes() -> ScopeDetails {
    ScopeDetails::from_scopes(&[AuthConsumerScope::Run, AuthConsumerScope::Project])
}

fn delegation(name: &str) -> DelegationRequest {
    DelegationRequest {
        name: name.to_string(),
        description: String::new(),
        consumer_type: trust_service::models::ConsumerType::Builtin,
        group_ids: Vec::new(),
        scopes: run_scopes(),
        duration: None,
    }
}

async fn reload(app: &TestApp, id: &str) -> AuthConsumer {
    app.state
        .consumers
        .load_consumer(id, LoadOptions::default())
        .await
        .expect("consumer loads")
}

#[tokio::test]
async fn test_group_transitions_keep_warning_order() {
    let app = TestApp::new();
    let alice = principal("alice", &[1, 5]);
    let consumers = &app.state.consumers;

    let root = consumers
        .create_root(&alice, ROOT_TYPE, driver_data("t0k3n"))
        .await
        .unwrap();
    let (child, _) = consumers
        .create_delegated(&root.id, &alice, delegation("ci"))
        .await
        .unwrap();
    assert_eq!(child.group_ids, vec![1, 5]);

    let changed = consumers
        .invalidate_group_for_user(&GroupRef::new(1, "g1"), &alice)
        .await
        .unwrap();
    assert_eq!(changed, 2);

    let r = reload(&app, &root.id).await;
    assert_eq!(r.group_ids, vec![5]);
    assert_eq!(r.invalid_group_ids, vec![1]);
    assert!(!r.disabled);
    assert_eq!(
        r.warnings.as_slice(),
        &[ConsumerWarning::group_invalid(1, Some("g1".into()))]
    );

    consumers
        .invalidate_group_for_user(&GroupRef::new(5, "g5"), &alice)
        .await
        .unwrap();
    let r = reload(&app, &root.id).await;
    assert!(r.group_ids.is_empty());
    assert_eq!(r.invalid_group_ids, vec![1, 5]);
    assert!(r.disabled);
    assert_eq!(
        r.warnings.as_slice(),
        &[
            ConsumerWarning::group_invalid(1, Some("g1".into())),
            ConsumerWarning::group_invalid(5, Some("g5".into())),
            ConsumerWarning::last_group_removed(),
        ]
    );

    let restored = consumers
        .restore_invalidated_group_for_user(1, "alice")
        .await
        .unwrap();
    assert_eq!(restored, 2);
    let r = reload(&app, &root.id).await;
    assert_eq!(r.group_ids, vec![1]);
    assert_eq!(r.invalid_group_ids, vec![5]);
    assert!(!r.disabled);
    assert_eq!(
        r.warnings.as_slice(),
        &[ConsumerWarning::group_invalid(5, Some("g5".into()))]
    );

    let removed = consumers
        .remove_group(&GroupRef::new(5, "g5"))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    let c = reload(&app, &child.id).await;
    assert_eq!(c.group_ids, vec![1]);
    assert!(c.invalid_group_ids.is_empty());
    assert!(!c.disabled);
    assert_eq!(
        c.warnings.as_slice(),
        &[ConsumerWarning::group_removed(5, Some("g5".into()))]
    );
}

#[tokio::test]
async fn test_removing_an_invalid_group_while_disabled() {
    let app = TestApp::new();
    let alice = principal("alice", &[1, 5]);
    let consumers = &app.state.consumers;
    let root = consumers
        .create_root(&alice, ROOT_TYPE, driver_data("x"))
        .await
        .unwrap();

    consumers
        .invalidate_group_for_user(&GroupRef::new(1, "g1"), &alice)
        .await
        .unwrap();
    let r = reload(&app, &root.id).await;
    assert_eq!(r.group_ids, vec![5]);
    assert_eq!(r.invalid_group_ids, vec![1]);
    assert!(!r.disabled);
    assert_eq!(
        r.warnings.as_slice(),
        &[ConsumerWarning::group_invalid(1, Some("g1".into()))]
    );

    consumers
        .invalidate_group_for_user(&GroupRef::new(5, "g5"), &alice)
        .await
        .unwrap();
    let r = reload(&app, &root.id).await;
    assert!(r.group_ids.is_empty());
    assert_eq!(r.invalid_group_ids, vec![1, 5]);
    assert!(r.disabled);

    assert_eq!(consumers.remove_group(&GroupRef::new(1, "g1")).await.unwrap(), 1);
    let r = reload(&app, &root.id).await;
    assert!(r.group_ids.is_empty());
    assert_eq!(r.invalid_group_ids, vec![5]);
    assert!(r.disabled);
    assert_eq!(
        r.warnings.as_slice(),
        &[
            ConsumerWarning::group_invalid(5, Some("g5".into())),
            ConsumerWarning::last_group_removed(),
            ConsumerWarning::group_removed(1, Some("g1".into())),
        ]
    );

    assert_eq!(
        consumers
            .restore_invalidated_group_for_user(5, "alice")
            .await
            .unwrap(),
        1
    );
    let r = reload(&app, &root.id).await;
    assert_eq!(r.group_ids, vec![5]);
    assert!(r.invalid_group_ids.is_empty());
    assert!(!r.disabled);
    assert_eq!(
        r.warnings.as_slice(),
        &[ConsumerWarning::group_removed(1, Some("g1".into()))]
    );
}

#[tokio::test]
async fn test_stale_update_keeps_group_state() {
    let app = TestApp::new();
    let alice = principal("alice", &[1, 5]);
    let consumers = &app.state.consumers;
    let root = consumers
        .create_root(&alice, ROOT_TYPE, driver_data("x"))
        .await
        .unwrap();
    let mut stale = reload(&app, &root.id).await;

    for group in [GroupRef::new(1, "g1"), GroupRef::new(5, "g5")] {
        consumers
            .invalidate_group_for_user(&group, &alice)
            .await
            .unwrap();
    }

    stale.description = "nightly".to_string();
    stale.scopes = ScopeDetails::unrestricted();
    stale.disabled = false;
    consumers.update_consumer(&mut stale).await.unwrap();

    let r = reload(&app, &root.id).await;
    assert_eq!(r.description, "nightly");
    assert!(r.group_ids.is_empty());
    assert_eq!(r.invalid_group_ids, vec![1, 5]);
    assert!(r.disabled);
    assert_eq!(r.warnings.len(), 3);
    assert_eq!(stale, r);
}

#[tokio::test]
async fn test_update_cannot_widen_trust_fields() {
    let app = TestApp::new();
    let alice = principal("alice", &[1]);
    let consumers = &app.state.consumers;
    let root = consumers
        .create_root(&alice, ROOT_TYPE, driver_data("x"))
        .await
        .unwrap();
    let mut request = delegation("narrow");
    request.scopes = ScopeDetails::from_scopes(&[AuthConsumerScope::Run]);
    let (mut child, _) = consumers
        .create_delegated(&root.id, &alice, request)
        .await
        .unwrap();

    child.name = "renamed".to_string();
    child.scopes = ScopeDetails::unrestricted();
    child.group_ids = vec![1, 2, 3];
    consumers.update_consumer(&mut child).await.unwrap();

    let r = reload(&app, &child.id).await;
    assert_eq!(r.name, "renamed");
    assert_eq!(r.scopes, ScopeDetails::from_scopes(&[AuthConsumerScope::Run]));
    assert_eq!(r.group_ids, vec![1]);
}

#[tokio::test]
async fn test_removing_last_group_disables_consumer() {
    let app = TestApp::new();
    let bob = principal("bob", &[3]);
    let root = app
        .state
        .consumers
        .create_root(&bob, ROOT_TYPE, driver_data("x"))
        .await
        .unwrap();

    app.state
        .consumers
        .remove_group(&GroupRef::new(3, "g3"))
        .await
        .unwrap();

    let r = reload(&app, &root.id).await;
    assert!(r.disabled);
    assert!(r.warnings.contains_for_group(WarningType::GroupRemoved, 3));
    assert!(r.warnings.contains(WarningType::LastGroupRemoved));

    let err = app
        .state
        .sessions
        .open_session(&r, Duration::hours(1), false)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized(_)));
}

#[tokio::test]
async fn test_admin_consumers_keep_their_groups() {
    let app = TestApp::new();
    let root_admin = admin("root", &[1, 2]);
    let root = app
        .state
        .consumers
        .create_root(&root_admin, ROOT_TYPE, driver_data("x"))
        .await
        .unwrap();

    let changed = app
        .state
        .consumers
        .invalidate_group_for_user(&GroupRef::new(1, "g1"), &root_admin)
        .await
        .unwrap();
    assert_eq!(changed, 0);
    assert_eq!(
        app.state
            .consumers
            .invalidate_groups_for_user(&root_admin, &[])
            .await
            .unwrap(),
        0
    );

    let r = reload(&app, &root.id).await;
    assert_eq!(r.group_ids, vec![1, 2]);
    assert!(r.warnings.is_empty());
}

#[tokio::test]
async fn test_bulk_invalidate_and_restore() {
    let app = TestApp::new();
    let alice = principal("alice", &[1, 2, 3]);
    let bob = principal("bob", &[1]);
    let consumers = &app.state.consumers;

    let a = consumers
        .create_root(&alice, ROOT_TYPE, driver_data("a"))
        .await
        .unwrap();
    let b = consumers
        .create_root(&bob, ROOT_TYPE, driver_data("b"))
        .await
        .unwrap();

    let changed = consumers
        .invalidate_groups_for_user(&alice, &[2])
        .await
        .unwrap();
    assert_eq!(changed, 1);

    let r = reload(&app, &a.id).await;
    assert_eq!(r.group_ids, vec![2]);
    assert_eq!(r.invalid_group_ids, vec![1, 3]);
    assert_eq!(r.warnings.len(), 2);

    // Another owner's consumer is untouched
    assert_eq!(reload(&app, &b.id).await.group_ids, vec![1]);

    let restored = consumers
        .restore_invalidated_groups_for_user("alice")
        .await
        .unwrap();
    assert_eq!(restored, 1);
    let r = reload(&app, &a.id).await;
    assert_eq!(r.group_ids, vec![2, 1, 3]);
    assert!(r.invalid_group_ids.is_empty());
    assert!(r.warnings.is_empty());
}

#[tokio::test]
async fn test_group_listener_drives_registry() {
    let app = TestApp::new();
    let alice = principal("alice", &[7, 8]);
    let root = app
        .state
        .consumers
        .create_root(&alice, ROOT_TYPE, driver_data("x"))
        .await
        .unwrap();

    let listener: &dyn GroupLifecycleListener = &app.state.consumers;
    let group = GroupRef::new(7, "g7");

    assert_eq!(listener.on_user_removed_from_group(&group, &alice).await.unwrap(), 1);
    assert_eq!(reload(&app, &root.id).await.invalid_group_ids, vec![7]);

    assert_eq!(listener.on_user_added_to_group(&group, &alice).await.unwrap(), 1);
    assert_eq!(reload(&app, &root.id).await.group_ids, vec![8, 7]);

    assert_eq!(listener.on_group_deleted(&group).await.unwrap(), 1);
    let r = reload(&app, &root.id).await;
    assert_eq!(r.group_ids, vec![8]);
    assert!(r.warnings.contains_for_group(WarningType::GroupRemoved, 7));
}

#[tokio::test]
async fn test_transitions_are_noops_when_nothing_matches() {
    let app = TestApp::new();
    let alice = principal("alice", &[1]);
    app.state
        .consumers
        .create_root(&alice, ROOT_TYPE, driver_data("x"))
        .await
        .unwrap();

    let consumers = &app.state.consumers;
    assert_eq!(
        consumers
            .invalidate_group_for_user(&GroupRef::id_only(9), &alice)
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        consumers
            .restore_invalidated_group_for_user(9, "alice")
            .await
            .unwrap(),
        0
    );
    assert_eq!(consumers.remove_group(&GroupRef::id_only(9)).await.unwrap(), 0);
}

#[tokio::test]
async fn test_delete_consumer_cascades_to_children_and_sessions() {
    let app = TestApp::new();
    let alice = principal("alice", &[1]);
    let consumers = &app.state.consumers;
    let sessions = &app.state.sessions;

    let root = consumers
        .create_root(&alice, ROOT_TYPE, driver_data("x"))
        .await
        .unwrap();
    let (child, _) = consumers
        .create_delegated(&root.id, &alice, delegation("child"))
        .await
        .unwrap();
    let mut grandchild_request = delegation("grandchild");
    grandchild_request.scopes = ScopeDetails::from_scopes(&[AuthConsumerScope::Run]);
    let (grandchild, _) = consumers
        .create_delegated(&child.id, &alice, grandchild_request)
        .await
        .unwrap();

    let mut session_ids = Vec::new();
    for consumer in [&root, &child, &grandchild] {
        let session = sessions
            .open_session(consumer, Duration::hours(1), false)
            .await
            .unwrap();
        session_ids.push(session.id);
    }

    let unrelated = consumers
        .create_root(&principal("bob", &[1]), ROOT_TYPE, driver_data("y"))
        .await
        .unwrap();

    let deleted = consumers.delete_consumer(&root.id).await.unwrap();
    assert_eq!(deleted, 3);

    for id in [&root.id, &child.id, &grandchild.id] {
        let err = consumers
            .load_consumer(id, LoadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
    for id in &session_ids {
        assert!(matches!(
            sessions.load_session(id).await,
            Err(ServiceError::NotFound(_))
        ));
    }
    assert_eq!(reload(&app, &unrelated.id).await.owner_id, "bob");
    assert_eq!(app.records.len(), 1);
}

#[tokio::test]
async fn test_touch_last_authentication() {
    let app = TestApp::new();
    let alice = principal("alice", &[1]);
    let root = app
        .state
        .consumers
        .create_root(&alice, ROOT_TYPE, driver_data("x"))
        .await
        .unwrap();
    assert!(root.last_authentication.is_none());

    let touched = app
        .state
        .consumers
        .touch_last_authentication(&root.id)
        .await
        .unwrap();
    assert!(touched.last_authentication.is_some());
    assert_eq!(
        reload(&app, &root.id).await.last_authentication,
        touched.last_authentication
    );
}
