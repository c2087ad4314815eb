//! Integration tests for the handled state stored on objects
//!
//! A fresh tracker stands in for a restarted operator; the annotation
//! written by the previous process decides what still needs a pass.

mod common;

use std::collections::BTreeMap;

use common::FakeResources;
use kube::api::ObjectMeta;
use postgres_provisioning_operator::controllers::{
    object_key, persist_handled, persisted_snapshot, snapshot, Plan, ReconcileTracker, LAST_HANDLED_ANNOTATION,
};
use postgres_provisioning_operator::crd::{PostgresqlServer, PostgresqlServerSpec, SizeSpec};
use postgres_provisioning_operator::reconcilers::ACTION_LABEL;

fn server(class: &str) -> PostgresqlServer {
    let mut server = PostgresqlServer::new(
        "main",
        PostgresqlServerSpec {
            size: SizeSpec {
                class: Some(class.to_string()),
                ..Default::default()
            },
            credentials_secret: "main-admin".to_string(),
            ..Default::default()
        },
    );
    server.metadata = ObjectMeta {
        name: Some("main".to_string()),
        namespace: Some("team-a".to_string()),
        ..Default::default()
    };
    server
}

fn with_stored(mut server: PostgresqlServer, raw: &str) -> PostgresqlServer {
    server.metadata.annotations = Some(BTreeMap::from([(
        LAST_HANDLED_ANNOTATION.to_string(),
        raw.to_string(),
    )]));
    server
}

#[tokio::test]
async fn test_handled_state_is_written_once() {
    let resources = FakeResources::default();
    let obj = server("small");
    let state = snapshot(&obj).unwrap();

    persist_handled(&resources, &obj, &state).await;
    let written = resources.handled("main");
    assert_eq!(written.len(), 1);

    let stored = with_stored(obj, &written[0]);
    assert_eq!(persisted_snapshot(&stored), Some(state.clone()));

    persist_handled(&resources, &stored, &state).await;
    assert_eq!(resources.handled("main").len(), 1);
}

#[tokio::test]
async fn test_edit_while_down_runs_after_restart() {
    let resources = FakeResources::default();
    let before = server("small");
    persist_handled(&resources, &before, &snapshot(&before).unwrap()).await;
    let raw = resources.handled("main").remove(0);

    // Resized and labelled while no operator was running
    let mut after = with_stored(server("large"), &raw);
    after
        .metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(ACTION_LABEL.to_string(), "reset-password".to_string());

    let tracker = ReconcileTracker::default();
    let stored = persisted_snapshot(&after);
    let plan = tracker.plan(&object_key(&after), &snapshot(&after).unwrap(), stored.as_ref(), true, false);
    match plan {
        Plan::Run { diff, retry } => {
            assert_eq!(retry, 0);
            assert_eq!(diff.len(), 2);
        }
        other => panic!("unexpected plan {:?}", other),
    }
}

#[tokio::test]
async fn test_untouched_object_skipped_after_restart() {
    let resources = FakeResources::default();
    let obj = server("small");
    persist_handled(&resources, &obj, &snapshot(&obj).unwrap()).await;
    let obj = with_stored(obj, &resources.handled("main")[0]);

    let tracker = ReconcileTracker::default();
    let stored = persisted_snapshot(&obj);
    assert_eq!(
        tracker.plan(&object_key(&obj), &snapshot(&obj).unwrap(), stored.as_ref(), false, false),
        Plan::Skip
    );
}

#[test]
fn test_unreadable_annotation_is_ignored() {
    let obj = with_stored(server("small"), "{not json");
    assert_eq!(persisted_snapshot(&obj), None);
}
