//! Topic lifecycle under the hub: idle shutdown, deletion, stuck sessions
//! and server shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::{AccessMode, DefaultAccess, Uid};
use serde_json::json;
use std::time::Duration;
use topic_service::actors::{ExitReason, MetaKind};
use topic_service::plugins::PluginAction;
use topic_service::protocol::{DelQuery, ServerMessage};
use topic_service::store::{Subscription, TopicRecord, User};
use topic_test_utils::{test_config_with, MemoryStore, PluginEvent, RecordingPlugins, TestServer};

const GRP: &str = "grpLifecycle";

fn alice() -> Uid {
    Uid::new(11)
}

fn bob() -> Uid {
    Uid::new(22)
}

fn group_store() -> MemoryStore {
    let mut record = TopicRecord::new(GRP, alice());
    record.access = DefaultAccess::new(AccessMode::CPUBLIC, AccessMode::NONE);
    MemoryStore::new()
        .with_user(User::new(alice()))
        .with_user(User::new(bob()))
        .with_topic(
            record,
            vec![Subscription::new(GRP, alice(), AccessMode::CFULL, AccessMode::CFULL)],
        )
}

fn delete_topic() -> MetaKind {
    MetaKind::Del(DelQuery::Topic { hard: true })
}

// ============================================================================
// Idle shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_idle_topic_stops_and_restarts_on_join() {
    let server = TestServer::start(group_store()).await;
    let mut alice = server.connect(alice());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;
    alice.leave(GRP, "l1", false).await;
    assert_eq!(alice.ctrl_for("l1").await.code, 200);
    assert!(server.hub.topic_state(GRP).await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(server.hub.topic_state(GRP).await.unwrap().is_none());
    assert_eq!(server.hub.status().await.unwrap().topic_count, 0);

    alice.join(GRP, "j2").await;
    assert_eq!(alice.ctrl_for("j2").await.code, 200);
    let state = server.hub.topic_state(GRP).await.unwrap().unwrap();
    assert_eq!(state.sessions, 1);
    server.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_attached_topic_stays_alive() {
    let server = TestServer::start(group_store()).await;
    let mut alice = server.connect(alice());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(server.hub.topic_state(GRP).await.unwrap().is_some());
    server.stop().await;
}

// ============================================================================
// Deletion
// ============================================================================

#[tokio::test]
async fn test_owner_deletes_topic() {
    let server = TestServer::start(group_store()).await;
    let mut alice = server.connect(alice());
    let mut bob = server.connect(bob());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;
    bob.join(GRP, "j2").await;
    bob.ctrl_for("j2").await;

    alice.meta(GRP, "d1", delete_topic()).await;
    assert_eq!(alice.ctrl_for("d1").await.code, 200);

    assert!(server.store.topic(GRP).is_none());
    assert!(server.store.sub(GRP, bob.uid()).is_none());
    assert_eq!(bob.detached().await, GRP);
    assert!(server.hub.topic_state(GRP).await.unwrap().is_none());
    assert!(server
        .plugins
        .events()
        .contains(&PluginEvent::Topic(GRP.to_string(), PluginAction::Deleted)));

    // Deleting again is not an error.
    server.hub.unregister(GRP, ExitReason::Deleted).await.unwrap();

    bob.join(GRP, "j3").await;
    assert_eq!(bob.ctrl_for("j3").await.code, 404);
    server.stop().await;
}

#[tokio::test]
async fn test_failed_delete_leaves_topic_running() {
    let server = TestServer::start(group_store()).await;
    let mut alice = server.connect(alice());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;

    server.store.fail("topic_delete");
    alice.meta(GRP, "d1", delete_topic()).await;
    assert_eq!(alice.ctrl_for("d1").await.code, 500);

    let state = server.hub.topic_state(GRP).await.unwrap().unwrap();
    assert!(!state.suspended);
    assert_eq!(server.ctx.metrics.suspensions(), 1);
    assert_eq!(server.ctx.metrics.resumptions(), 1);
    alice.publish(GRP, "p1", json!("still here")).await;
    assert_eq!(alice.ctrl_for("p1").await.code, 202);

    server.store.heal("topic_delete");
    alice.meta(GRP, "d2", delete_topic()).await;
    assert_eq!(alice.ctrl_for("d2").await.code, 200);
    assert!(server.store.topic(GRP).is_none());
    server.stop().await;
}

#[tokio::test]
async fn test_member_delete_only_unsubscribes() {
    let server = TestServer::start(group_store()).await;
    let mut alice = server.connect(alice());
    let mut bob = server.connect(bob());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;
    bob.join(GRP, "j2").await;
    bob.ctrl_for("j2").await;

    bob.meta(GRP, "d1", delete_topic()).await;
    assert_eq!(bob.ctrl_for("d1").await.code, 200);

    assert!(server.store.topic(GRP).is_some());
    assert!(server.store.sub(GRP, bob.uid()).unwrap().deleted_at.is_some());
    let state = server.hub.topic_state(GRP).await.unwrap().unwrap();
    assert!(state.subscriber(bob.uid()).is_none());
    assert_eq!(state.sessions, 1);
    server.stop().await;
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn test_stuck_session_is_detached() {
    let config = test_config_with(&[("SESSION_QUEUE_CAPACITY", "8")]);
    let server = TestServer::start_with(group_store(), config, RecordingPlugins::new()).await;
    let mut alice = server.connect(alice());
    let mut bob = server.connect(bob());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;
    bob.join(GRP, "j2").await;
    bob.ctrl_for("j2").await;

    // Bob stops reading; alice keeps her own queue empty.
    for i in 0..12 {
        let id = format!("p{i}");
        alice.publish(GRP, &id, json!(i)).await;
        alice.ctrl_for(&id).await;
        alice.next_data().await;
    }

    assert_eq!(bob.detached().await, GRP);
    assert!(!bob.session.has_sub(GRP));
    let state = server.hub.topic_state(GRP).await.unwrap().unwrap();
    assert_eq!(state.sessions, 1);
    assert_eq!(state.subscriber(bob.uid()).unwrap().online, 0);
    assert_eq!(state.last_id, 12);
    assert_eq!(server.ctx.metrics.stuck_detaches(), 1);
    assert_eq!(server.hub.status().await.unwrap().stuck_detaches, 1);
    server.stop().await;
}

#[tokio::test]
async fn test_closed_session_leaves_its_topics() {
    let server = TestServer::start(group_store()).await;
    let mut alice = server.connect(alice());
    let mut bob = server.connect(bob());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;
    bob.join(GRP, "j2").await;
    bob.ctrl_for("j2").await;

    server.hub.session_closed(&bob.session);

    let off = alice.next_pres("off").await;
    assert_eq!(off.src, bob.uid().user_id());
    let state = server.hub.topic_state(GRP).await.unwrap().unwrap();
    assert_eq!(state.sessions, 1);
    assert_eq!(state.subscriber(bob.uid()).unwrap().online, 0);
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_detaches_and_stops_sessions() {
    let server = TestServer::start(group_store()).await;
    let mut alice = server.connect(alice());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;
    let status = server.hub.status().await.unwrap();
    assert_eq!(status.topic_count, 1);
    assert_eq!(status.session_count, 1);

    server.stop().await;

    assert_eq!(alice.detached().await, GRP);
    let stop = tokio::time::timeout(Duration::from_secs(1), alice.rx.stop.recv())
        .await
        .unwrap();
    match stop {
        Some(Some(ServerMessage::Ctrl(ctrl))) => assert_eq!(ctrl.code, 205),
        other => panic!("expected a shutdown notice, got {other:?}"),
    }
}

#[tokio::test]
async fn test_storage_failure_on_load_is_reported() {
    let server = TestServer::start(group_store()).await;
    let mut alice = server.connect(alice());

    server.store.fail("topic_get");
    alice.join(GRP, "j1").await;
    assert_eq!(alice.ctrl_for("j1").await.code, 500);
    assert!(server.hub.topic_state(GRP).await.unwrap().is_none());

    server.store.heal("topic_get");
    alice.join(GRP, "j2").await;
    assert_eq!(alice.ctrl_for("j2").await.code, 200);
    server.stop().await;
}
