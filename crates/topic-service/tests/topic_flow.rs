//! End-to-end topic behaviour through the hub.
//!
//! Each test starts a hub over an in-memory store, connects sessions and
//! asserts on what those sessions receive.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::{AccessMode, DefaultAccess, Uid};
use serde_json::json;
use std::time::Duration;
use topic_service::actors::{JoinRequest, MetaKind};
use topic_service::plugins::PluginAction;
use topic_service::protocol::{
    DelQuery, DelRangeWire, GetOpts, GetQuery, MsgInfo, ServerMessage, SetQuery, SetSub,
};
use topic_service::store::{Subscription, TopicRecord, User};
use topic_test_utils::{
    test_config_with, MemoryStore, PluginEvent, RecordingPlugins, TestClient, TestServer,
};

const GRP: &str = "grpTestTopic";

fn alice() -> Uid {
    Uid::new(101)
}

fn bob() -> Uid {
    Uid::new(202)
}

fn carol() -> Uid {
    Uid::new(303)
}

/// Alice owns `GRP`. Authenticated users get `auth` by default.
fn group_store(auth: AccessMode) -> MemoryStore {
    group_store_with(auth, &[])
}

/// [`group_store`] where `others` already hold subscriptions.
fn group_store_with(auth: AccessMode, others: &[(Uid, AccessMode, AccessMode)]) -> MemoryStore {
    let mut record = TopicRecord::new(GRP, alice());
    record.access = DefaultAccess::new(auth, AccessMode::NONE);
    let mut subs = vec![Subscription::new(GRP, alice(), AccessMode::CFULL, AccessMode::CFULL)];
    for &(uid, want, given) in others {
        subs.push(Subscription::new(GRP, uid, want, given));
    }
    MemoryStore::new()
        .with_user(User::new(alice()))
        .with_user(User::new(bob()))
        .with_user(User::new(carol()))
        .with_topic(record, subs)
}

fn mode(s: &str) -> AccessMode {
    s.parse().unwrap()
}

fn del_sub(user: Uid) -> MetaKind {
    MetaKind::Del(DelQuery::Sub { user })
}

fn join_wanting(client: &TestClient, id: &str, want: AccessMode) -> JoinRequest {
    JoinRequest::new(std::sync::Arc::clone(&client.session), GRP)
        .with_id(id)
        .with_set(SetQuery {
            sub: Some(SetSub { user: None, mode: want }),
            ..SetQuery::default()
        })
}

fn del_msgs(ranges: Vec<DelRangeWire>, hard: bool) -> MetaKind {
    MetaKind::Del(DelQuery::Msg { ranges, hard })
}

async fn next_info(client: &mut TestClient) -> MsgInfo {
    loop {
        if let ServerMessage::Info(info) = client.recv().await {
            return info;
        }
    }
}

fn set_sub(user: Option<Uid>, mode: AccessMode) -> MetaKind {
    MetaKind::Set(SetQuery {
        sub: Some(SetSub { user, mode }),
        ..SetQuery::default()
    })
}

// ============================================================================
// Publishing
// ============================================================================

#[tokio::test]
async fn test_publish_assigns_increasing_sequence_ids() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut alice = server.connect(alice());

    alice.join(GRP, "j1").await;
    assert_eq!(alice.ctrl_for("j1").await.code, 200);

    for (i, id) in ["p1", "p2", "p3"].into_iter().enumerate() {
        alice.publish(GRP, id, json!(format!("hello {i}"))).await;
        let ctrl = alice.ctrl_for(id).await;
        assert_eq!(ctrl.code, 202);
        assert_eq!(ctrl.params.unwrap()["seq"], json!(i + 1));
        assert_eq!(alice.next_data().await.seq, i as u64 + 1);
    }

    assert_eq!(server.store.messages(GRP).len(), 3);
    assert_eq!(server.store.topic(GRP).unwrap().seq_id, 3);
    server.stop().await;
}

#[tokio::test]
async fn test_publish_without_write_access_is_rejected() {
    let server = TestServer::start(group_store(AccessMode::JOIN | AccessMode::READ)).await;
    let mut bob = server.connect(bob());

    bob.join(GRP, "j1").await;
    assert_eq!(bob.ctrl_for("j1").await.code, 200);

    bob.publish(GRP, "p1", json!("hi")).await;
    assert_eq!(bob.ctrl_for("p1").await.code, 403);
    assert!(server.store.messages(GRP).is_empty());
    server.stop().await;
}

#[tokio::test]
async fn test_publish_before_join_is_not_attached() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut bob = server.connect(bob());

    bob.publish(GRP, "p1", json!("hi")).await;
    assert_eq!(bob.ctrl_for("p1").await.code, 409);
    server.stop().await;
}

#[tokio::test]
async fn test_data_reaches_other_readers_and_push() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut alice = server.connect(alice());
    let mut bob = server.connect(bob());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;
    bob.join(GRP, "j2").await;
    bob.ctrl_for("j2").await;

    alice.publish(GRP, "p1", json!("hello bob")).await;
    let data = bob.next_data().await;
    assert_eq!(data.from, alice.uid());
    assert_eq!(data.content, json!("hello bob"));

    // The state round trip runs after the publish finished.
    server.hub.topic_state(GRP).await.unwrap();
    let receipts = server.push.receipts();
    assert_eq!(receipts.len(), 1);
    let receipt = receipts.first().unwrap();
    assert_eq!(receipt.to.get(&bob.uid()).unwrap().delivered, 1);
    assert!(!receipt.to.contains_key(&alice.uid()));
    assert!(server
        .plugins
        .events()
        .contains(&PluginEvent::Message(GRP.to_string(), alice.uid(), 1)));
    server.stop().await;
}

// ============================================================================
// Group lifecycle
// ============================================================================

#[tokio::test]
async fn test_join_new_creates_group_owned_by_requester() {
    let server = TestServer::start(MemoryStore::new().with_user(User::new(alice()))).await;
    let mut alice = server.connect(alice());

    alice.join("new", "c1").await;
    let ctrl = alice.ctrl_for("c1").await;
    assert_eq!(ctrl.code, 200);
    assert!(ctrl.topic.starts_with("grp"));
    let params = ctrl.params.unwrap();
    assert_eq!(params["tmpname"], json!("new"));
    assert_eq!(params["acs"]["mode"], json!("JRWPASDO"));

    let record = server.store.topic(&ctrl.topic).unwrap();
    assert_eq!(record.owner, alice.uid());
    let state = server.hub.topic_state(&ctrl.topic).await.unwrap().unwrap();
    assert_eq!(state.owner, alice.uid());
    assert_eq!(state.sessions, 1);
    assert!(server
        .plugins
        .events()
        .contains(&PluginEvent::Topic(ctrl.topic.clone(), PluginAction::Created)));
    server.stop().await;
}

#[tokio::test]
async fn test_owner_invites_and_invitee_joins() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut alice = server.connect(alice());
    let mut bob = server.connect(bob());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;

    alice.meta(GRP, "s1", set_sub(Some(bob.uid()), AccessMode::UNSET)).await;
    let ctrl = alice.ctrl_for("s1").await;
    assert_eq!(ctrl.code, 200);
    let params = ctrl.params.unwrap();
    assert_eq!(params["user"], json!(bob.uid().user_id()));
    assert_eq!(params["acs"]["given"], json!("JRWP"));

    let sub = server.store.sub(GRP, bob.uid()).unwrap();
    assert_eq!(sub.mode_given, AccessMode::CPUBLIC);

    bob.join(GRP, "j2").await;
    assert_eq!(bob.ctrl_for("j2").await.code, 200);
    let on = alice.next_pres("on").await;
    assert_eq!(on.src, bob.uid().user_id());
    server.stop().await;
}

#[tokio::test]
async fn test_ownership_transfer() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut alice = server.connect(alice());
    let mut bob = server.connect(bob());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;
    bob.join(GRP, "j2").await;
    bob.ctrl_for("j2").await;

    alice.meta(GRP, "s1", set_sub(Some(bob.uid()), AccessMode::CFULL)).await;
    assert_eq!(alice.ctrl_for("s1").await.code, 200);

    bob.meta(GRP, "s2", set_sub(None, AccessMode::CFULL)).await;
    assert_eq!(bob.ctrl_for("s2").await.code, 200);

    let state = server.hub.topic_state(GRP).await.unwrap().unwrap();
    assert_eq!(state.owner, bob.uid());
    let old = state.subscriber(alice.uid()).unwrap();
    assert!(!old.want.is_owner());
    assert!(!old.given.is_owner());
    let owners = state
        .subscribers
        .iter()
        .filter(|s| (s.want & s.given).is_owner())
        .count();
    assert_eq!(owners, 1);
    assert_eq!(server.store.topic(GRP).unwrap().owner, bob.uid());
    assert!(!server.store.sub(GRP, alice.uid()).unwrap().mode_given.is_owner());
    server.stop().await;
}

#[tokio::test]
async fn test_non_owner_cannot_claim_ownership() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut bob = server.connect(bob());

    bob.join(GRP, "j1").await;
    bob.ctrl_for("j1").await;

    bob.meta(GRP, "s1", set_sub(None, AccessMode::CFULL)).await;
    assert_eq!(bob.ctrl_for("s1").await.code, 403);
    server.stop().await;
}

#[tokio::test]
async fn test_owner_cannot_unsubscribe() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut alice = server.connect(alice());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;

    alice.leave(GRP, "l1", true).await;
    assert_eq!(alice.ctrl_for("l1").await.code, 403);
    assert!(server.store.sub(GRP, alice.uid()).unwrap().deleted_at.is_none());
    server.stop().await;
}

#[tokio::test]
async fn test_removed_member_is_evicted_and_told_gone() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut alice = server.connect(alice());
    let mut bob = server.connect(bob());

    bob.join("me", "m1").await;
    bob.ctrl_for("m1").await;
    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;
    bob.join(GRP, "j2").await;
    bob.ctrl_for("j2").await;

    alice
        .meta(GRP, "d1", MetaKind::Del(DelQuery::Sub { user: bob.uid() }))
        .await;
    assert_eq!(alice.ctrl_for("d1").await.code, 200);

    let mut evicted = false;
    let mut gone = false;
    while !(evicted && gone) {
        match bob.recv().await {
            ServerMessage::Ctrl(ctrl) if ctrl.code == 205 && ctrl.topic == GRP => {
                assert_eq!(ctrl.params.unwrap()["unsub"], json!(true));
                evicted = true;
            }
            ServerMessage::Pres(pres) if pres.what == "gone" => {
                assert_eq!(pres.topic, "me");
                assert_eq!(pres.src, GRP);
                gone = true;
            }
            _ => {}
        }
    }
    assert_eq!(bob.detached().await, GRP);
    assert!(!bob.session.has_sub(GRP));
    assert!(server.store.sub(GRP, bob.uid()).unwrap().deleted_at.is_some());

    let state = server.hub.topic_state(GRP).await.unwrap().unwrap();
    assert!(state.subscriber(bob.uid()).is_none());
    server.stop().await;
}

#[tokio::test]
async fn test_subscriber_cap() {
    let mut store = group_store(AccessMode::CPUBLIC);
    let crowd: Vec<Uid> = (1..=3).map(|i| Uid::new(900 + i)).collect();
    for uid in &crowd {
        store = store.with_user(User::new(*uid));
    }
    let config = test_config_with(&[("TOPIC_MAX_SUBSCRIBERS", "3")]);
    let server = TestServer::start_with(store, config, RecordingPlugins::new()).await;

    let mut codes = Vec::new();
    for uid in &crowd {
        let mut client = server.connect(*uid);
        client.join(GRP, "j").await;
        codes.push(client.ctrl_for("j").await.code);
    }
    // The owner plus two newcomers fill the topic.
    assert_eq!(codes, vec![200, 200, 422]);
    server.stop().await;
}

// ============================================================================
// Metadata
// ============================================================================

#[tokio::test]
async fn test_get_data_returns_history_oldest_first() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut alice = server.connect(alice());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;
    for id in ["p1", "p2", "p3"] {
        alice.publish(GRP, id, json!(id)).await;
        alice.ctrl_for(id).await;
    }
    alice.drain();

    let query = GetQuery {
        data: Some(GetOpts {
            limit: 2,
            ..GetOpts::default()
        }),
        ..GetQuery::default()
    };
    alice.meta(GRP, "g1", MetaKind::Get(query)).await;

    assert_eq!(alice.next_data().await.seq, 2);
    assert_eq!(alice.next_data().await.seq, 3);
    let ctrl = alice.ctrl_for("g1").await;
    assert_eq!(ctrl.params.unwrap(), json!({ "what": "data", "count": 2 }));
    server.stop().await;
}

#[tokio::test]
async fn test_soft_delete_hides_messages_for_requester_only() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut alice = server.connect(alice());
    let mut bob = server.connect(bob());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;
    bob.join(GRP, "j2").await;
    bob.ctrl_for("j2").await;
    for id in ["p1", "p2"] {
        alice.publish(GRP, id, json!(id)).await;
        alice.ctrl_for(id).await;
    }

    // Bob is not a deleter, so a hard delete is downgraded.
    let del = DelQuery::Msg {
        ranges: vec![DelRangeWire { low: 1, hi: 0 }],
        hard: true,
    };
    bob.meta(GRP, "d1", MetaKind::Del(del)).await;
    let ctrl = bob.ctrl_for("d1").await;
    assert_eq!(ctrl.code, 200);
    assert_eq!(ctrl.params.unwrap()["del"], json!(1));
    assert_eq!(server.store.messages(GRP).len(), 2);

    let query = GetQuery {
        del: Some(GetOpts::default()),
        ..GetQuery::default()
    };
    bob.meta(GRP, "g1", MetaKind::Get(query.clone())).await;
    let meta = bob.next_meta().await;
    let del = meta.del.unwrap();
    assert_eq!(del.clear, 1);
    assert_eq!(del.delseq, vec![DelRangeWire { low: 1, hi: 0 }]);

    alice.drain();
    alice.meta(GRP, "g2", MetaKind::Get(query)).await;
    let ctrl = alice.ctrl_for("g2").await;
    assert_eq!(ctrl.params.unwrap(), json!({ "what": "del" }));
    server.stop().await;
}

#[tokio::test]
async fn test_delete_range_past_last_message_is_rejected() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut alice = server.connect(alice());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;

    let del = DelQuery::Msg {
        ranges: vec![DelRangeWire { low: 5, hi: 9 }],
        hard: true,
    };
    alice.meta(GRP, "d1", MetaKind::Del(del)).await;
    assert_eq!(alice.ctrl_for("d1").await.code, 400);
    server.stop().await;
}

#[tokio::test]
async fn test_tags_are_owner_only_on_groups() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut alice = server.connect(alice());
    let mut bob = server.connect(bob());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;
    bob.join(GRP, "j2").await;
    bob.ctrl_for("j2").await;

    let tags = |t: &[&str]| {
        MetaKind::Set(SetQuery {
            tags: Some(t.iter().map(ToString::to_string).collect()),
            ..SetQuery::default()
        })
    };

    bob.meta(GRP, "t1", tags(&["rust"])).await;
    assert_eq!(bob.ctrl_for("t1").await.code, 403);

    alice.meta(GRP, "t2", tags(&["Rust", " chat "])).await;
    let ctrl = alice.ctrl_for("t2").await;
    assert_eq!(ctrl.code, 200);
    assert_eq!(ctrl.params.unwrap()["added"], json!(2));
    assert_eq!(
        server.store.topic(GRP).unwrap().tags,
        vec!["chat".to_string(), "rust".to_string()]
    );

    alice.meta(GRP, "t3", tags(&["chat", "rust"])).await;
    assert_eq!(alice.ctrl_for("t3").await.code, 304);
    server.stop().await;
}

// ============================================================================
// Two-party topics
// ============================================================================

#[tokio::test]
async fn test_first_p2p_join_creates_topic_for_both_parties() {
    let store = MemoryStore::new()
        .with_user(User::new(alice()))
        .with_user(User::new(bob()));
    let server = TestServer::start(store).await;
    let mut alice = server.connect(alice());
    let mut bob = server.connect(bob());
    let name = alice.uid().p2p_name(bob.uid());

    alice.join(&bob.uid().user_id(), "j1").await;
    let ctrl = alice.ctrl_for("j1").await;
    assert_eq!(ctrl.code, 200);
    assert_eq!(ctrl.topic, bob.uid().user_id());
    assert!(server.store.topic(&name).is_some());
    assert_eq!(
        server.store.sub(&name, bob.uid()).unwrap().mode_given,
        AccessMode::CP2P
    );

    alice.publish(&bob.uid().user_id(), "p1", json!("hi bob")).await;
    assert_eq!(alice.ctrl_for("p1").await.code, 202);

    bob.join(&alice.uid().user_id(), "j2").await;
    bob.ctrl_for("j2").await;
    let query = GetQuery {
        data: Some(GetOpts::default()),
        ..GetQuery::default()
    };
    bob.meta(&alice.uid().user_id(), "g1", MetaKind::Get(query)).await;
    let data = bob.next_data().await;
    assert_eq!(data.topic, alice.uid().user_id());
    assert_eq!(data.content, json!("hi bob"));
    server.stop().await;
}

#[tokio::test]
async fn test_p2p_with_self_is_rejected() {
    let server = TestServer::start(MemoryStore::new().with_user(User::new(alice()))).await;
    let mut alice = server.connect(alice());

    alice.join(&alice.uid().user_id(), "j1").await;
    assert_eq!(alice.ctrl_for("j1").await.code, 400);
    server.stop().await;
}

#[tokio::test]
async fn test_join_with_explicit_want_sets_mode() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut bob = server.connect(bob());

    let want = AccessMode::JOIN | AccessMode::READ;
    let req = join_wanting(&bob, "j1", want);
    bob.join_with(req).await;
    let ctrl = bob.ctrl_for("j1").await;
    assert_eq!(ctrl.code, 200);
    assert_eq!(ctrl.params.unwrap()["acs"]["want"], json!("JR"));
    assert_eq!(server.store.sub(GRP, bob.uid()).unwrap().mode_want, want);
    server.stop().await;
}

// ============================================================================
// Attaching and re-joining
// ============================================================================

#[tokio::test]
async fn test_second_join_on_same_session_is_not_counted() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut alice = server.connect(alice());
    let mut bob = server.connect(bob());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;
    bob.join(GRP, "j2").await;
    assert_eq!(bob.ctrl_for("j2").await.code, 200);
    alice.next_pres("on").await;

    bob.join(GRP, "j3").await;
    let ctrl = bob.ctrl_for("j3").await;
    assert_eq!(ctrl.code, 200);
    assert_eq!(ctrl.params.unwrap()["acs"]["mode"], json!("JRWP"));

    let state = server.hub.topic_state(GRP).await.unwrap().unwrap();
    assert_eq!(state.sessions, 2);
    assert_eq!(state.subscriber(bob.uid()).unwrap().online, 1);

    // One leave takes the user offline again.
    bob.leave(GRP, "l1", false).await;
    assert_eq!(bob.ctrl_for("l1").await.code, 200);
    let off = alice.next_pres("off").await;
    assert_eq!(off.src, bob.uid().user_id());

    let state = server.hub.topic_state(GRP).await.unwrap().unwrap();
    assert_eq!(state.sessions, 1);
    assert_eq!(state.subscriber(bob.uid()).unwrap().online, 0);
    assert!(!bob.session.has_sub(GRP));
    server.stop().await;
}

#[tokio::test]
async fn test_rejoin_without_want_restores_default_access() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut bob = server.connect(bob());

    bob.join_with(join_wanting(&bob, "j1", mode("JR"))).await;
    let ctrl = bob.ctrl_for("j1").await;
    assert_eq!(ctrl.params.unwrap()["acs"]["want"], json!("JR"));
    bob.leave(GRP, "l1", false).await;
    bob.ctrl_for("l1").await;

    bob.join(GRP, "j2").await;
    let ctrl = bob.ctrl_for("j2").await;
    assert_eq!(ctrl.code, 200);
    assert_eq!(ctrl.params.unwrap()["acs"]["want"], json!("JRWP"));
    assert_eq!(
        server.store.sub(GRP, bob.uid()).unwrap().mode_want,
        AccessMode::CPUBLIC
    );
    server.stop().await;
}

#[tokio::test]
async fn test_rejoin_without_want_keeps_self_ban() {
    let store = group_store_with(
        AccessMode::CPUBLIC,
        &[(bob(), AccessMode::NONE, AccessMode::CPUBLIC)],
    );
    let server = TestServer::start(store).await;
    let mut bob = server.connect(bob());

    bob.join(GRP, "j1").await;
    let ctrl = bob.ctrl_for("j1").await;
    assert_eq!(ctrl.code, 200);
    assert_eq!(ctrl.params.unwrap()["acs"]["want"], json!("N"));
    assert!(!bob.session.has_sub(GRP));

    let state = server.hub.topic_state(GRP).await.unwrap().unwrap();
    let sub = state.subscriber(bob.uid()).unwrap();
    assert_eq!(sub.want, AccessMode::NONE);
    assert_eq!(sub.online, 0);

    // Only an explicit want lifts the ban.
    bob.join_with(join_wanting(&bob, "j2", AccessMode::CPUBLIC)).await;
    assert_eq!(bob.ctrl_for("j2").await.code, 200);
    assert!(bob.session.has_sub(GRP));
    server.stop().await;
}

#[tokio::test]
async fn test_self_ban_evicts_attached_sessions() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut bob = server.connect(bob());

    bob.join(GRP, "j1").await;
    bob.ctrl_for("j1").await;

    bob.meta(GRP, "s1", set_sub(None, AccessMode::NONE)).await;
    let evicted = bob.next_ctrl().await;
    assert_eq!(evicted.code, 205);
    assert_eq!(evicted.params.unwrap()["unsub"], json!(false));
    assert_eq!(bob.ctrl_for("s1").await.code, 200);
    assert_eq!(bob.detached().await, GRP);
    assert!(!bob.session.has_sub(GRP));

    let state = server.hub.topic_state(GRP).await.unwrap().unwrap();
    let sub = state.subscriber(bob.uid()).unwrap();
    assert_eq!(sub.want, AccessMode::NONE);
    assert_eq!(sub.online, 0);
    assert_eq!(state.sessions, 0);
    assert_eq!(
        server.store.sub(GRP, bob.uid()).unwrap().mode_want,
        AccessMode::NONE
    );
    server.stop().await;
}

// ============================================================================
// Access changes
// ============================================================================

#[tokio::test]
async fn test_losing_presence_is_announced_before_new_access() {
    let store = group_store_with(
        AccessMode::CPUBLIC,
        &[(bob(), AccessMode::CPUBLIC, AccessMode::CPUBLIC)],
    );
    let server = TestServer::start(store).await;
    let mut me = server.connect(bob());
    let mut grp = server.connect(bob());

    me.join("me", "m1").await;
    me.ctrl_for("m1").await;
    grp.join(GRP, "j1").await;
    grp.ctrl_for("j1").await;
    assert_eq!(me.next_pres("on").await.src, GRP);

    grp.meta(GRP, "s1", set_sub(None, mode("JRW"))).await;
    assert_eq!(grp.ctrl_for("s1").await.code, 200);

    let mut seen = Vec::new();
    while seen.last().map(String::as_str) != Some("acs") {
        if let ServerMessage::Pres(pres) = me.recv().await {
            if pres.src == GRP {
                seen.push(pres.what);
            }
        }
    }
    assert_eq!(seen, vec!["off".to_string(), "acs".to_string()]);
    server.stop().await;
}

#[tokio::test]
async fn test_admin_raises_own_grant_short_of_delete() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut alice = server.connect(alice());
    let mut bob = server.connect(bob());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;
    bob.join(GRP, "j2").await;
    bob.ctrl_for("j2").await;

    alice.meta(GRP, "s1", set_sub(Some(bob.uid()), mode("JRWPA"))).await;
    assert_eq!(alice.ctrl_for("s1").await.code, 200);

    bob.meta(GRP, "s2", set_sub(None, mode("JRWPASD"))).await;
    let ctrl = bob.ctrl_for("s2").await;
    assert_eq!(ctrl.code, 200);
    assert_eq!(ctrl.params.unwrap()["acs"]["given"], json!("JRWPAS"));

    let state = server.hub.topic_state(GRP).await.unwrap().unwrap();
    let sub = state.subscriber(bob.uid()).unwrap();
    assert_eq!(sub.given, mode("JRWPAS"));
    assert!(!(sub.want & sub.given).is_deleter());
    server.stop().await;
}

#[tokio::test]
async fn test_sharer_cannot_set_explicit_access() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut alice = server.connect(alice());
    let mut bob = server.connect(bob());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;
    bob.join(GRP, "j2").await;
    bob.ctrl_for("j2").await;

    alice.meta(GRP, "s1", set_sub(Some(bob.uid()), mode("JRWPS"))).await;
    assert_eq!(alice.ctrl_for("s1").await.code, 200);
    bob.meta(GRP, "s2", set_sub(None, mode("JRWPS"))).await;
    assert_eq!(bob.ctrl_for("s2").await.code, 200);

    bob.meta(GRP, "s3", set_sub(Some(carol()), mode("JRW"))).await;
    assert_eq!(bob.ctrl_for("s3").await.code, 403);
    assert!(server.store.sub(GRP, carol()).is_none());

    // A plain invite gets the topic default.
    bob.meta(GRP, "s4", set_sub(Some(carol()), AccessMode::UNSET)).await;
    assert_eq!(bob.ctrl_for("s4").await.code, 200);
    assert_eq!(
        server.store.sub(GRP, carol()).unwrap().mode_given,
        AccessMode::CPUBLIC
    );
    server.stop().await;
}

// ============================================================================
// Removing subscribers
// ============================================================================

#[tokio::test]
async fn test_subscription_removal_refusals() {
    let store = group_store_with(
        AccessMode::CPUBLIC,
        &[(carol(), AccessMode::NONE, AccessMode::CPUBLIC)],
    );
    let server = TestServer::start(store).await;
    let mut alice = server.connect(alice());
    let mut bob = server.connect(bob());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;
    bob.join(GRP, "j2").await;
    bob.ctrl_for("j2").await;

    alice.meta(GRP, "d1", del_sub(alice.uid())).await;
    assert_eq!(alice.ctrl_for("d1").await.code, 403);

    // Carol banned herself; removing her would lift the ban.
    alice.meta(GRP, "d2", del_sub(carol())).await;
    assert_eq!(alice.ctrl_for("d2").await.code, 403);

    alice.meta(GRP, "d3", del_sub(Uid::new(999))).await;
    assert_eq!(alice.ctrl_for("d3").await.code, 204);

    // Without admin rights.
    bob.meta(GRP, "d4", del_sub(carol())).await;
    assert_eq!(bob.ctrl_for("d4").await.code, 403);

    alice.meta(GRP, "s1", set_sub(Some(bob.uid()), mode("JRWPA"))).await;
    alice.ctrl_for("s1").await;
    bob.meta(GRP, "s2", set_sub(None, mode("JRWPA"))).await;
    assert_eq!(bob.ctrl_for("s2").await.code, 200);

    bob.meta(GRP, "d5", del_sub(alice.uid())).await;
    assert_eq!(bob.ctrl_for("d5").await.code, 403);

    assert!(server.store.sub(GRP, alice.uid()).unwrap().deleted_at.is_none());
    assert!(server.store.sub(GRP, carol()).unwrap().deleted_at.is_none());
    server.stop().await;
}

#[tokio::test]
async fn test_p2p_subscription_cannot_be_removed() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut alice = server.connect(alice());
    let peer = bob().user_id();

    alice.join(&peer, "j1").await;
    assert_eq!(alice.ctrl_for("j1").await.code, 200);

    alice.meta(&peer, "d1", del_sub(bob())).await;
    assert_eq!(alice.ctrl_for("d1").await.code, 403);
    let name = alice.uid().p2p_name(bob());
    assert!(server.store.sub(&name, bob()).unwrap().deleted_at.is_none());
    server.stop().await;
}

// ============================================================================
// Watermarks and deletion
// ============================================================================

#[tokio::test]
async fn test_read_and_recv_only_move_forward() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut alice = server.connect(alice());
    let mut reader = server.connect(bob());
    let mut other = server.connect(bob());
    let mut me = server.connect(bob());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;
    for id in ["p1", "p2", "p3"] {
        alice.publish(GRP, id, json!(id)).await;
        alice.ctrl_for(id).await;
    }
    reader.join(GRP, "j2").await;
    reader.ctrl_for("j2").await;
    other.join(GRP, "j3").await;
    other.ctrl_for("j3").await;
    me.join("me", "m1").await;
    me.ctrl_for("m1").await;

    reader.note(GRP, "read", 2).await;
    let info = next_info(&mut other).await;
    assert_eq!((info.what.as_str(), info.seq, info.from), ("read", 2, bob()));
    let pres = me.next_pres("read").await;
    assert_eq!(pres.src, GRP);
    assert_eq!(pres.seq, 2);

    // Stale watermarks are dropped without an echo.
    reader.note(GRP, "read", 1).await;
    reader.note(GRP, "recv", 2).await;
    reader.note(GRP, "recv", 3).await;
    let info = next_info(&mut other).await;
    assert_eq!((info.what.as_str(), info.seq), ("recv", 3));

    let sub = server.store.sub(GRP, bob()).unwrap();
    assert_eq!((sub.read_id, sub.recv_id), (2, 3));
    let state = server.hub.topic_state(GRP).await.unwrap().unwrap();
    let sub = state.subscriber(bob()).unwrap();
    assert_eq!((sub.read_id, sub.recv_id), (2, 3));
    server.stop().await;
}

#[tokio::test]
async fn test_hard_delete_stamps_every_subscriber() {
    let store = group_store_with(
        AccessMode::CPUBLIC,
        &[(carol(), AccessMode::CPUBLIC, AccessMode::CPUBLIC)],
    );
    let server = TestServer::start(store).await;
    let mut alice = server.connect(alice());
    let mut bob = server.connect(bob());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;
    bob.join(GRP, "j2").await;
    bob.ctrl_for("j2").await;
    for id in ["p1", "p2", "p3"] {
        alice.publish(GRP, id, json!(id)).await;
        alice.ctrl_for(id).await;
    }

    let ranges = vec![DelRangeWire { low: 1, hi: 0 }, DelRangeWire { low: 3, hi: 0 }];
    alice.meta(GRP, "d1", del_msgs(ranges, true)).await;
    let ctrl = alice.ctrl_for("d1").await;
    assert_eq!(ctrl.code, 200);
    assert_eq!(ctrl.params.unwrap()["del"], json!(1));
    assert_eq!(bob.next_pres("del").await.clear, 1);

    let left: Vec<u64> = server.store.messages(GRP).iter().map(|m| m.seq_id).collect();
    assert_eq!(left, vec![2]);
    for uid in [alice.uid(), bob.uid(), carol()] {
        assert_eq!(server.store.sub(GRP, uid).unwrap().del_id, 1);
    }
    let state = server.hub.topic_state(GRP).await.unwrap().unwrap();
    assert_eq!(state.del_id, 1);
    assert!(state.subscribers.iter().all(|s| s.del_id == 1));

    alice
        .meta(GRP, "d2", del_msgs(vec![DelRangeWire { low: 2, hi: 0 }], true))
        .await;
    assert_eq!(alice.ctrl_for("d2").await.params.unwrap()["del"], json!(2));
    assert!(server.store.messages(GRP).is_empty());
    assert_eq!(server.store.topic(GRP).unwrap().del_id, 2);
    server.stop().await;
}

// ============================================================================
// Suspension
// ============================================================================

#[tokio::test]
async fn test_suspended_topic_answers_locked() {
    let server = TestServer::start(group_store(AccessMode::CPUBLIC)).await;
    let mut alice = server.connect(alice());
    let mut bob = server.connect(bob());

    alice.join(GRP, "j1").await;
    alice.ctrl_for("j1").await;
    alice.publish(GRP, "p1", json!("before")).await;
    alice.ctrl_for("p1").await;

    let topic = server.hub.topic_handle(GRP).await.unwrap().unwrap();
    assert!(topic.suspend());

    bob.join(GRP, "j2").await;
    assert_eq!(bob.ctrl_for("j2").await.code, 423);
    alice.publish(GRP, "p2", json!("during")).await;
    assert_eq!(alice.ctrl_for("p2").await.code, 423);
    alice.meta(GRP, "s1", set_sub(Some(bob.uid()), AccessMode::UNSET)).await;
    assert_eq!(alice.ctrl_for("s1").await.code, 423);
    alice
        .meta(GRP, "d1", del_msgs(vec![DelRangeWire { low: 1, hi: 0 }], true))
        .await;
    assert_eq!(alice.ctrl_for("d1").await.code, 423);
    assert_eq!(server.store.messages(GRP).len(), 1);
    assert!(server.store.sub(GRP, bob.uid()).is_none());

    assert!(topic.resume());
    alice.publish(GRP, "p3", json!("after")).await;
    assert_eq!(alice.ctrl_for("p3").await.code, 202);
    server.stop().await;
}

// ============================================================================
// Presence
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_user_agent_changes_are_debounced() {
    let name = alice().p2p_name(bob());
    let store = MemoryStore::new()
        .with_user(User::new(alice()))
        .with_user(User::new(bob()))
        .with_topic(
            TopicRecord::new(&name, alice()),
            vec![
                Subscription::new(&name, alice(), AccessMode::CP2P, AccessMode::CP2P),
                Subscription::new(&name, bob(), AccessMode::CP2P, AccessMode::CP2P),
            ],
        );
    let server = TestServer::start(store).await;
    let mut alice = server.connect(alice());
    let mut bob = server.connect(bob());

    bob.join("me", "m1").await;
    bob.ctrl_for("m1").await;
    alice.join("me", "m2").await;
    alice.ctrl_for("m2").await;
    assert_eq!(bob.next_pres("on").await.src, alice.uid().user_id());

    assert!(server.hub.user_agent_changed(alice.uid(), "client/1.0"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(server.hub.user_agent_changed(alice.uid(), "client/2.0"));

    let ua = bob.next_pres("ua").await;
    assert_eq!(ua.src, alice.uid().user_id());
    assert_eq!(ua.ua, "client/2.0");
    bob.expect_silence(Duration::from_millis(100)).await;
    server.stop().await;
}
