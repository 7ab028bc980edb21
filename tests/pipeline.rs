use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use inbox_router::config::AppConfig;
use inbox_router::gateway::MockGateway;
use inbox_router::ingest::{ingest_event, unwrap_envelope, IngestOutcome};
use inbox_router::notify;
use inbox_router::store::{MemStore, Store};
use inbox_router::types::{
    now_iso, AppState, AutomationRule, ConversationStatus, Direction, MessageOrigin,
    MessageStatus, NotificationKind, NotificationPriority, Topic, TriggerKind, Worker, WorkerRole,
};

fn text_delivery(external_id: &str, from: &str, body: &str) -> Value {
    json!({
        "entry": [{
            "changes": [{
                "value": {
                    "messages": [{
                        "id": external_id,
                        "from": from,
                        "timestamp": "1724659200",
                        "type": "text",
                        "text": { "body": body }
                    }]
                }
            }]
        }]
    })
}

fn status_delivery(external_id: &str, status: &str, timestamp: &str) -> Value {
    json!({
        "entry": [{
            "changes": [{
                "value": {
                    "statuses": [{
                        "id": external_id,
                        "status": status,
                        "timestamp": timestamp
                    }]
                }
            }]
        }]
    })
}

fn employee(id: &str, created_at: &str) -> Worker {
    Worker {
        id: id.to_string(),
        name: format!("agent {id}"),
        role: WorkerRole::Employee,
        active: true,
        created_at: created_at.to_string(),
    }
}

async fn pipeline() -> (Arc<AppState>, Arc<MemStore>, Arc<MockGateway>) {
    let store = Arc::new(MemStore::new());
    let gateway = Arc::new(MockGateway::new());
    let state = Arc::new(AppState::new(
        store.clone(),
        gateway.clone(),
        AppConfig::default(),
    ));
    (state, store, gateway)
}

async fn ingest_all(state: &Arc<AppState>, body: &Value) -> Vec<IngestOutcome> {
    let mut outcomes = Vec::new();
    for event in unwrap_envelope(body) {
        outcomes.push(ingest_event(state, event).await.unwrap());
    }
    outcomes
}

#[tokio::test]
async fn inbound_message_creates_and_routes_conversation() {
    let (state, store, _) = pipeline().await;
    store.seed_worker(employee("w1", "1")).await;

    let outcomes = ingest_all(&state, &text_delivery("wamid.1", "9665550001", "hello")).await;
    assert!(matches!(outcomes[0], IngestOutcome::Stored { .. }));

    let conversations = store.conversations().await.unwrap();
    assert_eq!(conversations.len(), 1);
    let conversation = &conversations[0];
    assert_eq!(conversation.phone_number, "9665550001");
    assert_eq!(conversation.status, ConversationStatus::Assigned);
    assert_eq!(conversation.assigned_to.as_deref(), Some("w1"));

    let messages = store.messages_for_conversation(&conversation.id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].direction, Direction::Incoming);
    assert_eq!(messages[0].status, MessageStatus::Delivered);
    assert_eq!(messages[0].origin, MessageOrigin::Webhook);
    assert_eq!(messages[0].content, "hello");
    assert!(messages[0].delivered_at.as_deref().unwrap().starts_with("2024-08-26"));

    // the new owner got an assignment notification
    let notifications = store.notifications_for_worker("w1").await.unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::Assignment);
}

#[tokio::test]
async fn duplicate_delivery_is_a_noop() {
    let (state, store, _) = pipeline().await;

    let first = ingest_all(&state, &text_delivery("wamid.1", "9665550001", "hello")).await;
    assert!(matches!(first[0], IngestOutcome::Stored { .. }));

    let second = ingest_all(&state, &text_delivery("wamid.1", "9665550001", "hello")).await;
    assert_eq!(second[0], IngestOutcome::Duplicate);

    let conversations = store.conversations().await.unwrap();
    assert_eq!(conversations.len(), 1);
    let messages = store
        .messages_for_conversation(&conversations[0].id)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn no_employees_leaves_conversation_unassigned() {
    let (state, store, _) = pipeline().await;

    ingest_all(&state, &text_delivery("wamid.1", "9665550001", "hello")).await;

    let conversation = &store.conversations().await.unwrap()[0];
    assert_eq!(conversation.status, ConversationStatus::Open);
    assert!(conversation.assigned_to.is_none());
}

#[tokio::test]
async fn owned_conversation_accumulates_unread_and_notifies_owner() {
    let (state, store, _) = pipeline().await;
    store.seed_worker(employee("w1", "1")).await;

    ingest_all(&state, &text_delivery("wamid.1", "9665550001", "first")).await;
    ingest_all(&state, &text_delivery("wamid.2", "9665550001", "second")).await;
    ingest_all(&state, &text_delivery("wamid.3", "9665550001", "third")).await;

    let conversation = &store.conversations().await.unwrap()[0];
    // first message triggered assignment; the next two count as unread
    assert_eq!(conversation.unread_count, 2);

    let notifications = store.notifications_for_worker("w1").await.unwrap();
    let message_notices = notifications
        .iter()
        .filter(|n| n.kind == NotificationKind::Message)
        .count();
    assert_eq!(message_notices, 2);
}

#[tokio::test]
async fn round_robin_spreads_conversations() {
    let (state, store, _) = pipeline().await;
    store.seed_worker(employee("w1", "1")).await;
    store.seed_worker(employee("w2", "2")).await;

    ingest_all(&state, &text_delivery("wamid.1", "9665550001", "hi")).await;
    ingest_all(&state, &text_delivery("wamid.2", "9665550002", "hi")).await;

    let mut owners = store
        .conversations()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.assigned_to.unwrap())
        .collect::<Vec<_>>();
    owners.sort();
    assert_eq!(owners, vec!["w1".to_string(), "w2".to_string()]);
}

#[tokio::test]
async fn status_updates_apply_monotonically() {
    let (state, store, _) = pipeline().await;
    store.seed_worker(employee("w1", "1")).await;
    ingest_all(&state, &text_delivery("wamid.1", "9665550001", "hi")).await;

    // read without a prior delivered-advance still lands, stamping read_at
    // from the wire timestamp
    let outcomes = ingest_all(&state, &status_delivery("wamid.1", "read", "1724662800")).await;
    assert_eq!(outcomes[0], IngestOutcome::StatusApplied);

    let message = store.message_by_external_id("wamid.1").await.unwrap().unwrap();
    assert_eq!(message.status, MessageStatus::Read);
    assert!(message.read_at.as_deref().unwrap().starts_with("2024-08-26"));

    // late delivered update is out of order and ignored
    let outcomes = ingest_all(&state, &status_delivery("wamid.1", "delivered", "1724662900")).await;
    assert_eq!(
        outcomes[0],
        IngestOutcome::StatusDropped { reason: "out_of_order" }
    );

    let outcomes = ingest_all(&state, &status_delivery("wamid.9", "read", "1724662800")).await;
    assert_eq!(
        outcomes[0],
        IngestOutcome::StatusDropped { reason: "unknown_message" }
    );

    let outcomes = ingest_all(&state, &status_delivery("wamid.1", "warehoused", "1")).await;
    assert_eq!(
        outcomes[0],
        IngestOutcome::StatusDropped { reason: "unrecognized_status" }
    );
}

#[tokio::test]
async fn keyword_rule_fires_auto_reply() {
    let (state, store, gateway) = pipeline().await;
    store
        .seed_rule(AutomationRule {
            id: "r1".to_string(),
            name: "refund autoresponder".to_string(),
            trigger_kind: TriggerKind::MessageReceived,
            conditions: json!({ "keywords": ["refund"] }),
            actions: json!([{ "kind": "send_reply", "text": "An agent will review your refund shortly." }]),
            active: true,
            priority: 5,
            created_at: now_iso(),
        })
        .await;

    ingest_all(&state, &text_delivery("wamid.1", "9665550001", "I need a refund")).await;

    let sent = gateway.sent_snapshot();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "9665550001");
    assert_eq!(sent[0].body, "An agent will review your refund shortly.");

    let conversation = &store.conversations().await.unwrap()[0];
    let messages = store.messages_for_conversation(&conversation.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    let reply = messages
        .iter()
        .find(|m| m.direction == Direction::Outgoing)
        .unwrap();
    assert_eq!(reply.origin, MessageOrigin::Rule);
    assert_eq!(reply.status, MessageStatus::Sent);

    // a second message without the keyword stays quiet
    ingest_all(&state, &text_delivery("wamid.2", "9665550001", "thanks")).await;
    assert_eq!(gateway.sent_snapshot().len(), 1);
}

#[tokio::test]
async fn transfer_resets_unread_and_notifies_both_workers() {
    let (state, store, _) = pipeline().await;
    store.seed_worker(employee("w1", "1")).await;

    ingest_all(&state, &text_delivery("wamid.1", "9665550001", "hi")).await;
    ingest_all(&state, &text_delivery("wamid.2", "9665550001", "anyone?")).await;

    let conversation = store.conversations().await.unwrap().remove(0);
    assert_eq!(conversation.assigned_to.as_deref(), Some("w1"));
    assert_eq!(conversation.unread_count, 1);

    // transfer to w2 the way the HTTP handler does it
    let previous = conversation.assigned_to.clone();
    let updated = store
        .assign_owner(&conversation.id, "w2", &now_iso())
        .await
        .unwrap()
        .unwrap();
    let updated = store.reset_unread(&updated.id).await.unwrap().unwrap();
    notify::notify_transfer(&state, previous.as_deref(), "w2", &updated).await;

    assert_eq!(updated.assigned_to.as_deref(), Some("w2"));
    assert_eq!(updated.unread_count, 0);

    let to_new = store.notifications_for_worker("w2").await.unwrap();
    let transfer_in = to_new
        .iter()
        .find(|n| n.kind == NotificationKind::Transfer)
        .unwrap();
    assert_eq!(transfer_in.priority, NotificationPriority::Normal);

    let to_previous = store.notifications_for_worker("w1").await.unwrap();
    let transfer_out = to_previous
        .iter()
        .find(|n| n.kind == NotificationKind::Transfer)
        .unwrap();
    assert_eq!(transfer_out.priority, NotificationPriority::Low);
}

#[tokio::test]
async fn subscribed_client_receives_message_events() {
    let (state, store, _) = pipeline().await;

    // seed the conversation so its topic id is known before subscribing
    let conversation = store.find_or_create_conversation("9665550001").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    {
        let mut realtime = state.realtime.lock().await;
        realtime.clients.insert(7, tx);
        realtime
            .topic_members
            .entry(Topic::Conversation(conversation.id.clone()))
            .or_default()
            .insert(7);
    }

    ingest_all(&state, &text_delivery("wamid.1", "9665550001", "hello")).await;

    let first = rx.recv().await.unwrap();
    let event = serde_json::from_str::<Value>(&first).unwrap();
    assert_eq!(event["event"], "message:new");
    assert_eq!(event["data"]["message"]["content"], "hello");
    assert_eq!(event["data"]["conversation"]["id"], conversation.id);

    // the global snapshot broadcast follows
    let second = rx.recv().await.unwrap();
    let event = serde_json::from_str::<Value>(&second).unwrap();
    assert_eq!(event["event"], "conversations:update");
    assert_eq!(event["data"]["lastMessage"]["content"], "hello");
}

#[tokio::test]
async fn reopened_conversation_gets_auto_assigned() {
    let (state, store, _) = pipeline().await;

    // first message arrives with nobody to take it
    ingest_all(&state, &text_delivery("wamid.1", "9665550001", "hi")).await;
    let conversation = store.conversations().await.unwrap().remove(0);
    assert!(conversation.assigned_to.is_none());
    store
        .close_conversation(&conversation.id, &now_iso())
        .await
        .unwrap();

    // an employee comes online before the customer writes again
    store.seed_worker(employee("w1", "1")).await;
    ingest_all(&state, &text_delivery("wamid.2", "9665550001", "back again")).await;

    let conversation = store.conversation(&conversation.id).await.unwrap().unwrap();
    assert_eq!(conversation.status, ConversationStatus::Assigned);
    assert_eq!(conversation.assigned_to.as_deref(), Some("w1"));
    assert!(conversation.closed_at.is_none());
}

#[tokio::test]
async fn outbound_send_to_new_phone_creates_conversation() {
    let (state, store, gateway) = pipeline().await;
    store.seed_worker(employee("w1", "1")).await;
    let worker = store.worker("w1").await.unwrap().unwrap();

    let (message, conversation) =
        inbox_router::app::send_text_to_phone(&state, &worker, "9665550042", "welcome aboard")
            .await
            .unwrap();

    assert_eq!(conversation.phone_number, "9665550042");
    assert_eq!(message.direction, Direction::Outgoing);
    assert_eq!(message.origin, MessageOrigin::Operator);
    assert_eq!(message.status, MessageStatus::Sent);
    assert_eq!(message.worker_id.as_deref(), Some("w1"));
    assert_eq!(gateway.sent_snapshot().len(), 1);

    // a second send to the same number reuses the conversation
    let (_, again) = inbox_router::app::send_text_to_phone(&state, &worker, "9665550042", "hello?")
        .await
        .unwrap();
    assert_eq!(again.id, conversation.id);
    assert_eq!(store.conversations().await.unwrap().len(), 1);

    let stored = store.conversation(&conversation.id).await.unwrap().unwrap();
    assert!(stored.last_message_id.is_some());
}

#[tokio::test]
async fn rejected_outbound_send_persists_nothing() {
    let (state, store, gateway) = pipeline().await;
    store.seed_worker(employee("w1", "1")).await;
    let worker = store.worker("w1").await.unwrap().unwrap();
    gateway.fail.store(true, std::sync::atomic::Ordering::Relaxed);

    let result =
        inbox_router::app::send_text_to_phone(&state, &worker, "9665550042", "welcome").await;
    assert!(result.is_err());

    let conversation = &store.conversations().await.unwrap()[0];
    let messages = store.messages_for_conversation(&conversation.id).await.unwrap();
    assert!(messages.is_empty());
}

#[tokio::test]
async fn closed_conversation_reopens_on_new_message() {
    let (state, store, _) = pipeline().await;

    ingest_all(&state, &text_delivery("wamid.1", "9665550001", "hi")).await;
    let conversation = store.conversations().await.unwrap().remove(0);
    store
        .close_conversation(&conversation.id, &now_iso())
        .await
        .unwrap();

    ingest_all(&state, &text_delivery("wamid.2", "9665550001", "still there?")).await;

    let conversation = store.conversation(&conversation.id).await.unwrap().unwrap();
    assert_eq!(conversation.status, ConversationStatus::Open);
    assert!(conversation.closed_at.is_none());

    // same conversation row, not a new one
    assert_eq!(store.conversations().await.unwrap().len(), 1);
}
