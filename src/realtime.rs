use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::store::Store;
use crate::types::{
    now_iso, AppState, Conversation, EventEnvelopeIn, Message, RealtimeState, Topic,
};

pub fn event_payload(event: &str, data: Value) -> String {
    json!({ "event": event, "data": data, "ts": now_iso() }).to_string()
}

fn emit_to_client(realtime: &RealtimeState, client_id: usize, payload: &str) {
    if let Some(tx) = realtime.clients.get(&client_id) {
        // A closed channel means the client is mid-disconnect; cleanup
        // happens in its socket task.
        let _ = tx.send(payload.to_string());
    }
}

fn emit_to_clients(realtime: &RealtimeState, clients: &HashSet<usize>, payload: &str) {
    for client_id in clients {
        emit_to_client(realtime, *client_id, payload);
    }
}

fn clients_for_topic(realtime: &RealtimeState, topic: &Topic) -> HashSet<usize> {
    realtime
        .topic_members
        .get(topic)
        .cloned()
        .unwrap_or_default()
}

fn all_clients(realtime: &RealtimeState) -> HashSet<usize> {
    realtime.clients.keys().copied().collect()
}

fn clients_for_identity(realtime: &RealtimeState, identity: &str) -> HashSet<usize> {
    realtime
        .identity_by_client
        .iter()
        .filter(|(_, id)| id.as_str() == identity)
        .map(|(client_id, _)| *client_id)
        .collect()
}

/// Fans a new message out to conversation and phone subscribers, then
/// pushes the refreshed conversation snapshot to everyone.
pub async fn emit_message_created(
    state: &Arc<AppState>,
    message: &Message,
    conversation: &Conversation,
) {
    let realtime = state.realtime.lock().await;

    let payload = event_payload(
        "message:new",
        json!({ "message": message, "conversation": conversation }),
    );
    let mut targets = clients_for_topic(&realtime, &Topic::Conversation(conversation.id.clone()));
    targets.extend(clients_for_topic(
        &realtime,
        &Topic::Phone(conversation.phone_number.clone()),
    ));
    emit_to_clients(&realtime, &targets, &payload);

    let mut snapshot = serde_json::to_value(conversation).unwrap_or_else(|_| json!({}));
    snapshot["lastMessage"] = json!({
        "id": message.id,
        "kind": message.kind,
        "content": message.content,
        "direction": message.direction,
        "createdAt": message.created_at,
    });
    let payload = event_payload("conversations:update", snapshot);
    emit_to_clients(&realtime, &all_clients(&realtime), &payload);
}

pub async fn emit_message_status(state: &Arc<AppState>, message: &Message) {
    let Some(conversation_id) = &message.conversation_id else {
        return;
    };
    let realtime = state.realtime.lock().await;
    let payload = event_payload("message:status", json!({ "message": message }));
    let mut targets = clients_for_topic(&realtime, &Topic::Conversation(conversation_id.clone()));
    targets.extend(clients_for_topic(
        &realtime,
        &Topic::Phone(message.phone_number.clone()),
    ));
    emit_to_clients(&realtime, &targets, &payload);
}

pub async fn emit_conversation_update(state: &Arc<AppState>, conversation: &Conversation) {
    let realtime = state.realtime.lock().await;
    let payload = event_payload(
        "conversations:update",
        serde_json::to_value(conversation).unwrap_or_else(|_| json!({})),
    );
    emit_to_clients(&realtime, &all_clients(&realtime), &payload);
}

pub async fn emit_notification(state: &Arc<AppState>, worker_id: &str, payload: &str) {
    let realtime = state.realtime.lock().await;
    let targets = clients_for_identity(&realtime, worker_id);
    emit_to_clients(&realtime, &targets, payload);
}

/// Broadcasts per-identity connection counts whenever a socket joins or
/// leaves.
async fn emit_presence(state: &Arc<AppState>) {
    let realtime = state.realtime.lock().await;
    let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for identity in realtime.identity_by_client.values() {
        *counts.entry(identity.as_str()).or_default() += 1;
    }
    let payload = event_payload("presence:update", json!({ "online": counts }));
    emit_to_clients(&realtime, &all_clients(&realtime), &payload);
}

#[derive(serde::Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    // Anonymous sockets are allowed; they receive broadcasts but no
    // worker-targeted notifications.
    let identity = match &query.token {
        Some(token) => state
            .store
            .worker_by_token(token)
            .await
            .ok()
            .flatten()
            .map(|w| w.id),
        None => None,
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: Option<String>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    {
        let mut realtime = state.realtime.lock().await;
        realtime.clients.insert(client_id, tx);
        if let Some(identity) = &identity {
            realtime
                .identity_by_client
                .insert(client_id, identity.clone());
        }
    }
    debug!(client_id, identity = ?identity, "socket connected");
    emit_presence(&state).await;

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sink.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = stream.next().await {
        let WsMessage::Text(text) = frame else {
            continue;
        };
        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };
        let topic = topic_from_data(&envelope.data);
        match (envelope.event.as_str(), topic) {
            ("join", Some(topic)) => {
                let mut realtime = state.realtime.lock().await;
                realtime
                    .topic_members
                    .entry(topic.clone())
                    .or_default()
                    .insert(client_id);
                realtime
                    .topics_by_client
                    .entry(client_id)
                    .or_default()
                    .insert(topic);
            }
            ("leave", Some(topic)) => {
                let mut realtime = state.realtime.lock().await;
                if let Some(members) = realtime.topic_members.get_mut(&topic) {
                    members.remove(&client_id);
                    if members.is_empty() {
                        realtime.topic_members.remove(&topic);
                    }
                }
                if let Some(topics) = realtime.topics_by_client.get_mut(&client_id) {
                    topics.remove(&topic);
                }
            }
            _ => {}
        }
    }

    {
        let mut realtime = state.realtime.lock().await;
        realtime.clients.remove(&client_id);
        realtime.identity_by_client.remove(&client_id);
        if let Some(topics) = realtime.topics_by_client.remove(&client_id) {
            for topic in topics {
                if let Some(members) = realtime.topic_members.get_mut(&topic) {
                    members.remove(&client_id);
                    if members.is_empty() {
                        realtime.topic_members.remove(&topic);
                    }
                }
            }
        }
    }
    writer.abort();
    debug!(client_id, "socket disconnected");
    emit_presence(&state).await;
}

fn topic_from_data(data: &Value) -> Option<Topic> {
    if let Some(id) = data.get("conversationId").and_then(Value::as_str) {
        return Some(Topic::Conversation(id.to_string()));
    }
    if let Some(phone) = data.get("phoneNumber").and_then(Value::as_str) {
        return Some(Topic::Phone(phone.to_string()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_data_maps_to_topic() {
        let topic = topic_from_data(&json!({ "conversationId": "c1" }));
        assert_eq!(topic, Some(Topic::Conversation("c1".to_string())));
        let topic = topic_from_data(&json!({ "phoneNumber": "9665550001" }));
        assert_eq!(topic, Some(Topic::Phone("9665550001".to_string())));
        assert_eq!(topic_from_data(&json!({})), None);
    }

    #[test]
    fn payload_wraps_event_and_data() {
        let payload = event_payload("message:new", json!({ "id": "m1" }));
        let value = serde_json::from_str::<Value>(&payload).unwrap();
        assert_eq!(value["event"], "message:new");
        assert_eq!(value["data"]["id"], "m1");
        assert!(value["ts"].is_string());
    }
}
