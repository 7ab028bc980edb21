use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::assign;
use crate::config::AppConfig;
use crate::gateway::{CloudGateway, GatewayError, SendGateway};
use crate::ingest;
use crate::notify;
use crate::realtime;
use crate::store::{MemStore, PgStore, Store, StoreError};
use crate::types::{
    normalize_phone, now_iso, AppState, AssignBody, AssignDecision, AssignParams, AssignPolicy,
    AutoAssignBody, Conversation, Direction, Message, MessageKind, MessageOrigin, MessageStatus,
    SendMessageBody, SendToPhoneBody, TransferBody, Worker, WorkerRole,
};

type Handler = (StatusCode, Json<Value>);

fn bad_request(message: &str) -> Handler {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found(message: &str) -> Handler {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message })))
}

fn internal(message: &str) -> Handler {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
}

/// Resolves the bearer token to a worker, or rejects with 401.
async fn authed_worker(state: &Arc<AppState>, headers: &HeaderMap) -> Result<Worker, Handler> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    if token.is_empty() {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing bearer token" })),
        ));
    }
    match state.store.worker_by_token(token).await {
        Ok(Some(worker)) if worker.active => Ok(worker),
        Ok(_) => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid token" })),
        )),
        Err(error) => {
            error!(%error, "token lookup failed");
            Err(internal("token lookup failed"))
        }
    }
}

async fn health() -> Handler {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// Provider subscription handshake: echo the challenge when the verify
/// token matches.
async fn webhook_verify(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or("");
    let token = params
        .get("hub.verify_token")
        .map(String::as_str)
        .unwrap_or("");
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    if mode == "subscribe"
        && !state.config.webhook_verify_token.is_empty()
        && token == state.config.webhook_verify_token
    {
        return (StatusCode::OK, challenge);
    }
    (StatusCode::FORBIDDEN, "verification failed".to_string())
}

/// Constant-time-enough signature check over the raw body. An empty
/// configured secret disables verification (local development).
fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    if secret.is_empty() {
        return true;
    }
    let Some(signature) = header.and_then(|h| h.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Accepts a webhook delivery: verify, ack immediately, process each event
/// in its own task so provider retries never pile up behind our pipeline.
async fn webhook_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Handler {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !verify_signature(&state.config.webhook_app_secret, &body, signature) {
        warn!("webhook delivery with bad signature rejected");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid signature" })),
        );
    }

    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return bad_request("invalid json body");
    };

    let events = ingest::unwrap_envelope(&payload);
    let count = events.len();
    for event in events {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(error) = ingest::ingest_event(&state, event).await {
                error!(%error, "event ingestion failed");
            }
        });
    }

    (
        StatusCode::OK,
        Json(json!({ "received": true, "events": count })),
    )
}

async fn list_conversations(State(state): State<Arc<AppState>>) -> Handler {
    match state.store.conversations().await {
        Ok(list) => (StatusCode::OK, Json(json!({ "conversations": list }))),
        Err(error) => {
            error!(%error, "conversation list failed");
            internal("conversation list failed")
        }
    }
}

async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Handler {
    match state.store.conversation(&id).await {
        Ok(Some(conversation)) => (StatusCode::OK, Json(json!({ "conversation": conversation }))),
        Ok(None) => not_found("conversation not found"),
        Err(error) => {
            error!(%error, "conversation lookup failed");
            internal("conversation lookup failed")
        }
    }
}

async fn get_messages(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Handler {
    match state.store.messages_for_conversation(&id).await {
        Ok(list) => (StatusCode::OK, Json(json!({ "messages": list }))),
        Err(error) => {
            error!(%error, "message list failed");
            internal("message list failed")
        }
    }
}

#[derive(Debug, Error)]
pub enum OutboundError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Sends an operator text into an existing conversation. The provider send
/// happens first; nothing is persisted for a rejected send.
pub async fn send_operator_text(
    state: &Arc<AppState>,
    worker: &Worker,
    conversation: &Conversation,
    text: &str,
) -> Result<Message, OutboundError> {
    let external_id = state
        .gateway
        .send_text(&conversation.phone_number, text)
        .await?;

    let now = now_iso();
    let message = Message {
        id: Uuid::new_v4().to_string(),
        external_id: Some(external_id),
        phone_number: conversation.phone_number.clone(),
        kind: MessageKind::Text,
        direction: Direction::Outgoing,
        content: text.to_string(),
        metadata: json!({}),
        status: MessageStatus::Sent,
        origin: MessageOrigin::Operator,
        conversation_id: Some(conversation.id.clone()),
        worker_id: Some(worker.id.clone()),
        created_at: now.clone(),
        updated_at: now.clone(),
        delivered_at: None,
        read_at: None,
        deleted_at: None,
    };
    state.store.insert_message(&message).await?;
    let updated = state
        .store
        .record_activity(&conversation.id, &message.id, &now)
        .await?
        .unwrap_or_else(|| conversation.clone());
    realtime::emit_message_created(state, &message, &updated).await;
    Ok(message)
}

/// Outbound send keyed by phone number; the first send to a fresh number
/// creates its conversation.
pub async fn send_text_to_phone(
    state: &Arc<AppState>,
    worker: &Worker,
    phone_number: &str,
    text: &str,
) -> Result<(Message, Conversation), OutboundError> {
    let conversation = state.store.find_or_create_conversation(phone_number).await?;
    let message = send_operator_text(state, worker, &conversation, text).await?;
    Ok((message, conversation))
}

fn outbound_rejection(error: OutboundError) -> Handler {
    match error {
        OutboundError::Gateway(error) => {
            warn!(%error, "provider rejected operator send");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "provider send failed" })),
            )
        }
        OutboundError::Store(error) => {
            error!(%error, "outgoing message persist failed");
            internal("message persist failed")
        }
    }
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SendMessageBody>,
) -> Handler {
    let worker = match authed_worker(&state, &headers).await {
        Ok(worker) => worker,
        Err(rejection) => return rejection,
    };
    if body.text.trim().is_empty() {
        return bad_request("text must not be empty");
    }
    let conversation = match state.store.conversation(&id).await {
        Ok(Some(conversation)) => conversation,
        Ok(None) => return not_found("conversation not found"),
        Err(error) => {
            error!(%error, "conversation lookup failed");
            return internal("conversation lookup failed");
        }
    };

    match send_operator_text(&state, &worker, &conversation, &body.text).await {
        Ok(message) => (StatusCode::CREATED, Json(json!({ "message": message }))),
        Err(error) => outbound_rejection(error),
    }
}

async fn post_outbound_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SendToPhoneBody>,
) -> Handler {
    let worker = match authed_worker(&state, &headers).await {
        Ok(worker) => worker,
        Err(rejection) => return rejection,
    };
    if body.text.trim().is_empty() {
        return bad_request("text must not be empty");
    }
    let Some(phone_number) = normalize_phone(&body.to) else {
        return bad_request("invalid destination number");
    };

    match send_text_to_phone(&state, &worker, &phone_number, &body.text).await {
        Ok((message, conversation)) => (
            StatusCode::CREATED,
            Json(json!({ "message": message, "conversation": conversation })),
        ),
        Err(error) => outbound_rejection(error),
    }
}

async fn assign_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AssignBody>,
) -> Handler {
    if let Err(rejection) = authed_worker(&state, &headers).await {
        return rejection;
    }
    match state.store.worker(&body.worker_id).await {
        Ok(Some(worker)) if worker.active => {}
        Ok(_) => return bad_request("worker not active"),
        Err(error) => {
            error!(%error, "worker lookup failed");
            return internal("worker lookup failed");
        }
    }
    match state.store.assign_owner(&id, &body.worker_id, &now_iso()).await {
        Ok(Some(conversation)) => {
            notify::notify_assignment(&state, &body.worker_id, &conversation).await;
            realtime::emit_conversation_update(&state, &conversation).await;
            (StatusCode::OK, Json(json!({ "conversation": conversation })))
        }
        Ok(None) => not_found("conversation not found"),
        Err(error) => {
            error!(%error, "assignment failed");
            internal("assignment failed")
        }
    }
}

async fn auto_assign_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AutoAssignBody>,
) -> Handler {
    if let Err(rejection) = authed_worker(&state, &headers).await {
        return rejection;
    }
    let policy = body
        .policy
        .as_deref()
        .and_then(AssignPolicy::parse)
        .unwrap_or(AssignPolicy::RoundRobin);
    let params = AssignParams {
        priority: body.priority.unwrap_or(0),
    };
    match assign::assign(&state, &id, policy, &params).await {
        Ok(AssignDecision::Assigned {
            conversation,
            worker_id,
        }) => {
            notify::notify_assignment(&state, &worker_id, &conversation).await;
            realtime::emit_conversation_update(&state, &conversation).await;
            (
                StatusCode::OK,
                Json(json!({
                    "assigned": true,
                    "workerId": worker_id,
                    "conversation": conversation
                })),
            )
        }
        Ok(AssignDecision::Skipped { reason }) => (
            StatusCode::OK,
            Json(json!({ "assigned": false, "reason": reason })),
        ),
        Err(error) => {
            error!(%error, "auto-assignment failed");
            internal("auto-assignment failed")
        }
    }
}

/// Hands the conversation to another worker, clearing its unread backlog
/// so the new owner starts fresh.
async fn transfer_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<TransferBody>,
) -> Handler {
    if let Err(rejection) = authed_worker(&state, &headers).await {
        return rejection;
    }
    match state.store.worker(&body.worker_id).await {
        Ok(Some(worker)) if worker.active => {}
        Ok(_) => return bad_request("worker not active"),
        Err(error) => {
            error!(%error, "worker lookup failed");
            return internal("worker lookup failed");
        }
    }
    let previous_owner = match state.store.conversation(&id).await {
        Ok(Some(conversation)) => conversation.assigned_to,
        Ok(None) => return not_found("conversation not found"),
        Err(error) => {
            error!(%error, "conversation lookup failed");
            return internal("conversation lookup failed");
        }
    };
    let conversation = match state.store.assign_owner(&id, &body.worker_id, &now_iso()).await {
        Ok(Some(conversation)) => conversation,
        Ok(None) => return not_found("conversation not found"),
        Err(error) => {
            error!(%error, "transfer failed");
            return internal("transfer failed");
        }
    };
    let conversation = state
        .store
        .reset_unread(&id)
        .await
        .ok()
        .flatten()
        .unwrap_or(conversation);

    notify::notify_transfer(
        &state,
        previous_owner.as_deref(),
        &body.worker_id,
        &conversation,
    )
    .await;
    realtime::emit_conversation_update(&state, &conversation).await;
    (StatusCode::OK, Json(json!({ "conversation": conversation })))
}

async fn close_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Handler {
    if let Err(rejection) = authed_worker(&state, &headers).await {
        return rejection;
    }
    match state.store.close_conversation(&id, &now_iso()).await {
        Ok(Some(conversation)) => {
            realtime::emit_conversation_update(&state, &conversation).await;
            (StatusCode::OK, Json(json!({ "conversation": conversation })))
        }
        Ok(None) => not_found("conversation not found"),
        Err(error) => {
            error!(%error, "close failed");
            internal("close failed")
        }
    }
}

async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Handler {
    let worker = match authed_worker(&state, &headers).await {
        Ok(worker) => worker,
        Err(rejection) => return rejection,
    };
    if worker.role != WorkerRole::Admin {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "admin role required" })),
        );
    }
    match state.store.soft_delete_conversation(&id, &now_iso()).await {
        Ok(Some(conversation)) => {
            realtime::emit_conversation_update(&state, &conversation).await;
            (StatusCode::OK, Json(json!({ "deleted": true })))
        }
        Ok(None) => not_found("conversation not found"),
        Err(error) => {
            error!(%error, "delete failed");
            internal("delete failed")
        }
    }
}

async fn list_notifications(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Handler {
    let worker = match authed_worker(&state, &headers).await {
        Ok(worker) => worker,
        Err(rejection) => return rejection,
    };
    let list = match state.store.notifications_for_worker(&worker.id).await {
        Ok(list) => list,
        Err(error) => {
            error!(%error, "notification list failed");
            return internal("notification list failed");
        }
    };
    let unread = state
        .store
        .unread_notification_count(&worker.id)
        .await
        .unwrap_or(0);
    (
        StatusCode::OK,
        Json(json!({ "notifications": list, "unreadCount": unread })),
    )
}

async fn read_all_notifications(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Handler {
    let worker = match authed_worker(&state, &headers).await {
        Ok(worker) => worker,
        Err(rejection) => return rejection,
    };
    match state
        .store
        .mark_all_notifications_read(&worker.id, &now_iso())
        .await
    {
        Ok(updated) => (StatusCode::OK, Json(json!({ "updated": updated }))),
        Err(error) => {
            error!(%error, "mark all read failed");
            internal("mark all read failed")
        }
    }
}

async fn read_notification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Handler {
    let worker = match authed_worker(&state, &headers).await {
        Ok(worker) => worker,
        Err(rejection) => return rejection,
    };
    match state
        .store
        .mark_notification_read(&id, &worker.id, &now_iso())
        .await
    {
        Ok(true) => (StatusCode::OK, Json(json!({ "read": true }))),
        Ok(false) => not_found("notification not found"),
        Err(error) => {
            error!(%error, "mark read failed");
            internal("mark read failed")
        }
    }
}

async fn delete_notification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Handler {
    let worker = match authed_worker(&state, &headers).await {
        Ok(worker) => worker,
        Err(rejection) => return rejection,
    };
    match state.store.delete_notification(&id, &worker.id).await {
        Ok(true) => (StatusCode::OK, Json(json!({ "deleted": true }))),
        Ok(false) => not_found("notification not found"),
        Err(error) => {
            error!(%error, "notification delete failed");
            internal("notification delete failed")
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/webhook", get(webhook_verify).post(webhook_event))
        .route("/api/messages", post(post_outbound_message))
        .route("/api/conversations", get(list_conversations))
        .route(
            "/api/conversations/{id}",
            get(get_conversation).delete(delete_conversation),
        )
        .route(
            "/api/conversations/{id}/messages",
            get(get_messages).post(post_message),
        )
        .route("/api/conversations/{id}/assign", post(assign_conversation))
        .route(
            "/api/conversations/{id}/auto-assign",
            post(auto_assign_conversation),
        )
        .route("/api/conversations/{id}/transfer", post(transfer_conversation))
        .route("/api/conversations/{id}/close", post(close_conversation))
        .route("/api/notifications", get(list_notifications))
        .route("/api/notifications/read-all", post(read_all_notifications))
        .route("/api/notifications/{id}", delete(delete_notification))
        .route("/api/notifications/{id}/read", patch(read_notification))
        .route("/ws", get(realtime::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env();

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => match PgStore::connect(url).await {
            Ok(store) => {
                info!("connected to postgres");
                Arc::new(store)
            }
            Err(error) => {
                error!(%error, "postgres connection failed");
                std::process::exit(1);
            }
        },
        None => {
            warn!("DATABASE_URL unset, running on the in-memory store");
            Arc::new(MemStore::new())
        }
    };
    let gateway: Arc<dyn SendGateway> = Arc::new(CloudGateway::new(&config));
    let port = config.port;
    let state = Arc::new(AppState::new(store, gateway, config));

    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                state.config.overdue_scan_secs,
            ));
            loop {
                ticker.tick().await;
                notify::scan_overdue(&state).await;
            }
        });
    }

    let app = router(state);
    let addr = format!("0.0.0.0:{port}");
    info!(addr = addr.as_str(), "listening");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(%error, "bind failed");
            std::process::exit(1);
        }
    };
    if let Err(error) = axum::serve(listener, app).await {
        error!(%error, "server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_check_accepts_valid_hmac() {
        let secret = "shh";
        let body = br#"{"entry":[]}"#;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let header = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verify_signature(secret, body, Some(&header)));
        assert!(!verify_signature(secret, body, Some("sha256=deadbeef")));
        assert!(!verify_signature(secret, body, None));
    }

    #[test]
    fn empty_secret_disables_verification() {
        assert!(verify_signature("", b"anything", None));
    }
}
