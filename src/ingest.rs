use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assign;
use crate::notify;
use crate::realtime;
use crate::store::{StatusAdvance, Store, StoreError};
use crate::types::{
    normalize_phone, now_iso, AppState, AssignDecision, AssignParams, AssignPolicy,
    ConversationStatus, Direction, InboundEvent, InboundMessage, Message, MessageKind,
    MessageOrigin, MessageStatus, StatusUpdate, TriggerKind,
};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored { message_id: String },
    Duplicate,
    Skipped { reason: &'static str },
    StatusApplied,
    StatusDropped { reason: &'static str },
}

/// Flattens a provider webhook delivery into its individual events.
/// Anything that is not a recognizable message or status entry is ignored.
pub fn unwrap_envelope(body: &Value) -> Vec<InboundEvent> {
    let mut events = Vec::new();
    let entries = body.get("entry").and_then(Value::as_array);
    for entry in entries.into_iter().flatten() {
        let changes = entry.get("changes").and_then(Value::as_array);
        for change in changes.into_iter().flatten() {
            let Some(value) = change.get("value") else {
                continue;
            };
            for raw in value
                .get("messages")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let Some(external_id) = raw.get("id").and_then(Value::as_str) else {
                    continue;
                };
                events.push(InboundEvent::Message(InboundMessage {
                    external_id: external_id.to_string(),
                    from: raw
                        .get("from")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    timestamp: raw
                        .get("timestamp")
                        .and_then(Value::as_str)
                        .map(|t| t.to_string()),
                    payload: raw.clone(),
                }));
            }
            for raw in value
                .get("statuses")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let (Some(external_id), Some(status)) = (
                    raw.get("id").and_then(Value::as_str),
                    raw.get("status").and_then(Value::as_str),
                ) else {
                    continue;
                };
                events.push(InboundEvent::Status(StatusUpdate {
                    external_id: external_id.to_string(),
                    status: status.to_string(),
                    timestamp: raw
                        .get("timestamp")
                        .and_then(Value::as_str)
                        .map(|t| t.to_string()),
                    errors: raw.get("errors").cloned(),
                }));
            }
        }
    }
    events
}

pub struct Classified {
    pub kind: MessageKind,
    pub content: String,
    pub metadata: Value,
}

/// Maps a raw provider message payload to our kind, display content, and
/// metadata. Unknown payload types land as text carrying the raw JSON so
/// nothing is silently lost.
pub fn classify(payload: &Value) -> Classified {
    let kind_tag = payload.get("type").and_then(Value::as_str).unwrap_or("");
    match kind_tag {
        "text" => Classified {
            kind: MessageKind::Text,
            content: payload
                .pointer("/text/body")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            metadata: json!({}),
        },
        "button" => Classified {
            kind: MessageKind::Text,
            content: payload
                .pointer("/button/text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            metadata: json!({ "interactive": true }),
        },
        "interactive" => {
            let reply = payload
                .pointer("/interactive/button_reply/title")
                .or_else(|| payload.pointer("/interactive/list_reply/title"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            Classified {
                kind: MessageKind::Text,
                content: reply.to_string(),
                metadata: json!({ "interactive": true }),
            }
        }
        "location" => {
            let latitude = payload.pointer("/location/latitude").and_then(Value::as_f64);
            let longitude = payload.pointer("/location/longitude").and_then(Value::as_f64);
            let name = payload
                .pointer("/location/name")
                .and_then(Value::as_str)
                .unwrap_or("Shared a location");
            Classified {
                kind: MessageKind::Location,
                content: name.to_string(),
                metadata: json!({ "latitude": latitude, "longitude": longitude }),
            }
        }
        "image" | "video" | "audio" | "document" | "sticker" => {
            let kind = MessageKind::parse(kind_tag).unwrap_or(MessageKind::Document);
            let media = payload.get(kind_tag).cloned().unwrap_or_else(|| json!({}));
            let caption = media
                .get("caption")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let content = if caption.is_empty() {
                format!("Sent a {kind_tag}")
            } else {
                caption.to_string()
            };
            Classified {
                kind,
                content,
                metadata: json!({
                    "mediaId": media.get("id"),
                    "mimeType": media.get("mime_type"),
                    "filename": media.get("filename"),
                    "voice": media.get("voice"),
                }),
            }
        }
        "contacts" => {
            let name = payload
                .pointer("/contacts/0/name/formatted_name")
                .and_then(Value::as_str)
                .unwrap_or("Shared a contact");
            Classified {
                kind: MessageKind::Contact,
                content: name.to_string(),
                metadata: json!({ "contacts": payload.get("contacts") }),
            }
        }
        _ => Classified {
            kind: MessageKind::Text,
            content: payload.to_string(),
            metadata: json!({ "unrecognized": true }),
        },
    }
}

/// Provider timestamps arrive as unix-second strings; anything unparseable
/// falls back to the current time.
pub fn wire_timestamp(raw: Option<&str>) -> String {
    raw.and_then(|t| t.parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(now_iso)
}

pub async fn ingest_event(
    state: &Arc<AppState>,
    event: InboundEvent,
) -> Result<IngestOutcome, IngestError> {
    match event {
        InboundEvent::Message(message) => ingest_message(state, message).await,
        InboundEvent::Status(status) => ingest_status(state, status).await,
    }
}

async fn ingest_message(
    state: &Arc<AppState>,
    inbound: InboundMessage,
) -> Result<IngestOutcome, IngestError> {
    if state
        .store
        .message_by_external_id(&inbound.external_id)
        .await?
        .is_some()
    {
        debug!(external_id = inbound.external_id.as_str(), "duplicate delivery dropped");
        return Ok(IngestOutcome::Duplicate);
    }

    let Some(phone_number) = normalize_phone(&inbound.from) else {
        warn!(external_id = inbound.external_id.as_str(), "message without usable sender");
        return Ok(IngestOutcome::Skipped {
            reason: "missing_sender",
        });
    };

    let classified = classify(&inbound.payload);
    let delivered_at = wire_timestamp(inbound.timestamp.as_deref());

    let conversation = state.store.find_or_create_conversation(&phone_number).await?;

    let now = now_iso();
    let message = Message {
        id: Uuid::new_v4().to_string(),
        external_id: Some(inbound.external_id.clone()),
        phone_number: phone_number.clone(),
        kind: classified.kind,
        direction: Direction::Incoming,
        content: classified.content,
        metadata: classified.metadata,
        status: MessageStatus::Delivered,
        origin: MessageOrigin::Webhook,
        conversation_id: Some(conversation.id.clone()),
        worker_id: None,
        created_at: now.clone(),
        updated_at: now.clone(),
        delivered_at: Some(delivered_at.clone()),
        read_at: None,
        deleted_at: None,
    };

    // The unique index is the real dedupe gate; the lookup above only
    // short-circuits the common case.
    if !state.store.insert_message(&message).await? {
        return Ok(IngestOutcome::Duplicate);
    }

    // A closed conversation reopens here, so the owner/status checks below
    // must read the returned row, not the pre-insert snapshot.
    let conversation = state
        .store
        .record_activity(&conversation.id, &message.id, &delivered_at)
        .await?
        .unwrap_or(conversation);

    let mut latest = conversation.clone();
    if conversation.assigned_to.is_some() {
        if let Some(updated) = state.store.increment_unread(&conversation.id).await? {
            notify::notify_new_message(state, &message, &updated).await;
            latest = updated;
        }
    } else if conversation.status == ConversationStatus::Open {
        match assign::assign(
            state,
            &conversation.id,
            AssignPolicy::RoundRobin,
            &AssignParams::default(),
        )
        .await?
        {
            AssignDecision::Assigned {
                conversation: assigned,
                worker_id,
            } => {
                notify::notify_assignment(state, &worker_id, &assigned).await;
                latest = assigned;
            }
            AssignDecision::Skipped { reason } => {
                debug!(conversation_id = conversation.id.as_str(), reason, "auto-assign skipped");
            }
        }
    }

    if classified_is_rule_eligible(&message) {
        match crate::rules::evaluate(state, TriggerKind::MessageReceived, &message, &conversation)
            .await
        {
            Ok(results) => {
                // rule actions may have reassigned or stamped activity
                if !results.is_empty() {
                    if let Some(updated) = state.store.conversation(&conversation.id).await? {
                        latest = updated;
                    }
                }
            }
            Err(error) => warn!(%error, "rule evaluation failed"),
        }
    }

    realtime::emit_message_created(state, &message, &latest).await;

    Ok(IngestOutcome::Stored {
        message_id: message.id,
    })
}

fn classified_is_rule_eligible(message: &Message) -> bool {
    message.kind == MessageKind::Text && !message.content.trim().is_empty()
}

async fn ingest_status(
    state: &Arc<AppState>,
    update: StatusUpdate,
) -> Result<IngestOutcome, IngestError> {
    let Some(next) = MessageStatus::parse(&update.status) else {
        // Providers add status values over time; unknown ones are dropped
        // loudly rather than guessed at.
        warn!(
            external_id = update.external_id.as_str(),
            status = update.status.as_str(),
            "unrecognized delivery status dropped"
        );
        return Ok(IngestOutcome::StatusDropped {
            reason: "unrecognized_status",
        });
    };

    if next == MessageStatus::Failed {
        warn!(
            external_id = update.external_id.as_str(),
            errors = ?update.errors,
            "provider reported send failure"
        );
    }

    let at = wire_timestamp(update.timestamp.as_deref());
    match state
        .store
        .advance_message_status(&update.external_id, next, &at)
        .await?
    {
        StatusAdvance::Advanced(message) => {
            realtime::emit_message_status(state, &message).await;
            Ok(IngestOutcome::StatusApplied)
        }
        StatusAdvance::Rejected { current } => {
            warn!(
                external_id = update.external_id.as_str(),
                current = current.status.as_str(),
                next = next.as_str(),
                "out-of-order status update ignored"
            );
            Ok(IngestOutcome::StatusDropped {
                reason: "out_of_order",
            })
        }
        StatusAdvance::NotFound => {
            info!(
                external_id = update.external_id.as_str(),
                "status update for unknown message dropped"
            );
            Ok(IngestOutcome::StatusDropped {
                reason: "unknown_message",
            })
        }
    }
}
