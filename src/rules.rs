use std::sync::Arc;

use chrono::{Local, Timelike};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::gateway::SendGateway;
use crate::notify;
use crate::realtime;
use crate::store::{Store, StoreError};
use crate::types::{
    normalize_phone, now_iso, ActionResult, ActionStatus, AppState, Conversation, Direction,
    Message, MessageKind, MessageOrigin, MessageStatus, TriggerKind,
};

/// Runs every active rule for the trigger against the message, highest
/// priority first. Each action reports its own outcome; one failing action
/// never stops the rest.
pub async fn evaluate(
    state: &Arc<AppState>,
    trigger: TriggerKind,
    message: &Message,
    conversation: &Conversation,
) -> Result<Vec<ActionResult>, StoreError> {
    let rules = state.store.active_rules(trigger).await?;
    let hour = Local::now().hour();
    let mut results = Vec::new();

    for rule in rules {
        if !rule_matches(&rule.conditions, &message.content, &message.phone_number, hour) {
            continue;
        }
        debug!(rule_id = rule.id.as_str(), rule = rule.name.as_str(), "rule matched");

        let actions = rule.actions.as_array().cloned().unwrap_or_default();
        for action in actions {
            let kind = action
                .get("kind")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let result = match kind.as_str() {
                "assign_to_worker" => run_assign(state, &action, conversation).await,
                "send_reply" => run_send_reply(state, &action, message, conversation).await,
                other => ActionResult {
                    rule_id: rule.id.clone(),
                    kind: other.to_string(),
                    status: ActionStatus::Skipped,
                    detail: "unknown action kind".to_string(),
                },
            };
            results.push(ActionResult {
                rule_id: rule.id.clone(),
                ..result
            });
        }
    }
    Ok(results)
}

/// Empty conditions match everything. Present conditions must all hold:
/// keywords is an any-of substring match, phoneNumbers an allow-list,
/// hours an inclusive local-time window.
pub fn rule_matches(conditions: &Value, content: &str, phone_number: &str, hour: u32) -> bool {
    let Some(conditions) = conditions.as_object() else {
        return true;
    };

    if let Some(keywords) = conditions.get("keywords").and_then(Value::as_array) {
        if !keywords.is_empty() {
            let haystack = content.to_lowercase();
            let hit = keywords
                .iter()
                .filter_map(Value::as_str)
                .any(|k| !k.is_empty() && haystack.contains(&k.to_lowercase()));
            if !hit {
                return false;
            }
        }
    }

    if let Some(phones) = conditions.get("phoneNumbers").and_then(Value::as_array) {
        if !phones.is_empty() {
            let hit = phones
                .iter()
                .filter_map(Value::as_str)
                .filter_map(normalize_phone)
                .any(|p| p == phone_number);
            if !hit {
                return false;
            }
        }
    }

    if let Some(hours) = conditions.get("hours").and_then(Value::as_object) {
        let start = hours.get("start").and_then(Value::as_u64).unwrap_or(0) as u32;
        let end = hours.get("end").and_then(Value::as_u64).unwrap_or(23) as u32;
        let inside = if start <= end {
            hour >= start && hour <= end
        } else {
            // window wraps midnight
            hour >= start || hour <= end
        };
        if !inside {
            return false;
        }
    }

    true
}

async fn run_assign(
    state: &Arc<AppState>,
    action: &Value,
    conversation: &Conversation,
) -> ActionResult {
    let template = ActionResult {
        rule_id: String::new(),
        kind: "assign_to_worker".to_string(),
        status: ActionStatus::Failed,
        detail: String::new(),
    };

    let Some(worker_id) = action.get("workerId").and_then(Value::as_str) else {
        return ActionResult {
            status: ActionStatus::Skipped,
            detail: "missing workerId".to_string(),
            ..template
        };
    };

    match state.store.worker(worker_id).await {
        Ok(Some(worker)) if worker.active => {}
        Ok(_) => {
            return ActionResult {
                status: ActionStatus::Skipped,
                detail: format!("worker {worker_id} not active"),
                ..template
            };
        }
        Err(error) => {
            return ActionResult {
                detail: error.to_string(),
                ..template
            };
        }
    }

    match state
        .store
        .assign_owner(&conversation.id, worker_id, &now_iso())
        .await
    {
        Ok(Some(updated)) => {
            notify::notify_assignment(state, worker_id, &updated).await;
            realtime::emit_conversation_update(state, &updated).await;
            ActionResult {
                status: ActionStatus::Executed,
                detail: format!("assigned to {worker_id}"),
                ..template
            }
        }
        Ok(None) => ActionResult {
            status: ActionStatus::Skipped,
            detail: "conversation gone".to_string(),
            ..template
        },
        Err(error) => ActionResult {
            detail: error.to_string(),
            ..template
        },
    }
}

async fn run_send_reply(
    state: &Arc<AppState>,
    action: &Value,
    message: &Message,
    conversation: &Conversation,
) -> ActionResult {
    let template = ActionResult {
        rule_id: String::new(),
        kind: "send_reply".to_string(),
        status: ActionStatus::Failed,
        detail: String::new(),
    };

    let Some(text) = action.get("text").and_then(Value::as_str) else {
        return ActionResult {
            status: ActionStatus::Skipped,
            detail: "missing text".to_string(),
            ..template
        };
    };

    let external_id = match state.gateway.send_text(&message.phone_number, text).await {
        Ok(id) => id,
        Err(error) => {
            warn!(%error, "rule reply send failed");
            return ActionResult {
                detail: error.to_string(),
                ..template
            };
        }
    };

    let now = now_iso();
    let reply = Message {
        id: Uuid::new_v4().to_string(),
        external_id: Some(external_id),
        phone_number: message.phone_number.clone(),
        kind: MessageKind::Text,
        direction: Direction::Outgoing,
        content: text.to_string(),
        metadata: serde_json::json!({}),
        status: MessageStatus::Sent,
        origin: MessageOrigin::Rule,
        conversation_id: Some(conversation.id.clone()),
        worker_id: None,
        created_at: now.clone(),
        updated_at: now.clone(),
        delivered_at: None,
        read_at: None,
        deleted_at: None,
    };

    if let Err(error) = state.store.insert_message(&reply).await {
        return ActionResult {
            detail: error.to_string(),
            ..template
        };
    }
    let updated = state
        .store
        .record_activity(&conversation.id, &reply.id, &now)
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| conversation.clone());
    realtime::emit_message_created(state, &reply, &updated).await;

    ActionResult {
        status: ActionStatus::Executed,
        detail: "reply sent".to_string(),
        ..template
    }
}
