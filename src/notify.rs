use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::realtime;
use crate::store::Store;
use crate::types::{
    now_iso, AppState, Conversation, Message, Notification, NotificationKind, NotificationPriority,
    WorkerRole,
};

/// Persists a notification and pushes it to the recipient's live sockets.
/// Failures are logged and swallowed; notification delivery never blocks
/// the pipeline that produced it.
pub async fn create_notification(state: &Arc<AppState>, notification: Notification) {
    if let Err(error) = state.store.insert_notification(&notification).await {
        warn!(
            worker_id = notification.worker_id.as_str(),
            %error,
            "failed to persist notification"
        );
        return;
    }

    let unread = state
        .store
        .unread_notification_count(&notification.worker_id)
        .await
        .unwrap_or(0);
    let payload = realtime::event_payload(
        "notification:new",
        json!({ "notification": notification, "unreadCount": unread }),
    );
    realtime::emit_notification(state, &notification.worker_id, &payload).await;
}

fn base_notification(
    worker_id: &str,
    kind: NotificationKind,
    title: String,
    body: String,
    conversation_id: &str,
) -> Notification {
    Notification {
        id: Uuid::new_v4().to_string(),
        worker_id: worker_id.to_string(),
        kind,
        title,
        body,
        entity_id: Some(conversation_id.to_string()),
        entity_kind: Some("conversation".to_string()),
        read_at: None,
        priority: NotificationPriority::Normal,
        link: Some(format!("/conversations/{conversation_id}")),
        metadata: json!({}),
        expires_at: None,
        created_at: now_iso(),
    }
}

fn preview(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() <= 80 {
        trimmed.to_string()
    } else {
        let cut = trimmed.chars().take(77).collect::<String>();
        format!("{cut}...")
    }
}

/// Tells the conversation owner about a new inbound message. Unowned
/// conversations produce no notification; assignment covers those.
pub async fn notify_new_message(
    state: &Arc<AppState>,
    message: &Message,
    conversation: &Conversation,
) {
    let Some(owner_id) = &conversation.assigned_to else {
        return;
    };
    let mut notification = base_notification(
        owner_id,
        NotificationKind::Message,
        format!("New message from {}", conversation.phone_number),
        preview(&message.content),
        &conversation.id,
    );
    if conversation.unread_count > 5 {
        notification.priority = NotificationPriority::High;
    }
    notification.metadata = json!({ "messageId": message.id });
    create_notification(state, notification).await;
}

pub async fn notify_assignment(
    state: &Arc<AppState>,
    worker_id: &str,
    conversation: &Conversation,
) {
    let notification = base_notification(
        worker_id,
        NotificationKind::Assignment,
        "Conversation assigned to you".to_string(),
        format!("You are now handling {}", conversation.phone_number),
        &conversation.id,
    );
    create_notification(state, notification).await;
}

/// The new owner gets a normal-priority transfer notice; the previous
/// owner, when different, gets a low-priority one.
pub async fn notify_transfer(
    state: &Arc<AppState>,
    previous_worker_id: Option<&str>,
    new_worker_id: &str,
    conversation: &Conversation,
) {
    let notification = base_notification(
        new_worker_id,
        NotificationKind::Transfer,
        "Conversation transferred to you".to_string(),
        format!("You are now handling {}", conversation.phone_number),
        &conversation.id,
    );
    create_notification(state, notification).await;

    if let Some(previous) = previous_worker_id {
        if previous != new_worker_id {
            let mut notification = base_notification(
                previous,
                NotificationKind::Transfer,
                "Conversation transferred away".to_string(),
                format!("{} was handed to another worker", conversation.phone_number),
                &conversation.id,
            );
            notification.priority = NotificationPriority::Low;
            create_notification(state, notification).await;
        }
    }
}

pub fn overdue_priority(waited_minutes: i64, urgent_after: i64) -> NotificationPriority {
    if waited_minutes > urgent_after {
        NotificationPriority::Urgent
    } else {
        NotificationPriority::High
    }
}

/// Periodic sweep for owned conversations that have sat unanswered past
/// the warn threshold. Past the escalate threshold supervisors are copied.
pub async fn scan_overdue(state: &Arc<AppState>) {
    let cutoff = (Utc::now() - Duration::minutes(state.config.overdue_warn_minutes)).to_rfc3339();
    let overdue = match state.store.overdue_conversations(&cutoff).await {
        Ok(list) => list,
        Err(error) => {
            warn!(%error, "overdue scan failed");
            return;
        }
    };

    for conversation in overdue {
        let Some(owner_id) = conversation.assigned_to.clone() else {
            continue;
        };
        let waited_minutes = chrono::DateTime::parse_from_rfc3339(&conversation.last_activity_at)
            .map(|t| (Utc::now() - t.with_timezone(&Utc)).num_minutes())
            .unwrap_or(0);

        let mut notification = base_notification(
            &owner_id,
            NotificationKind::Alert,
            "Conversation waiting for a reply".to_string(),
            format!(
                "{} has waited {} minutes with {} unread",
                conversation.phone_number, waited_minutes, conversation.unread_count
            ),
            &conversation.id,
        );
        notification.priority =
            overdue_priority(waited_minutes, state.config.overdue_urgent_minutes);
        create_notification(state, notification).await;

        if waited_minutes > state.config.overdue_escalate_minutes {
            let supervisors = match state.store.active_workers(WorkerRole::Supervisor).await {
                Ok(list) => list,
                Err(error) => {
                    warn!(%error, "supervisor lookup failed during overdue scan");
                    continue;
                }
            };
            for supervisor in supervisors {
                let mut notification = base_notification(
                    &supervisor.id,
                    NotificationKind::Alert,
                    "Overdue conversation needs attention".to_string(),
                    format!(
                        "{} owned by {} has waited {} minutes",
                        conversation.phone_number, owner_id, waited_minutes
                    ),
                    &conversation.id,
                );
                notification.priority = NotificationPriority::Urgent;
                create_notification(state, notification).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::gateway::MockGateway;
    use crate::store::MemStore;
    use crate::types::{ConversationStatus, Worker};

    fn state_with_store(store: Arc<MemStore>) -> Arc<AppState> {
        Arc::new(AppState::new(
            store,
            Arc::new(MockGateway::new()),
            AppConfig::default(),
        ))
    }

    fn conversation(owner: Option<&str>, unread: i64) -> Conversation {
        Conversation {
            id: "c1".to_string(),
            phone_number: "9665550001".to_string(),
            status: ConversationStatus::Assigned,
            assigned_to: owner.map(|o| o.to_string()),
            assigned_at: None,
            priority: 0,
            last_activity_at: now_iso(),
            last_message_id: None,
            unread_count: unread,
            archived: false,
            closed_at: None,
            metadata: json!({}),
            created_at: now_iso(),
            updated_at: now_iso(),
            deleted_at: None,
        }
    }

    fn message() -> Message {
        Message {
            id: "m1".to_string(),
            external_id: Some("wamid.1".to_string()),
            phone_number: "9665550001".to_string(),
            kind: crate::types::MessageKind::Text,
            direction: crate::types::Direction::Incoming,
            content: "hello".to_string(),
            metadata: json!({}),
            status: crate::types::MessageStatus::Delivered,
            origin: crate::types::MessageOrigin::Webhook,
            conversation_id: Some("c1".to_string()),
            worker_id: None,
            created_at: now_iso(),
            updated_at: now_iso(),
            delivered_at: Some(now_iso()),
            read_at: None,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn new_message_priority_escalates_with_unread() {
        let store = Arc::new(MemStore::new());
        let state = state_with_store(store.clone());

        notify_new_message(&state, &message(), &conversation(Some("w1"), 2)).await;
        notify_new_message(&state, &message(), &conversation(Some("w1"), 6)).await;

        let list = store.notifications_for_worker("w1").await.unwrap();
        assert_eq!(list.len(), 2);
        let priorities: Vec<NotificationPriority> = list.iter().map(|n| n.priority).collect();
        assert!(priorities.contains(&NotificationPriority::Normal));
        assert!(priorities.contains(&NotificationPriority::High));
    }

    #[tokio::test]
    async fn unowned_conversation_gets_no_message_notification() {
        let store = Arc::new(MemStore::new());
        let state = state_with_store(store.clone());
        notify_new_message(&state, &message(), &conversation(None, 0)).await;
        assert_eq!(store.notifications_for_worker("w1").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn transfer_notifies_both_sides_asymmetrically() {
        let store = Arc::new(MemStore::new());
        let state = state_with_store(store.clone());

        notify_transfer(&state, Some("w1"), "w2", &conversation(Some("w2"), 0)).await;

        let to_new = store.notifications_for_worker("w2").await.unwrap();
        assert_eq!(to_new.len(), 1);
        assert_eq!(to_new[0].priority, NotificationPriority::Normal);

        let to_previous = store.notifications_for_worker("w1").await.unwrap();
        assert_eq!(to_previous.len(), 1);
        assert_eq!(to_previous[0].priority, NotificationPriority::Low);
    }

    #[tokio::test]
    async fn transfer_to_same_owner_notifies_once() {
        let store = Arc::new(MemStore::new());
        let state = state_with_store(store.clone());
        notify_transfer(&state, Some("w2"), "w2", &conversation(Some("w2"), 0)).await;
        assert_eq!(store.notifications_for_worker("w2").await.unwrap().len(), 1);
    }

    #[test]
    fn overdue_priority_thresholds() {
        assert_eq!(overdue_priority(45, 120), NotificationPriority::High);
        assert_eq!(overdue_priority(121, 120), NotificationPriority::Urgent);
    }

    #[tokio::test]
    async fn escalated_overdue_copies_supervisors() {
        let store = Arc::new(MemStore::new());
        store
            .seed_worker(Worker {
                id: "sup1".to_string(),
                name: "supervisor".to_string(),
                role: WorkerRole::Supervisor,
                active: true,
                created_at: now_iso(),
            })
            .await;
        let state = state_with_store(store.clone());

        let conversation = store.find_or_create_conversation("9665550001").await.unwrap();
        store.assign_owner(&conversation.id, "w1", &now_iso()).await.unwrap();
        store.increment_unread(&conversation.id).await.unwrap();
        let stale = (Utc::now() - Duration::minutes(300)).to_rfc3339();
        store.record_activity(&conversation.id, "m1", &stale).await.unwrap();

        scan_overdue(&state).await;

        let to_owner = store.notifications_for_worker("w1").await.unwrap();
        assert_eq!(to_owner.len(), 1);
        assert_eq!(to_owner[0].priority, NotificationPriority::Urgent);

        let to_supervisor = store.notifications_for_worker("sup1").await.unwrap();
        assert_eq!(to_supervisor.len(), 1);
        assert_eq!(to_supervisor[0].priority, NotificationPriority::Urgent);
    }
}
