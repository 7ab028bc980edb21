use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::types::{
    now_iso, AutomationRule, Conversation, ConversationStatus, Direction, Message, MessageKind,
    MessageOrigin, MessageStatus, Notification, NotificationKind, NotificationPriority,
    TriggerKind, Worker, WorkerRole, Workload,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Outcome of a conditional status advance.
#[derive(Debug, Clone)]
pub enum StatusAdvance {
    Advanced(Message),
    /// The transition would move status backward or out of a terminal
    /// state; the stored row is returned untouched.
    Rejected { current: Message },
    NotFound,
}

/// Durable state behind the pipeline. Every mutation on this trait is a
/// single atomic operation against the backing store; callers never
/// read-modify-write across two calls.
#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts a message. Returns false when a non-deleted message with the
    /// same external id already exists (duplicate delivery).
    async fn insert_message(&self, message: &Message) -> Result<bool, StoreError>;
    async fn message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Message>, StoreError>;
    async fn messages_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, StoreError>;
    /// Advances a message's delivery status monotonically, stamping
    /// delivered_at/read_at with `at` the first time each is reached.
    async fn advance_message_status(
        &self,
        external_id: &str,
        next: MessageStatus,
        at: &str,
    ) -> Result<StatusAdvance, StoreError>;

    async fn find_or_create_conversation(
        &self,
        phone_number: &str,
    ) -> Result<Conversation, StoreError>;
    async fn conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError>;
    async fn conversations(&self) -> Result<Vec<Conversation>, StoreError>;
    /// Stamps last activity and last message, reopening a closed
    /// conversation in the same statement.
    async fn record_activity(
        &self,
        id: &str,
        last_message_id: &str,
        activity_at: &str,
    ) -> Result<Option<Conversation>, StoreError>;
    async fn increment_unread(&self, id: &str) -> Result<Option<Conversation>, StoreError>;
    async fn reset_unread(&self, id: &str) -> Result<Option<Conversation>, StoreError>;
    async fn assign_owner(
        &self,
        id: &str,
        worker_id: &str,
        at: &str,
    ) -> Result<Option<Conversation>, StoreError>;
    async fn close_conversation(
        &self,
        id: &str,
        at: &str,
    ) -> Result<Option<Conversation>, StoreError>;
    async fn soft_delete_conversation(
        &self,
        id: &str,
        at: &str,
    ) -> Result<Option<Conversation>, StoreError>;
    /// Owned conversations with pending unread activity older than `cutoff`.
    async fn overdue_conversations(&self, cutoff: &str) -> Result<Vec<Conversation>, StoreError>;

    async fn worker(&self, id: &str) -> Result<Option<Worker>, StoreError>;
    async fn worker_by_token(&self, token: &str) -> Result<Option<Worker>, StoreError>;
    /// Active workers of one role, in stable (created_at, id) order.
    async fn active_workers(&self, role: WorkerRole) -> Result<Vec<Worker>, StoreError>;
    async fn workload_index(&self) -> Result<HashMap<String, Workload>, StoreError>;

    async fn active_rules(&self, trigger: TriggerKind) -> Result<Vec<AutomationRule>, StoreError>;

    async fn insert_notification(&self, notification: &Notification) -> Result<(), StoreError>;
    async fn notifications_for_worker(
        &self,
        worker_id: &str,
    ) -> Result<Vec<Notification>, StoreError>;
    async fn unread_notification_count(&self, worker_id: &str) -> Result<i64, StoreError>;
    async fn mark_notification_read(
        &self,
        id: &str,
        worker_id: &str,
        at: &str,
    ) -> Result<bool, StoreError>;
    async fn mark_all_notifications_read(
        &self,
        worker_id: &str,
        at: &str,
    ) -> Result<u64, StoreError>;
    async fn delete_notification(&self, id: &str, worker_id: &str) -> Result<bool, StoreError>;
}

const MESSAGE_COLUMNS: &str = "id, external_id, phone_number, kind, direction, content, metadata, \
     status, origin, conversation_id, worker_id, created_at, updated_at, delivered_at, read_at, \
     deleted_at";

const CONVERSATION_COLUMNS: &str = "id, phone_number, status, assigned_to, assigned_at, priority, \
     last_activity_at, last_message_id, unread_count, archived, closed_at, metadata, created_at, \
     updated_at, deleted_at";

const NOTIFICATION_COLUMNS: &str = "id, worker_id, kind, title, body, entity_id, entity_kind, \
     read_at, priority, link, metadata, expires_at, created_at";

fn message_from_row(row: &PgRow) -> Message {
    let kind: String = row.get("kind");
    let direction: String = row.get("direction");
    let status: String = row.get("status");
    let origin: String = row.get("origin");
    Message {
        id: row.get("id"),
        external_id: row.get("external_id"),
        phone_number: row.get("phone_number"),
        kind: MessageKind::parse(&kind).unwrap_or(MessageKind::Text),
        direction: Direction::parse(&direction).unwrap_or(Direction::Incoming),
        content: row.get("content"),
        metadata: row.get("metadata"),
        status: MessageStatus::parse(&status).unwrap_or(MessageStatus::Sent),
        origin: MessageOrigin::parse(&origin).unwrap_or(MessageOrigin::Webhook),
        conversation_id: row.get("conversation_id"),
        worker_id: row.get("worker_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        delivered_at: row.get("delivered_at"),
        read_at: row.get("read_at"),
        deleted_at: row.get("deleted_at"),
    }
}

fn conversation_from_row(row: &PgRow) -> Conversation {
    let status: String = row.get("status");
    Conversation {
        id: row.get("id"),
        phone_number: row.get("phone_number"),
        status: ConversationStatus::parse(&status).unwrap_or(ConversationStatus::Open),
        assigned_to: row.get("assigned_to"),
        assigned_at: row.get("assigned_at"),
        priority: row.get("priority"),
        last_activity_at: row.get("last_activity_at"),
        last_message_id: row.get("last_message_id"),
        unread_count: row.get("unread_count"),
        archived: row.get("archived"),
        closed_at: row.get("closed_at"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    }
}

fn worker_from_row(row: &PgRow) -> Worker {
    let role: String = row.get("role");
    Worker {
        id: row.get("id"),
        name: row.get("name"),
        role: WorkerRole::parse(&role).unwrap_or(WorkerRole::User),
        active: row.get("active"),
        created_at: row.get("created_at"),
    }
}

fn notification_from_row(row: &PgRow) -> Notification {
    let kind: String = row.get("kind");
    let priority: String = row.get("priority");
    Notification {
        id: row.get("id"),
        worker_id: row.get("worker_id"),
        kind: NotificationKind::parse(&kind).unwrap_or(NotificationKind::System),
        title: row.get("title"),
        body: row.get("body"),
        entity_id: row.get("entity_id"),
        entity_kind: row.get("entity_kind"),
        read_at: row.get("read_at"),
        priority: NotificationPriority::parse(&priority).unwrap_or(NotificationPriority::Normal),
        link: row.get("link"),
        metadata: row.get("metadata"),
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
    }
}

fn rule_from_row(row: &PgRow) -> AutomationRule {
    AutomationRule {
        id: row.get("id"),
        name: row.get("name"),
        trigger_kind: TriggerKind::MessageReceived,
        conditions: row.get("conditions"),
        actions: row.get("actions"),
        active: row.get("active"),
        priority: row.get("priority"),
        created_at: row.get("created_at"),
    }
}

pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let db = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&db).await?;
        Ok(Self { db })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_message(&self, message: &Message) -> Result<bool, StoreError> {
        // The partial unique index on external_id turns a duplicate delivery
        // into zero affected rows instead of an error.
        let result = sqlx::query(
            "INSERT INTO messages \
             (id, external_id, phone_number, kind, direction, content, metadata, status, origin, \
              conversation_id, worker_id, created_at, updated_at, delivered_at, read_at, deleted_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16) \
             ON CONFLICT DO NOTHING",
        )
        .bind(&message.id)
        .bind(&message.external_id)
        .bind(&message.phone_number)
        .bind(message.kind.as_str())
        .bind(message.direction.as_str())
        .bind(&message.content)
        .bind(&message.metadata)
        .bind(message.status.as_str())
        .bind(message.origin.as_str())
        .bind(&message.conversation_id)
        .bind(&message.worker_id)
        .bind(&message.created_at)
        .bind(&message.updated_at)
        .bind(&message.delivered_at)
        .bind(&message.read_at)
        .bind(&message.deleted_at)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE external_id = $1 AND deleted_at IS NULL LIMIT 1"
        ))
        .bind(external_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| message_from_row(&r)))
    }

    async fn messages_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE conversation_id = $1 AND deleted_at IS NULL ORDER BY created_at ASC"
        ))
        .bind(conversation_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    async fn advance_message_status(
        &self,
        external_id: &str,
        next: MessageStatus,
        at: &str,
    ) -> Result<StatusAdvance, StoreError> {
        // One conditional statement; the rank CASE mirrors
        // MessageStatus::can_advance_to.
        let row = sqlx::query(&format!(
            "UPDATE messages SET \
               status = $2, \
               updated_at = $3, \
               delivered_at = CASE WHEN $2 = 'delivered' \
                   THEN COALESCE(delivered_at, $4) ELSE delivered_at END, \
               read_at = CASE WHEN $2 = 'read' \
                   THEN COALESCE(read_at, $4) ELSE read_at END \
             WHERE external_id = $1 AND deleted_at IS NULL \
               AND status <> 'failed' \
               AND NOT (status = 'read' AND $2 = 'failed') \
               AND (CASE status WHEN 'sent' THEN 0 WHEN 'delivered' THEN 1 \
                    WHEN 'read' THEN 2 ELSE 3 END) \
                 < (CASE $2 WHEN 'sent' THEN 0 WHEN 'delivered' THEN 1 \
                    WHEN 'read' THEN 2 ELSE 3 END) \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(external_id)
        .bind(next.as_str())
        .bind(now_iso())
        .bind(at)
        .fetch_optional(&self.db)
        .await?;

        if let Some(row) = row {
            return Ok(StatusAdvance::Advanced(message_from_row(&row)));
        }
        match self.message_by_external_id(external_id).await? {
            Some(current) => Ok(StatusAdvance::Rejected { current }),
            None => Ok(StatusAdvance::NotFound),
        }
    }

    async fn find_or_create_conversation(
        &self,
        phone_number: &str,
    ) -> Result<Conversation, StoreError> {
        if let Some(row) = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE phone_number = $1 AND deleted_at IS NULL LIMIT 1"
        ))
        .bind(phone_number)
        .fetch_optional(&self.db)
        .await?
        {
            return Ok(conversation_from_row(&row));
        }

        let now = now_iso();
        let inserted = sqlx::query(&format!(
            "INSERT INTO conversations \
             (id, phone_number, status, assigned_to, assigned_at, priority, last_activity_at, \
              last_message_id, unread_count, archived, closed_at, metadata, created_at, \
              updated_at, deleted_at) \
             VALUES ($1,$2,'open',NULL,NULL,0,$3,NULL,0,FALSE,NULL,'{{}}'::jsonb,$3,$3,NULL) \
             ON CONFLICT DO NOTHING \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(phone_number)
        .bind(&now)
        .fetch_optional(&self.db)
        .await?;
        if let Some(row) = inserted {
            return Ok(conversation_from_row(&row));
        }

        // Lost the creation race; the winner's row is there now.
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE phone_number = $1 AND deleted_at IS NULL LIMIT 1"
        ))
        .bind(phone_number)
        .fetch_one(&self.db)
        .await?;
        Ok(conversation_from_row(&row))
    }

    async fn conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE id = $1 AND deleted_at IS NULL LIMIT 1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| conversation_from_row(&r)))
    }

    async fn conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE deleted_at IS NULL ORDER BY last_activity_at DESC"
        ))
        .fetch_all(&self.db)
        .await?;
        Ok(rows.iter().map(conversation_from_row).collect())
    }

    async fn record_activity(
        &self,
        id: &str,
        last_message_id: &str,
        activity_at: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE conversations SET \
               closed_at = CASE WHEN status = 'closed' THEN NULL ELSE closed_at END, \
               status = CASE WHEN status = 'closed' THEN 'open' ELSE status END, \
               last_activity_at = $2, \
               last_message_id = $3, \
               updated_at = $4 \
             WHERE id = $1 AND deleted_at IS NULL \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(id)
        .bind(activity_at)
        .bind(last_message_id)
        .bind(now_iso())
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| conversation_from_row(&r)))
    }

    async fn increment_unread(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE conversations SET unread_count = unread_count + 1, updated_at = $2 \
             WHERE id = $1 AND deleted_at IS NULL \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(id)
        .bind(now_iso())
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| conversation_from_row(&r)))
    }

    async fn reset_unread(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE conversations SET unread_count = 0, updated_at = $2 \
             WHERE id = $1 AND deleted_at IS NULL \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(id)
        .bind(now_iso())
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| conversation_from_row(&r)))
    }

    async fn assign_owner(
        &self,
        id: &str,
        worker_id: &str,
        at: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE conversations SET \
               assigned_to = $2, status = 'assigned', assigned_at = $3, updated_at = $3 \
             WHERE id = $1 AND deleted_at IS NULL \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(id)
        .bind(worker_id)
        .bind(at)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| conversation_from_row(&r)))
    }

    async fn close_conversation(
        &self,
        id: &str,
        at: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE conversations SET status = 'closed', closed_at = $2, updated_at = $2 \
             WHERE id = $1 AND deleted_at IS NULL \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(id)
        .bind(at)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| conversation_from_row(&r)))
    }

    async fn soft_delete_conversation(
        &self,
        id: &str,
        at: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE conversations SET \
               deleted_at = $2, status = 'closed', closed_at = COALESCE(closed_at, $2), \
               updated_at = $2 \
             WHERE id = $1 AND deleted_at IS NULL \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(id)
        .bind(at)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| conversation_from_row(&r)))
    }

    async fn overdue_conversations(&self, cutoff: &str) -> Result<Vec<Conversation>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE deleted_at IS NULL \
               AND assigned_to IS NOT NULL \
               AND unread_count > 0 \
               AND status IN ('open','assigned','pending') \
               AND last_activity_at < $1 \
             ORDER BY last_activity_at ASC"
        ))
        .bind(cutoff)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.iter().map(conversation_from_row).collect())
    }

    async fn worker(&self, id: &str) -> Result<Option<Worker>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, role, active, created_at FROM workers WHERE id = $1 LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| worker_from_row(&r)))
    }

    async fn worker_by_token(&self, token: &str) -> Result<Option<Worker>, StoreError> {
        let row = sqlx::query(
            "SELECT w.id, w.name, w.role, w.active, w.created_at \
             FROM auth_tokens t JOIN workers w ON w.id = t.worker_id \
             WHERE t.token = $1 LIMIT 1",
        )
        .bind(token)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| worker_from_row(&r)))
    }

    async fn active_workers(&self, role: WorkerRole) -> Result<Vec<Worker>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, role, active, created_at FROM workers \
             WHERE active = TRUE AND role = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(role.as_str())
        .fetch_all(&self.db)
        .await?;
        Ok(rows.iter().map(worker_from_row).collect())
    }

    async fn workload_index(&self) -> Result<HashMap<String, Workload>, StoreError> {
        let rows = sqlx::query(
            "SELECT assigned_to, COUNT(1) AS active_conversations, \
                    COALESCE(SUM(unread_count), 0) AS unread_total \
             FROM conversations \
             WHERE deleted_at IS NULL AND assigned_to IS NOT NULL \
               AND status IN ('open','assigned','pending') \
             GROUP BY assigned_to",
        )
        .fetch_all(&self.db)
        .await?;
        let mut index = HashMap::new();
        for row in rows {
            let worker_id: String = row.get("assigned_to");
            index.insert(
                worker_id,
                Workload {
                    active_conversations: row.get("active_conversations"),
                    unread_total: row.get("unread_total"),
                },
            );
        }
        Ok(index)
    }

    async fn active_rules(&self, trigger: TriggerKind) -> Result<Vec<AutomationRule>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, trigger_kind, conditions, actions, active, priority, created_at \
             FROM automation_rules \
             WHERE active = TRUE AND trigger_kind = $1 \
             ORDER BY priority DESC, created_at DESC",
        )
        .bind(trigger.as_str())
        .fetch_all(&self.db)
        .await?;
        Ok(rows.iter().map(rule_from_row).collect())
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO notifications \
             (id, worker_id, kind, title, body, entity_id, entity_kind, read_at, priority, link, \
              metadata, expires_at, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)",
        )
        .bind(&notification.id)
        .bind(&notification.worker_id)
        .bind(notification.kind.as_str())
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(&notification.entity_id)
        .bind(&notification.entity_kind)
        .bind(&notification.read_at)
        .bind(notification.priority.as_str())
        .bind(&notification.link)
        .bind(&notification.metadata)
        .bind(&notification.expires_at)
        .bind(&notification.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn notifications_for_worker(
        &self,
        worker_id: &str,
    ) -> Result<Vec<Notification>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
             WHERE worker_id = $1 ORDER BY created_at DESC"
        ))
        .bind(worker_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.iter().map(notification_from_row).collect())
    }

    async fn unread_notification_count(&self, worker_id: &str) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(1) FROM notifications WHERE worker_id = $1 AND read_at IS NULL",
        )
        .bind(worker_id)
        .fetch_one(&self.db)
        .await?;
        Ok(count)
    }

    async fn mark_notification_read(
        &self,
        id: &str,
        worker_id: &str,
        at: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE notifications SET read_at = $3 \
             WHERE id = $1 AND worker_id = $2 AND read_at IS NULL",
        )
        .bind(id)
        .bind(worker_id)
        .bind(at)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_all_notifications_read(
        &self,
        worker_id: &str,
        at: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE notifications SET read_at = $2 WHERE worker_id = $1 AND read_at IS NULL",
        )
        .bind(worker_id)
        .bind(at)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_notification(&self, id: &str, worker_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = $1 AND worker_id = $2")
            .bind(id)
            .bind(worker_id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// In-memory store. One mutex over the whole state keeps every trait call
/// as atomic as the single-statement Postgres counterparts.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

#[derive(Default)]
struct MemInner {
    messages: HashMap<String, Message>,
    external_ids: HashMap<String, String>,
    conversations: HashMap<String, Conversation>,
    workers: Vec<Worker>,
    tokens: HashMap<String, String>,
    rules: Vec<AutomationRule>,
    notifications: HashMap<String, Notification>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_worker(&self, worker: Worker) {
        let mut inner = self.inner.lock().await;
        inner.workers.push(worker);
        inner
            .workers
            .sort_by(|a, b| (a.created_at.as_str(), a.id.as_str())
                .cmp(&(b.created_at.as_str(), b.id.as_str())));
    }

    pub async fn seed_token(&self, token: &str, worker_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.tokens.insert(token.to_string(), worker_id.to_string());
    }

    pub async fn seed_rule(&self, rule: AutomationRule) {
        let mut inner = self.inner.lock().await;
        inner.rules.push(rule);
    }
}

#[async_trait]
impl Store for MemStore {
    async fn insert_message(&self, message: &Message) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(external_id) = &message.external_id {
            if inner.external_ids.contains_key(external_id) {
                return Ok(false);
            }
            inner
                .external_ids
                .insert(external_id.clone(), message.id.clone());
        }
        inner.messages.insert(message.id.clone(), message.clone());
        Ok(true)
    }

    async fn message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .external_ids
            .get(external_id)
            .and_then(|id| inner.messages.get(id))
            .filter(|m| m.deleted_at.is_none())
            .cloned())
    }

    async fn messages_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock().await;
        let mut list = inner
            .messages
            .values()
            .filter(|m| {
                m.deleted_at.is_none() && m.conversation_id.as_deref() == Some(conversation_id)
            })
            .cloned()
            .collect::<Vec<_>>();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn advance_message_status(
        &self,
        external_id: &str,
        next: MessageStatus,
        at: &str,
    ) -> Result<StatusAdvance, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(message_id) = inner.external_ids.get(external_id).cloned() else {
            return Ok(StatusAdvance::NotFound);
        };
        let Some(message) = inner.messages.get_mut(&message_id) else {
            return Ok(StatusAdvance::NotFound);
        };
        if message.deleted_at.is_some() {
            return Ok(StatusAdvance::NotFound);
        }
        if !message.status.can_advance_to(next) {
            return Ok(StatusAdvance::Rejected {
                current: message.clone(),
            });
        }
        message.status = next;
        message.updated_at = now_iso();
        match next {
            MessageStatus::Delivered => {
                message.delivered_at.get_or_insert_with(|| at.to_string());
            }
            MessageStatus::Read => {
                message.read_at.get_or_insert_with(|| at.to_string());
            }
            _ => {}
        }
        Ok(StatusAdvance::Advanced(message.clone()))
    }

    async fn find_or_create_conversation(
        &self,
        phone_number: &str,
    ) -> Result<Conversation, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .conversations
            .values()
            .find(|c| c.deleted_at.is_none() && c.phone_number == phone_number)
        {
            return Ok(existing.clone());
        }
        let now = now_iso();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            phone_number: phone_number.to_string(),
            status: ConversationStatus::Open,
            assigned_to: None,
            assigned_at: None,
            priority: 0,
            last_activity_at: now.clone(),
            last_message_id: None,
            unread_count: 0,
            archived: false,
            closed_at: None,
            metadata: serde_json::json!({}),
            created_at: now.clone(),
            updated_at: now,
            deleted_at: None,
        };
        inner
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .conversations
            .get(id)
            .filter(|c| c.deleted_at.is_none())
            .cloned())
    }

    async fn conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let inner = self.inner.lock().await;
        let mut list = inner
            .conversations
            .values()
            .filter(|c| c.deleted_at.is_none())
            .cloned()
            .collect::<Vec<_>>();
        list.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(list)
    }

    async fn record_activity(
        &self,
        id: &str,
        last_message_id: &str,
        activity_at: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(conversation) = inner
            .conversations
            .get_mut(id)
            .filter(|c| c.deleted_at.is_none())
        else {
            return Ok(None);
        };
        if conversation.status == ConversationStatus::Closed {
            conversation.status = ConversationStatus::Open;
            conversation.closed_at = None;
        }
        conversation.last_activity_at = activity_at.to_string();
        conversation.last_message_id = Some(last_message_id.to_string());
        conversation.updated_at = now_iso();
        Ok(Some(conversation.clone()))
    }

    async fn increment_unread(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(conversation) = inner
            .conversations
            .get_mut(id)
            .filter(|c| c.deleted_at.is_none())
        else {
            return Ok(None);
        };
        conversation.unread_count += 1;
        conversation.updated_at = now_iso();
        Ok(Some(conversation.clone()))
    }

    async fn reset_unread(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(conversation) = inner
            .conversations
            .get_mut(id)
            .filter(|c| c.deleted_at.is_none())
        else {
            return Ok(None);
        };
        conversation.unread_count = 0;
        conversation.updated_at = now_iso();
        Ok(Some(conversation.clone()))
    }

    async fn assign_owner(
        &self,
        id: &str,
        worker_id: &str,
        at: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(conversation) = inner
            .conversations
            .get_mut(id)
            .filter(|c| c.deleted_at.is_none())
        else {
            return Ok(None);
        };
        conversation.assigned_to = Some(worker_id.to_string());
        conversation.assigned_at = Some(at.to_string());
        conversation.status = ConversationStatus::Assigned;
        conversation.updated_at = at.to_string();
        Ok(Some(conversation.clone()))
    }

    async fn close_conversation(
        &self,
        id: &str,
        at: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(conversation) = inner
            .conversations
            .get_mut(id)
            .filter(|c| c.deleted_at.is_none())
        else {
            return Ok(None);
        };
        conversation.status = ConversationStatus::Closed;
        conversation.closed_at = Some(at.to_string());
        conversation.updated_at = at.to_string();
        Ok(Some(conversation.clone()))
    }

    async fn soft_delete_conversation(
        &self,
        id: &str,
        at: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(conversation) = inner
            .conversations
            .get_mut(id)
            .filter(|c| c.deleted_at.is_none())
        else {
            return Ok(None);
        };
        conversation.deleted_at = Some(at.to_string());
        conversation.status = ConversationStatus::Closed;
        if conversation.closed_at.is_none() {
            conversation.closed_at = Some(at.to_string());
        }
        conversation.updated_at = at.to_string();
        Ok(Some(conversation.clone()))
    }

    async fn overdue_conversations(&self, cutoff: &str) -> Result<Vec<Conversation>, StoreError> {
        let inner = self.inner.lock().await;
        let mut list = inner
            .conversations
            .values()
            .filter(|c| {
                c.deleted_at.is_none()
                    && c.assigned_to.is_some()
                    && c.unread_count > 0
                    && c.status.is_active()
                    && c.last_activity_at.as_str() < cutoff
            })
            .cloned()
            .collect::<Vec<_>>();
        list.sort_by(|a, b| a.last_activity_at.cmp(&b.last_activity_at));
        Ok(list)
    }

    async fn worker(&self, id: &str) -> Result<Option<Worker>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.workers.iter().find(|w| w.id == id).cloned())
    }

    async fn worker_by_token(&self, token: &str) -> Result<Option<Worker>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tokens
            .get(token)
            .and_then(|id| inner.workers.iter().find(|w| &w.id == id))
            .cloned())
    }

    async fn active_workers(&self, role: WorkerRole) -> Result<Vec<Worker>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .workers
            .iter()
            .filter(|w| w.active && w.role == role)
            .cloned()
            .collect())
    }

    async fn workload_index(&self) -> Result<HashMap<String, Workload>, StoreError> {
        let inner = self.inner.lock().await;
        let mut index: HashMap<String, Workload> = HashMap::new();
        for conversation in inner.conversations.values() {
            if conversation.deleted_at.is_some() || !conversation.status.is_active() {
                continue;
            }
            let Some(worker_id) = &conversation.assigned_to else {
                continue;
            };
            let entry = index.entry(worker_id.clone()).or_default();
            entry.active_conversations += 1;
            entry.unread_total += conversation.unread_count;
        }
        Ok(index)
    }

    async fn active_rules(&self, trigger: TriggerKind) -> Result<Vec<AutomationRule>, StoreError> {
        let inner = self.inner.lock().await;
        let mut list = inner
            .rules
            .iter()
            .filter(|r| r.active && r.trigger_kind == trigger)
            .cloned()
            .collect::<Vec<_>>();
        list.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.created_at.cmp(&a.created_at))
        });
        Ok(list)
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .notifications
            .insert(notification.id.clone(), notification.clone());
        Ok(())
    }

    async fn notifications_for_worker(
        &self,
        worker_id: &str,
    ) -> Result<Vec<Notification>, StoreError> {
        let inner = self.inner.lock().await;
        let mut list = inner
            .notifications
            .values()
            .filter(|n| n.worker_id == worker_id)
            .cloned()
            .collect::<Vec<_>>();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn unread_notification_count(&self, worker_id: &str) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .notifications
            .values()
            .filter(|n| n.worker_id == worker_id && n.read_at.is_none())
            .count() as i64)
    }

    async fn mark_notification_read(
        &self,
        id: &str,
        worker_id: &str,
        at: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(notification) = inner
            .notifications
            .get_mut(id)
            .filter(|n| n.worker_id == worker_id && n.read_at.is_none())
        else {
            return Ok(false);
        };
        notification.read_at = Some(at.to_string());
        Ok(true)
    }

    async fn mark_all_notifications_read(
        &self,
        worker_id: &str,
        at: &str,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut updated = 0;
        for notification in inner.notifications.values_mut() {
            if notification.worker_id == worker_id && notification.read_at.is_none() {
                notification.read_at = Some(at.to_string());
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn delete_notification(&self, id: &str, worker_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let matches = inner
            .notifications
            .get(id)
            .map(|n| n.worker_id == worker_id)
            .unwrap_or(false);
        if !matches {
            return Ok(false);
        }
        inner.notifications.remove(id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn incoming(external_id: &str, phone: &str) -> Message {
        let now = now_iso();
        Message {
            id: Uuid::new_v4().to_string(),
            external_id: Some(external_id.to_string()),
            phone_number: phone.to_string(),
            kind: MessageKind::Text,
            direction: Direction::Incoming,
            content: "hello".to_string(),
            metadata: serde_json::json!({}),
            status: MessageStatus::Delivered,
            origin: MessageOrigin::Webhook,
            conversation_id: None,
            worker_id: None,
            created_at: now.clone(),
            updated_at: now.clone(),
            delivered_at: Some(now),
            read_at: None,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn duplicate_external_id_is_rejected() {
        let store = MemStore::new();
        assert!(store.insert_message(&incoming("wamid.1", "1")).await.unwrap());
        assert!(!store.insert_message(&incoming("wamid.1", "1")).await.unwrap());
    }

    #[tokio::test]
    async fn status_advance_is_monotonic() {
        let store = MemStore::new();
        let mut message = incoming("wamid.2", "1");
        message.status = MessageStatus::Sent;
        message.delivered_at = None;
        store.insert_message(&message).await.unwrap();

        // read straight from sent: allowed, delivered_at not required
        let advance = store
            .advance_message_status("wamid.2", MessageStatus::Read, "T")
            .await
            .unwrap();
        assert!(matches!(&advance, StatusAdvance::Advanced(m)
            if m.status == MessageStatus::Read && m.read_at.as_deref() == Some("T")
               && m.delivered_at.is_none()));

        // backward move is rejected
        let advance = store
            .advance_message_status("wamid.2", MessageStatus::Delivered, "T2")
            .await
            .unwrap();
        assert!(matches!(advance, StatusAdvance::Rejected { .. }));

        // read is terminal even for failed
        let advance = store
            .advance_message_status("wamid.2", MessageStatus::Failed, "T3")
            .await
            .unwrap();
        assert!(matches!(advance, StatusAdvance::Rejected { .. }));
    }

    #[tokio::test]
    async fn unknown_message_status_update_is_not_found() {
        let store = MemStore::new();
        let advance = store
            .advance_message_status("wamid.missing", MessageStatus::Read, "T")
            .await
            .unwrap();
        assert!(matches!(advance, StatusAdvance::NotFound));
    }

    #[tokio::test]
    async fn find_or_create_reuses_active_conversation() {
        let store = MemStore::new();
        let first = store.find_or_create_conversation("9665550001").await.unwrap();
        let second = store.find_or_create_conversation("9665550001").await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn record_activity_reopens_closed_conversation() {
        let store = MemStore::new();
        let conversation = store.find_or_create_conversation("9665550001").await.unwrap();
        store
            .close_conversation(&conversation.id, &now_iso())
            .await
            .unwrap();
        let reopened = store
            .record_activity(&conversation.id, "m1", &now_iso())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reopened.status, ConversationStatus::Open);
        assert!(reopened.closed_at.is_none());
        assert_eq!(reopened.last_message_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn concurrent_unread_increments_are_lossless() {
        let store = Arc::new(MemStore::new());
        let conversation = store.find_or_create_conversation("9665550001").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = Arc::clone(&store);
            let id = conversation.id.clone();
            handles.push(tokio::spawn(async move {
                store.increment_unread(&id).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let conversation = store.conversation(&conversation.id).await.unwrap().unwrap();
        assert_eq!(conversation.unread_count, 20);

        let conversation = store.reset_unread(&conversation.id).await.unwrap().unwrap();
        assert_eq!(conversation.unread_count, 0);
    }

    #[tokio::test]
    async fn soft_delete_forces_closed() {
        let store = MemStore::new();
        let conversation = store.find_or_create_conversation("9665550001").await.unwrap();
        let deleted = store
            .soft_delete_conversation(&conversation.id, &now_iso())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deleted.status, ConversationStatus::Closed);
        assert!(deleted.closed_at.is_some());
        assert!(store.conversation(&conversation.id).await.unwrap().is_none());
    }
}
