use std::{
    collections::{HashMap, HashSet},
    sync::{atomic::AtomicUsize, Arc},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::config::AppConfig;
use crate::gateway::SendGateway;
use crate::store::Store;

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Strips a raw provider phone value down to its digits.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits = raw
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Location,
    Contact,
    Sticker,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Location => "location",
            Self::Contact => "contact",
            Self::Sticker => "sticker",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "document" => Some(Self::Document),
            "location" => Some(Self::Location),
            "contact" => Some(Self::Contact),
            "sticker" => Some(Self::Sticker),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "incoming" => Some(Self::Incoming),
            "outgoing" => Some(Self::Outgoing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Sent => 0,
            Self::Delivered => 1,
            Self::Read => 2,
            Self::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Read | Self::Failed)
    }

    /// Status only moves forward: sent -> delivered -> read, or to failed
    /// from any non-terminal state.
    pub fn can_advance_to(self, next: Self) -> bool {
        if self == Self::Failed {
            return false;
        }
        if next == Self::Failed {
            return self != Self::Read;
        }
        next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    Webhook,
    Operator,
    Rule,
}

impl MessageOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Operator => "operator",
            Self::Rule => "rule",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "webhook" => Some(Self::Webhook),
            "operator" => Some(Self::Operator),
            "rule" => Some(Self::Rule),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    Pending,
    Assigned,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Closed => "closed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "open" => Some(Self::Open),
            "pending" => Some(Self::Pending),
            "assigned" => Some(Self::Assigned),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    /// Statuses that count toward a worker's workload.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Open | Self::Pending | Self::Assigned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Admin,
    Supervisor,
    Employee,
    User,
}

impl WorkerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Supervisor => "supervisor",
            Self::Employee => "employee",
            Self::User => "user",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "admin" => Some(Self::Admin),
            "supervisor" => Some(Self::Supervisor),
            "employee" => Some(Self::Employee),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Message,
    Assignment,
    Transfer,
    Broadcast,
    System,
    Alert,
    Reminder,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Assignment => "assignment",
            Self::Transfer => "transfer",
            Self::Broadcast => "broadcast",
            Self::System => "system",
            Self::Alert => "alert",
            Self::Reminder => "reminder",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "message" => Some(Self::Message),
            "assignment" => Some(Self::Assignment),
            "transfer" => Some(Self::Transfer),
            "broadcast" => Some(Self::Broadcast),
            "system" => Some(Self::System),
            "alert" => Some(Self::Alert),
            "reminder" => Some(Self::Reminder),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl NotificationPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    MessageReceived,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageReceived => "message_received",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub external_id: Option<String>,
    pub phone_number: String,
    pub kind: MessageKind,
    pub direction: Direction,
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
    pub status: MessageStatus,
    pub origin: MessageOrigin,
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub delivered_at: Option<String>,
    pub read_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub phone_number: String,
    pub status: ConversationStatus,
    pub assigned_to: Option<String>,
    pub assigned_at: Option<String>,
    pub priority: i32,
    pub last_activity_at: String,
    pub last_message_id: Option<String>,
    pub unread_count: i64,
    pub archived: bool,
    pub closed_at: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub id: String,
    pub name: String,
    pub role: WorkerRole,
    pub active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRule {
    pub id: String,
    pub name: String,
    pub trigger_kind: TriggerKind,
    #[serde(default)]
    pub conditions: Value,
    #[serde(default)]
    pub actions: Value,
    pub active: bool,
    pub priority: i32,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub worker_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub entity_id: Option<String>,
    pub entity_kind: Option<String>,
    pub read_at: Option<String>,
    pub priority: NotificationPriority,
    pub link: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub expires_at: Option<String>,
    pub created_at: String,
}

/// One event extracted from a provider webhook delivery.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Message(InboundMessage),
    Status(StatusUpdate),
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub external_id: String,
    pub from: String,
    pub timestamp: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub external_id: String,
    pub status: String,
    pub timestamp: Option<String>,
    pub errors: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignPolicy {
    RoundRobin,
    LoadBalancing,
    Priority,
}

impl AssignPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "round_robin" => Some(Self::RoundRobin),
            "load_balancing" => Some(Self::LoadBalancing),
            "priority" => Some(Self::Priority),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AssignParams {
    pub priority: i32,
}

#[derive(Debug, Clone)]
pub enum AssignDecision {
    Assigned {
        conversation: Conversation,
        worker_id: String,
    },
    Skipped {
        reason: &'static str,
    },
}

/// Per-worker derived counts used to rank assignment candidates.
#[derive(Debug, Clone, Copy, Default)]
pub struct Workload {
    pub active_conversations: i64,
    pub unread_total: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Executed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub rule_id: String,
    pub kind: String,
    pub status: ActionStatus,
    pub detail: String,
}

/// Realtime routing key a subscriber can join.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Conversation(String),
    Phone(String),
}

#[derive(Default)]
pub struct RealtimeState {
    pub clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    pub identity_by_client: HashMap<usize, String>,
    pub topic_members: HashMap<Topic, HashSet<usize>>,
    pub topics_by_client: HashMap<usize, HashSet<Topic>>,
}

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub gateway: Arc<dyn SendGateway>,
    pub realtime: Mutex<RealtimeState>,
    pub next_client_id: AtomicUsize,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, gateway: Arc<dyn SendGateway>, config: AppConfig) -> Self {
        Self {
            store,
            gateway,
            realtime: Mutex::new(RealtimeState::default()),
            next_client_id: AtomicUsize::new(0),
            config,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendToPhoneBody {
    pub to: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignBody {
    pub worker_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoAssignBody {
    #[serde(default)]
    pub policy: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferBody {
    pub worker_id: String,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}
