//! `ThreadStore` trait: async interface for thread persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::DatabaseError;

/// Subject used when the first message of a thread had none worth keeping.
pub const DEFAULT_THREAD_SUBJECT: &str = "Email Conversation";

/// A conversation between one user and the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationThread {
    pub id: String,
    pub user_id: String,
    pub subject: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    /// Inbound messages attributed to this thread. Never decreases.
    pub message_count: i64,
}

impl ConversationThread {
    /// A fresh thread holding its first message.
    pub fn new(user_id: &str, subject: &str, now: DateTime<Utc>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), user_id, subject, now)
    }

    pub fn with_id(id: String, user_id: &str, subject: &str, now: DateTime<Utc>) -> Self {
        let subject = subject.trim();
        Self {
            id,
            user_id: user_id.to_string(),
            subject: if subject.is_empty() {
                DEFAULT_THREAD_SUBJECT.to_string()
            } else {
                subject.to_string()
            },
            created_at: now,
            last_message_at: now,
            message_count: 1,
        }
    }
}

/// Which way a ledger entry travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl std::str::FromStr for MessageDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(format!("unknown message direction '{other}'")),
        }
    }
}

/// Delivery state of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Inbound message attributed to a thread, no reply yet.
    Received,
    /// Inbound message answered.
    Replied,
    /// Outbound message accepted by the provider.
    Sent,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Replied => "replied",
            Self::Sent => "sent",
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "replied" => Ok(Self::Replied),
            "sent" => Ok(Self::Sent),
            other => Err(format!("unknown delivery status '{other}'")),
        }
    }
}

/// A message-id mapped to the thread it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub message_id: String,
    pub thread_id: String,
    pub direction: MessageDirection,
    pub status: DeliveryStatus,
    /// Provider-side id for outbound messages.
    pub provider_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn inbound(message_id: &str, thread_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            message_id: message_id.to_string(),
            thread_id: thread_id.to_string(),
            direction: MessageDirection::Inbound,
            status: DeliveryStatus::Received,
            provider_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn outbound(
        message_id: &str,
        thread_id: &str,
        provider_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: message_id.to_string(),
            thread_id: thread_id.to_string(),
            direction: MessageDirection::Outbound,
            status: DeliveryStatus::Sent,
            provider_id: provider_id.map(str::to_string),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Backend-agnostic persistence for threads and the message ledger.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    // ── Threads ─────────────────────────────────────────────────────

    async fn get_thread(&self, id: &str) -> Result<Option<ConversationThread>, DatabaseError>;

    /// The user's most recently active thread with activity at or after `since`.
    async fn find_recent_thread(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<ConversationThread>, DatabaseError>;

    async fn insert_thread(&self, thread: &ConversationThread) -> Result<(), DatabaseError>;

    /// Atomically bump `message_count` and set `last_message_at`.
    ///
    /// Returns the updated thread, or `NotFound` if the id is unknown.
    async fn touch_thread(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<ConversationThread, DatabaseError>;

    // ── Message ledger ──────────────────────────────────────────────

    async fn find_message(&self, message_id: &str) -> Result<Option<MessageRecord>, DatabaseError>;

    /// Insert a ledger entry. Returns `false` if the message-id was already
    /// recorded; the existing entry is left untouched.
    async fn record_message(&self, record: &MessageRecord) -> Result<bool, DatabaseError>;

    /// Mark an inbound message as answered.
    async fn mark_replied(&self, message_id: &str, at: DateTime<Utc>) -> Result<(), DatabaseError>;
}
