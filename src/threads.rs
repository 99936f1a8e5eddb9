//! Thread resolution: (user, thread signal) to a conversation thread.
//!
//! Lookup order: the signal as a thread ID, the signal as a recorded
//! message-id, the user's most recent thread inside the staleness window,
//! then a new thread. Persistence errors degrade to an ephemeral thread.
//!
//! Reuse inside the window is a read-then-write and not exclusive: two
//! concurrent first messages from one user can both create a thread.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::email::CanonicalMessage;
use crate::error::DatabaseError;
use crate::pipeline::Resolution;
use crate::store::{ConversationThread, DeliveryStatus, MessageDirection, MessageRecord, ThreadStore};

/// A thread attributed to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadAttribution {
    pub thread: ConversationThread,
    /// Ledger status when this message-id had already been attributed.
    pub redelivery: Option<DeliveryStatus>,
}

impl ThreadAttribution {
    /// The message was already answered; nothing more to do.
    pub fn is_answered(&self) -> bool {
        self.redelivery == Some(DeliveryStatus::Replied)
    }
}

#[derive(Clone)]
pub struct ThreadResolver {
    store: Arc<dyn ThreadStore>,
    stale_window: Duration,
}

impl ThreadResolver {
    pub fn new(store: Arc<dyn ThreadStore>, stale_window: Duration) -> Self {
        Self {
            store,
            stale_window,
        }
    }

    /// Get or create the thread for a user's next message.
    pub async fn get_or_create_thread(
        &self,
        user_id: &str,
        signal: Option<&str>,
        subject: &str,
    ) -> Resolution<ConversationThread> {
        self.get_or_create_thread_at(user_id, signal, subject, Utc::now())
            .await
    }

    /// As [`get_or_create_thread`](Self::get_or_create_thread) with an explicit clock.
    pub async fn get_or_create_thread_at(
        &self,
        user_id: &str,
        signal: Option<&str>,
        subject: &str,
        now: DateTime<Utc>,
    ) -> Resolution<ConversationThread> {
        match self.lookup_or_create(user_id, signal, subject, now).await {
            Ok(thread) => Resolution::Resolved(thread),
            Err(e) => {
                let thread = ephemeral_thread(user_id, subject, now);
                warn!(
                    user_id,
                    thread_id = %thread.id,
                    error = %e,
                    "Thread persistence failed, using ephemeral thread"
                );
                Resolution::degraded(thread, e.to_string())
            }
        }
    }

    /// Attribute an inbound message to a thread, honouring the ledger.
    ///
    /// A message-id already in the ledger returns its thread without
    /// counting the message a second time.
    pub async fn resolve_inbound(
        &self,
        user_id: &str,
        message: &CanonicalMessage,
    ) -> Resolution<ThreadAttribution> {
        self.resolve_inbound_at(user_id, message, Utc::now()).await
    }

    pub async fn resolve_inbound_at(
        &self,
        user_id: &str,
        message: &CanonicalMessage,
        now: DateTime<Utc>,
    ) -> Resolution<ThreadAttribution> {
        if let Some(message_id) = message.message_id.as_deref() {
            match self.redelivered(message_id, user_id).await {
                Ok(Some(attribution)) => {
                    info!(
                        message_id,
                        thread_id = %attribution.thread.id,
                        status = ?attribution.redelivery,
                        "Redelivered message, reusing attributed thread"
                    );
                    return Resolution::Resolved(attribution);
                }
                Ok(None) => {}
                Err(e) => warn!(message_id, error = %e, "Ledger lookup failed"),
            }
        }

        let resolution = self
            .get_or_create_thread_at(user_id, message.thread_signal.as_deref(), &message.subject, now)
            .await;

        if let (Resolution::Resolved(thread), Some(message_id)) =
            (&resolution, message.message_id.as_deref())
        {
            let record = MessageRecord::inbound(message_id, &thread.id, now);
            if let Err(e) = self.store.record_message(&record).await {
                warn!(message_id, thread_id = %thread.id, error = %e, "Failed to record inbound message");
            }
        }

        match resolution {
            Resolution::Resolved(thread) => Resolution::Resolved(ThreadAttribution {
                thread,
                redelivery: None,
            }),
            Resolution::Degraded { value, reason } => Resolution::Degraded {
                value: ThreadAttribution {
                    thread: value,
                    redelivery: None,
                },
                reason,
            },
        }
    }

    /// Record a sent reply against its thread and mark the inbound message answered.
    ///
    /// Best effort: failures are logged.
    pub async fn record_reply(
        &self,
        thread_id: &str,
        inbound_id: Option<&str>,
        outbound_id: &str,
        provider_id: Option<&str>,
    ) {
        let now = Utc::now();
        let record = MessageRecord::outbound(outbound_id, thread_id, provider_id, now);
        if let Err(e) = self.store.record_message(&record).await {
            warn!(thread_id, message_id = outbound_id, error = %e, "Failed to record outbound message");
        }
        if let Some(inbound_id) = inbound_id
            && let Err(e) = self.store.mark_replied(inbound_id, now).await
        {
            warn!(thread_id, message_id = inbound_id, error = %e, "Failed to mark message replied");
        }
    }

    async fn redelivered(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> Result<Option<ThreadAttribution>, DatabaseError> {
        let Some(record) = self.store.find_message(message_id).await? else {
            return Ok(None);
        };
        if record.direction != MessageDirection::Inbound {
            return Ok(None);
        }
        let thread = self.store.get_thread(&record.thread_id).await?;
        Ok(thread
            .filter(|t| t.user_id == user_id)
            .map(|thread| ThreadAttribution {
                thread,
                redelivery: Some(record.status),
            }))
    }

    async fn lookup_or_create(
        &self,
        user_id: &str,
        signal: Option<&str>,
        subject: &str,
        now: DateTime<Utc>,
    ) -> Result<ConversationThread, DatabaseError> {
        if let Some(signal) = signal
            && let Some(thread) = self.thread_for_signal(user_id, signal).await?
        {
            debug!(user_id, signal, thread_id = %thread.id, "Signal matched thread");
            return self.store.touch_thread(&thread.id, now).await;
        }

        let since = now - self.stale_window;
        if let Some(thread) = self.store.find_recent_thread(user_id, since).await? {
            debug!(user_id, thread_id = %thread.id, "Reusing recent thread");
            return self.store.touch_thread(&thread.id, now).await;
        }

        let thread = ConversationThread::new(user_id, subject, now);
        self.store.insert_thread(&thread).await?;
        info!(user_id, thread_id = %thread.id, "Created new thread");
        Ok(thread)
    }

    /// The user's thread named by `signal`, as a thread ID or a ledger message-id.
    async fn thread_for_signal(
        &self,
        user_id: &str,
        signal: &str,
    ) -> Result<Option<ConversationThread>, DatabaseError> {
        if let Some(thread) = self.store.get_thread(signal).await?
            && thread.user_id == user_id
        {
            return Ok(Some(thread));
        }
        if let Some(record) = self.store.find_message(signal).await?
            && let Some(thread) = self.store.get_thread(&record.thread_id).await?
            && thread.user_id == user_id
        {
            return Ok(Some(thread));
        }
        Ok(None)
    }
}

/// Non-persisted thread keyed by user and the current time.
fn ephemeral_thread(user_id: &str, subject: &str, now: DateTime<Utc>) -> ConversationThread {
    let id = format!("ephemeral-{user_id}-{}", now.timestamp_millis());
    ConversationThread::with_id(id, user_id, subject, now)
}
