//! libSQL backend: async `ThreadStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    ConversationThread, DeliveryStatus, MessageDirection, MessageRecord, ThreadStore,
};

/// libSQL thread store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlThreadStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlThreadStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db)?;
        store.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let store = Self::from_database(db)?;
        store.init_schema().await?;
        Ok(store)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Query(format!("invalid timestamp '{s}': {e}")))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const THREAD_COLUMNS: &str = "id, user_id, subject, created_at, last_message_at, message_count";

/// Column order matches THREAD_COLUMNS.
fn row_to_thread(row: &libsql::Row) -> Result<ConversationThread, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));
    let created: String = row.get(3).map_err(get_err)?;
    let last: String = row.get(4).map_err(get_err)?;
    Ok(ConversationThread {
        id: row.get(0).map_err(get_err)?,
        user_id: row.get(1).map_err(get_err)?,
        subject: row.get(2).map_err(get_err)?,
        created_at: parse_datetime(&created)?,
        last_message_at: parse_datetime(&last)?,
        message_count: row.get(5).map_err(get_err)?,
    })
}

const MESSAGE_COLUMNS: &str =
    "message_id, thread_id, direction, status, provider_id, created_at, updated_at";

/// Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<MessageRecord, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));
    let direction: String = row.get(2).map_err(get_err)?;
    let status: String = row.get(3).map_err(get_err)?;
    let created: String = row.get(5).map_err(get_err)?;
    let updated: String = row.get(6).map_err(get_err)?;
    Ok(MessageRecord {
        message_id: row.get(0).map_err(get_err)?,
        thread_id: row.get(1).map_err(get_err)?,
        direction: direction
            .parse::<MessageDirection>()
            .map_err(DatabaseError::Query)?,
        status: status.parse::<DeliveryStatus>().map_err(DatabaseError::Query)?,
        provider_id: row.get::<Option<String>>(4).map_err(get_err)?,
        created_at: parse_datetime(&created)?,
        updated_at: parse_datetime(&updated)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl ThreadStore for LibSqlThreadStore {
    async fn get_thread(&self, id: &str) -> Result<Option<ConversationThread>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {THREAD_COLUMNS} FROM email_threads WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_thread: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_thread(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_thread: {e}"))),
        }
    }

    async fn find_recent_thread(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<ConversationThread>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {THREAD_COLUMNS} FROM email_threads
                     WHERE user_id = ?1 AND last_message_at >= ?2
                     ORDER BY last_message_at DESC LIMIT 1"
                ),
                params![user_id, format_datetime(since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_recent_thread: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_thread(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_recent_thread: {e}"))),
        }
    }

    async fn insert_thread(&self, thread: &ConversationThread) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO email_threads (id, user_id, subject, created_at, last_message_at, message_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    thread.id.as_str(),
                    thread.user_id.as_str(),
                    thread.subject.as_str(),
                    format_datetime(thread.created_at),
                    format_datetime(thread.last_message_at),
                    thread.message_count,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_thread: {e}")))?;

        debug!(thread_id = %thread.id, user_id = %thread.user_id, "Thread inserted into DB");
        Ok(())
    }

    async fn touch_thread(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<ConversationThread, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE email_threads
                 SET message_count = message_count + 1, last_message_at = ?2
                 WHERE id = ?1",
                params![id, format_datetime(at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch_thread: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "email_thread".to_string(),
                id: id.to_string(),
            });
        }

        let thread = self
            .get_thread(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "email_thread".to_string(),
                id: id.to_string(),
            })?;
        debug!(thread_id = id, count = thread.message_count, "Thread touched");
        Ok(thread)
    }

    async fn find_message(&self, message_id: &str) -> Result<Option<MessageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM thread_messages WHERE message_id = ?1"),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_message: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_message(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_message: {e}"))),
        }
    }

    async fn record_message(&self, record: &MessageRecord) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO thread_messages
                    (message_id, thread_id, direction, status, provider_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.message_id.as_str(),
                    record.thread_id.as_str(),
                    record.direction.as_str(),
                    record.status.as_str(),
                    opt_text(record.provider_id.as_deref()),
                    format_datetime(record.created_at),
                    format_datetime(record.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_message: {e}")))?;

        debug!(
            message_id = %record.message_id,
            thread_id = %record.thread_id,
            direction = record.direction.as_str(),
            inserted = inserted > 0,
            "Ledger entry recorded"
        );
        Ok(inserted > 0)
    }

    async fn mark_replied(&self, message_id: &str, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE thread_messages SET status = ?1, updated_at = ?2
                 WHERE message_id = ?3 AND direction = 'inbound'",
                params![
                    DeliveryStatus::Replied.as_str(),
                    format_datetime(at),
                    message_id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_replied: {e}")))?;

        debug!(message_id, "Inbound message marked replied");
        Ok(())
    }
}
