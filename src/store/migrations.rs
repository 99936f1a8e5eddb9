//! Schema versioning for the thread store.
//!
//! The `schema_version` table holds one row per applied step. Each step
//! runs in its own transaction together with its version row, so a crash
//! mid-upgrade leaves the database at the previous version.

use libsql::Connection;
use tracing::{debug, info};

use crate::error::DatabaseError;

struct SchemaStep {
    version: i64,
    label: &'static str,
    ddl: &'static str,
}

/// Ordered schema history. Append only.
const SCHEMA: &[SchemaStep] = &[
    SchemaStep {
        version: 1,
        label: "email_threads",
        ddl: r#"
            CREATE TABLE email_threads (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_message_at TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX idx_email_threads_user_activity
                ON email_threads(user_id, last_message_at);
        "#,
    },
    SchemaStep {
        version: 2,
        label: "thread_messages",
        ddl: r#"
            CREATE TABLE thread_messages (
                message_id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL REFERENCES email_threads(id),
                direction TEXT NOT NULL CHECK (direction IN ('inbound', 'outbound')),
                status TEXT NOT NULL,
                provider_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX idx_thread_messages_thread
                ON thread_messages(thread_id);
        "#,
    },
];

/// Bring the schema up to the latest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            label TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("schema_version table: {e}")))?;

    let start = applied_version(conn).await?;
    let pending: Vec<&SchemaStep> = SCHEMA.iter().filter(|s| s.version > start).collect();
    if pending.is_empty() {
        debug!(version = start, "Schema up to date");
        return Ok(());
    }

    for step in pending {
        apply(conn, step).await?;
    }
    info!(from = start, to = applied_version(conn).await?, "Schema upgraded");
    Ok(())
}

async fn apply(conn: &Connection, step: &SchemaStep) -> Result<(), DatabaseError> {
    let fail = |e: libsql::Error| {
        DatabaseError::Migration(format!("V{} {}: {e}", step.version, step.label))
    };

    info!(version = step.version, label = step.label, "Applying schema step");
    let tx = conn.transaction().await.map_err(fail)?;
    tx.execute_batch(step.ddl).await.map_err(fail)?;
    tx.execute(
        "INSERT INTO schema_version (version, label) VALUES (?1, ?2)",
        libsql::params![step.version, step.label],
    )
    .await
    .map_err(fail)?;
    tx.commit().await.map_err(fail)
}

/// Highest applied version; 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let fail = |e: libsql::Error| DatabaseError::Migration(format!("schema version: {e}"));
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await
        .map_err(fail)?;
    match rows.next().await.map_err(fail)? {
        Some(row) => row.get::<i64>(0).map_err(fail),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                libsql::params![name],
            )
            .await
            .unwrap();
        rows.next().await.unwrap().is_some()
    }

    #[tokio::test]
    async fn fresh_database_reaches_latest_version() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();

        assert!(table_exists(&conn, "email_threads").await);
        assert!(table_exists(&conn, "thread_messages").await);
        let latest = SCHEMA.last().map(|s| s.version).unwrap();
        assert_eq!(applied_version(&conn).await.unwrap(), latest);
    }

    #[tokio::test]
    async fn rerun_is_a_no_op() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT COUNT(*) FROM schema_version", ())
            .await
            .unwrap();
        let count: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(count, SCHEMA.len() as i64);
    }

    #[tokio::test]
    async fn upgrades_from_first_version() {
        let conn = memory_conn().await;
        conn.execute(
            "CREATE TABLE schema_version (version INTEGER PRIMARY KEY, label TEXT NOT NULL, applied_at TEXT)",
            (),
        )
        .await
        .unwrap();
        apply(&conn, &SCHEMA[0]).await.unwrap();
        assert!(!table_exists(&conn, "thread_messages").await);

        run_migrations(&conn).await.unwrap();
        assert!(table_exists(&conn, "thread_messages").await);
        assert_eq!(applied_version(&conn).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn ledger_rejects_unknown_direction() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();
        conn.execute(
            "INSERT INTO email_threads (id, user_id, subject, created_at, last_message_at)
             VALUES ('t1', 'u1', 's', 'x', 'x')",
            (),
        )
        .await
        .unwrap();
        let result = conn
            .execute(
                "INSERT INTO thread_messages
                    (message_id, thread_id, direction, status, created_at, updated_at)
                 VALUES ('m1', 't1', 'sideways', 'received', 'x', 'x')",
                (),
            )
            .await;
        assert!(result.is_err());
    }
}
