//! Persistence layer: libSQL-backed storage for threads and the message ledger.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlThreadStore;
pub use traits::{
    ConversationThread, DEFAULT_THREAD_SUBJECT, DeliveryStatus, MessageDirection, MessageRecord,
    ThreadStore,
};
