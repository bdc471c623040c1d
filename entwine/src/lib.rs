//! Entwine core library.
//!
//! Persists nested entity graphs in one atomic commit. A [`Schema`] describes
//! record kinds and how they relate; a [`Document`] tree describes the state a
//! caller wants; [`GraphEngine::commit`] makes the store match it or changes
//! nothing at all.

pub mod auth;
pub mod document;
pub mod engine;
pub mod errors;
pub mod keys;
pub mod notify;
pub mod schema;
pub mod store;
pub mod types;
pub mod validation;

pub use auth::{Actor, AllowAll, Authorizer, Grant, Operation, PolicyAuthorizer};
pub use document::{Document, Node, Reference, RelationPayload};
pub use engine::{
    Change, CommitReceipt, GraphEngine, TouchedRecord,
    path::NodePath,
    queue::{DeferredOperation, DeferredQueue, DrainReport, QueueState},
};
pub use errors::*;
pub use notify::{ChannelNotifier, CommitNotifier, GraphCommitted, LogNotifier, NoopNotifier};
pub use schema::{Schema, SchemaBuilder, SchemaError};
pub use store::{Backend, ChangeSet, Guard, TransactionScope, memory::MemoryBackend, redis::RedisBackend};
pub use types::*;
pub use validation::{ScalarValidator, ValidatorRegistry};

// Re-export redis types so users don't need to depend on a specific redis version
pub use redis;
pub use redis::aio::ConnectionManager;

/// Delete all keys under `prefix` (for test cleanup).
///
/// Uses SCAN + DEL so Redis is never blocked by a large keyspace.
pub async fn purge_prefix(conn: &mut ConnectionManager, prefix: &str) -> Result<u64, StoreError> {
    const SCAN_COUNT: usize = 1000;
    let pattern = format!("{prefix}:*");
    let mut cursor: u64 = 0;
    let mut total_deleted: u64 = 0;

    loop {
        let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(conn)
            .await?;

        if !keys.is_empty() {
            let deleted: u64 = redis::cmd("DEL").arg(&keys).query_async(conn).await?;
            total_deleted += deleted;
        }

        cursor = next_cursor;
        if cursor == 0 {
            break;
        }
    }

    Ok(total_deleted)
}
