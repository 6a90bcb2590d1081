//! Idempotent schema creation.
//!
//! Every statement is `CREATE ... IF NOT EXISTS`, so running the
//! migrations against an existing database is a no-op and re-opening a
//! store path reconstructs the same collections.

use anyhow::Result;
use sqlx::SqlitePool;

/// Tables backing [`SqliteVectorStore`](crate::store::sqlite::SqliteVectorStore).
pub async fn migrate_vector_store(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            metric TEXT NOT NULL,
            dims INTEGER,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            document_id TEXT,
            text TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            embedding BLOB NOT NULL,
            hash TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (collection, id),
            FOREIGN KEY (collection) REFERENCES collections(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_document ON records(collection, document_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Tables backing [`LongTermMemory`](crate::memory::LongTermMemory).
pub async fn migrate_memory(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memories (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            memory_type TEXT NOT NULL,
            content TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            embedding BLOB,
            created_at INTEGER NOT NULL,
            last_accessed INTEGER NOT NULL,
            access_count INTEGER NOT NULL DEFAULT 0,
            importance REAL NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_memories_user ON memories(user_id, memory_type)")
        .execute(pool)
        .await?;

    Ok(())
}
