//! Idempotent schema creation.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index on an open pool.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Document status records; history is a JSON array.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_logs (
            id TEXT PRIMARY KEY,
            file_path TEXT NOT NULL,
            file_name TEXT NOT NULL,
            state TEXT NOT NULL,
            chunk_count INTEGER NOT NULL DEFAULT -1,
            merged_chunk_count INTEGER NOT NULL DEFAULT -1,
            start_timestamp INTEGER NOT NULL,
            state_timestamp INTEGER NOT NULL,
            state_description TEXT NOT NULL DEFAULT '',
            status_updates_json TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_logs (
            id TEXT PRIMARY KEY,
            file_path TEXT NOT NULL,
            file_name TEXT NOT NULL,
            chunk_name TEXT NOT NULL,
            chunk_blob_uri TEXT NOT NULL,
            chunk_state TEXT NOT NULL,
            state_timestamp INTEGER NOT NULL,
            additional_info TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS llm_outputs (
            id TEXT PRIMARY KEY,
            file_path TEXT NOT NULL,
            file_name TEXT NOT NULL,
            chunk_name TEXT NOT NULL,
            chunk_blob_uri TEXT NOT NULL,
            llm_output TEXT NOT NULL,
            llm_output_file TEXT NOT NULL,
            user_id TEXT NOT NULL,
            prompt_id TEXT NOT NULL,
            completion_tokens INTEGER NOT NULL,
            prompt_tokens INTEGER NOT NULL,
            total_tokens INTEGER NOT NULL,
            state_timestamp INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS prompts (
            user_id TEXT PRIMARY KEY,
            id TEXT NOT NULL,
            prompts_json TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Durable queue; visible_at and leases are milliseconds since epoch.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_messages (
            id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            body TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL,
            visible_at INTEGER NOT NULL,
            dequeue_count INTEGER NOT NULL DEFAULT 0,
            pop_receipt TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_file_logs_start ON file_logs(start_timestamp)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_file_logs_path ON file_logs(file_path)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunk_logs_path_state ON chunk_logs(file_path, chunk_state)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_queue_visible ON queue_messages(queue, visible_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
