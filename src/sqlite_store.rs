//! SQLite-backed [`StatusBackend`] and [`PromptBackend`].
//!
//! Timestamps are stored as INTEGER milliseconds since the epoch so that
//! range filters and ordering happen in SQL. A document's status history is
//! one JSON column; it is only ever read and written whole, together with
//! the rest of the record.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use docflow_core::models::{
    ChunkLogRecord, DocumentStatusRecord, LlmOutputRecord, PromptEntry, PromptRecord, State,
    StatusUpdate, TokenUsage, DOC_TYPE_CHUNK_LOG, DOC_TYPE_FILE_LOG, DOC_TYPE_LLM_OUTPUT,
};
use docflow_core::store::{DocumentQuery, PromptBackend, StatusBackend};

/// SQLite implementation of the store traits.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Document counts per state, for `docflow stats`.
    pub async fn state_counts(&self) -> Result<Vec<(State, i64)>> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS n FROM file_logs GROUP BY state ORDER BY n DESC, state",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let state: String = row.get("state");
                Ok((state.parse::<State>()?, row.get::<i64, _>("n")))
            })
            .collect()
    }

    /// Totals over chunk logs and LLM outputs, for `docflow stats`.
    pub async fn chunk_totals(&self) -> Result<ChunkTotals> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM chunk_logs) AS chunks,
                (SELECT COUNT(*) FROM chunk_logs WHERE chunk_state = 'Complete') AS complete,
                (SELECT COUNT(*) FROM llm_outputs) AS outputs,
                (SELECT COALESCE(SUM(total_tokens), 0) FROM llm_outputs) AS tokens
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(ChunkTotals {
            chunks: row.get("chunks"),
            complete: row.get("complete"),
            llm_outputs: row.get("outputs"),
            total_tokens: row.get("tokens"),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkTotals {
    pub chunks: i64,
    pub complete: i64,
    pub llm_outputs: i64,
    pub total_tokens: i64,
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

fn document_from_row(row: &SqliteRow) -> Result<DocumentStatusRecord> {
    let state: String = row.get("state");
    let updates_json: String = row.get("status_updates_json");
    let status_updates: Vec<StatusUpdate> = serde_json::from_str(&updates_json)
        .with_context(|| "corrupt status_updates_json")?;
    Ok(DocumentStatusRecord {
        id: row.get("id"),
        doc_type: DOC_TYPE_FILE_LOG.to_string(),
        file_path: row.get("file_path"),
        file_name: row.get("file_name"),
        state: state.parse()?,
        chunk_count: row.get("chunk_count"),
        merged_chunk_count: row.get("merged_chunk_count"),
        start_timestamp: from_millis(row.get("start_timestamp"))?,
        state_timestamp: from_millis(row.get("state_timestamp"))?,
        state_description: row.get("state_description"),
        status_updates,
    })
}

fn chunk_log_from_row(row: &SqliteRow) -> Result<ChunkLogRecord> {
    let state: String = row.get("chunk_state");
    Ok(ChunkLogRecord {
        id: row.get("id"),
        doc_type: DOC_TYPE_CHUNK_LOG.to_string(),
        file_path: row.get("file_path"),
        file_name: row.get("file_name"),
        chunk_name: row.get("chunk_name"),
        chunk_blob_uri: row.get("chunk_blob_uri"),
        chunk_state: state.parse()?,
        state_timestamp: from_millis(row.get("state_timestamp"))?,
        additional_info: row.get("additional_info"),
    })
}

const DOCUMENT_COLUMNS: &str = "id, file_path, file_name, state, chunk_count, merged_chunk_count, \
     start_timestamp, state_timestamp, state_description, status_updates_json";

#[async_trait]
impl StatusBackend for SqliteStore {
    async fn get_document(&self, id: &str) -> Result<Option<DocumentStatusRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM file_logs WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn put_document(&self, record: &DocumentStatusRecord) -> Result<()> {
        let updates_json = serde_json::to_string(&record.status_updates)?;
        sqlx::query(
            r#"
            INSERT INTO file_logs (id, file_path, file_name, state, chunk_count,
                                   merged_chunk_count, start_timestamp, state_timestamp,
                                   state_description, status_updates_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                file_path = excluded.file_path,
                file_name = excluded.file_name,
                state = excluded.state,
                chunk_count = excluded.chunk_count,
                merged_chunk_count = excluded.merged_chunk_count,
                start_timestamp = excluded.start_timestamp,
                state_timestamp = excluded.state_timestamp,
                state_description = excluded.state_description,
                status_updates_json = excluded.status_updates_json
            "#,
        )
        .bind(&record.id)
        .bind(&record.file_path)
        .bind(&record.file_name)
        .bind(record.state.as_str())
        .bind(record.chunk_count)
        .bind(record.merged_chunk_count)
        .bind(record.start_timestamp.timestamp_millis())
        .bind(record.state_timestamp.timestamp_millis())
        .bind(&record.state_description)
        .bind(updates_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM file_logs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_document_state(&self, id: &str, state: State, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE file_logs SET state = ?, state_timestamp = ? WHERE id = ? AND state <> ?",
        )
        .bind(state.as_str())
        .bind(at.timestamp_millis())
        .bind(id)
        .bind(state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn merged_chunk_count(&self, file_path: &str) -> Result<Option<i64>> {
        let count: Option<i64> =
            sqlx::query_scalar("SELECT merged_chunk_count FROM file_logs WHERE file_path = ?")
                .bind(file_path)
                .fetch_optional(&self.pool)
                .await?;
        Ok(count)
    }

    async fn query_documents(&self, query: &DocumentQuery) -> Result<Vec<DocumentStatusRecord>> {
        let since = query.started_after.map(|t| t.timestamp_millis());
        let state = query.state.map(|s| s.as_str());
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM file_logs
            WHERE (? IS NULL OR start_timestamp > ?)
              AND (? IS NULL OR state = ?)
            ORDER BY state_timestamp DESC
            "#,
            DOCUMENT_COLUMNS
        ))
        .bind(since)
        .bind(since)
        .bind(state)
        .bind(state)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn put_chunk_log(&self, record: &ChunkLogRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chunk_logs (id, file_path, file_name, chunk_name, chunk_blob_uri,
                                    chunk_state, state_timestamp, additional_info)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                file_path = excluded.file_path,
                file_name = excluded.file_name,
                chunk_name = excluded.chunk_name,
                chunk_blob_uri = excluded.chunk_blob_uri,
                chunk_state = excluded.chunk_state,
                state_timestamp = excluded.state_timestamp,
                additional_info = excluded.additional_info
            "#,
        )
        .bind(&record.id)
        .bind(&record.file_path)
        .bind(&record.file_name)
        .bind(&record.chunk_name)
        .bind(&record.chunk_blob_uri)
        .bind(record.chunk_state.as_str())
        .bind(record.state_timestamp.timestamp_millis())
        .bind(&record.additional_info)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_chunk_log(&self, id: &str) -> Result<Option<ChunkLogRecord>> {
        let row = sqlx::query("SELECT * FROM chunk_logs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(chunk_log_from_row).transpose()
    }

    async fn count_chunks(&self, file_path: &str, state: State) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunk_logs WHERE file_path = ? AND chunk_state = ?",
        )
        .bind(file_path)
        .bind(state.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn list_chunk_logs(&self, file_path: &str) -> Result<Vec<ChunkLogRecord>> {
        let rows = sqlx::query("SELECT * FROM chunk_logs WHERE file_path = ? ORDER BY chunk_name")
            .bind(file_path)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(chunk_log_from_row).collect()
    }

    async fn delete_chunk_logs(&self, file_path: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunk_logs WHERE file_path = ?")
            .bind(file_path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn put_llm_output(&self, record: &LlmOutputRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO llm_outputs (id, file_path, file_name, chunk_name, chunk_blob_uri,
                                     llm_output, llm_output_file, user_id, prompt_id,
                                     completion_tokens, prompt_tokens, total_tokens,
                                     state_timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                llm_output = excluded.llm_output,
                user_id = excluded.user_id,
                prompt_id = excluded.prompt_id,
                completion_tokens = excluded.completion_tokens,
                prompt_tokens = excluded.prompt_tokens,
                total_tokens = excluded.total_tokens,
                state_timestamp = excluded.state_timestamp
            "#,
        )
        .bind(&record.id)
        .bind(&record.file_path)
        .bind(&record.file_name)
        .bind(&record.chunk_name)
        .bind(&record.chunk_blob_uri)
        .bind(&record.llm_output)
        .bind(&record.llm_output_file)
        .bind(&record.user_id)
        .bind(&record.prompt_id)
        .bind(record.usage.completion_tokens)
        .bind(record.usage.prompt_tokens)
        .bind(record.usage.total_tokens)
        .bind(record.state_timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_llm_output(&self, id: &str) -> Result<Option<LlmOutputRecord>> {
        let row = sqlx::query("SELECT * FROM llm_outputs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(LlmOutputRecord {
            id: row.get("id"),
            doc_type: DOC_TYPE_LLM_OUTPUT.to_string(),
            file_path: row.get("file_path"),
            file_name: row.get("file_name"),
            chunk_name: row.get("chunk_name"),
            chunk_blob_uri: row.get("chunk_blob_uri"),
            llm_output: row.get("llm_output"),
            llm_output_file: row.get("llm_output_file"),
            user_id: row.get("user_id"),
            prompt_id: row.get("prompt_id"),
            usage: TokenUsage {
                completion_tokens: row.get("completion_tokens"),
                prompt_tokens: row.get("prompt_tokens"),
                total_tokens: row.get("total_tokens"),
            },
            state_timestamp: from_millis(row.get("state_timestamp"))?,
        }))
    }
}

#[async_trait]
impl PromptBackend for SqliteStore {
    async fn get_prompts(&self, user_id: &str) -> Result<Option<PromptRecord>> {
        let row = sqlx::query("SELECT * FROM prompts WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let prompts_json: String = row.get("prompts_json");
        let prompts: Vec<PromptEntry> =
            serde_json::from_str(&prompts_json).with_context(|| "corrupt prompts_json")?;
        Ok(Some(PromptRecord {
            id: row.get("id"),
            user_id: row.get("user_id"),
            prompts,
            timestamp: from_millis(row.get("updated_at"))?,
        }))
    }

    async fn put_prompts(&self, record: &PromptRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO prompts (user_id, id, prompts_json, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                prompts_json = excluded.prompts_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.user_id)
        .bind(&record.id)
        .bind(serde_json::to_string(&record.prompts)?)
        .bind(record.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
