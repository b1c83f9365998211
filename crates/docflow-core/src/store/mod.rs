//! Storage substrate for the status and prompt logs.
//!
//! [`StatusBackend`] and [`PromptBackend`] are the durable document store
//! the pipeline writes through. They are deliberately thin: point reads,
//! whole-record writes, and the two targeted queries the fan-in barrier
//! needs. Staging, history appends and concise filtering live one level up
//! in [`StatusLog`](crate::status_log::StatusLog).
//!
//! Implementations must be `Send + Sync`; many stage invocations share one
//! backend concurrently.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{ChunkLogRecord, DocumentStatusRecord, LlmOutputRecord, PromptRecord, State};

/// Filter for [`StatusBackend::query_documents`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentQuery {
    /// Only documents started strictly after this instant.
    pub started_after: Option<DateTime<Utc>>,
    pub state: Option<State>,
}

/// Durable store for document logs, chunk logs and LLM outputs.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_document`](StatusBackend::get_document) | Point read by encoded id |
/// | [`put_document`](StatusBackend::put_document) | Whole-record upsert |
/// | [`delete_document`](StatusBackend::delete_document) | Delete if present |
/// | [`set_document_state`](StatusBackend::set_document_state) | Atomic conditional state write |
/// | [`merged_chunk_count`](StatusBackend::merged_chunk_count) | Targeted count read for fan-in |
/// | [`count_chunks`](StatusBackend::count_chunks) | Chunk logs of a file in a state |
/// | [`delete_chunk_logs`](StatusBackend::delete_chunk_logs) | Drop a file's chunk logs |
/// | [`query_documents`](StatusBackend::query_documents) | Time/state filtered listing |
#[async_trait]
pub trait StatusBackend: Send + Sync {
    async fn get_document(&self, id: &str) -> Result<Option<DocumentStatusRecord>>;

    async fn put_document(&self, record: &DocumentStatusRecord) -> Result<()>;

    /// Returns whether a record was removed.
    async fn delete_document(&self, id: &str) -> Result<bool>;

    /// Set `state` unless the document is already in it.
    ///
    /// Returns `true` only for the caller whose write changed the state, so
    /// concurrent identical transitions resolve to exactly one winner.
    /// Missing documents return `false`.
    async fn set_document_state(&self, id: &str, state: State, at: DateTime<Utc>) -> Result<bool>;

    /// `merged_chunk_count` of the document at `file_path`, if it exists.
    async fn merged_chunk_count(&self, file_path: &str) -> Result<Option<i64>>;

    /// Documents matching `query`, newest `state_timestamp` first.
    async fn query_documents(&self, query: &DocumentQuery) -> Result<Vec<DocumentStatusRecord>>;

    /// Overwrite a chunk log record.
    async fn put_chunk_log(&self, record: &ChunkLogRecord) -> Result<()>;

    async fn get_chunk_log(&self, id: &str) -> Result<Option<ChunkLogRecord>>;

    /// Chunk logs of `file_path` whose latest state is `state`.
    async fn count_chunks(&self, file_path: &str, state: State) -> Result<i64>;

    /// Chunk logs of `file_path`, ordered by chunk name.
    async fn list_chunk_logs(&self, file_path: &str) -> Result<Vec<ChunkLogRecord>>;

    /// Remove every chunk log of `file_path`; returns how many were removed.
    async fn delete_chunk_logs(&self, file_path: &str) -> Result<u64>;

    /// Overwrite an LLM output record.
    async fn put_llm_output(&self, record: &LlmOutputRecord) -> Result<()>;

    async fn get_llm_output(&self, id: &str) -> Result<Option<LlmOutputRecord>>;
}

/// Durable store for per-user prompt records.
#[async_trait]
pub trait PromptBackend: Send + Sync {
    async fn get_prompts(&self, user_id: &str) -> Result<Option<PromptRecord>>;

    async fn put_prompts(&self, record: &PromptRecord) -> Result<()>;
}
