//! Per-document and per-chunk status log.
//!
//! A [`StatusLog`] is created fresh for every stage invocation. Document
//! updates are staged in memory and accumulate into one record per document
//! id until [`StatusLog::save`] writes it back in a single call, so a stage
//! that logs five steps still performs one durable write. Chunk logs and LLM
//! outputs bypass staging and are written through immediately.
//!
//! # Fan-in
//!
//! [`StatusLog::mark_document_processing_complete`] is re-run by every chunk
//! that completes. It compares the persisted `merged_chunk_count` with the
//! number of Complete chunk logs and, on equality, performs the terminal
//! transition through [`StatusBackend::set_document_state`], which only one
//! concurrent caller can win.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::models::{
    encode_id, ChunkLogRecord, DocumentStatusRecord, LlmOutputEntry, LlmOutputRecord,
    StatusClassification, StatusQueryLevel, StatusUpdate, State, UNKNOWN_COUNT,
};
use crate::store::{DocumentQuery, StatusBackend};

/// One status update to stage against a document.
#[derive(Debug, Clone)]
pub struct StatusEntry {
    pub status: String,
    pub classification: StatusClassification,
    pub state: State,
    pub fresh_start: bool,
    pub chunk_count: Option<i64>,
    pub merged_chunk_count: Option<i64>,
    pub stack_trace: Option<String>,
}

impl StatusEntry {
    pub fn new(status: impl Into<String>, classification: StatusClassification) -> Self {
        Self {
            status: status.into(),
            classification,
            state: State::Processing,
            fresh_start: false,
            chunk_count: None,
            merged_chunk_count: None,
            stack_trace: None,
        }
    }

    pub fn debug(status: impl Into<String>) -> Self {
        Self::new(status, StatusClassification::Debug)
    }

    pub fn info(status: impl Into<String>) -> Self {
        Self::new(status, StatusClassification::Info)
    }

    pub fn error(status: impl Into<String>) -> Self {
        Self::new(status, StatusClassification::Error)
    }

    pub fn state(mut self, state: State) -> Self {
        self.state = state;
        self
    }

    /// Delete any previous record for the path before logging.
    pub fn fresh_start(mut self) -> Self {
        self.fresh_start = true;
        self
    }

    pub fn counts(mut self, chunk_count: i64, merged_chunk_count: i64) -> Self {
        self.chunk_count = Some(chunk_count);
        self.merged_chunk_count = Some(merged_chunk_count);
        self
    }

    /// Attach a trace captured elsewhere instead of the one taken at upsert.
    pub fn stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }
}

/// Staged status writer over a [`StatusBackend`].
pub struct StatusLog {
    backend: Arc<dyn StatusBackend>,
    staged: HashMap<String, DocumentStatusRecord>,
}

impl StatusLog {
    pub fn new(backend: Arc<dyn StatusBackend>) -> Self {
        Self {
            backend,
            staged: HashMap::new(),
        }
    }

    /// Stage a status update for `document_path`.
    ///
    /// Never fails: a storage error while loading the existing record
    /// degrades to starting a fresh record.
    pub async fn upsert(&mut self, document_path: &str, entry: StatusEntry) {
        let id = encode_id(document_path);
        match entry.classification {
            StatusClassification::Debug => debug!(document_id = %id, "{}", entry.status),
            StatusClassification::Info => info!(document_id = %id, "{}", entry.status),
            StatusClassification::Error => error!(document_id = %id, "{}", entry.status),
        }

        if entry.fresh_start {
            self.staged.remove(&id);
            if let Err(e) = self.backend.delete_document(&id).await {
                warn!(document_id = %id, "fresh start could not delete previous record: {:#}", e);
            }
            // Chunk log ids repeat across runs; old Complete entries would
            // satisfy the new run's fan-in.
            if let Err(e) = self.backend.delete_chunk_logs(document_path).await {
                warn!(document_id = %id, "fresh start could not delete previous chunk logs: {:#}", e);
            }
        }

        let now = Utc::now();
        let stack_trace = match entry.classification {
            StatusClassification::Error => entry
                .stack_trace
                .or_else(|| Some(Backtrace::force_capture().to_string())),
            _ => entry.stack_trace,
        };
        let update = StatusUpdate {
            status: entry.status,
            status_timestamp: now,
            status_classification: entry.classification,
            stack_trace,
        };

        let existing = match self.staged.remove(&id) {
            Some(record) => Ok(Some(record)),
            None => self.backend.get_document(&id).await,
        };

        let mut record = match existing {
            Ok(Some(mut record)) => {
                record.apply_state(entry.state, now);
                record.status_updates.push(update);
                record
            }
            Ok(None) => DocumentStatusRecord::new(document_path, entry.state, update),
            Err(e) => {
                warn!(document_id = %id, "status read failed, starting a fresh record: {:#}", e);
                DocumentStatusRecord::new(document_path, entry.state, update)
            }
        };

        if let Some(count) = entry.chunk_count {
            record.chunk_count = count;
        }
        if let Some(count) = entry.merged_chunk_count {
            record.merged_chunk_count = count;
        }

        self.staged.insert(id, record);
    }

    /// Flush the staged record for `document_path` in one write.
    ///
    /// A path with nothing staged is a no-op.
    pub async fn save(&mut self, document_path: &str) -> Result<(), PipelineError> {
        let id = encode_id(document_path);
        let Some(record) = self.staged.remove(&id) else {
            return Ok(());
        };
        self.backend
            .put_document(&record)
            .await
            .map_err(PipelineError::storage)
    }

    /// Set the document state and persist it immediately.
    ///
    /// Returns `true` if this call changed the state. Setting the state the
    /// document already has is a no-op.
    pub async fn update_state(
        &mut self,
        document_path: &str,
        state: State,
    ) -> Result<bool, PipelineError> {
        let id = encode_id(document_path);
        let now = Utc::now();
        let changed = self
            .backend
            .set_document_state(&id, state, now)
            .await
            .map_err(PipelineError::storage)?;
        if let Some(record) = self.staged.get_mut(&id) {
            record.apply_state(state, now);
        }
        if changed {
            info!(document_id = %id, "{}", state);
        } else {
            debug!(document_id = %id, "state already {} or document missing", state);
        }
        Ok(changed)
    }

    /// Point read of one document's record.
    pub async fn read_by_id(
        &self,
        document_path: &str,
        level: StatusQueryLevel,
    ) -> Result<Option<DocumentStatusRecord>, PipelineError> {
        let record = self
            .backend
            .get_document(&encode_id(document_path))
            .await
            .map_err(PipelineError::storage)?;
        Ok(record.map(|r| r.filter_for(level)))
    }

    /// Documents started within the last `within_hours` (negative means
    /// unbounded), optionally in one state, newest state change first.
    pub async fn read_by_timeframe(
        &self,
        within_hours: i64,
        state: Option<State>,
    ) -> Result<Vec<DocumentStatusRecord>, PipelineError> {
        let started_after = (within_hours >= 0).then(|| Utc::now() - Duration::hours(within_hours));
        let query = DocumentQuery {
            started_after,
            state,
        };
        self.backend
            .query_documents(&query)
            .await
            .map_err(PipelineError::storage)
    }

    /// Overwrite the latest state of one chunk.
    pub async fn create_chunk_log_entry(
        &self,
        file_path: &str,
        chunk_blob_uri: &str,
        chunk_name: &str,
        chunk_state: State,
        info: &str,
    ) -> Result<(), PipelineError> {
        debug!(chunk = chunk_name, state = %chunk_state, "{}", info);
        let record = ChunkLogRecord::new(file_path, chunk_blob_uri, chunk_name, chunk_state, info);
        self.backend
            .put_chunk_log(&record)
            .await
            .map_err(PipelineError::storage)
    }

    pub async fn create_llm_output_entry(
        &self,
        entry: &LlmOutputEntry<'_>,
    ) -> Result<(), PipelineError> {
        let record = LlmOutputRecord::new(entry);
        self.backend
            .put_llm_output(&record)
            .await
            .map_err(PipelineError::storage)
    }

    /// Fan-in barrier: mark the document Complete once every merged chunk
    /// has a Complete chunk log.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub async fn mark_document_processing_complete(
        &mut self,
        file_path: &str,
    ) -> Result<bool, PipelineError> {
        let total = self
            .backend
            .merged_chunk_count(file_path)
            .await
            .map_err(PipelineError::storage)?;
        let Some(total) = total.filter(|t| *t != UNKNOWN_COUNT) else {
            debug!(file_path, "fan-in skipped, merged chunk count not known yet");
            return Ok(false);
        };
        let done = self
            .backend
            .count_chunks(file_path, State::Complete)
            .await
            .map_err(PipelineError::storage)?;
        debug!(file_path, done, total, "fan-in check");
        if done != total {
            return Ok(false);
        }
        self.update_state(file_path, State::Complete).await
    }
}
