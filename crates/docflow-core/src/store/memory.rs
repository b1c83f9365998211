//! In-memory [`StatusBackend`] and [`PromptBackend`] for tests and
//! single-process runs.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. The conditional state write
//! holds the document write lock for its whole read-compare-write, which is
//! what makes concurrent fan-in checks safe.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    encode_id, ChunkLogRecord, DocumentStatusRecord, LlmOutputRecord, PromptRecord, State,
};

use super::{DocumentQuery, PromptBackend, StatusBackend};

/// In-memory store for testing.
pub struct InMemoryStore {
    documents: RwLock<HashMap<String, DocumentStatusRecord>>,
    chunk_logs: RwLock<HashMap<String, ChunkLogRecord>>,
    llm_outputs: RwLock<HashMap<String, LlmOutputRecord>>,
    prompts: RwLock<HashMap<String, PromptRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            chunk_logs: RwLock::new(HashMap::new()),
            llm_outputs: RwLock::new(HashMap::new()),
            prompts: RwLock::new(HashMap::new()),
        }
    }

    /// Number of document records currently held.
    pub fn document_count(&self) -> usize {
        self.documents.read().map(|d| d.len()).unwrap_or(0)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

#[async_trait]
impl StatusBackend for InMemoryStore {
    async fn get_document(&self, id: &str) -> Result<Option<DocumentStatusRecord>> {
        Ok(read(&self.documents)?.get(id).cloned())
    }

    async fn put_document(&self, record: &DocumentStatusRecord) -> Result<()> {
        write(&self.documents)?.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        Ok(write(&self.documents)?.remove(id).is_some())
    }

    async fn set_document_state(&self, id: &str, state: State, at: DateTime<Utc>) -> Result<bool> {
        let mut documents = write(&self.documents)?;
        Ok(documents
            .get_mut(id)
            .map(|record| record.apply_state(state, at))
            .unwrap_or(false))
    }

    async fn merged_chunk_count(&self, file_path: &str) -> Result<Option<i64>> {
        Ok(read(&self.documents)?
            .get(&encode_id(file_path))
            .map(|r| r.merged_chunk_count))
    }

    async fn query_documents(&self, query: &DocumentQuery) -> Result<Vec<DocumentStatusRecord>> {
        let mut found: Vec<DocumentStatusRecord> = read(&self.documents)?
            .values()
            .filter(|r| query.started_after.map_or(true, |t| r.start_timestamp > t))
            .filter(|r| query.state.map_or(true, |s| r.state == s))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.state_timestamp.cmp(&a.state_timestamp));
        Ok(found)
    }

    async fn put_chunk_log(&self, record: &ChunkLogRecord) -> Result<()> {
        write(&self.chunk_logs)?.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_chunk_log(&self, id: &str) -> Result<Option<ChunkLogRecord>> {
        Ok(read(&self.chunk_logs)?.get(id).cloned())
    }

    async fn count_chunks(&self, file_path: &str, state: State) -> Result<i64> {
        let count = read(&self.chunk_logs)?
            .values()
            .filter(|c| c.file_path == file_path && c.chunk_state == state)
            .count();
        Ok(count as i64)
    }

    async fn list_chunk_logs(&self, file_path: &str) -> Result<Vec<ChunkLogRecord>> {
        let mut logs: Vec<ChunkLogRecord> = read(&self.chunk_logs)?
            .values()
            .filter(|c| c.file_path == file_path)
            .cloned()
            .collect();
        logs.sort_by(|a, b| a.chunk_name.cmp(&b.chunk_name));
        Ok(logs)
    }

    async fn delete_chunk_logs(&self, file_path: &str) -> Result<u64> {
        let mut logs = write(&self.chunk_logs)?;
        let before = logs.len();
        logs.retain(|_, c| c.file_path != file_path);
        Ok((before - logs.len()) as u64)
    }

    async fn put_llm_output(&self, record: &LlmOutputRecord) -> Result<()> {
        write(&self.llm_outputs)?.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_llm_output(&self, id: &str) -> Result<Option<LlmOutputRecord>> {
        Ok(read(&self.llm_outputs)?.get(id).cloned())
    }
}

#[async_trait]
impl PromptBackend for InMemoryStore {
    async fn get_prompts(&self, user_id: &str) -> Result<Option<PromptRecord>> {
        Ok(read(&self.prompts)?.get(user_id).cloned())
    }

    async fn put_prompts(&self, record: &PromptRecord) -> Result<()> {
        write(&self.prompts)?.insert(record.user_id.clone(), record.clone());
        Ok(())
    }
}
