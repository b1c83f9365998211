//! Prompt lookup keyed by `(user_id, prompt_id)`.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::PipelineError;
use crate::models::{PromptRecord, DEFAULT_USER_ID};
use crate::store::PromptBackend;

pub struct PromptLog {
    backend: Arc<dyn PromptBackend>,
}

impl PromptLog {
    pub fn new(backend: Arc<dyn PromptBackend>) -> Self {
        Self { backend }
    }

    /// Seed the default user's record if the store has none yet.
    ///
    /// Returns `true` when the seed was written.
    pub async fn ensure_seeded(&self) -> Result<bool, PipelineError> {
        let existing = self
            .backend
            .get_prompts(DEFAULT_USER_ID)
            .await
            .map_err(PipelineError::storage)?;
        if existing.is_some() {
            return Ok(false);
        }
        self.backend
            .put_prompts(&PromptRecord::seeded_default())
            .await
            .map_err(PipelineError::storage)?;
        info!("seeded default prompt");
        Ok(true)
    }

    /// Prompt text, or an empty string when the user or prompt is unknown.
    ///
    /// Callers must treat `""` as not found.
    pub async fn get_prompt(&self, user_id: &str, prompt_id: &str) -> Result<String, PipelineError> {
        let record = self
            .backend
            .get_prompts(user_id)
            .await
            .map_err(PipelineError::storage)?;
        let prompt = record
            .as_ref()
            .and_then(|r| r.find(prompt_id))
            .unwrap_or_default()
            .to_string();
        if prompt.is_empty() {
            debug!(user_id, prompt_id, "no prompt found");
        }
        Ok(prompt)
    }

    /// Insert or replace one prompt in the user's record.
    pub async fn set_prompt(
        &self,
        user_id: &str,
        prompt_id: &str,
        prompt: &str,
    ) -> Result<(), PipelineError> {
        let mut record = self
            .backend
            .get_prompts(user_id)
            .await
            .map_err(PipelineError::storage)?
            .unwrap_or_else(|| PromptRecord::new(user_id, Vec::new()));
        record.set(prompt_id, prompt);
        self.backend
            .put_prompts(&record)
            .await
            .map_err(PipelineError::storage)
    }
}
