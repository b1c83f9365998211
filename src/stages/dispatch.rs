//! Stage 1: route a new upload to its submit queue.

use std::sync::Arc;
use std::time::Duration;

use docflow_core::error::PipelineError;
use docflow_core::message::{FileTrack, PipelineMessage, SubmitMessage};
use docflow_core::models::{State, DEFAULT_PROMPT_ID};
use docflow_core::status_log::{StatusEntry, StatusLog};
use rand::Rng;
use tracing::info;

use super::{save_status, Services, StageContext};
use crate::blob::Metadata;

/// Metadata key carrying the prompt to run against an upload.
pub const PROMPT_ID_METADATA_KEY: &str = "prompt_id";

/// A newly observed upload.
#[derive(Debug, Clone)]
pub struct Upload {
    /// `{container}/{path}`; doubles as the status-log document path.
    pub name: String,
    pub uri: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Queued { queue: String, delay_secs: u64 },
    Unsupported,
    Failed(String),
}

pub struct Dispatcher {
    services: Arc<Services>,
}

impl Dispatcher {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    pub async fn dispatch(&self, upload: &Upload) -> DispatchOutcome {
        self.jitter().await;

        let mut log = self.services.status_log();
        let outcome = match self.route(&mut log, upload).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let ctx = StageContext::new("dispatch", &upload.name, &upload.uri);
                ctx.record_failure(&mut log, &e).await;
                DispatchOutcome::Failed(e.to_string())
            }
        };
        save_status(&mut log, &upload.name).await;
        outcome
    }

    /// Desynchronize uploads that land at the same moment.
    async fn jitter(&self) {
        let dispatch = &self.services.config.dispatch;
        if dispatch.jitter_max_ms == 0 {
            return;
        }
        let ms = self
            .services
            .with_rng(|rng| rng.gen_range(dispatch.jitter_min_ms..=dispatch.jitter_max_ms));
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    async fn route(
        &self,
        log: &mut StatusLog,
        upload: &Upload,
    ) -> Result<DispatchOutcome, PipelineError> {
        let prompt_id = upload
            .metadata
            .get(PROMPT_ID_METADATA_KEY)
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_PROMPT_ID);

        log.upsert(
            &upload.name,
            StatusEntry::info(format!("File uploaded, prompt id '{}'", prompt_id))
                .state(State::Processing)
                .fresh_start(),
        )
        .await;

        let Some(track) = FileTrack::classify(&upload.name) else {
            log.upsert(
                &upload.name,
                StatusEntry::error(format!("Unsupported file type: {}", upload.name))
                    .state(State::Skipped),
            )
            .await;
            return Ok(DispatchOutcome::Unsupported);
        };

        let queue = self.services.submit_queue(track).to_string();
        let message = SubmitMessage::new(&upload.name, &upload.uri, prompt_id);
        let body = PipelineMessage::Submit(message).encode()?;
        let policy = self.services.policy();
        let delay_secs = self.services.with_rng(|rng| policy.spread_delay(rng));

        self.services.queue.send(&queue, &body, delay_secs).await?;
        info!(file = %upload.name, queue = %queue, delay_secs, "dispatched");

        log.upsert(
            &upload.name,
            StatusEntry::info(format!(
                "Queued to {} with a {} second delay",
                queue, delay_secs
            ))
            .state(State::Queued),
        )
        .await;
        Ok(DispatchOutcome::Queued { queue, delay_secs })
    }
}
