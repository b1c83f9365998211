//! Stage 3: run the user's prompt over one merged chunk.
//!
//! Each chunk reports its own state in the chunk log. The document itself
//! is only touched by the fan-in check after a chunk completes; the chunk
//! that completes last moves the document to Complete.

use std::sync::Arc;

use async_trait::async_trait;
use docflow_core::chunk::MergedChunk;
use docflow_core::error::PipelineError;
use docflow_core::message::{ChunkMessage, MessageKind, PipelineMessage};
use docflow_core::models::{LlmOutputEntry, State, TokenUsage, DEFAULT_PROMPT_ID, DEFAULT_USER_ID};
use docflow_core::prompt_log::PromptLog;
use docflow_core::retry::RequeueDecision;
use docflow_core::status_log::StatusLog;
use serde::Serialize;
use tracing::{error, info, warn};

use super::{quarantine, Disposition, Services, Stage, StageContext};
use crate::blob::{llm_output_name, user_id_from_uri, BlobUri, Metadata};
use crate::llm::{ChatRequest, CompletionOutcome};

const STAGE: &str = "execute";

/// LLM output artifact: the merged chunk plus what produced the answer.
#[derive(Debug, Serialize)]
struct LlmArtifact<'a> {
    #[serde(flatten)]
    merged: &'a MergedChunk,
    chunk_name: &'a str,
    chunk_blob_uri: &'a str,
    prompt_id: &'a str,
    response: &'a serde_json::Value,
}

pub struct PromptExecutor {
    services: Arc<Services>,
}

/// User owning the prompt. The default prompt belongs to the default user;
/// any other prompt to the user segment of the upload locator.
pub fn resolve_user_id(message: &ChunkMessage) -> Result<String, PipelineError> {
    if message.prompt_id == DEFAULT_PROMPT_ID {
        return Ok(DEFAULT_USER_ID.to_string());
    }
    user_id_from_uri(&message.blob_uri)
}

fn usage_info(usage: &TokenUsage) -> String {
    format!(
        "llm_completion_tokens: {}, llm_prompt_tokens: {}, llm_total_tokens: {}",
        usage.completion_tokens, usage.prompt_tokens, usage.total_tokens
    )
}

impl PromptExecutor {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn chunk_state(
        &self,
        log: &StatusLog,
        message: &ChunkMessage,
        state: State,
        info: &str,
    ) -> Result<(), PipelineError> {
        log.create_chunk_log_entry(
            &message.blob_name,
            &message.chunk_blob_uri,
            &message.chunk_name,
            state,
            info,
        )
        .await
    }

    async fn execute(&self, log: &mut StatusLog, message: &ChunkMessage) -> Result<(), PipelineError> {
        self.chunk_state(
            log,
            message,
            State::Processing,
            &format!("prompt '{}', attempt {}", message.prompt_id, message.chunk_queued_count),
        )
        .await?;

        let user_id = resolve_user_id(message)?;
        let prompt = PromptLog::new(self.services.prompts.clone())
            .get_prompt(&user_id, &message.prompt_id)
            .await?;
        if prompt.is_empty() {
            return Err(PipelineError::InvalidRequest(format!(
                "no prompt '{}' for user '{}'",
                message.prompt_id, user_id
            )));
        }

        let chunk_uri = BlobUri::parse(&message.chunk_blob_uri)
            .map_err(|e| PipelineError::MalformedMessage(e.to_string()))?;
        let merged: MergedChunk = serde_json::from_slice(&self.services.blobs.read(&chunk_uri).await?)
            .map_err(|e| PipelineError::ServiceAnomaly(format!("unreadable merged chunk: {}", e)))?;

        let request = ChatRequest::build(&self.services.config.llm, &prompt, &merged.merged_content);
        let reply = self.services.llm.complete(&request).await?;

        match reply.interpret()? {
            CompletionOutcome::Completed {
                content,
                usage,
                response,
            } => {
                let artifact = LlmArtifact {
                    merged: &merged,
                    chunk_name: &message.chunk_name,
                    chunk_blob_uri: &message.chunk_blob_uri,
                    prompt_id: &message.prompt_id,
                    response: &response,
                };
                let output_name = llm_output_name(&message.blob_name, &message.chunk_name);
                let output_uri = self
                    .services
                    .blobs
                    .write(
                        &self.services.config.storage.output_container,
                        &output_name,
                        &serde_json::to_vec(&artifact)?,
                        &Metadata::new(),
                    )
                    .await?;

                log.create_llm_output_entry(&LlmOutputEntry {
                    file_path: &message.blob_name,
                    chunk_blob_uri: &message.chunk_blob_uri,
                    chunk_name: &message.chunk_name,
                    llm_output: &content,
                    llm_output_file: &output_uri.to_string(),
                    user_id: &user_id,
                    prompt_id: &message.prompt_id,
                    usage,
                })
                .await?;
                self.chunk_state(log, message, State::Complete, &usage_info(&usage))
                    .await?;

                // The chunk is already Complete; a failed check must not undo that.
                match log.mark_document_processing_complete(&message.blob_name).await {
                    Ok(true) => info!(file = %message.blob_name, "all chunks complete"),
                    Ok(false) => {}
                    Err(e) => warn!(file = %message.blob_name, "fan-in check failed: {}", e),
                }
            }
            CompletionOutcome::ContentFiltered => {
                // Never counted toward completion.
                self.chunk_state(log, message, State::Skipped, "completion blocked by the content filter")
                    .await?;
            }
            CompletionOutcome::Throttled => self.requeue(log, message).await?,
            CompletionOutcome::BadRequest { body } => {
                return Err(PipelineError::InvalidRequest(body));
            }
            CompletionOutcome::Unfinished { finish_reason } => {
                return Err(PipelineError::ServiceAnomaly(format!(
                    "completion finished with '{}'",
                    finish_reason
                )));
            }
            CompletionOutcome::Failed { status, body } => {
                return Err(PipelineError::ServiceAnomaly(format!(
                    "completion returned HTTP {}: {}",
                    status, body
                )));
            }
        }
        Ok(())
    }

    async fn requeue(&self, log: &StatusLog, message: &ChunkMessage) -> Result<(), PipelineError> {
        let policy = self.services.policy();
        match policy.resubmit(message.chunk_queued_count) {
            RequeueDecision::Requeue { delay_secs, next } => {
                let body = PipelineMessage::Chunk(message.requeued()).encode()?;
                self.services
                    .queue
                    .send(&self.services.config.queues.chunks, &body, delay_secs)
                    .await?;
                self.chunk_state(
                    log,
                    message,
                    State::Throttled,
                    &format!("completion throttled, attempt {} in {} seconds", next, delay_secs),
                )
                .await
            }
            RequeueDecision::Exhausted => Err(PipelineError::Exhausted(format!(
                "maximum submissions ({}) to the completion endpoint reached",
                policy.max_submit_requeue_count
            ))),
        }
    }
}

#[async_trait]
impl Stage for PromptExecutor {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn queues(&self) -> Vec<String> {
        vec![self.services.config.queues.chunks.clone()]
    }

    async fn handle(&self, body: &str) -> Disposition {
        let message = match PipelineMessage::decode(MessageKind::Chunk, body) {
            Ok(PipelineMessage::Chunk(m)) => m,
            Ok(other) => {
                return quarantine(
                    STAGE,
                    PipelineError::MalformedMessage(format!("unexpected {:?} message", other.kind())),
                    body,
                )
            }
            Err(e) => return quarantine(STAGE, e, body),
        };

        let mut log = self.services.status_log();
        if let Err(e) = self.execute(&mut log, &message).await {
            let ctx = StageContext::new(STAGE, &message.blob_name, body);
            let info = ctx.describe(&e);
            if let Err(write_err) = self
                .chunk_state(&log, &message, e.terminal_state(), &info)
                .await
            {
                error!(chunk = %message.chunk_name, "failed to record chunk error: {}", write_err);
            }
        }
        Disposition::Done
    }
}
