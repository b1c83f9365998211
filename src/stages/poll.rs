//! Stage 2: poll an analysis job, then chunk, merge and fan out.
//!
//! | Poll result | Action | State |
//! |-------------|--------|-------|
//! | 200 `succeeded` | write artifacts, save counts, send one chunk message per merged chunk | Queued |
//! | 200 `running` | requeue to polling with `base * n²` + jitter, until `max_polling_requeue_count` | Queued / Error |
//! | 200 other | resubmit the job, until `max_submit_requeue_count` | Throttled / Error |
//! | non-200 | give up | Error |

use std::sync::Arc;

use async_trait::async_trait;
use docflow_core::chunk::{build_chunks, merge_chunks, StoredChunk};
use docflow_core::docmap::{build_document_map, AnalyzeResult};
use docflow_core::error::PipelineError;
use docflow_core::message::{file_extension, FileTrack, MessageKind, PipelineMessage, PollMessage};
use docflow_core::models::{base_name, encode_id, State};
use docflow_core::retry::RequeueDecision;
use docflow_core::status_log::{StatusEntry, StatusLog};
use tracing::{debug, info};

use super::{quarantine, save_status, Disposition, Services, Stage, StageContext};
use crate::blob::{chunk_name, doc_intel_response_name, merged_chunk_name, Metadata};
use crate::doc_intel::PollOutcome;

const STAGE: &str = "poll";

pub struct PollingCoordinator {
    services: Arc<Services>,
}

impl PollingCoordinator {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn poll(&self, log: &mut StatusLog, message: &PollMessage) -> Result<(), PipelineError> {
        let path = &message.blob_name;
        log.upsert(
            path,
            StatusEntry::debug(format!(
                "Polling analysis job {} on endpoint {} (poll {})",
                message.result_id, message.endpoint_index, message.polling_queue_count
            ))
            .state(State::Processing),
        )
        .await;

        let outcome = self
            .services
            .layout
            .poll(message.endpoint_index, &message.result_id)
            .await?;

        match outcome {
            PollOutcome::Succeeded { raw, result } => self.fan_out(log, message, &raw, &result).await,
            PollOutcome::Running => self.requeue_poll(log, message).await,
            PollOutcome::Unexpected { status } => self.resubmit(log, message, &status).await,
            PollOutcome::HttpError { status, body } => Err(PipelineError::ServiceAnomaly(format!(
                "analysis poll returned HTTP {}: {}",
                status, body
            ))),
        }
    }

    async fn requeue_poll(&self, log: &mut StatusLog, message: &PollMessage) -> Result<(), PipelineError> {
        let policy = self.services.policy();
        let decision = self
            .services
            .with_rng(|rng| policy.polling(message.polling_queue_count, rng));
        match decision {
            RequeueDecision::Requeue { delay_secs, next } => {
                let body = PipelineMessage::Poll(message.requeued()).encode()?;
                self.services
                    .queue
                    .send(&self.services.config.queues.pdf_polling, &body, delay_secs)
                    .await?;
                log.upsert(
                    &message.blob_name,
                    StatusEntry::info(format!(
                        "Analysis still running, poll {} in {} seconds",
                        next, delay_secs
                    ))
                    .state(State::Queued),
                )
                .await;
                Ok(())
            }
            RequeueDecision::Exhausted => Err(PipelineError::Exhausted(format!(
                "analysis job {} still running after {} polls",
                message.result_id, message.polling_queue_count
            ))),
        }
    }

    async fn resubmit(
        &self,
        log: &mut StatusLog,
        message: &PollMessage,
        status: &str,
    ) -> Result<(), PipelineError> {
        let policy = self.services.policy();
        match policy.resubmit(message.submit_queued_count) {
            RequeueDecision::Requeue { delay_secs, next } => {
                let track = FileTrack::classify(&message.blob_name).unwrap_or(FileTrack::Pdf);
                let body = PipelineMessage::Submit(message.resubmission()).encode()?;
                self.services
                    .queue
                    .send(self.services.submit_queue(track), &body, delay_secs)
                    .await?;
                log.upsert(
                    &message.blob_name,
                    StatusEntry::error(format!(
                        "Analysis job {} reported status '{}', resubmitting (submission {}) in {} seconds",
                        message.result_id, status, next, delay_secs
                    ))
                    .state(State::Throttled),
                )
                .await;
                Ok(())
            }
            RequeueDecision::Exhausted => Err(PipelineError::Exhausted(format!(
                "analysis job {} reported status '{}' and the maximum of {} submissions was reached",
                message.result_id, status, policy.max_submit_requeue_count
            ))),
        }
    }

    async fn fan_out(
        &self,
        log: &mut StatusLog,
        message: &PollMessage,
        raw: &str,
        result: &AnalyzeResult,
    ) -> Result<(), PipelineError> {
        let path = &message.blob_name;

        // A redelivered completion must not send the chunk messages twice.
        // This is a read then a write, so it only covers sequential
        // redelivery; two copies polled at the same moment can both pass.
        let persisted = self.services.status.get_document(&encode_id(path)).await?;
        if let Some(record) = persisted.filter(|r| r.fan_out_known()) {
            // Restore whatever state the chunks have driven the document to.
            log.upsert(
                path,
                StatusEntry::info(format!(
                    "Analysis job {} already fanned out into {} merged chunks, ignoring",
                    message.result_id, record.merged_chunk_count
                ))
                .state(record.state),
            )
            .await;
            return Ok(());
        }

        let storage = &self.services.config.storage;
        let blobs = &self.services.blobs;
        let no_metadata = Metadata::new();

        blobs
            .write(
                &storage.log_container,
                &doc_intel_response_name(path),
                raw.as_bytes(),
                &no_metadata,
            )
            .await?;

        let map = build_document_map(base_name(path), &message.blob_uri, result);
        let chunks = build_chunks(&map, self.services.config.chunking.chunk_target_size);

        let mut stored = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.into_iter().enumerate() {
            let name = chunk_name(path, i);
            let uri = blobs
                .write(
                    &storage.output_container,
                    &name,
                    &serde_json::to_vec(&chunk)?,
                    &no_metadata,
                )
                .await?;
            stored.push(StoredChunk {
                name,
                uri: uri.to_string(),
                chunk,
            });
        }

        let file_class = file_extension(path).unwrap_or_default();
        let merged = merge_chunks(
            &stored,
            self.services.config.chunking.merged_chunk_target_size,
            &file_class,
        );

        let mut targets = Vec::with_capacity(merged.len());
        for (i, group) in merged.iter().enumerate() {
            let name = merged_chunk_name(path, i);
            let uri = blobs
                .write(
                    &storage.output_container,
                    &name,
                    &serde_json::to_vec(group)?,
                    &no_metadata,
                )
                .await?;
            targets.push((name, uri.to_string()));
        }

        let chunk_count = i64::try_from(stored.len()).unwrap_or(i64::MAX);
        let merged_count = i64::try_from(targets.len()).unwrap_or(i64::MAX);

        if targets.is_empty() {
            log.upsert(
                path,
                StatusEntry::info("Analysis produced no text, nothing to run")
                    .counts(chunk_count, 0)
                    .state(State::Complete),
            )
            .await;
            return Ok(());
        }

        // Totals are durable before any chunk can complete against them.
        log.upsert(
            path,
            StatusEntry::info(format!(
                "Split into {} chunks merged into {}, queueing merged chunks",
                chunk_count, merged_count
            ))
            .counts(chunk_count, merged_count)
            .state(State::Queued),
        )
        .await;
        log.save(path).await?;

        let policy = self.services.policy();
        for (name, uri) in &targets {
            let body = PipelineMessage::Chunk(message.fan_out(name, uri)).encode()?;
            let delay_secs = self.services.with_rng(|rng| policy.spread_delay(rng));
            self.services
                .queue
                .send(&self.services.config.queues.chunks, &body, delay_secs)
                .await?;
            debug!(chunk = %name, delay_secs, "chunk queued");
        }
        info!(file = %path, merged = merged_count, "fanned out");
        Ok(())
    }
}

#[async_trait]
impl Stage for PollingCoordinator {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn queues(&self) -> Vec<String> {
        vec![self.services.config.queues.pdf_polling.clone()]
    }

    async fn handle(&self, body: &str) -> Disposition {
        let message = match PipelineMessage::decode(MessageKind::Poll, body) {
            Ok(PipelineMessage::Poll(m)) => m,
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
        if let Err(e) = self.poll(&mut log, &message).await {
            StageContext::new(STAGE, &message.blob_name, body)
                .record_failure(&mut log, &e)
                .await;
        }
        save_status(&mut log, &message.blob_name).await;
        Disposition::Done
    }
}
