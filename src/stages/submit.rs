//! Submit an upload to document intelligence and hand the job to polling.

use std::sync::Arc;

use async_trait::async_trait;
use docflow_core::error::PipelineError;
use docflow_core::message::{file_extension, FileTrack, MessageKind, PipelineMessage, SubmitMessage};
use docflow_core::models::State;
use docflow_core::retry::RequeueDecision;
use docflow_core::status_log::{StatusEntry, StatusLog};
use rand::Rng;
use tracing::info;

use super::{quarantine, save_status, Disposition, Services, Stage, StageContext};
use crate::blob::BlobUri;
use crate::doc_intel::SubmitOutcome;

const STAGE: &str = "submit";

pub struct Submitter {
    services: Arc<Services>,
}

/// Content type sent with the upload body.
pub fn content_type_for(name: &str) -> &'static str {
    match file_extension(name).as_deref() {
        Some("pdf") => "application/pdf",
        Some("htm") | Some("html") => "text/html",
        Some("txt") | Some("md") | Some("csv") => "text/plain",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        _ => "application/octet-stream",
    }
}

impl Submitter {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn submit(&self, log: &mut StatusLog, message: &SubmitMessage) -> Result<(), PipelineError> {
        let path = &message.blob_name;
        let endpoints = self.services.layout.endpoint_count();
        if endpoints == 0 {
            return Err(PipelineError::InvalidRequest(
                "no document intelligence endpoint configured".to_string(),
            ));
        }
        let endpoint_index = self.services.with_rng(|rng| rng.gen_range(0..endpoints));

        log.upsert(
            path,
            StatusEntry::info(format!(
                "Submitting to document intelligence endpoint {} (submission {})",
                endpoint_index, message.submit_queued_count
            ))
            .state(State::Processing),
        )
        .await;

        let uri = BlobUri::parse(&message.blob_uri)
            .map_err(|e| PipelineError::MalformedMessage(e.to_string()))?;
        let content = self.services.blobs.read(&uri).await?;

        let outcome = self
            .services
            .layout
            .submit(endpoint_index, content, content_type_for(path))
            .await?;

        let policy = self.services.policy();
        match outcome {
            SubmitOutcome::Accepted { result_id } => {
                let delay_secs = self.services.with_rng(|rng| policy.spread_delay(rng));
                let poll = message.clone().into_poll(&result_id, endpoint_index);
                let body = PipelineMessage::Poll(poll).encode()?;
                let queue = &self.services.config.queues.pdf_polling;
                self.services.queue.send(queue, &body, delay_secs).await?;
                info!(file = %path, result_id = %result_id, "analysis submitted");
                log.upsert(
                    path,
                    StatusEntry::info(format!(
                        "Analysis job {} accepted, polling in {} seconds",
                        result_id, delay_secs
                    ))
                    .state(State::Queued),
                )
                .await;
            }
            SubmitOutcome::Throttled { status, .. } => match policy.resubmit(message.submit_queued_count) {
                RequeueDecision::Requeue { delay_secs, .. } => {
                    let track = FileTrack::classify(path).unwrap_or(FileTrack::Pdf);
                    let body = PipelineMessage::Submit(message.requeued()).encode()?;
                    self.services
                        .queue
                        .send(self.services.submit_queue(track), &body, delay_secs)
                        .await?;
                    log.upsert(
                        path,
                        StatusEntry::info(format!(
                            "Document intelligence busy (HTTP {}), resubmitting in {} seconds",
                            status, delay_secs
                        ))
                        .state(State::Throttled),
                    )
                    .await;
                }
                RequeueDecision::Exhausted => {
                    return Err(PipelineError::Exhausted(format!(
                        "maximum submissions ({}) to document intelligence reached",
                        policy.max_submit_requeue_count
                    )));
                }
            },
            SubmitOutcome::Rejected { status, body } => {
                return Err(PipelineError::InvalidRequest(format!(
                    "document intelligence rejected the submission with HTTP {}: {}",
                    status, body
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for Submitter {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn queues(&self) -> Vec<String> {
        let queues = &self.services.config.queues;
        vec![queues.pdf_submit.clone(), queues.non_pdf_submit.clone()]
    }

    async fn handle(&self, body: &str) -> Disposition {
        let message = match PipelineMessage::decode(MessageKind::Submit, body) {
            Ok(PipelineMessage::Submit(m)) => m,
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
        if let Err(e) = self.submit(&mut log, &message).await {
            StageContext::new(STAGE, &message.blob_name, body)
                .record_failure(&mut log, &e)
                .await;
        }
        save_status(&mut log, &message.blob_name).await;
        Disposition::Done
    }
}
