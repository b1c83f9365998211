//! End-to-end runs of the stages over in-memory queues, blobs and status
//! store, with scripted layout and completion services.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docflow::blob::{llm_output_name, merged_chunk_name, BlobStore, Metadata, MemoryBlobStore};
use docflow::config::{parse_config, WorkerConfig};
use docflow::doc_intel::{classify_poll_body, LayoutService, PollOutcome, SubmitOutcome};
use docflow::llm::{ChatRequest, CompletionReply, CompletionService};
use docflow::queue::{MemoryQueue, Queue};
use docflow::stages::{
    DispatchOutcome, Dispatcher, PollingCoordinator, PromptExecutor, Services, Stage, Submitter,
    Upload,
};
use docflow::worker::Worker;
use docflow_core::error::PipelineError;
use docflow_core::message::{MessageKind, PipelineMessage};
use docflow_core::models::{
    encode_id, ChunkLogRecord, DocumentStatusRecord, LlmOutputRecord, State, StatusClassification,
};
use docflow_core::prompt_log::PromptLog;
use docflow_core::store::memory::InMemoryStore;
use docflow_core::store::{DocumentQuery, StatusBackend};
use serde_json::json;

const PDF: &str = "upload/alice/report.pdf";
const SUBMIT_Q: &str = "pdf-submit-queue";
const POLL_Q: &str = "pdf-polling-queue";
const CHUNKS_Q: &str = "chunks-queue";

/// Three 36-character paragraphs: three chunks of 9 tokens, merged into two.
fn analysis_body() -> String {
    analysis_of(&["a", "b", "c"])
}

/// One 36-character paragraph per letter.
fn analysis_of(letters: &[&str]) -> String {
    let paragraphs: Vec<serde_json::Value> = letters
        .iter()
        .enumerate()
        .map(|(i, letter)| {
            json!({
                "content": letter.repeat(36),
                "spans": [{ "offset": i * 40, "length": 36 }],
                "boundingRegions": [{ "pageNumber": i + 1 }]
            })
        })
        .collect();
    json!({
        "status": "succeeded",
        "analyzeResult": { "content": "", "paragraphs": paragraphs }
    })
    .to_string()
}

fn completion(finish_reason: &str, content: &str) -> CompletionReply {
    CompletionReply {
        status: 200,
        body: json!({
            "choices": [{
                "finish_reason": finish_reason,
                "message": { "role": "assistant", "content": content }
            }],
            "usage": { "completion_tokens": 10, "prompt_tokens": 20, "total_tokens": 30 }
        })
        .to_string(),
    }
}

#[derive(Default)]
struct FakeLayout {
    submits: Mutex<VecDeque<SubmitOutcome>>,
    polls: Mutex<VecDeque<PollOutcome>>,
    submitted: Mutex<Vec<(usize, String)>>,
}

impl FakeLayout {
    fn script_submit(&self, outcome: SubmitOutcome) {
        self.submits.lock().unwrap().push_back(outcome);
    }

    fn script_poll(&self, outcome: PollOutcome) {
        self.polls.lock().unwrap().push_back(outcome);
    }
}

#[async_trait]
impl LayoutService for FakeLayout {
    fn endpoint_count(&self) -> usize {
        1
    }

    async fn submit(
        &self,
        endpoint_index: usize,
        _content: Vec<u8>,
        content_type: &str,
    ) -> Result<SubmitOutcome, PipelineError> {
        self.submitted
            .lock()
            .unwrap()
            .push((endpoint_index, content_type.to_string()));
        Ok(self
            .submits
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SubmitOutcome::Accepted {
                result_id: "job-1".to_string(),
            }))
    }

    async fn poll(
        &self,
        _endpoint_index: usize,
        _result_id: &str,
    ) -> Result<PollOutcome, PipelineError> {
        match self.polls.lock().unwrap().pop_front() {
            Some(outcome) => Ok(outcome),
            None => classify_poll_body(analysis_body()),
        }
    }
}

#[derive(Default)]
struct FakeLlm {
    replies: Mutex<VecDeque<CompletionReply>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl FakeLlm {
    fn script(&self, reply: CompletionReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for FakeLlm {
    async fn complete(&self, request: &ChatRequest) -> Result<CompletionReply, PipelineError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| completion("stop", "summary")))
    }
}

/// Status backend whose fan-in count read always fails.
struct FailingFanIn(Arc<InMemoryStore>);

#[async_trait]
impl StatusBackend for FailingFanIn {
    async fn get_document(&self, id: &str) -> anyhow::Result<Option<DocumentStatusRecord>> {
        self.0.get_document(id).await
    }

    async fn put_document(&self, record: &DocumentStatusRecord) -> anyhow::Result<()> {
        self.0.put_document(record).await
    }

    async fn delete_document(&self, id: &str) -> anyhow::Result<bool> {
        self.0.delete_document(id).await
    }

    async fn set_document_state(
        &self,
        id: &str,
        state: State,
        at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        self.0.set_document_state(id, state, at).await
    }

    async fn merged_chunk_count(&self, _file_path: &str) -> anyhow::Result<Option<i64>> {
        anyhow::bail!("store unavailable")
    }

    async fn query_documents(
        &self,
        query: &DocumentQuery,
    ) -> anyhow::Result<Vec<DocumentStatusRecord>> {
        self.0.query_documents(query).await
    }

    async fn put_chunk_log(&self, record: &ChunkLogRecord) -> anyhow::Result<()> {
        self.0.put_chunk_log(record).await
    }

    async fn get_chunk_log(&self, id: &str) -> anyhow::Result<Option<ChunkLogRecord>> {
        self.0.get_chunk_log(id).await
    }

    async fn count_chunks(&self, file_path: &str, state: State) -> anyhow::Result<i64> {
        self.0.count_chunks(file_path, state).await
    }

    async fn list_chunk_logs(&self, file_path: &str) -> anyhow::Result<Vec<ChunkLogRecord>> {
        self.0.list_chunk_logs(file_path).await
    }

    async fn delete_chunk_logs(&self, file_path: &str) -> anyhow::Result<u64> {
        self.0.delete_chunk_logs(file_path).await
    }

    async fn put_llm_output(&self, record: &LlmOutputRecord) -> anyhow::Result<()> {
        self.0.put_llm_output(record).await
    }

    async fn get_llm_output(&self, id: &str) -> anyhow::Result<Option<LlmOutputRecord>> {
        self.0.get_llm_output(id).await
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    queue: Arc<MemoryQueue>,
    blobs: Arc<MemoryBlobStore>,
    layout: Arc<FakeLayout>,
    llm: Arc<FakeLlm>,
    services: Arc<Services>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_status(|store| store as Arc<dyn StatusBackend>).await
    }

    /// Harness whose stages write status through `status(store)`.
    async fn with_status(
        status: impl FnOnce(Arc<InMemoryStore>) -> Arc<dyn StatusBackend>,
    ) -> Self {
        let config = parse_config(
            r#"
[db]
path = "/unused/docflow.sqlite"

[storage]
root = "/unused/blobs"

[chunking]
chunk_target_size = 10
merged_chunk_target_size = 20

[dispatch]
jitter_min_ms = 0
jitter_max_ms = 0

[retry]
max_submit_requeue_count = 3
max_polling_requeue_count = 3
"#,
        )
        .unwrap();

        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let blobs = Arc::new(MemoryBlobStore::new("local"));
        let layout = Arc::new(FakeLayout::default());
        let llm = Arc::new(FakeLlm::default());
        let services = Services::new(
            Arc::new(config),
            status(store.clone()),
            store.clone(),
            queue.clone(),
            blobs.clone(),
            layout.clone(),
            llm.clone(),
        )
        .with_seed(7);

        PromptLog::new(store.clone()).ensure_seeded().await.unwrap();

        Self {
            store,
            queue,
            blobs,
            layout,
            llm,
            services: Arc::new(services),
        }
    }

    /// Write `path` (`{container}/{name}`) and dispatch it.
    async fn upload(&self, path: &str, prompt_id: Option<&str>) -> DispatchOutcome {
        let (container, name) = path.split_once('/').unwrap();
        let mut metadata = Metadata::new();
        if let Some(prompt_id) = prompt_id {
            metadata.insert("prompt_id".to_string(), prompt_id.to_string());
        }
        let uri = self
            .blobs
            .write(container, name, b"%PDF-1.7", &metadata)
            .await
            .unwrap();
        Dispatcher::new(self.services.clone())
            .dispatch(&Upload {
                name: path.to_string(),
                uri: uri.to_string(),
                metadata,
            })
            .await
    }

    async fn run(&self, stage: Arc<dyn Stage>) -> usize {
        Worker::new(stage, self.queue.clone(), WorkerConfig::default())
            .drain(100)
            .await
            .unwrap()
    }

    async fn submit(&self) -> usize {
        self.run(Arc::new(Submitter::new(self.services.clone()))).await
    }

    async fn poll(&self) -> usize {
        self.run(Arc::new(PollingCoordinator::new(self.services.clone())))
            .await
    }

    async fn execute(&self) -> usize {
        self.run(Arc::new(PromptExecutor::new(self.services.clone())))
            .await
    }

    async fn doc(&self, path: &str) -> DocumentStatusRecord {
        self.store
            .get_document(&encode_id(path))
            .await
            .unwrap()
            .unwrap()
    }

    async fn set_prompt(&self, user: &str, prompt_id: &str, text: &str) {
        PromptLog::new(self.store.clone())
            .set_prompt(user, prompt_id, text)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_pdf_runs_to_completion() {
    let h = Harness::new().await;

    match h.upload(PDF, None).await {
        DispatchOutcome::Queued { queue, delay_secs } => {
            assert_eq!(queue, SUBMIT_Q);
            assert!((1..=300).contains(&delay_secs));
        }
        other => panic!("unexpected dispatch outcome {:?}", other),
    }
    assert_eq!(h.doc(PDF).await.state, State::Queued);

    assert_eq!(h.submit().await, 1);
    assert_eq!(
        *h.layout.submitted.lock().unwrap(),
        vec![(0, "application/pdf".to_string())]
    );
    assert_eq!(h.doc(PDF).await.state, State::Queued);
    assert_eq!(h.queue.sent(POLL_Q).len(), 1);

    assert_eq!(h.poll().await, 1);
    let doc = h.doc(PDF).await;
    assert_eq!(doc.state, State::Queued);
    assert_eq!(doc.chunk_count, 3);
    assert_eq!(doc.merged_chunk_count, 2);
    assert_eq!(
        h.blobs.list("logs", "upload/alice/report.pdf/"),
        vec!["upload/alice/report.pdf/doc_intel_response.json".to_string()]
    );
    assert_eq!(h.blobs.list("content", "upload/alice/report.pdf/chunks/").len(), 3);
    assert_eq!(h.blobs.list("content", "upload/alice/report.pdf/merged/").len(), 2);
    assert_eq!(h.queue.sent(CHUNKS_Q).len(), 2);

    assert_eq!(h.execute().await, 2);
    let doc = h.doc(PDF).await;
    assert_eq!(doc.state, State::Complete);
    assert_eq!(h.store.count_chunks(PDF, State::Complete).await.unwrap(), 2);
    assert_eq!(h.blobs.list("content", "upload/alice/report.pdf/llm/").len(), 2);

    let requests = h.llm.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].messages[0].role, "system");
    assert!(requests[0].messages[1].content.contains("\ninput text:"));

    let logs = h.store.list_chunk_logs(PDF).await.unwrap();
    assert!(logs
        .iter()
        .all(|l| l.additional_info == "llm_completion_tokens: 10, llm_prompt_tokens: 20, llm_total_tokens: 30"));

    let output_uri = h
        .blobs
        .uri("content", &llm_output_name(PDF, &merged_chunk_name(PDF, 0)))
        .to_string();
    let output = h
        .store
        .get_llm_output(&encode_id(&output_uri))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(output.user_id, "default");
    assert_eq!(output.llm_output, "summary");
    assert_eq!(output.usage.total_tokens, 30);
}

#[tokio::test]
async fn test_user_prompt_resolved_from_upload_path() {
    let h = Harness::new().await;
    h.set_prompt("alice", "legal", "Find the clauses.").await;

    h.upload(PDF, Some("legal")).await;
    h.submit().await;
    h.poll().await;
    h.execute().await;

    assert_eq!(h.doc(PDF).await.state, State::Complete);
    let requests = h.llm.requests();
    assert!(requests[0].messages[1]
        .content
        .starts_with("Find the clauses.\ninput text:aaaa"));
}

#[tokio::test]
async fn test_missing_prompt_errors_the_chunks() {
    let h = Harness::new().await;

    h.upload(PDF, Some("nope")).await;
    h.submit().await;
    h.poll().await;
    assert_eq!(h.execute().await, 2);

    assert!(h.llm.requests().is_empty());
    assert_eq!(h.store.count_chunks(PDF, State::Error).await.unwrap(), 2);
    let logs = h.store.list_chunk_logs(PDF).await.unwrap();
    assert!(logs[0].additional_info.contains("no prompt 'nope' for user 'alice'"));
    assert_eq!(h.doc(PDF).await.state, State::Queued);
}

#[tokio::test]
async fn test_unsupported_upload_is_skipped() {
    let h = Harness::new().await;

    let outcome = h.upload("upload/alice/archive.zip", None).await;
    assert_eq!(outcome, DispatchOutcome::Unsupported);
    assert_eq!(h.doc("upload/alice/archive.zip").await.state, State::Skipped);
    assert!(h.queue.sent(SUBMIT_Q).is_empty());
    assert!(h.queue.sent("non-pdf-submit-queue").is_empty());
}

#[tokio::test]
async fn test_non_pdf_routes_to_its_own_queue() {
    let h = Harness::new().await;

    let outcome = h.upload("upload/notes.txt", None).await;
    assert!(matches!(outcome, DispatchOutcome::Queued { ref queue, .. } if queue == "non-pdf-submit-queue"));
    assert_eq!(h.submit().await, 1);
    assert_eq!(h.layout.submitted.lock().unwrap()[0].1, "text/plain");
    assert_eq!(h.queue.sent(POLL_Q).len(), 1);
}

#[tokio::test]
async fn test_reupload_starts_a_fresh_record() {
    let h = Harness::new().await;

    h.upload(PDF, None).await;
    h.submit().await;
    h.poll().await;
    h.execute().await;
    assert_eq!(h.doc(PDF).await.state, State::Complete);

    h.upload(PDF, None).await;
    let doc = h.doc(PDF).await;
    assert_eq!(doc.state, State::Queued);
    assert_eq!(doc.merged_chunk_count, -1);
    assert_eq!(doc.status_updates.len(), 2);
    assert!(h.store.list_chunk_logs(PDF).await.unwrap().is_empty());

    // The second run is shorter than the first and still completes.
    h.layout
        .script_poll(classify_poll_body(analysis_of(&["z"])).unwrap());
    h.submit().await;
    h.poll().await;
    assert_eq!(h.doc(PDF).await.merged_chunk_count, 1);
    h.execute().await;

    let doc = h.doc(PDF).await;
    assert_eq!(doc.state, State::Complete);
    assert_eq!(h.store.list_chunk_logs(PDF).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_throttled_submit_requeues_until_exhausted() {
    let h = Harness::new().await;
    for _ in 0..3 {
        h.layout.script_submit(SubmitOutcome::Throttled {
            status: 429,
            body: String::new(),
        });
    }

    h.upload(PDF, None).await;
    // Attempts 1 and 2 requeue; attempt 3 hits the ceiling.
    assert_eq!(h.submit().await, 3);

    let sent = h.queue.sent(SUBMIT_Q);
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[1].delay_secs, 60);
    let PipelineMessage::Submit(last) =
        PipelineMessage::decode(MessageKind::Submit, &sent[2].body).unwrap()
    else {
        panic!("expected a submit message");
    };
    assert_eq!(last.submit_queued_count.get(), 3);

    let doc = h.doc(PDF).await;
    assert_eq!(doc.state, State::Error);
    assert!(doc
        .status_updates
        .iter()
        .any(|u| u.status.contains("Document intelligence busy (HTTP 429)")));
    assert!(h.queue.sent(POLL_Q).is_empty());
}

#[tokio::test]
async fn test_rejected_submit_is_an_error() {
    let h = Harness::new().await;
    h.layout.script_submit(SubmitOutcome::Rejected {
        status: 400,
        body: "bad file".to_string(),
    });

    h.upload(PDF, None).await;
    h.submit().await;

    let doc = h.doc(PDF).await;
    assert_eq!(doc.state, State::Error);
    let last = doc.status_updates.last().unwrap();
    assert_eq!(last.status_classification, StatusClassification::Error);
    assert!(last.status.contains("HTTP 400"));
    assert!(last.stack_trace.is_some());
}

#[tokio::test]
async fn test_running_job_is_polled_again_with_backoff() {
    let h = Harness::new().await;
    h.layout.script_poll(PollOutcome::Running);

    h.upload(PDF, None).await;
    h.submit().await;
    assert_eq!(h.poll().await, 2);

    let sent = h.queue.sent(POLL_Q);
    assert_eq!(sent.len(), 2);
    // 30 * 1² plus up to 10 seconds of jitter.
    assert!((30..=40).contains(&sent[1].delay_secs));
    assert_eq!(h.doc(PDF).await.merged_chunk_count, 2);
}

#[tokio::test]
async fn test_polling_gives_up_after_ceiling() {
    let h = Harness::new().await;
    for _ in 0..3 {
        h.layout.script_poll(PollOutcome::Running);
    }

    h.upload(PDF, None).await;
    h.submit().await;
    assert_eq!(h.poll().await, 3);

    let doc = h.doc(PDF).await;
    assert_eq!(doc.state, State::Error);
    assert!(doc.status_updates.last().unwrap().status.contains("still running"));
    assert!(h.queue.sent(CHUNKS_Q).is_empty());
}

#[tokio::test]
async fn test_unexpected_job_status_resubmits() {
    let h = Harness::new().await;
    h.layout.script_poll(PollOutcome::Unexpected {
        status: "failed".to_string(),
    });

    h.upload(PDF, None).await;
    h.submit().await;
    assert_eq!(h.poll().await, 1);

    assert_eq!(h.doc(PDF).await.state, State::Throttled);
    let sent = h.queue.sent(SUBMIT_Q);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].delay_secs, 60);

    // The resubmission goes through the whole pipeline again.
    h.submit().await;
    h.poll().await;
    h.execute().await;
    assert_eq!(h.doc(PDF).await.state, State::Complete);
}

#[tokio::test]
async fn test_poll_http_error_is_terminal() {
    let h = Harness::new().await;
    h.layout.script_poll(PollOutcome::HttpError {
        status: 500,
        body: "boom".to_string(),
    });

    h.upload(PDF, None).await;
    h.submit().await;
    h.poll().await;

    let doc = h.doc(PDF).await;
    assert_eq!(doc.state, State::Error);
    assert!(doc.status_updates.last().unwrap().status.contains("HTTP 500"));
}

#[tokio::test]
async fn test_redelivered_poll_does_not_fan_out_twice() {
    let h = Harness::new().await;
    h.upload(PDF, None).await;
    h.submit().await;

    let body = h.queue.drain(POLL_Q).pop().unwrap();
    let stage = PollingCoordinator::new(h.services.clone());
    stage.handle(&body).await;
    stage.handle(&body).await;

    assert_eq!(h.queue.sent(CHUNKS_Q).len(), 2);
    let doc = h.doc(PDF).await;
    assert_eq!(doc.state, State::Queued);
    assert_eq!(doc.merged_chunk_count, 2);
}

#[tokio::test]
async fn test_empty_analysis_completes_immediately() {
    let h = Harness::new().await;
    h.layout.script_poll(
        classify_poll_body(json!({ "status": "succeeded", "analyzeResult": {} }).to_string())
            .unwrap(),
    );

    h.upload(PDF, None).await;
    h.submit().await;
    h.poll().await;

    let doc = h.doc(PDF).await;
    assert_eq!(doc.state, State::Complete);
    assert_eq!(doc.chunk_count, 0);
    assert_eq!(doc.merged_chunk_count, 0);
    assert!(h.queue.sent(CHUNKS_Q).is_empty());
}

#[tokio::test]
async fn test_content_filtered_chunk_blocks_completion() {
    let h = Harness::new().await;
    h.llm.script(completion("content_filter", ""));

    h.upload(PDF, None).await;
    h.submit().await;
    h.poll().await;
    h.execute().await;

    assert_eq!(h.store.count_chunks(PDF, State::Skipped).await.unwrap(), 1);
    assert_eq!(h.store.count_chunks(PDF, State::Complete).await.unwrap(), 1);
    assert_eq!(h.doc(PDF).await.state, State::Queued);
}

#[tokio::test]
async fn test_throttled_completion_requeues_the_chunk() {
    let h = Harness::new().await;
    h.llm.script(CompletionReply {
        status: 429,
        body: String::new(),
    });

    h.upload(PDF, None).await;
    h.submit().await;
    h.poll().await;
    assert_eq!(h.execute().await, 3);

    let sent = h.queue.sent(CHUNKS_Q);
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[2].delay_secs, 60);
    let PipelineMessage::Chunk(requeued) =
        PipelineMessage::decode(MessageKind::Chunk, &sent[2].body).unwrap()
    else {
        panic!("expected a chunk message");
    };
    assert_eq!(requeued.chunk_queued_count.get(), 2);
    assert_eq!(h.doc(PDF).await.state, State::Complete);
}

#[tokio::test]
async fn test_completion_order_does_not_matter() {
    let h = Harness::new().await;
    h.upload(PDF, None).await;
    h.submit().await;
    h.poll().await;

    let mut bodies = h.queue.drain(CHUNKS_Q);
    assert_eq!(bodies.len(), 2);
    bodies.reverse();
    let executor = PromptExecutor::new(h.services.clone());

    // merged-1 first: one of two chunks done.
    assert!(bodies[0].contains("report-merged-1.json"));
    executor.handle(&bodies[0]).await;
    assert_eq!(h.store.count_chunks(PDF, State::Complete).await.unwrap(), 1);
    assert_eq!(h.doc(PDF).await.state, State::Queued);

    executor.handle(&bodies[1]).await;
    assert_eq!(h.doc(PDF).await.state, State::Complete);
}

#[tokio::test]
async fn test_failed_fan_in_check_keeps_chunks_complete() {
    let h = Harness::with_status(|store| Arc::new(FailingFanIn(store)) as Arc<dyn StatusBackend>)
        .await;
    h.upload(PDF, None).await;
    h.submit().await;
    h.poll().await;
    assert_eq!(h.execute().await, 2);

    let logs = h.store.list_chunk_logs(PDF).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|l| l.chunk_state == State::Complete));
    assert_eq!(h.store.count_chunks(PDF, State::Error).await.unwrap(), 0);
    assert_eq!(h.doc(PDF).await.state, State::Queued);
}

#[tokio::test]
async fn test_repeated_throttling_exhausts_the_chunk() {
    let h = Harness::new().await;
    // Three throttled replies for each of the two chunks.
    for _ in 0..6 {
        h.llm.script(CompletionReply {
            status: 429,
            body: String::new(),
        });
    }

    h.upload(PDF, None).await;
    h.submit().await;
    h.poll().await;
    assert_eq!(h.execute().await, 6);

    // Two fan-out messages plus two requeues per chunk.
    assert_eq!(h.queue.sent(CHUNKS_Q).len(), 6);
    let logs = h.store.list_chunk_logs(PDF).await.unwrap();
    assert_eq!(logs.len(), 2);
    for log in &logs {
        assert_eq!(log.chunk_state, State::Error);
        assert!(log.additional_info.contains("maximum submissions (3)"));
    }
    assert_eq!(h.doc(PDF).await.state, State::Queued);
}

#[tokio::test]
async fn test_bad_completion_request_errors_the_chunk() {
    let h = Harness::new().await;
    h.llm.script(CompletionReply {
        status: 400,
        body: "context length exceeded".to_string(),
    });

    h.upload(PDF, None).await;
    h.submit().await;
    h.poll().await;
    h.execute().await;

    let logs = h.store.list_chunk_logs(PDF).await.unwrap();
    let errored: Vec<_> = logs.iter().filter(|l| l.chunk_state == State::Error).collect();
    assert_eq!(errored.len(), 1);
    assert!(errored[0].additional_info.contains("context length exceeded"));
    assert_eq!(h.doc(PDF).await.state, State::Queued);
}

#[tokio::test]
async fn test_malformed_message_goes_to_poison_queue() {
    let h = Harness::new().await;
    h.queue.send(CHUNKS_Q, "{not json", 0).await.unwrap();
    h.queue
        .send(CHUNKS_Q, &json!({ "blob_name": PDF }).to_string(), 0)
        .await
        .unwrap();

    assert_eq!(h.execute().await, 2);
    assert_eq!(h.queue.sent("chunks-queue-poison").len(), 2);
    assert!(h.llm.requests().is_empty());
    assert_eq!(h.queue.depth(CHUNKS_Q).await.unwrap(), 0);
}
