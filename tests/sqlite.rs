//! SQLite store and queue against a real database file.

use std::sync::Arc;

use docflow::db::connect_path;
use docflow::migrate::migrate_pool;
use docflow::queue::{Queue, SqliteQueue};
use docflow::sqlite_store::SqliteStore;
use docflow_core::models::{LlmOutputEntry, State, StatusQueryLevel, TokenUsage};
use docflow_core::prompt_log::PromptLog;
use docflow_core::status_log::{StatusEntry, StatusLog};
use docflow_core::store::StatusBackend;
use tempfile::TempDir;

const PATH: &str = "upload/alice/report.pdf";

async fn open() -> (TempDir, Arc<SqliteStore>, SqliteQueue) {
    let tmp = TempDir::new().unwrap();
    let pool = connect_path(&tmp.path().join("data/docflow.sqlite"))
        .await
        .unwrap();
    migrate_pool(&pool).await.unwrap();
    // Re-running migrations is harmless.
    migrate_pool(&pool).await.unwrap();
    (
        tmp,
        Arc::new(SqliteStore::new(pool.clone())),
        SqliteQueue::new(pool),
    )
}

#[tokio::test]
async fn test_status_record_roundtrip() {
    let (_tmp, store, _) = open().await;
    let mut log = StatusLog::new(store.clone());
    log.upsert(PATH, StatusEntry::info("queued").state(State::Queued).counts(5, 2))
        .await;
    log.upsert(PATH, StatusEntry::debug("detail").state(State::Queued))
        .await;
    log.save(PATH).await.unwrap();

    let verbose = log
        .read_by_id(PATH, StatusQueryLevel::Verbose)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(verbose.state, State::Queued);
    assert_eq!(verbose.chunk_count, 5);
    assert_eq!(verbose.merged_chunk_count, 2);
    assert_eq!(verbose.file_name, "report.pdf");
    assert_eq!(verbose.status_updates.len(), 2);

    let concise = log
        .read_by_id(PATH, StatusQueryLevel::Concise)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(concise.status_updates.len(), 1);

    let listed = log.read_by_timeframe(1, Some(State::Queued)).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(log
        .read_by_timeframe(-1, Some(State::Error))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_fan_in_on_sqlite() {
    let (_tmp, store, _) = open().await;
    let mut log = StatusLog::new(store.clone());
    log.upsert(PATH, StatusEntry::info("chunked").state(State::Queued).counts(3, 2))
        .await;
    log.save(PATH).await.unwrap();

    for (i, state) in [State::Complete, State::Processing].into_iter().enumerate() {
        log.create_chunk_log_entry(PATH, "uri", &format!("report-merged-{}.json", i), state, "")
            .await
            .unwrap();
    }
    assert!(!log.mark_document_processing_complete(PATH).await.unwrap());

    // Overwrites the Processing entry for the same chunk.
    log.create_chunk_log_entry(PATH, "uri", "report-merged-1.json", State::Complete, "done")
        .await
        .unwrap();
    assert_eq!(store.list_chunk_logs(PATH).await.unwrap().len(), 2);
    assert!(log.mark_document_processing_complete(PATH).await.unwrap());
    assert!(!log.mark_document_processing_complete(PATH).await.unwrap());

    let record = log
        .read_by_id(PATH, StatusQueryLevel::Concise)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, State::Complete);

    let totals = store.chunk_totals().await.unwrap();
    assert_eq!(totals.chunks, 2);
    assert_eq!(totals.complete, 2);

    assert_eq!(store.delete_chunk_logs("upload/other.pdf").await.unwrap(), 0);
    let mut log = StatusLog::new(store.clone());
    log.upsert(PATH, StatusEntry::info("re-upload").fresh_start())
        .await;
    log.save(PATH).await.unwrap();
    assert!(store.list_chunk_logs(PATH).await.unwrap().is_empty());
    assert!(!log.mark_document_processing_complete(PATH).await.unwrap());
    let totals = store.chunk_totals().await.unwrap();
    assert_eq!(totals.chunks, 0);
}

#[tokio::test]
async fn test_state_counts_and_totals() {
    let (_tmp, store, _) = open().await;
    let mut log = StatusLog::new(store.clone());
    log.upsert(PATH, StatusEntry::info("chunked").state(State::Queued).counts(3, 2))
        .await;
    log.save(PATH).await.unwrap();
    for i in 0..2 {
        log.create_chunk_log_entry(PATH, "uri", &format!("report-merged-{}.json", i), State::Complete, "")
            .await
            .unwrap();
    }
    assert!(log.mark_document_processing_complete(PATH).await.unwrap());

    let totals = store.chunk_totals().await.unwrap();
    assert_eq!(totals.chunks, 2);
    assert_eq!(totals.complete, 2);
    assert_eq!(
        store.state_counts().await.unwrap(),
        vec![(State::Complete, 1)]
    );
}

#[tokio::test]
async fn test_llm_output_roundtrip() {
    let (_tmp, store, _) = open().await;
    let log = StatusLog::new(store.clone());
    let file = "blob://local/content/upload/alice/report.pdf/llm/report-merged-0.json";
    log.create_llm_output_entry(&LlmOutputEntry {
        file_path: PATH,
        chunk_blob_uri: "blob://local/content/m0",
        chunk_name: "report-merged-0.json",
        llm_output: "answer",
        llm_output_file: file,
        user_id: "alice",
        prompt_id: "legal",
        usage: TokenUsage {
            completion_tokens: 1,
            prompt_tokens: 2,
            total_tokens: 3,
        },
    })
    .await
    .unwrap();

    let record = store
        .get_llm_output(&docflow_core::models::encode_id(file))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.llm_output, "answer");
    assert_eq!(record.usage.total_tokens, 3);
    assert_eq!(store.chunk_totals().await.unwrap().total_tokens, 3);
}

#[tokio::test]
async fn test_prompts_on_sqlite() {
    let (_tmp, store, _) = open().await;
    let prompts = PromptLog::new(store.clone());
    assert!(prompts.ensure_seeded().await.unwrap());
    assert!(!prompts.ensure_seeded().await.unwrap());
    assert!(!prompts.get_prompt("default", "default").await.unwrap().is_empty());

    prompts.set_prompt("alice", "legal", "one").await.unwrap();
    prompts.set_prompt("alice", "legal", "two").await.unwrap();
    prompts.set_prompt("alice", "short", "three").await.unwrap();
    assert_eq!(prompts.get_prompt("alice", "legal").await.unwrap(), "two");
    assert_eq!(prompts.get_prompt("alice", "short").await.unwrap(), "three");
    assert_eq!(prompts.get_prompt("bob", "legal").await.unwrap(), "");
}

#[tokio::test]
async fn test_queue_lease_and_delete() {
    let (_tmp, _, queue) = open().await;
    queue.send("q", "first", 0).await.unwrap();
    queue.send("q", "later", 3600).await.unwrap();
    assert_eq!(queue.depth("q").await.unwrap(), 2);

    let message = queue.receive("q", 30).await.unwrap().unwrap();
    assert_eq!(message.body, "first");
    assert_eq!(message.dequeue_count, 1);
    // Leased and delayed messages are both invisible.
    assert!(queue.receive("q", 30).await.unwrap().is_none());

    queue.delete("q", &message).await.unwrap();
    assert!(queue.delete("q", &message).await.is_err());
    assert_eq!(queue.depth("q").await.unwrap(), 1);
    assert_eq!(queue.depths().await.unwrap(), vec![("q".to_string(), 1)]);
}

#[tokio::test]
async fn test_expired_lease_is_redelivered() {
    let (_tmp, _, queue) = open().await;
    queue.send("q", "body", 0).await.unwrap();

    let first = queue.receive("q", 0).await.unwrap().unwrap();
    let second = queue.receive("q", 30).await.unwrap().unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.dequeue_count, 2);

    // The first receipt went stale when the message was leased again.
    assert!(queue.delete("q", &first).await.is_err());
    queue.delete("q", &second).await.unwrap();
    assert_eq!(queue.depth("q").await.unwrap(), 0);
}
