//! Pipeline stages.
//!
//! ```text
//! upload ──► Dispatcher ──► submit queue (pdf / non-pdf)
//!                               │
//!                               ▼
//!                           Submitter ──► polling queue
//!                                              │
//!                                              ▼
//!                                   PollingCoordinator ──► chunks queue (fan-out)
//!                                                               │
//!                                                               ▼
//!                                                        PromptExecutor ──► fan-in
//! ```
//!
//! Every stage handles one message per invocation and owns a fresh
//! [`StatusLog`]. No error crosses a stage boundary: the catch-all records
//! it as an Error status with the stage context, and the staged status is
//! saved on every exit path.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use docflow_core::error::PipelineError;
use docflow_core::message::FileTrack;
use docflow_core::retry::RetryPolicy;
use docflow_core::status_log::{StatusEntry, StatusLog};
use docflow_core::store::{PromptBackend, StatusBackend};
use rand::rngs::StdRng;
use rand::SeedableRng;
use sqlx::SqlitePool;
use tracing::{error, warn};

use crate::blob::{BlobStore, FsBlobStore};
use crate::config::Config;
use crate::doc_intel::{DocIntelClient, LayoutService};
use crate::llm::{AzureOpenAiClient, CompletionService};
use crate::queue::{Queue, SqliteQueue};
use crate::sqlite_store::SqliteStore;

pub mod dispatch;
pub mod execute;
pub mod poll;
pub mod submit;

pub use dispatch::{DispatchOutcome, Dispatcher, Upload};
pub use execute::PromptExecutor;
pub use poll::PollingCoordinator;
pub use submit::Submitter;

/// Everything a stage talks to.
pub struct Services {
    pub config: Arc<Config>,
    pub status: Arc<dyn StatusBackend>,
    pub prompts: Arc<dyn PromptBackend>,
    pub queue: Arc<dyn Queue>,
    pub blobs: Arc<dyn BlobStore>,
    pub layout: Arc<dyn LayoutService>,
    pub llm: Arc<dyn CompletionService>,
    rng: Mutex<StdRng>,
}

impl Services {
    pub fn new(
        config: Arc<Config>,
        status: Arc<dyn StatusBackend>,
        prompts: Arc<dyn PromptBackend>,
        queue: Arc<dyn Queue>,
        blobs: Arc<dyn BlobStore>,
        layout: Arc<dyn LayoutService>,
        llm: Arc<dyn CompletionService>,
    ) -> Self {
        Self {
            config,
            status,
            prompts,
            queue,
            blobs,
            layout,
            llm,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Production wiring: SQLite store and queue, filesystem blobs, HTTP clients.
    pub fn from_pool(config: Arc<Config>, pool: SqlitePool) -> anyhow::Result<Self> {
        let store = Arc::new(SqliteStore::new(pool.clone()));
        let blobs = Arc::new(FsBlobStore::new(
            config.storage.root.clone(),
            &config.storage.account,
        ));
        let layout = Arc::new(DocIntelClient::new(&config.doc_intel)?);
        let llm = Arc::new(AzureOpenAiClient::new(&config.llm)?);
        Ok(Self::new(
            config,
            store.clone(),
            store,
            Arc::new(SqliteQueue::new(pool)),
            blobs,
            layout,
            llm,
        ))
    }

    /// Pin the random source, for reproducible delays.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.config.retry.policy()
    }

    /// Run `f` with the shared random source.
    pub fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut rng)
    }

    /// Submit queue for an upload's track.
    pub fn submit_queue(&self, track: FileTrack) -> &str {
        match track {
            FileTrack::Pdf => &self.config.queues.pdf_submit,
            FileTrack::NonPdf => &self.config.queues.non_pdf_submit,
        }
    }

    pub fn status_log(&self) -> StatusLog {
        StatusLog::new(self.status.clone())
    }
}

/// What the worker should do with a message once its stage returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Handled, including handled failures recorded in the status log.
    Done,
    /// The body could not be decoded; move it aside.
    Quarantine(String),
}

/// A queue-triggered stage.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Queues this stage consumes.
    fn queues(&self) -> Vec<String>;

    async fn handle(&self, body: &str) -> Disposition;
}

/// Identity of the invocation an error belongs to.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub stage: &'static str,
    pub document_path: String,
    pub raw_message: String,
}

impl StageContext {
    pub fn new(stage: &'static str, document_path: &str, raw_message: &str) -> Self {
        Self {
            stage,
            document_path: document_path.to_string(),
            raw_message: raw_message.to_string(),
        }
    }

    /// Status text for an unhandled failure.
    pub fn describe(&self, err: &PipelineError) -> String {
        format!(
            "{} failed for {}: {}. Message: {}",
            self.stage, self.document_path, err, self.raw_message
        )
    }

    /// Record `err` against the document, leaving it in the error's
    /// terminal state.
    pub async fn record_failure(&self, log: &mut StatusLog, err: &PipelineError) {
        log.upsert(
            &self.document_path,
            StatusEntry::error(self.describe(err)).state(err.terminal_state()),
        )
        .await;
    }
}

/// Flush the staged status for `path`; a failing flush is only logged.
pub async fn save_status(log: &mut StatusLog, path: &str) {
    if let Err(e) = log.save(path).await {
        error!(path, "failed to save status: {}", e);
    }
}

/// Log and quarantine an undecodable body.
pub fn quarantine(stage: &'static str, err: PipelineError, body: &str) -> Disposition {
    warn!(stage, "rejecting message: {}", err);
    Disposition::Quarantine(format!("{}: {} ({})", stage, err, body))
}
