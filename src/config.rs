//! Pipeline configuration.
//!
//! Loaded once at process start from a TOML file, then overlaid with
//! environment variables for the deployment keys (`MAX_POLLING_REQUEUE_COUNT`,
//! `AZURE_OPENAI_ENDPOINT`, ...), then validated. The resulting [`Config`] is
//! immutable and shared by reference with every component.
//!
//! Secrets (`AZURE_FORM_RECOGNIZER_KEY`, `AZURE_OPENAI_KEY`) are read from
//! the environment only and never from the file.

use anyhow::{bail, Context, Result};
use docflow_core::retry::RetryPolicy;
use serde::Deserialize;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub queues: QueueNames,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub doc_intel: DocIntelConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Object storage laid out as one directory per container under `root`.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
    #[serde(default = "default_account")]
    pub account: String,
    #[serde(default = "default_upload_container")]
    pub upload_container: String,
    #[serde(default = "default_output_container")]
    pub output_container: String,
    #[serde(default = "default_log_container")]
    pub log_container: String,
}

fn default_account() -> String {
    "local".to_string()
}
fn default_upload_container() -> String {
    "upload".to_string()
}
fn default_output_container() -> String {
    "content".to_string()
}
fn default_log_container() -> String {
    "logs".to_string()
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct QueueNames {
    #[serde(default = "default_pdf_submit")]
    pub pdf_submit: String,
    #[serde(default = "default_non_pdf_submit")]
    pub non_pdf_submit: String,
    #[serde(default = "default_pdf_polling")]
    pub pdf_polling: String,
    #[serde(default = "default_chunks")]
    pub chunks: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            pdf_submit: default_pdf_submit(),
            non_pdf_submit: default_non_pdf_submit(),
            pdf_polling: default_pdf_polling(),
            chunks: default_chunks(),
        }
    }
}

fn default_pdf_submit() -> String {
    "pdf-submit-queue".to_string()
}
fn default_non_pdf_submit() -> String {
    "non-pdf-submit-queue".to_string()
}
fn default_pdf_polling() -> String {
    "pdf-polling-queue".to_string()
}
fn default_chunks() -> String {
    "chunks-queue".to_string()
}

/// Chunk sizes, in estimated tokens.
#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_target_size")]
    pub chunk_target_size: usize,
    #[serde(default = "default_merged_chunk_target_size")]
    pub merged_chunk_target_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_target_size: default_chunk_target_size(),
            merged_chunk_target_size: default_merged_chunk_target_size(),
        }
    }
}

fn default_chunk_target_size() -> usize {
    750
}
fn default_merged_chunk_target_size() -> usize {
    4000
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocIntelConfig {
    /// One or more endpoints, each paired with the key at the same index.
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(skip)]
    pub keys: Vec<String>,
    #[serde(default = "default_fr_api_version")]
    pub api_version: String,
    #[serde(default = "default_fr_model")]
    pub model: String,
    /// Attempts of the transport-level retry around each poll.
    #[serde(default = "default_max_read_attempts")]
    pub max_read_attempts: u32,
    #[serde(default = "default_read_retry_wait_secs")]
    pub read_retry_wait_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DocIntelConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            keys: Vec::new(),
            api_version: default_fr_api_version(),
            model: default_fr_model(),
            max_read_attempts: default_max_read_attempts(),
            read_retry_wait_secs: default_read_retry_wait_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_fr_api_version() -> String {
    "2023-07-31".to_string()
}
fn default_fr_model() -> String {
    "prebuilt-layout".to_string()
}
fn default_max_read_attempts() -> u32 {
    5
}
fn default_read_retry_wait_secs() -> u64 {
    5
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_submit_requeue_count")]
    pub max_submit_requeue_count: u32,
    #[serde(default = "default_max_polling_requeue_count")]
    pub max_polling_requeue_count: u32,
    #[serde(default = "default_submit_requeue_hide_seconds")]
    pub submit_requeue_hide_seconds: u64,
    #[serde(default = "default_polling_backoff")]
    pub polling_backoff: u64,
    #[serde(default = "default_polling_jitter_seconds")]
    pub polling_jitter_seconds: u64,
    #[serde(default = "default_max_seconds_hide_on_upload")]
    pub max_seconds_hide_on_upload: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_submit_requeue_count: default_max_submit_requeue_count(),
            max_polling_requeue_count: default_max_polling_requeue_count(),
            submit_requeue_hide_seconds: default_submit_requeue_hide_seconds(),
            polling_backoff: default_polling_backoff(),
            polling_jitter_seconds: default_polling_jitter_seconds(),
            max_seconds_hide_on_upload: default_max_seconds_hide_on_upload(),
        }
    }
}

fn default_max_submit_requeue_count() -> u32 {
    10
}
fn default_max_polling_requeue_count() -> u32 {
    10
}
fn default_submit_requeue_hide_seconds() -> u64 {
    60
}
fn default_polling_backoff() -> u64 {
    30
}
fn default_polling_jitter_seconds() -> u64 {
    10
}
fn default_max_seconds_hide_on_upload() -> u64 {
    300
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_submit_requeue_count: self.max_submit_requeue_count,
            max_polling_requeue_count: self.max_polling_requeue_count,
            submit_requeue_hide_seconds: self.submit_requeue_hide_seconds,
            polling_backoff: self.polling_backoff,
            polling_jitter_seconds: self.polling_jitter_seconds,
            max_seconds_hide_on_upload: self.max_seconds_hide_on_upload,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(skip)]
    pub api_key: String,
    #[serde(default)]
    pub deployment_id: String,
    #[serde(default = "default_openai_api_version")]
    pub api_version: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_system_message")]
    pub system_message: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            deployment_id: String::new(),
            api_version: default_openai_api_version(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            system_message: default_system_message(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_openai_api_version() -> String {
    "2024-02-01".to_string()
}
fn default_temperature() -> f64 {
    0.0
}
fn default_top_p() -> f64 {
    1.0
}
fn default_max_tokens() -> u32 {
    800
}
fn default_system_message() -> String {
    "You are an AI assistant that helps people find information.".to_string()
}

/// Jitter applied by the dispatcher before touching the status log, in ms.
#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    #[serde(default = "default_jitter_min_ms")]
    pub jitter_min_ms: u64,
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            jitter_min_ms: default_jitter_min_ms(),
            jitter_max_ms: default_jitter_max_ms(),
        }
    }
}

fn default_jitter_min_ms() -> u64 {
    1000
}
fn default_jitter_max_ms() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Sleep between receives when the queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Lease taken on a received message before it becomes visible again.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Receives after which a message is moved to `{queue}-poison`.
    #[serde(default = "default_max_dequeue_count")]
    pub max_dequeue_count: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_dequeue_count: default_max_dequeue_count(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_visibility_timeout_secs() -> u64 {
    300
}
fn default_max_dequeue_count() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_var<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid value for {}: '{}' ({})", key, raw, e))
}

impl Config {
    /// Overlay deployment variables; `lookup` is `std::env::var` outside tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        macro_rules! overlay {
            ($key:literal, $target:expr) => {
                if let Some(raw) = lookup($key) {
                    $target = parse_var($key, &raw)?;
                }
            };
        }

        overlay!("MAX_SUBMIT_REQUEUE_COUNT", self.retry.max_submit_requeue_count);
        overlay!("MAX_POLLING_REQUEUE_COUNT", self.retry.max_polling_requeue_count);
        overlay!("SUBMIT_REQUEUE_HIDE_SECONDS", self.retry.submit_requeue_hide_seconds);
        overlay!("POLLING_BACKOFF", self.retry.polling_backoff);
        overlay!("MAX_SECONDS_HIDE_ON_UPLOAD", self.retry.max_seconds_hide_on_upload);
        overlay!("MAX_READ_ATTEMPTS", self.doc_intel.max_read_attempts);
        overlay!("CHUNK_TARGET_SIZE", self.chunking.chunk_target_size);
        overlay!("MERGED_CHUNK_TARGET_SIZE", self.chunking.merged_chunk_target_size);
        overlay!("FR_API_VERSION", self.doc_intel.api_version);
        overlay!("AZURE_OPENAI_ENDPOINT", self.llm.endpoint);
        overlay!("AZURE_OPENAI_KEY", self.llm.api_key);
        overlay!("AZURE_OPENAI_DEPLOYMENT_ID", self.llm.deployment_id);
        overlay!("AZURE_OPENAI_API_VERSION", self.llm.api_version);
        overlay!("AZURE_OPENAI_TEMPERATURE", self.llm.temperature);
        overlay!("AZURE_OPENAI_TOP_P", self.llm.top_p);
        overlay!("AZURE_OPENAI_MAX_TOKENS", self.llm.max_tokens);
        overlay!("AZURE_OPENAI_SYSTEM_MESSAGE", self.llm.system_message);
        overlay!("PDF_SUBMIT_QUEUE", self.queues.pdf_submit);
        overlay!("NON_PDF_SUBMIT_QUEUE", self.queues.non_pdf_submit);
        overlay!("PDF_POLLING_QUEUE", self.queues.pdf_polling);
        overlay!("CHUNKS_QUEUE", self.queues.chunks);

        if let Some(raw) = lookup("AZURE_FORM_RECOGNIZER_ENDPOINT") {
            self.doc_intel.endpoints = split_list(&raw);
        }
        if let Some(raw) = lookup("AZURE_FORM_RECOGNIZER_KEY") {
            self.doc_intel.keys = split_list(&raw);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.chunking.chunk_target_size == 0 {
            bail!("chunking.chunk_target_size must be > 0");
        }
        if self.chunking.merged_chunk_target_size < self.chunking.chunk_target_size {
            bail!("chunking.merged_chunk_target_size must be >= chunking.chunk_target_size");
        }
        if self.retry.max_seconds_hide_on_upload == 0 {
            bail!("retry.max_seconds_hide_on_upload must be >= 1");
        }
        if self.dispatch.jitter_min_ms > self.dispatch.jitter_max_ms {
            bail!("dispatch.jitter_min_ms must be <= dispatch.jitter_max_ms");
        }
        if self.doc_intel.max_read_attempts == 0 {
            bail!("doc_intel.max_read_attempts must be >= 1");
        }
        if !self.doc_intel.keys.is_empty()
            && self.doc_intel.keys.len() != self.doc_intel.endpoints.len()
        {
            bail!(
                "AZURE_FORM_RECOGNIZER_KEY has {} keys but {} endpoints are configured",
                self.doc_intel.keys.len(),
                self.doc_intel.endpoints.len()
            );
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            bail!("llm.temperature must be in [0.0, 2.0]");
        }
        if !(0.0..=1.0).contains(&self.llm.top_p) {
            bail!("llm.top_p must be in [0.0, 1.0]");
        }
        if self.worker.concurrency == 0 {
            bail!("worker.concurrency must be >= 1");
        }
        if self.worker.max_dequeue_count == 0 {
            bail!("worker.max_dequeue_count must be >= 1");
        }
        Ok(())
    }

    /// Fail early when a stage that talks to document intelligence starts
    /// without endpoints.
    pub fn require_doc_intel(&self) -> Result<()> {
        if self.doc_intel.endpoints.is_empty() {
            bail!("no document intelligence endpoint configured (doc_intel.endpoints or AZURE_FORM_RECOGNIZER_ENDPOINT)");
        }
        if self.doc_intel.keys.len() != self.doc_intel.endpoints.len() {
            bail!("AZURE_FORM_RECOGNIZER_KEY must provide one key per endpoint");
        }
        Ok(())
    }

    pub fn require_llm(&self) -> Result<()> {
        if self.llm.endpoint.is_empty() || self.llm.deployment_id.is_empty() {
            bail!("llm.endpoint and llm.deployment_id must be set");
        }
        if self.llm.api_key.is_empty() {
            bail!("AZURE_OPENAI_KEY must be set");
        }
        Ok(())
    }
}

/// Parse TOML without touching the environment.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}
