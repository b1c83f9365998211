//! # docflow
//!
//! Queue-driven document processing: uploads are sent to a layout analysis
//! service, the result is split into chunks, every merged chunk is run
//! through an LLM prompt, and the document completes once all its chunks
//! have.
//!
//! ## Architecture
//!
//! ```text
//! upload ─▶ submit queue ─▶ Submitter ─▶ polling queue ─▶ PollingCoordinator
//!                                                               │ fan-out
//!                                                               ▼
//!                       status store ◀── fan-in ── PromptExecutor ◀─ chunks queue
//! ```
//!
//! Each stage is consumed by a [`worker::Worker`]. Durable state (status
//! records, chunk logs, LLM outputs, prompts, queues) lives in SQLite;
//! artifacts live in a [`blob::BlobStore`].
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with environment overrides |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite status and prompt backend |
//! | [`queue`] | Durable queues with leases and poison queues |
//! | [`blob`] | Blob locators, artifact names and stores |
//! | [`doc_intel`] | Layout analysis client |
//! | [`llm`] | Chat completion client |
//! | [`stages`] | Dispatch, submit, poll and execute stages |
//! | [`worker`] | Queue consumer |
//! | [`upload`] | Local upload and dispatch |
//! | [`status_cmd`] | Status queries |
//! | [`prompts_cmd`] | Prompt management |
//! | [`stats`] | Pipeline statistics |
//! | [`server`] | Read-only status HTTP API |

pub mod blob;
pub mod config;
pub mod db;
pub mod doc_intel;
pub mod llm;
pub mod migrate;
pub mod prompts_cmd;
pub mod queue;
pub mod server;
pub mod sqlite_store;
pub mod stages;
pub mod stats;
pub mod status_cmd;
pub mod upload;
pub mod worker;
