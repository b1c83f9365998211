//! # docflow core
//!
//! Runtime-free pipeline logic: record models, queue message schemas,
//! retry policy, document map and chunking, the store abstraction, and the
//! status and prompt logs built on it.
//!
//! This crate contains no tokio, sqlx, HTTP or filesystem I/O. The root
//! `docflow` crate supplies the SQLite store, the queue transport and the
//! external service clients.

pub mod chunk;
pub mod docmap;
pub mod error;
pub mod message;
pub mod models;
pub mod prompt_log;
pub mod retry;
pub mod status_log;
pub mod store;
