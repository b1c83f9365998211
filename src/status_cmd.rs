//! Status queries for `docflow status` and `GET /status`.
//!
//! Both surfaces share [`get_status`] and [`list_status`]; the CLI renders
//! the result as text or, with `--json`, as the same JSON the server returns.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use docflow_core::models::{
    ChunkLogRecord, DocumentStatusRecord, State, StatusQueryLevel, UNKNOWN_COUNT,
};
use docflow_core::status_log::StatusLog;
use docflow_core::store::StatusBackend;
use serde::Serialize;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

/// One document with its chunk logs.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentStatus {
    #[serde(flatten)]
    pub record: DocumentStatusRecord,
    pub chunks: Vec<ChunkLogRecord>,
}

pub fn parse_state(raw: &str) -> Result<State> {
    raw.parse::<State>().map_err(|e| {
        let known: Vec<&str> = State::ALL.iter().map(|s| s.as_str()).collect();
        anyhow!("{} (expected one of: {})", e, known.join(", "))
    })
}

pub async fn get_status(
    backend: Arc<dyn StatusBackend>,
    path: &str,
    level: StatusQueryLevel,
) -> Result<Option<DocumentStatus>> {
    let log = StatusLog::new(backend.clone());
    let Some(record) = log.read_by_id(path, level).await? else {
        return Ok(None);
    };
    let chunks = backend.list_chunk_logs(&record.file_path).await?;
    Ok(Some(DocumentStatus { record, chunks }))
}

pub async fn list_status(
    backend: Arc<dyn StatusBackend>,
    within_hours: i64,
    state: Option<State>,
) -> Result<Vec<DocumentStatusRecord>> {
    let log = StatusLog::new(backend);
    Ok(log.read_by_timeframe(within_hours, state).await?)
}

fn format_count(count: i64) -> String {
    if count == UNKNOWN_COUNT {
        "-".to_string()
    } else {
        count.to_string()
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Multi-line text rendering of one document.
pub fn render_document(status: &DocumentStatus) -> String {
    let r = &status.record;
    let mut out = String::new();
    out.push_str(&format!("{}\n", r.file_path));
    out.push_str(&format!("  id:            {}\n", r.id));
    out.push_str(&format!("  state:         {}\n", r.state));
    out.push_str(&format!("  started:       {}\n", format_ts(&r.start_timestamp)));
    out.push_str(&format!("  state changed: {}\n", format_ts(&r.state_timestamp)));
    out.push_str(&format!(
        "  chunks:        {} ({} merged)\n",
        format_count(r.chunk_count),
        format_count(r.merged_chunk_count)
    ));

    if !r.status_updates.is_empty() {
        out.push_str("\n  History:\n");
        for u in &r.status_updates {
            out.push_str(&format!(
                "    {}  {:<5}  {}\n",
                format_ts(&u.status_timestamp),
                u.status_classification,
                u.status
            ));
        }
    }

    if !status.chunks.is_empty() {
        out.push_str("\n  Chunks:\n");
        for c in &status.chunks {
            out.push_str(&format!("    {:<10} {}", c.chunk_state, c.chunk_name));
            if !c.additional_info.is_empty() {
                out.push_str(&format!("  ({})", c.additional_info));
            }
            out.push('\n');
        }
    }
    out
}

/// One line per document.
pub fn render_list(records: &[DocumentStatusRecord]) -> String {
    let mut out = format!(
        "{:<10} {:>7} {:>7}  {:<19}  {}\n",
        "STATE", "CHUNKS", "MERGED", "STATE CHANGED", "FILE"
    );
    for r in records {
        out.push_str(&format!(
            "{:<10} {:>7} {:>7}  {:<19}  {}\n",
            r.state.as_str(),
            format_count(r.chunk_count),
            format_count(r.merged_chunk_count),
            format_ts(&r.state_timestamp),
            r.file_path
        ));
    }
    out
}

async fn open_backend(config: &Config) -> Result<Arc<dyn StatusBackend>> {
    let pool = db::connect(config).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

pub async fn run_status_get(config: &Config, path: &str, verbose: bool, json: bool) -> Result<()> {
    let level = if verbose {
        StatusQueryLevel::Verbose
    } else {
        StatusQueryLevel::Concise
    };
    let Some(status) = get_status(open_backend(config).await?, path, level).await? else {
        bail!("no status recorded for {}", path);
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", render_document(&status));
    }
    Ok(())
}

pub async fn run_status_list(
    config: &Config,
    within_hours: i64,
    state: Option<&str>,
    json: bool,
) -> Result<()> {
    let state = state.map(parse_state).transpose()?;
    let records = list_status(open_backend(config).await?, within_hours, state).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() {
        println!("No documents found.");
    } else {
        print!("{}", render_list(&records));
    }
    Ok(())
}
