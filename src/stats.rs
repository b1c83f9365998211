//! Pipeline overview for `docflow stats`.
//!
//! Documents per state, chunk completion, token usage, and the depth of
//! every queue including poison queues.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::queue::{poison_queue_name, SqliteQueue};
use crate::sqlite_store::{ChunkTotals, SqliteStore};

/// Everything `docflow stats` prints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub db_size: u64,
    pub states: Vec<(String, i64)>,
    pub chunks: ChunkTotals,
    pub queues: Vec<(String, i64)>,
}

pub async fn collect_stats(config: &Config) -> Result<PipelineStats> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let states = store
        .state_counts()
        .await?
        .into_iter()
        .map(|(state, n)| (state.to_string(), n))
        .collect();
    let chunks = store.chunk_totals().await?;

    // Configured queues always show, even when empty.
    let stored = SqliteQueue::new(pool.clone()).depths().await?;
    let names = &config.queues;
    let mut queues: Vec<(String, i64)> = Vec::new();
    for name in [
        &names.pdf_submit,
        &names.non_pdf_submit,
        &names.pdf_polling,
        &names.chunks,
    ] {
        for queue in [name.clone(), poison_queue_name(name)] {
            let depth = stored
                .iter()
                .find(|(q, _)| *q == queue)
                .map(|(_, n)| *n)
                .unwrap_or(0);
            queues.push((queue, depth));
        }
    }
    pool.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(PipelineStats {
        db_size,
        states,
        chunks,
        queues,
    })
}

pub fn render_stats(config: &Config, stats: &PipelineStats) -> String {
    let mut out = String::new();
    out.push_str("docflow pipeline stats\n");
    out.push_str("======================\n\n");
    out.push_str(&format!("  Database:    {}\n", config.db.path.display()));
    out.push_str(&format!("  Size:        {}\n\n", format_bytes(stats.db_size)));

    let total: i64 = stats.states.iter().map(|(_, n)| n).sum();
    out.push_str(&format!("  Documents:   {}\n", total));
    for (state, n) in &stats.states {
        out.push_str(&format!("    {:<12} {:>6}\n", state, n));
    }

    let c = &stats.chunks;
    out.push_str(&format!(
        "\n  Chunks:      {} / {} complete ({}%)\n",
        c.complete,
        c.chunks,
        if c.chunks > 0 {
            (c.complete * 100) / c.chunks
        } else {
            0
        }
    ));
    out.push_str(&format!("  LLM outputs: {}\n", c.llm_outputs));
    out.push_str(&format!("  Tokens:      {}\n", c.total_tokens));

    out.push_str("\n  Queues:\n");
    out.push_str(&format!("  {:<32} {:>8}\n", "QUEUE", "DEPTH"));
    out.push_str(&format!("  {}\n", "-".repeat(41)));
    for (queue, depth) in &stats.queues {
        out.push_str(&format!("  {:<32} {:>8}\n", queue, depth));
    }
    out
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let stats = collect_stats(config).await?;
    print!("{}", render_stats(config, &stats));
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
