//! `docflow prompts` and the default-prompt seed run by `docflow init`.

use std::sync::Arc;

use anyhow::{bail, Result};
use docflow_core::prompt_log::PromptLog;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

async fn open(config: &Config) -> Result<PromptLog> {
    let pool = db::connect(config).await?;
    Ok(PromptLog::new(Arc::new(SqliteStore::new(pool))))
}

/// Returns `true` when the default prompt was written.
pub async fn seed_default(config: &Config) -> Result<bool> {
    Ok(open(config).await?.ensure_seeded().await?)
}

pub async fn run_prompts_get(config: &Config, user_id: &str, prompt_id: &str) -> Result<()> {
    let prompt = open(config).await?.get_prompt(user_id, prompt_id).await?;
    if prompt.is_empty() {
        bail!("no prompt '{}' for user '{}'", prompt_id, user_id);
    }
    println!("{}", prompt);
    Ok(())
}

pub async fn run_prompts_set(
    config: &Config,
    user_id: &str,
    prompt_id: &str,
    text: &str,
) -> Result<()> {
    if text.trim().is_empty() {
        bail!("prompt text must not be empty");
    }
    open(config).await?.set_prompt(user_id, prompt_id, text).await?;
    println!("Saved prompt '{}' for user '{}'.", prompt_id, user_id);
    Ok(())
}
