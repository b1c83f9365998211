//! # docflow CLI
//!
//! The `docflow` binary runs the document-processing pipeline: it
//! initializes the database, uploads documents, runs the queue workers for
//! each stage and reports status.
//!
//! ## Usage
//!
//! ```bash
//! docflow --config ./config/docflow.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docflow init` | Create the SQLite database and seed the default prompt |
//! | `docflow upload <path>` | Store files in the upload container and dispatch them |
//! | `docflow worker <stage>` | Consume the queues of `submit`, `poll` or `execute` |
//! | `docflow status get <path>` | One document's status and chunk logs |
//! | `docflow status list` | Documents started within a window |
//! | `docflow stats` | Document states, chunk totals and queue depths |
//! | `docflow prompts get/set` | Read or store a user's prompt |
//! | `docflow serve` | Start the read-only status HTTP server |

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use docflow::config::{self, Config};
use docflow::stages::{PollingCoordinator, PromptExecutor, Services, Stage, Submitter};
use docflow::upload::{self, UploadRequest};
use docflow::worker::Worker;
use docflow::{db, migrate, prompts_cmd, server, stats, status_cmd};
use docflow_core::models::{DEFAULT_PROMPT_ID, DEFAULT_USER_ID};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// docflow: queue-driven document extraction and LLM prompting.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docflow.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docflow",
    about = "Queue-driven document layout extraction, chunking and LLM prompting",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docflow.toml")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and seed the default prompt.
    ///
    /// Idempotent: running it again keeps existing data.
    Init,

    /// Upload a file or directory and dispatch every file to its submit queue.
    Upload {
        /// File or directory to upload.
        source: PathBuf,

        /// Blob path for a single file (defaults to the file name).
        #[arg(long)]
        name: Option<String>,

        /// User id, stored as the leading path segment.
        #[arg(long)]
        user: Option<String>,

        /// Prompt id attached to the upload's metadata.
        #[arg(long)]
        prompt_id: Option<String>,
    },

    /// Run the queue worker for one stage until Ctrl-C.
    Worker {
        stage: StageKind,

        /// Handle what is queued, then exit instead of waiting for more.
        #[arg(long)]
        drain: bool,
    },

    /// Query document status.
    Status {
        #[command(subcommand)]
        action: StatusAction,
    },

    /// Show pipeline statistics.
    Stats,

    /// Manage prompts.
    Prompts {
        #[command(subcommand)]
        action: PromptAction,
    },

    /// Start the read-only status HTTP server on `[server].bind`.
    Serve,
}

#[derive(Clone, Copy, ValueEnum)]
enum StageKind {
    /// Send documents to document intelligence.
    Submit,
    /// Poll analysis results and fan out chunks.
    Poll,
    /// Run the LLM prompt over each merged chunk.
    Execute,
}

#[derive(Subcommand)]
enum StatusAction {
    /// Status of one document, by its path (`{container}/{name}`).
    Get {
        path: String,

        /// Include debug-level status updates.
        #[arg(long)]
        verbose: bool,

        #[arg(long)]
        json: bool,
    },
    /// Documents started within the last N hours.
    List {
        /// Window in hours; negative means unbounded.
        #[arg(long, default_value_t = 24, allow_negative_numbers = true)]
        within_hours: i64,

        /// Only documents in this state.
        #[arg(long)]
        state: Option<String>,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum PromptAction {
    /// Print a stored prompt.
    Get {
        #[arg(long, default_value = DEFAULT_USER_ID)]
        user: String,
        #[arg(long, default_value = DEFAULT_PROMPT_ID)]
        id: String,
    },
    /// Store a prompt, replacing any previous text.
    Set {
        #[arg(long, default_value = DEFAULT_USER_ID)]
        user: String,
        #[arg(long, default_value = DEFAULT_PROMPT_ID)]
        id: String,
        text: String,
    },
}

fn init_tracing(debug: bool) {
    let default = if debug {
        "docflow=debug,docflow_core=debug"
    } else {
        "docflow=info,docflow_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn services(cfg: Config) -> anyhow::Result<Arc<Services>> {
    let cfg = Arc::new(cfg);
    let pool = db::connect(&cfg).await?;
    Ok(Arc::new(Services::from_pool(cfg, pool)?))
}

async fn run_worker(cfg: Config, kind: StageKind, drain: bool) -> anyhow::Result<()> {
    match kind {
        StageKind::Submit | StageKind::Poll => cfg.require_doc_intel()?,
        StageKind::Execute => cfg.require_llm()?,
    }
    let worker_config = cfg.worker.clone();
    let services = services(cfg).await?;
    let stage: Arc<dyn Stage> = match kind {
        StageKind::Submit => Arc::new(Submitter::new(services.clone())),
        StageKind::Poll => Arc::new(PollingCoordinator::new(services.clone())),
        StageKind::Execute => Arc::new(PromptExecutor::new(services.clone())),
    };
    let worker = Worker::new(stage, services.queue.clone(), worker_config);

    if drain {
        let handled = worker.drain(usize::MAX).await?;
        println!("Handled {} message(s).", handled);
        return Ok(());
    }

    worker
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for Ctrl-C: {}", e);
            }
            info!("shutdown requested");
        })
        .await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            std::fs::create_dir_all(&cfg.storage.root)?;
            if prompts_cmd::seed_default(&cfg).await? {
                println!("Seeded default prompt.");
            }
            println!("Database initialized successfully.");
        }
        Commands::Upload {
            source,
            name,
            user,
            prompt_id,
        } => {
            let request = UploadRequest {
                source,
                name,
                user,
                prompt_id,
            };
            upload::run_upload(services(cfg).await?, &request).await?;
        }
        Commands::Worker { stage, drain } => {
            run_worker(cfg, stage, drain).await?;
        }
        Commands::Status { action } => match action {
            StatusAction::Get {
                path,
                verbose,
                json,
            } => {
                status_cmd::run_status_get(&cfg, &path, verbose, json).await?;
            }
            StatusAction::List {
                within_hours,
                state,
                json,
            } => {
                status_cmd::run_status_list(&cfg, within_hours, state.as_deref(), json).await?;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Prompts { action } => match action {
            PromptAction::Get { user, id } => {
                prompts_cmd::run_prompts_get(&cfg, &user, &id).await?;
            }
            PromptAction::Set { user, id, text } => {
                prompts_cmd::run_prompts_set(&cfg, &user, &id, &text).await?;
            }
        },
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
