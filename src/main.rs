//! # crag
//!
//! Command-line interface for crm-rag: build the vector index from files or
//! HubSpot, ask questions, manage Messenger identity links, and run the
//! webhook server.
//!
//! ## Usage
//!
//! ```bash
//! crag --config ./config/crag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `crag init` | Create the data directory, CRM cache and identity store |
//! | `crag ingest files <paths..>` | Replace the index with local documents |
//! | `crag ingest crm` | Replace the index with cached (or freshly synced) CRM records |
//! | `crag sync crm` | Refresh the local CRM cache from HubSpot |
//! | `crag ask "<question>"` | Answer a question from the index |
//! | `crag link <psid> <contact>` | Link a Messenger user to a CRM contact |
//! | `crag conversations` | List linked and unlinked Messenger users |
//! | `crag messages <psid>` | Show a user's recent messages |
//! | `crag status` | Index, cache and identity overview |
//! | `crag serve webhook` | Start the Messenger webhook server |
//!
//! Secrets are read from the environment: `OPENAI_API_KEY`,
//! `HUBSPOT_ACCESS_TOKEN`, `FB_PAGE_ACCESS_TOKEN`, `FB_APP_SECRET`,
//! `FB_VERIFY_TOKEN`.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crm_rag::answer::{self, AskRequest};
use crm_rag::config::{self, Config};
use crm_rag::identity::{self, IdentityStore, SqliteIdentityStore};
use crm_rag::progress::ProgressMode;
use crm_rag::{hubspot, ingest, migrate, status, webhook};

/// crm-rag CLI: retrieval-augmented answers over documents and HubSpot CRM.
#[derive(Parser)]
#[command(name = "crag", version, about)]
struct Cli {
    /// Path to configuration file (TOML). Defaults are used when it is missing.
    #[arg(long, global = true, default_value = "./config/crag.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a terminal, else `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    /// Verbose logging (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the local stores. Safe to run repeatedly.
    Init,

    /// Build the vector index, replacing the configured collection.
    Ingest {
        #[command(subcommand)]
        source: IngestSource,
    },

    /// Refresh a local cache from its upstream.
    Sync {
        #[command(subcommand)]
        target: SyncTarget,
    },

    /// Ask a question against the index.
    Ask {
        question: String,

        /// Answer as this Messenger identity: scoped to its linked contact,
        /// with recent conversation as context.
        #[arg(long, conflicts_with = "contact")]
        identity: Option<String>,

        /// Scope retrieval to this CRM contact id.
        #[arg(long)]
        contact: Option<String>,

        /// Skip the query-correction step.
        #[arg(long)]
        no_correct: bool,

        /// Print the retrieved chunks after the answer.
        #[arg(long)]
        sources: bool,
    },

    /// Link a Messenger identity to a CRM contact (replaces an existing link).
    Link {
        identity: String,
        contact_id: String,
        /// Display name. Looked up in the CRM cache when omitted.
        name: Option<String>,
    },

    /// List Messenger identities.
    Conversations {
        /// Only show identities waiting to be linked.
        #[arg(long)]
        unlinked: bool,
    },

    /// Show recent messages of one identity, newest first.
    Messages {
        identity: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Show index health, CRM cache and identity counts.
    Status,

    /// Start a server.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },

    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum IngestSource {
    /// Index PDF, Markdown and text files. Directories are walked recursively.
    Files {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Documents per embedding batch (overrides `ingest.batch_size`).
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Index HubSpot records from the local cache, syncing it first when stale.
    Crm {
        /// Sync from HubSpot even when the cache is fresh.
        #[arg(long)]
        refresh: bool,
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

#[derive(Subcommand)]
enum SyncTarget {
    /// Fetch contacts, companies, deals and owners into the CRM cache.
    Crm,
}

#[derive(Subcommand)]
enum ServeService {
    /// Messenger webhook on `[server].bind`.
    Webhook,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(cli: &Cli) {
    let default = match (&cli.command, cli.verbose) {
        (_, true) => "info,crm_rag=debug",
        (Commands::Serve { .. }, false) => "info",
        _ => "warn",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "crag", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    let progress = cli
        .progress
        .unwrap_or_else(ProgressMode::default_for_tty)
        .reporter();

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Stores initialized.");
        }
        Commands::Ingest { source } => match source {
            IngestSource::Files { paths, batch_size } => {
                ingest::run_ingest_files(&cfg, &paths, batch_size, &*progress).await?;
            }
            IngestSource::Crm {
                refresh,
                batch_size,
            } => {
                ingest::run_ingest_crm(&cfg, refresh, batch_size, &*progress).await?;
            }
        },
        Commands::Sync { target } => match target {
            SyncTarget::Crm => {
                hubspot::run_sync_crm(&cfg, &*progress).await?;
            }
        },
        Commands::Ask {
            question,
            identity,
            contact,
            no_correct,
            sources,
        } => {
            let request = ask_request(&cfg, question, identity, contact, no_correct).await?;
            answer::run_ask(&cfg, &request, sources).await?;
        }
        Commands::Link {
            identity,
            contact_id,
            name,
        } => {
            identity::run_link(&cfg, &identity, &contact_id, name.as_deref()).await?;
        }
        Commands::Conversations { unlinked } => {
            identity::run_conversations(&cfg, unlinked).await?;
        }
        Commands::Messages { identity, limit } => {
            identity::run_messages(&cfg, &identity, limit).await?;
        }
        Commands::Status => {
            status::run_status(&cfg).await?;
        }
        Commands::Serve { service } => match service {
            ServeService::Webhook => {
                webhook::run_server(&cfg).await?;
            }
        },
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Resolve `--identity` to its linked contact and recent conversation.
async fn ask_request(
    cfg: &Config,
    question: String,
    identity: Option<String>,
    contact: Option<String>,
    no_correct: bool,
) -> Result<AskRequest> {
    let mut request = AskRequest {
        question,
        contact_id: contact,
        history: Vec::new(),
        correct_query: !(no_correct || cfg.retrieval.skip_query_correction),
    };

    if let Some(identity) = identity {
        let store = SqliteIdentityStore::open(&cfg.identity.path).await?;
        let Some(link) = store.get_link(&identity).await? else {
            anyhow::bail!(
                "Identity '{}' is not linked. Run `crag link {} <contact_id>` first.",
                identity,
                identity
            );
        };
        let mut history = store
            .recent_messages(&identity, cfg.retrieval.history_limit)
            .await?;
        history.reverse();
        request.contact_id = Some(link.contact_id);
        request.history = history;
    }

    Ok(request)
}
