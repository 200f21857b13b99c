//! # Listing Agent CLI (`listing-agent`)
//!
//! Operator interface for the enrichment pipeline: database setup, the
//! scheduler daemon, manual batch runs, item maintenance and the options
//! bag.
//!
//! ## Usage
//!
//! ```bash
//! listing-agent --config ./config/listing-agent.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `init` | Create the SQLite database and run schema migrations |
//! | `daemon` | Run the batch runner on its schedule until Ctrl-C |
//! | `agent run` | Advance a batch of items by one stage |
//! | `agent status` | Item counts per stage and configuration health |
//! | `agent tick` | Run one scheduled tick (for external cron) |
//! | `agent test-connection` | Send a greeting through the model gateway |
//! | `ingest add/show/reset/scrub/scrub-secrets/reimport` | Item maintenance |
//! | `option set/get/unset/list` | Edit the persisted options bag |

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;

use listing_agent::{agent_cmd, config, daemon, ingest_cmd, migrate, option_cmd};

/// Listing Agent: enrich scraped places and events into published listings.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Options stored with `option set` and `LISTING_AGENT_*` environment
/// constants override values from the file.
#[derive(Parser)]
#[command(
    name = "listing-agent",
    about = "Listing Agent: a resumable LLM enrichment pipeline for place and event listings",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/listing-agent.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Run the batch runner every `agent.tick_interval_secs` until Ctrl-C.
    ///
    /// Run at most one daemon per database.
    Daemon,

    /// Pipeline execution and diagnostics.
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },

    /// Item maintenance tools.
    Ingest {
        #[command(subcommand)]
        action: IngestAction,
    },

    /// Edit the persisted options bag.
    Option {
        #[command(subcommand)]
        action: OptionAction,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// Advance a batch of items by one stage.
    ///
    /// Items at `new` (classify) and `enriched` (rewrite) call the model;
    /// the other stages never do.
    Run {
        /// Maximum number of items to process (default: `agent.batch_size`).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Stage to process: new, classified, enriched, rewritten, scored, or all.
        #[arg(long, default_value = "all")]
        stage: String,

        /// Only items of this content type: local_place or local_event.
        #[arg(long)]
        target: Option<String>,

        /// Reprocess items whose stage no longer matches, including
        /// `error_publish` and `ready_for_review` under `--stage scored`.
        #[arg(long)]
        force: bool,

        /// Progress output on stderr: off, human, or json.
        /// Default: human when stderr is a TTY, otherwise off.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Item counts per stage plus configuration and credential health.
    Status {
        /// Only count items of this content type.
        #[arg(long)]
        target: Option<String>,

        /// Also run a live connectivity test against the model provider.
        #[arg(long)]
        test: bool,
    },

    /// Run one scheduled tick: poll ingestors, then process up to
    /// `agent.tick_cap` items.
    Tick,

    /// Send a minimal prompt through the model gateway.
    TestConnection,
}

#[derive(Subcommand)]
enum IngestAction {
    /// Enqueue a record from a JSON file (envelope or bare payload).
    Add {
        file: PathBuf,

        /// Record type: place or event.
        #[arg(long = "type")]
        kind: Option<String>,

        /// Content target: local_place, local_event, or city.
        #[arg(long)]
        target: Option<String>,
    },

    /// Print an item with its payload and stage outputs.
    Show { id: i64 },

    /// Delete every item, or with `--soft` rewind every item to `new`.
    Reset {
        /// Rewind instead of deleting; clears error, score and published id.
        #[arg(long)]
        soft: bool,
    },

    /// Find items that describe a whole city rather than a venue.
    Scrub {
        /// What to do with matches: retag or delete.
        #[arg(long)]
        action: String,

        /// Only list matches.
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove stored API keys that are also defined as constants.
    ScrubSecrets,

    /// Send published listings back through the pipeline.
    Reimport {
        /// Only listings of this content type.
        #[arg(long)]
        post_type: Option<String>,

        /// Maximum number of listings.
        #[arg(long)]
        limit: Option<usize>,

        /// Comma-separated listing ids.
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,

        /// Only list what would be re-imported.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum OptionAction {
    Set { key: String, value: String },
    Get { key: String },
    Unset { key: String },
    List,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Daemon => {
            daemon::run_daemon(cfg).await?;
        }
        Commands::Agent { action } => match action {
            AgentAction::Run {
                batch_size,
                stage,
                target,
                force,
                progress,
            } => {
                let progress = agent_cmd::parse_progress(progress.as_deref())?;
                agent_cmd::run_agent_batch(
                    cfg,
                    batch_size,
                    &stage,
                    target.as_deref(),
                    force,
                    progress,
                )
                .await?;
            }
            AgentAction::Status { target, test } => {
                agent_cmd::run_agent_status(cfg, target.as_deref(), test).await?;
            }
            AgentAction::Tick => {
                agent_cmd::run_agent_tick(cfg).await?;
            }
            AgentAction::TestConnection => {
                agent_cmd::run_test_connection(cfg).await?;
            }
        },
        Commands::Ingest { action } => match action {
            IngestAction::Add { file, kind, target } => {
                ingest_cmd::run_add(cfg, &file, kind.as_deref(), target.as_deref()).await?;
            }
            IngestAction::Show { id } => {
                ingest_cmd::run_show(cfg, id).await?;
            }
            IngestAction::Reset { soft } => {
                ingest_cmd::run_reset(cfg, soft).await?;
            }
            IngestAction::Scrub { action, dry_run } => {
                ingest_cmd::run_scrub(cfg, action.parse()?, dry_run).await?;
            }
            IngestAction::ScrubSecrets => {
                ingest_cmd::run_scrub_secrets(cfg).await?;
            }
            IngestAction::Reimport {
                post_type,
                limit,
                ids,
                dry_run,
            } => {
                ingest_cmd::run_reimport(cfg, post_type.as_deref(), limit, ids, dry_run).await?;
            }
        },
        Commands::Option { action } => match action {
            OptionAction::Set { key, value } => option_cmd::run_option_set(&cfg, &key, &value).await?,
            OptionAction::Get { key } => option_cmd::run_option_get(&cfg, &key).await?,
            OptionAction::Unset { key } => option_cmd::run_option_unset(&cfg, &key).await?,
            OptionAction::List => option_cmd::run_option_list(&cfg).await?,
        },
    }

    Ok(())
}
