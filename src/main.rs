//! # Montaine CLI (`montaine`)
//!
//! The `montaine` binary runs integrations and inspects what they stored.
//!
//! ## Usage
//!
//! ```bash
//! montaine --config ./config/montaine.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `montaine init` | Create the SQLite database and run schema migrations |
//! | `montaine integrations` | List integrations and their health |
//! | `montaine run <name\|all>` | Fetch, transform and persist with static parameters |
//! | `montaine auto <name>` | Same, with parameters derived from the aggregation pipeline |
//! | `montaine transform <name> --input FILE` | Offline map/type/historize of a saved response |
//! | `montaine history <name>` | Recent runs, newest first |
//! | `montaine record <name> --id K=V` | Show a stored record and its history |
//! | `montaine completions <shell>` | Print shell completions |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! montaine init --config ./config/montaine.toml
//!
//! # Try new schemas against a saved upstream response
//! montaine transform prices --input ./samples/prices.json
//!
//! # Scheduled run, JSON outcome on stdout
//! montaine auto prices --user scheduler --json --progress off
//! ```

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use montaine::progress::ProgressMode;
use montaine::{config, history, integrations, logging, migrate, run_cmd, transform};
use montaine_core::models::RunMode;

/// Montaine CLI: schema-driven ingestion of third-party APIs into
/// historized records.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/montaine.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "montaine",
    about = "Montaine: schema-driven ingestion of third-party APIs into historized records",
    version,
    long_about = "Montaine fetches JSON from configured integrations, projects it through a \
    mapping schema, coerces it with a typing schema, and appends every changed value to an \
    append-only history stored in SQLite."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/montaine.toml")]
    config: PathBuf,

    /// Log level when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Run progress on stderr. Defaults to `human` on a terminal, else `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (records, run_history, alert_outbox). Safe to run repeatedly.
    Init,

    /// List configured integrations and their health.
    ///
    /// Checks that schemas parse and credentials resolve. Nothing is
    /// fetched.
    Integrations,

    /// Run an integration with its static parameters.
    Run {
        /// Integration name, or `all` to run every integration concurrently.
        name: String,

        /// User recorded as having started the run.
        #[arg(long)]
        user: Option<String>,

        /// Print the full outcome as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run an integration with parameters derived from its `auto_pipeline`.
    Auto {
        /// Integration name, or `all`.
        name: String,

        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Map, type and historize a saved source document without persisting.
    Transform {
        /// Integration whose schemas to apply.
        name: String,

        /// JSON file holding an upstream response.
        #[arg(long)]
        input: PathBuf,

        /// Observation timestamp (RFC 3339 or `YYYY-MM-DD`). Defaults to now.
        #[arg(long)]
        observed_at: Option<String>,
    },

    /// Show recent runs of an integration.
    History {
        name: String,

        #[arg(long, default_value = "20")]
        limit: i64,
    },

    /// Show a stored record.
    Record {
        name: String,

        /// Identity field, e.g. `--id id=x1`. Repeat for compound identities.
        #[arg(long = "id", value_parser = parse_key_val, required = true)]
        ids: Vec<(String, String)>,
    },

    /// Print shell completions.
    Completions {
        shell: Shell,
    },
}

/// Parse a `key=value` pair for `--id` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "montaine", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Integrations => {
            integrations::list_integrations(&cfg)?;
        }
        Commands::Run { name, user, json } => {
            if !run_cmd::run(&cfg, &name, user, RunMode::Manual, json, progress).await? {
                std::process::exit(1);
            }
        }
        Commands::Auto { name, user, json } => {
            if !run_cmd::run(&cfg, &name, user, RunMode::Auto, json, progress).await? {
                std::process::exit(1);
            }
        }
        Commands::Transform {
            name,
            input,
            observed_at,
        } => {
            transform::run_transform(&cfg, &name, &input, observed_at.as_deref())?;
        }
        Commands::History { name, limit } => {
            history::show_history(&cfg, &name, limit).await?;
        }
        Commands::Record { name, ids } => {
            history::show_record(&cfg, &name, &ids).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
