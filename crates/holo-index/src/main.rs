//! # HoloIndex CLI (`holo`)
//!
//! ## Usage
//!
//! ```bash
//! holo --config ./config/holo.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `holo init` | Create the SQLite database and run schema migrations |
//! | `holo ingest <file.jsonl>` | Upsert or delete entities from a JSON Lines feed |
//! | `holo embed pending` | Embed entities with missing or stale vectors |
//! | `holo query "<text>"` | Classify, route, execute and compose a query |
//! | `holo feedback <query-id> ...` | Rate a past query's output |
//! | `holo health <entity-id>` | Show an entity's health score |
//! | `holo foundational` | List the most central entities |
//! | `holo weights` | Show learned component/intent affinity weights |
//! | `holo trail` | Show recent breadcrumbs |
//! | `holo decay` | Decay usage-derived health signals |
//! | `holo prune` | Delete breadcrumbs past retention |
//! | `holo completions <shell>` | Print shell completions |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{CommandFactory, Parser, Subcommand};

use holo_index::config::{self, Config};
use holo_index::health::HealthScorer;
use holo_index::ingest;
use holo_index::logging;
use holo_index::sqlite_store::SqliteStore;
use holo_index::HoloIndex;
use holo_index_core::compose::Verbosity;
use holo_index_core::models::{now_ts, FeedbackRatings, Intent};
use holo_index_core::store::CoordinationStore;

/// HoloIndex: semantic code and documentation search with intent routing
/// and feedback learning.
#[derive(Parser)]
#[command(name = "holo", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/holo.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest entities from a JSON Lines file.
    ///
    /// Each line is `{"id", "kind", "source_path", "content"}` with an
    /// optional `structure` object, or `{"id", "deleted": true}`.
    Ingest {
        /// Path to the `.jsonl` feed.
        path: PathBuf,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Run a query.
    Query {
        /// The query text.
        text: String,

        /// Output detail: `minimal`, `standard` or `verbose`.
        #[arg(long)]
        verbosity: Option<String>,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Rate the output of a past query. Each rating is in [0, 1].
    Feedback {
        /// Query id printed by `holo query`.
        query_id: String,

        #[arg(long)]
        relevance: f64,

        /// Higher means noisier output.
        #[arg(long)]
        noise: f64,

        #[arg(long)]
        completeness: f64,

        #[arg(long)]
        efficiency: f64,
    },

    /// Show an entity's health score.
    Health {
        entity_id: String,

        #[arg(long)]
        json: bool,
    },

    /// List foundational entities (highest dependency and usage).
    Foundational {
        /// Fraction of scored entities to return (default from config).
        #[arg(long)]
        top: Option<f64>,
    },

    /// Show learned affinity weights.
    Weights {
        /// Restrict to one intent (e.g. `DOC_LOOKUP`).
        #[arg(long)]
        intent: Option<String>,
    },

    /// Show recent breadcrumbs, oldest first.
    Trail {
        /// Restrict to one query.
        #[arg(long)]
        query: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Decay usage-derived health signals by time since last update.
    Decay,

    /// Delete breadcrumbs older than the retention window.
    Prune {
        /// Override `[breadcrumbs].retention_days`.
        #[arg(long)]
        days: Option<u32>,
    },

    /// Print shell completions to stdout.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed entities whose vector is missing or from another model.
    Pending {
        /// Maximum number of entities to embed in this run.
        #[arg(long, default_value_t = 10_000)]
        limit: usize,

        /// Show counts without embedding anything.
        #[arg(long)]
        dry_run: bool,
    },
}

fn parse_intent(s: &str) -> Result<Intent> {
    match Intent::parse(s) {
        Some(intent) => Ok(intent),
        None => bail!(
            "Unknown intent '{}'. Expected one of: {}",
            s,
            Intent::ALL
                .iter()
                .map(|i| i.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

async fn open_store(cfg: &Config) -> Result<Arc<SqliteStore>> {
    Ok(Arc::new(SqliteStore::open(cfg).await?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging();

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "holo", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            open_store(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { path } => {
            let holo = HoloIndex::open(cfg).await?;
            let stats = ingest::ingest_file(&holo, &path).await?;
            println!("ingest {}", path.display());
            println!("  records: {}", stats.records);
            println!("  upserted: {}", stats.upserted);
            println!("  unchanged: {}", stats.unchanged);
            println!("  deleted: {}", stats.deleted);
            println!("  rejected: {}", stats.rejected);
            if holo.config().embedding.is_enabled() {
                println!("  embeddings written: {}", stats.embedded);
                println!("  embeddings pending: {}", stats.embeddings_pending);
            }
            println!("ok");
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending { limit, dry_run } => {
                if !cfg.embedding.is_enabled() {
                    bail!("Embedding provider is disabled. Set [embedding] provider in config.");
                }
                let holo = HoloIndex::open(cfg).await?;
                if dry_run {
                    let pending = holo.index().stale_entities(limit).await?;
                    println!("embed pending (dry-run)");
                    println!("  entities needing embeddings: {}", pending.len());
                    return Ok(());
                }
                let stats = ingest::embed_pending(&holo, limit).await?;
                println!("embed pending");
                println!("  total pending: {}", stats.pending);
                println!("  embedded: {}", stats.embedded);
                println!("  failed: {}", stats.failed);
            }
        },
        Commands::Query {
            text,
            verbosity,
            json,
        } => {
            let verbosity = match verbosity.as_deref() {
                None => cfg.orchestration.verbosity,
                Some(v) => match Verbosity::parse(v) {
                    Some(v) => v,
                    None => bail!("Unknown verbosity '{}'. Use minimal, standard or verbose.", v),
                },
            };
            let holo = HoloIndex::open(cfg).await?;
            let response = holo.query(&text, verbosity).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!("query {}", response.query_id);
                println!(
                    "  complexity: {} ({:.2}), {}ms",
                    response.complexity.band, response.complexity.score, response.elapsed_ms
                );
                println!();
                print!("{}", response.output);
            }
        }
        Commands::Feedback {
            query_id,
            relevance,
            noise,
            completeness,
            efficiency,
        } => {
            let holo = HoloIndex::open(cfg).await?;
            let outcome = holo
                .record_feedback(
                    &query_id,
                    FeedbackRatings {
                        relevance,
                        noise_level: noise,
                        completeness,
                        efficiency,
                    },
                )
                .await?;
            println!("feedback {}", outcome.event.id);
            println!("  intent: {}", outcome.intent);
            println!("  delta: {:+.4}", outcome.event.delta);
            for w in &outcome.weights {
                println!("  {}: {:+.4} ({} updates)", w.component, w.weight, w.update_count);
            }
            println!("  entities rated: {}", outcome.rated_entities);
        }
        Commands::Health { entity_id, json } => {
            let store = open_store(&cfg).await?;
            let scorer = HealthScorer::new(store, cfg.health.clone());
            let score = scorer.get_score(&entity_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&score)?);
            } else {
                println!("health {}", score.entity_id);
                println!("  overall: {:.3}", score.overall);
                println!("  structural: {:.3}", score.structural);
                println!("  maintenance: {:.3}", score.maintenance);
                println!("  knowledge: {:.3}", score.knowledge);
                println!("  dependency: {:.3}", score.dependency);
                println!("  pattern: {:.3}", score.pattern);
                println!(
                    "  usage: {:.3} ({} hits, {} ratings)",
                    score.usage_frequency, score.usage_count, score.rating_count
                );
            }
        }
        Commands::Foundational { top } => {
            let store = open_store(&cfg).await?;
            let scorer = HealthScorer::new(store, cfg.health.clone());
            let ids = scorer.foundational_entities(top).await?;
            if ids.is_empty() {
                println!("No scored entities.");
            }
            for id in ids {
                println!("{}", id);
            }
        }
        Commands::Weights { intent } => {
            let store = open_store(&cfg).await?;
            let weights = match intent {
                Some(s) => store.affinity_weights(parse_intent(&s)?).await?,
                None => store.all_affinity_weights().await?,
            };
            if weights.is_empty() {
                println!("No learned weights yet (all components neutral).");
            }
            for w in weights {
                println!(
                    "{:<14} {:<16} {:+.4}  ({} updates)",
                    w.intent.as_str(),
                    w.component.as_str(),
                    w.weight,
                    w.update_count
                );
            }
        }
        Commands::Trail { query, limit } => {
            let store = open_store(&cfg).await?;
            for event in store.breadcrumbs(query.as_deref(), limit).await? {
                println!(
                    "{:>6} {} {:<10} {} {} {}",
                    event.id,
                    event.created_at,
                    event.kind.as_str(),
                    event.query_id.as_deref().unwrap_or("-"),
                    event.agent_id,
                    event.payload
                );
            }
        }
        Commands::Decay => {
            let store = open_store(&cfg).await?;
            let scorer = HealthScorer::new(store, cfg.health.clone());
            let touched = scorer.decay_all(now_ts()).await?;
            println!("decay");
            println!("  scores updated: {}", touched);
        }
        Commands::Prune { days } => {
            let store = open_store(&cfg).await?;
            let days = days.unwrap_or(cfg.breadcrumbs.retention_days);
            let before = now_ts() - i64::from(days) * 86_400;
            let removed = store.prune_breadcrumbs(before).await?;
            println!("prune");
            println!("  breadcrumbs removed: {}", removed);
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
