//! strata CLI: record commit pipeline and abstraction governor.

use std::collections::HashSet;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use strata::config::{KbConfig, StrataConfig};
use strata::fingerprint::{jaccard, normalize, token_set};
use strata::kb::KnowledgeBase;
use strata::paths::StrataPaths;
use strata::pipeline::ProposalResult;
use strata::record::{CandidateRecord, Origin, RecordId, now_secs};
use strata::store::snapshot::SnapshotRef;

#[derive(Parser)]
#[command(name = "strata", version, about = "Record commit pipeline with an abstraction-tiering governor")]
struct Cli {
    /// Data directory for persistent storage (default: $XDG_DATA_HOME/strata/kb).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (default: $XDG_CONFIG_HOME/strata/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a data directory and write the default config if missing.
    Init,

    /// Submit candidate records from a JSON file (one object or an array).
    Submit {
        #[arg(long)]
        file: PathBuf,

        /// Submit as system origin, honoring requested tiers.
        #[arg(long)]
        system: bool,
    },

    /// List recent proposals.
    Proposals {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show one record as JSON.
    Show {
        /// Record id (`rec:12` or `12`).
        id: RecordId,
    },

    /// Mark a record as used in a context.
    Use {
        id: RecordId,

        #[arg(long)]
        context: String,
    },

    /// Select a working set.
    Select {
        /// Exclude records subsumed by an aggregate.
        #[arg(long)]
        canonical_only: bool,

        /// Free-text query used as the relevance signal.
        #[arg(long)]
        query: Option<String>,

        /// Focus entries to print.
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Run the periodic upgrade cycle.
    Upgrade {
        /// Ignore the cadence gate.
        #[arg(long)]
        force: bool,
    },

    /// Capture a snapshot of the current store.
    Snapshot,

    /// Restore the store from a snapshot path.
    Restore { path: String },

    /// Delete all but the newest snapshots.
    Prune {
        #[arg(long, default_value = "10")]
        keep: usize,
    },

    /// Show knowledge-base info and statistics.
    Info,

    /// Run the heartbeat daemon until Ctrl+C.
    #[cfg(feature = "daemon")]
    Heartbeat,
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let paths = StrataPaths::resolve();
    let config_file = match (&cli.config, &paths) {
        (Some(file), _) => Some(file.clone()),
        (None, Ok(paths)) => Some(paths.config_file()),
        (None, Err(_)) => None,
    };
    let settings = match &config_file {
        Some(file) => StrataConfig::load_or_default(file)?,
        None => StrataConfig::default(),
    };
    let data_dir = match (cli.data_dir, paths) {
        (Some(dir), _) => dir,
        (None, Ok(paths)) => paths.default_layout().root,
        (None, Err(e)) => return Err(e.into()),
    };
    let config = KbConfig {
        settings,
        data_dir: Some(data_dir.clone()),
    };

    match cli.command {
        Commands::Init => {
            if let Some(file) = &config_file {
                if !file.exists() {
                    config.settings.save(file)?;
                    println!("Wrote default config to {}", file.display());
                }
            }
            let kb = KnowledgeBase::open(config)?;
            println!("Initialized strata at {}", data_dir.display());
            println!("{}", kb.info());
            kb.close()?;
        }

        Commands::Submit { file, system } => {
            let mut kb = KnowledgeBase::open(config)?;
            let content = std::fs::read_to_string(&file).into_diagnostic()?;
            let value: serde_json::Value = serde_json::from_str(&content).into_diagnostic()?;
            let candidates: Vec<CandidateRecord> = match value {
                serde_json::Value::Array(_) => serde_json::from_value(value).into_diagnostic()?,
                other => vec![serde_json::from_value(other).into_diagnostic()?],
            };
            let origin = if system { Origin::System } else { Origin::User };

            for candidate in candidates {
                let title = candidate.title.clone();
                match kb.submit(candidate, origin)? {
                    ProposalResult::Installed {
                        proposal_id,
                        record_id,
                        tier,
                    } => println!("  #{proposal_id} installed \"{title}\" as {record_id} ({tier})"),
                    ProposalResult::Rejected { proposal_id, reason } => {
                        println!("  #{proposal_id} rejected \"{title}\": {reason}")
                    }
                    ProposalResult::Failed {
                        proposal_id,
                        error,
                        snapshot,
                    } => println!("  #{proposal_id} failed \"{title}\": {error} (rolled back to {snapshot})"),
                }
            }
            kb.close()?;
        }

        Commands::Proposals { limit } => {
            let kb = KnowledgeBase::open(config)?;
            let proposals = kb.list_proposals(limit);
            if proposals.is_empty() {
                println!("No proposals.");
            }
            for p in proposals {
                let mut line = format!("  #{} {:?} {} \"{}\"", p.id, p.origin, p.status, p.payload.title);
                if let Some(reason) = &p.rejection {
                    line.push_str(&format!(" ({reason})"));
                }
                if let Some(error) = &p.error {
                    line.push_str(&format!(" ({error})"));
                }
                println!("{line}");
                for note in &p.annotations {
                    println!("      note: {note}");
                }
            }
        }

        Commands::Show { id } => {
            let kb = KnowledgeBase::open(config)?;
            let record = kb.require(id)?;
            println!("{}", serde_json::to_string_pretty(record).into_diagnostic()?);
        }

        Commands::Use { id, context } => {
            let mut kb = KnowledgeBase::open(config)?;
            kb.mark_used(id, &context)?;
            let record = kb.require(id)?;
            println!(
                "{id}: {} uses across {} contexts (score {:.3})",
                record.usage.count,
                record.usage.contexts.len(),
                record.abstraction_score
            );
            kb.close()?;
        }

        Commands::Select {
            canonical_only,
            query,
            limit,
        } => {
            let kb = KnowledgeBase::open(config)?;
            let wanted: HashSet<String> = query
                .as_deref()
                .map(|q| normalize(q).split(' ').filter(|t| t.len() > 2).map(str::to_string).collect())
                .unwrap_or_default();
            let ws = kb.select(
                |record| {
                    if wanted.is_empty() {
                        0.5
                    } else {
                        jaccard(&wanted, &token_set(record))
                    }
                },
                canonical_only,
            );
            println!(
                "peripheral {}  focus {}  micro {}  macro {}{}",
                ws.peripheral.len(),
                ws.focus.len(),
                ws.micro.len(),
                ws.macro_set.len(),
                if ws.relaxed { "  (richness floor relaxed)" } else { "" }
            );
            for id in ws.focus.iter().take(limit) {
                if let Some(record) = kb.get(*id) {
                    println!("  {id} [{}] {}", record.tier, record.title);
                }
            }
        }

        Commands::Upgrade { force } => {
            let mut kb = KnowledgeBase::open(config)?;
            let report = kb.run_upgrade(now_secs(), force)?;
            if report.ran {
                println!(
                    "Upgrade: {} demoted, {} merged, {} aggregates, {} kernels, {} canonicalized",
                    report.demotions,
                    report.merged,
                    report.promotion.aggregates.len(),
                    report.promotion.kernels.len(),
                    report.promotion.canonicalized
                );
            } else {
                println!("Upgrade not due (use --force to run anyway).");
            }
            kb.close()?;
        }

        Commands::Snapshot => {
            let mut kb = KnowledgeBase::open(config)?;
            let reference = kb.snapshot()?;
            println!("Snapshot: {reference}");
        }

        Commands::Restore { path } => {
            let mut kb = KnowledgeBase::open(config)?;
            let reference: SnapshotRef = path.parse().into_diagnostic()?;
            kb.restore(&reference)?;
            println!("Restored from {reference}");
            println!("{}", kb.info());
        }

        Commands::Prune { keep } => {
            let mut kb = KnowledgeBase::open(config)?;
            let removed = kb.prune_snapshots(keep)?;
            println!("Pruned {removed} snapshots, kept up to {keep}.");
        }

        Commands::Info => {
            let kb = KnowledgeBase::open(config)?;
            println!("{}", kb.info());
        }

        #[cfg(feature = "daemon")]
        Commands::Heartbeat => {
            use strata::daemon::{DaemonConfig, HeartbeatDaemon};

            let kb = KnowledgeBase::open(config)?;
            let daemon_config = DaemonConfig {
                flush_interval: kb.config().settings.persistence.flush_interval(),
                ..Default::default()
            };
            let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
            let mut daemon = HeartbeatDaemon::new(kb, daemon_config);
            runtime.block_on(daemon.run())?;
        }
    }

    Ok(())
}
