use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pipewarden::alert::slack::SlackTransport;
use pipewarden::alert::{AlertPayload, NotifyTransport, TransportError};
use pipewarden::backup::BackupKind;
use pipewarden::config::Config;
use pipewarden::pipeline::InboundEvent;
use pipewarden::scan::ArtifactKind;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "pipewarden",
    about = "CI/CD pipeline security analysis: scan, score, alert",
    version,
    long_about = None
)]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "pipewarden.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan an artifact file and run it through the full alert pipeline
    Scan {
        /// Artifact class: definition, build, or log
        #[arg(long, value_enum)]
        kind: ArtifactKind,

        /// File containing the artifact text
        path: PathBuf,

        /// Source system for the event identity
        #[arg(long, default_value = "azure")]
        source: String,

        /// Build identifier
        #[arg(long)]
        build_id: String,

        /// Pipeline definition identifier
        #[arg(long)]
        definition_id: String,

        /// Analyze and print, but skip claim and alert dispatch
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate the rule and whitelist configuration
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Manage state backups
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Inspect the alert audit trail
    Audit {
        /// How many records to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Re-claim and re-dispatch alerts stuck in PENDING
    Recover,
}

#[derive(Subcommand)]
enum RulesAction {
    /// Load the configured rule files and report counts
    Check,
    /// Per-rule hit statistics from the findings database
    Stats,
}

#[derive(Subcommand)]
enum BackupAction {
    /// Create a backup now
    Create {
        #[arg(long, value_enum, default_value = "manual")]
        kind: BackupKind,

        #[arg(long, default_value = "")]
        description: String,
    },

    /// List sealed backups, newest first
    List,

    /// Extract a backup into an isolated restore directory
    Restore {
        /// Backup id (archive file stem)
        id: String,
    },

    /// Run the retention sweep for one kind
    Prune {
        #[arg(long, value_enum)]
        kind: BackupKind,
    },
}

/// Transport used when no webhook URL is configured: logs the alert instead
/// of delivering it.
struct LogOnlyTransport;

#[async_trait::async_trait]
impl NotifyTransport for LogOnlyTransport {
    async fn send(&self, payload: &AlertPayload) -> Result<(), TransportError> {
        tracing::warn!(
            title = %payload.title,
            risk_level = %payload.risk_level,
            "No webhook configured; alert logged only"
        );
        Ok(())
    }
}

fn build_transport(config: &Config) -> Result<Arc<dyn NotifyTransport>> {
    match &config.slack_webhook_url {
        Some(url) => Ok(Arc::new(SlackTransport::new(url.clone())?)),
        None => Ok(Arc::new(LogOnlyTransport)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Scan {
            kind,
            path,
            source,
            build_id,
            definition_id,
            dry_run,
        } => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read artifact {}", path.display()))?;
            let app = pipewarden::App::build(&config, build_transport(&config)?)?;

            let event = InboundEvent {
                source_system: source,
                build_id,
                definition_id,
                kind,
                content,
                received_at: chrono::Utc::now(),
            };

            if dry_run {
                let result = app.pipeline.analyze(&event);
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                let outcome = app.pipeline.process_event(&event).await?;
                println!("Outcome: {outcome:?}");
            }
        }
        Commands::Rules { action } => match action {
            RulesAction::Check => {
                let store = pipewarden::rules::RuleStore::open(
                    &config.rules_path,
                    &config.whitelist_path,
                )?;
                let set = store.current();
                println!(
                    "Rule configuration OK: {} rules ({} enabled), {} whitelist entries",
                    set.rule_count(),
                    set.enabled_rules().count(),
                    set.whitelist().len()
                );
            }
            RulesAction::Stats => {
                let pool =
                    pipewarden::storage::open_pool(&config.database_path.to_string_lossy())?;
                let stats = pipewarden::storage::pattern_statistics(&pool)?;
                if stats.is_empty() {
                    println!("No findings recorded yet.");
                } else {
                    println!("{:<30} | {:>10} | {:>8} | Last seen", "Rule", "Hits", "Avg sev");
                    for stat in stats {
                        println!(
                            "{:<30} | {:>10} | {:>8.1} | {}",
                            stat.rule_id, stat.occurrences, stat.avg_severity, stat.last_seen
                        );
                    }
                }
            }
        },
        Commands::Backup { action } => {
            let app = pipewarden::App::build(&config, build_transport(&config)?)?;
            match action {
                BackupAction::Create { kind, description } => {
                    let backup = app.backups.create_backup(kind, &description).await?;
                    println!(
                        "Backup sealed: {} ({} files, {} bytes)",
                        backup.id,
                        backup.file_manifest.len(),
                        backup.size_bytes
                    );
                }
                BackupAction::List => {
                    let backups = app.backups.list_backups()?;
                    if backups.is_empty() {
                        println!("No backups found.");
                    } else {
                        println!("{:<45} | {:<7} | {:>12} | Created", "Id", "Kind", "Bytes");
                        for backup in backups {
                            println!(
                                "{:<45} | {:<7} | {:>12} | {}",
                                backup.id,
                                backup.kind,
                                backup.size_bytes,
                                backup.created_at.to_rfc3339()
                            );
                        }
                    }
                }
                BackupAction::Restore { id } => {
                    let target = app.backups.restore_backup(&id)?;
                    println!("Restored to {}", target.display());
                }
                BackupAction::Prune { kind } => {
                    let removed = app.backups.prune_retained(kind).await?;
                    println!("Removed {removed} {kind} backup(s).");
                }
            }
        }
        Commands::Audit { limit } => {
            let pool = pipewarden::storage::open_pool(&config.database_path.to_string_lossy())?;
            let dedup = pipewarden::dedup::DedupStore::new(pool);
            let records = dedup.recent(limit)?;
            if records.is_empty() {
                println!("No alert records.");
            } else {
                println!("{:<30} | {:<8} | Claimed at / reason", "Event", "Status");
                for record in records {
                    let detail = record
                        .failure_reason
                        .unwrap_or_else(|| record.claimed_at.clone());
                    println!(
                        "{:<30} | {:<8} | {}",
                        record.identity.to_string(),
                        record.alert_status.as_str(),
                        detail
                    );
                }
            }
        }
        Commands::Recover => {
            let app = pipewarden::App::build(&config, build_transport(&config)?)?;
            let recovered = app
                .pipeline
                .recover_stalled(config.pending_timeout_secs)
                .await?;
            println!("Re-dispatched {recovered} stalled alert(s).");
        }
    }

    Ok(())
}
