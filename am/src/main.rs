use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use artifactstore::cli::{Cli, Command};
use artifactstore::{Artifact, ArtifactKind, ArtifactStore, LocalStore, StoreConfig};

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
}

fn print_artifact_line(artifact: &Artifact) {
    println!(
        "{}  {}  {}  q={:.2} uses={}",
        artifact.artifact_id.cyan(),
        artifact.kind.to_string().yellow(),
        artifact.name,
        artifact.quality_score,
        artifact.usage_count,
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();
    let config = StoreConfig::load(cli.config.as_ref()).context("Failed to load configuration")?;

    info!(path = %config.path.display(), "artifactstore starting");
    let store = LocalStore::open(&config.path, config.dimension, config.ema_alpha)
        .context("Failed to open artifact store")?;

    match cli.command {
        Command::List { kind, tag, limit } => {
            let kind = match kind {
                Some(raw) => Some(
                    ArtifactKind::parse(&raw).ok_or_else(|| eyre::eyre!("Unknown artifact kind: {}", raw))?,
                ),
                None => None,
            };
            let artifacts = store.list(kind, &tag, limit).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&artifacts)?);
            } else if artifacts.is_empty() {
                println!("No artifacts found");
            } else {
                for artifact in &artifacts {
                    print_artifact_line(artifact);
                }
            }
        }
        Command::Find { text, limit } => {
            let needle = text.to_lowercase();
            let all = store.list(None, &[], usize::MAX).await?;
            let matches: Vec<Artifact> = all
                .into_iter()
                .filter(|a| {
                    a.name.to_lowercase().contains(&needle)
                        || a.description.to_lowercase().contains(&needle)
                        || a.tags.iter().any(|t| t.to_lowercase().contains(&needle))
                })
                .take(limit)
                .collect();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&matches)?);
            } else if matches.is_empty() {
                println!("No artifacts match '{}'", text);
            } else {
                for artifact in &matches {
                    print_artifact_line(artifact);
                }
            }
        }
        Command::Get { artifact_id } => match store.get(&artifact_id).await? {
            Some(artifact) => {
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&artifact)?);
                } else {
                    print_artifact_line(&artifact);
                    println!("{}", artifact.description.dimmed());
                    println!("---");
                    println!("{}", artifact.content);
                }
            }
            None => {
                eprintln!("{} Artifact not found: {}", "✗".red(), artifact_id);
                std::process::exit(1);
            }
        },
        Command::Delete { artifact_id } => {
            if store.delete(&artifact_id).await? {
                println!("{} Deleted artifact: {}", "✓".green(), artifact_id);
            } else {
                eprintln!("{} Artifact not found: {}", "✗".red(), artifact_id);
                std::process::exit(1);
            }
        }
        Command::Stats => {
            let total = store.count().await?;
            if cli.json {
                let mut by_kind = serde_json::Map::new();
                for kind in ArtifactKind::all() {
                    let n = store.list(Some(*kind), &[], usize::MAX).await?.len();
                    if n > 0 {
                        by_kind.insert(kind.to_string(), serde_json::json!(n));
                    }
                }
                println!(
                    "{}",
                    serde_json::json!({ "total": total, "by_kind": by_kind })
                );
            } else {
                println!("Artifacts: {}", total);
                for kind in ArtifactKind::all() {
                    let n = store.list(Some(*kind), &[], usize::MAX).await?.len();
                    if n > 0 {
                        println!("  {:<14} {}", kind.to_string(), n);
                    }
                }
            }
        }
    }

    Ok(())
}
