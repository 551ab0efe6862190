use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use codevolve::App;
use codevolve::cli::{Cli, Command};
use codevolve::config::Config;

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    let app = App::build(config).await?;

    // Ctrl-C becomes cooperative cancellation; in-flight work finishes its
    // current attempt, then the loop stops
    let cancel = app.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received; cancelling");
            cancel.cancel();
        }
    });

    match cli.command {
        Command::Generate { text, input } => {
            let result = app.pipeline.handle_with_input(&text, input.as_deref()).await?;

            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "success": result.success,
                        "node_id": result.node_id,
                        "code": result.code,
                        "score": result.score,
                        "tool_used": result.tool_used,
                        "used_fallback_tool": result.used_fallback_tool,
                        "parse_fallback": result.parse_fallback,
                        "plan_artifact_id": result.plan_artifact_id,
                        "artifact_id": result.artifact_id,
                        "attempts": result.attempts,
                        "suggestion": result.suggestion,
                    })
                );
            } else {
                if result.success {
                    println!("{} Task complete (score {:.2})", "✓".green(), result.score);
                } else {
                    println!("{} Task failed after {} attempts", "✗".red(), result.attempts.len());
                }
                println!("Tool: {}{}", result.tool_used, if result.used_fallback_tool { " (fallback)" } else { "" });
                if let Some(node_id) = &result.node_id {
                    println!("Node: {}", node_id.cyan());
                }
                for attempt in &result.attempts {
                    println!("  {}", attempt.summary_line().dimmed());
                }
                if let Some(suggestion) = &result.suggestion {
                    println!("{} {}", "→".yellow(), suggestion);
                }
                if !result.code.is_empty() {
                    println!("---\n{}", result.code);
                }
            }

            if !result.success {
                std::process::exit(1);
            }
        }
        Command::Run {
            node_id,
            input_json,
            timeout_ms,
        } => {
            let metrics = app.runner.run_node(&node_id, &input_json, timeout_ms).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&metrics)?);
            } else {
                println!("{}", metrics.stdout);
                if !metrics.stderr.is_empty() {
                    eprintln!("{}", metrics.stderr.dimmed());
                }
                println!(
                    "{} exit {} in {} ms (peak {:.1} MB)",
                    if metrics.success { "✓".green() } else { "✗".red() },
                    metrics.exit_code,
                    metrics.latency_ms,
                    metrics.memory_mb_peak,
                );
            }

            if !metrics.success {
                std::process::exit(1);
            }
        }
        Command::List => {
            let nodes = app.runner.nodes().list()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&nodes)?);
            } else if nodes.is_empty() {
                println!("No nodes saved");
            } else {
                for node in nodes {
                    let status = match &node.last_metrics {
                        Some(m) if m.success => "✓".green(),
                        Some(_) => "✗".red(),
                        None => "·".dimmed(),
                    };
                    println!("{} {}  {}", status, node.node_id.cyan(), node.name);
                }
            }
        }
        Command::Tools => {
            let tools = app.registry.list(None).await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&tools)?);
            } else {
                for tool in tools {
                    let marker = if tool.deprecated { " (deprecated)".red().to_string() } else { String::new() };
                    println!(
                        "{}  {:?}  q={:.2} uses={}{}",
                        tool.name.cyan(),
                        tool.kind,
                        tool.quality_score,
                        tool.usage_count,
                        marker,
                    );
                    println!("    {}", tool.description.dimmed());
                }
            }
        }
        Command::Search { text, limit } => {
            let hits = app.memory.find(&text, None, &[], limit, None).await?;
            if cli.json {
                let rows: Vec<serde_json::Value> = hits
                    .iter()
                    .map(|h| serde_json::json!({ "similarity": h.similarity, "artifact": h.artifact }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if hits.is_empty() {
                println!("No artifacts match");
            } else {
                for hit in hits {
                    println!(
                        "{:.2}  {}  {}  {}",
                        hit.similarity,
                        hit.artifact.artifact_id.cyan(),
                        hit.artifact.kind.to_string().yellow(),
                        hit.artifact.name,
                    );
                }
            }
        }
    }

    Ok(())
}
