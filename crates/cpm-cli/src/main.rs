use anyhow::Result;
use clap::{Parser, Subcommand};
use cpm_engine::{diff_snapshots, MasterPipeline, PipelineConfig};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "cpm-cli")]
#[command(about = "Canonical product master command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled source, canonicalize, replace the master table.
    Run,
    /// Load the curated alias table and report validation results.
    ValidateAliases,
    /// Build a fresh snapshot and compare it against the published table.
    Diff,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cpm_engine=info".parse()?)
                .add_directive("cpm_adapters=info".parse()?)
                .add_directive("cpm_storage=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = cpm_engine::run_once_from_env().await?;
            println!(
                "run complete: run_id={} records={} filtered={} parents={} destination={}",
                summary.run_id,
                summary.records_fetched,
                summary.records_filtered_out,
                summary.parents_published,
                summary.destination
            );
            for (origin, count) in &summary.source_counts {
                println!("  {origin}: {count}");
            }
            println!(
                "alias table v{} ({})",
                summary.alias_version, summary.alias_fingerprint
            );
        }
        Commands::ValidateAliases => {
            let pipeline = MasterPipeline::new(PipelineConfig::from_env())?;
            let aliases = pipeline.aliases();
            println!(
                "alias table ok: {} parents, {} aliases",
                aliases.parent_count(),
                aliases.alias_count()
            );
        }
        Commands::Diff => {
            let pipeline = MasterPipeline::new(PipelineConfig::from_env())?;
            let published = pipeline.read_published().await?;
            let (_records, fresh) = pipeline.build_snapshot(Uuid::new_v4()).await?;
            let diff = diff_snapshots(&published, &fresh);
            if diff.is_empty() {
                println!(
                    "published master is up to date ({} parents)",
                    published.len()
                );
            } else {
                for name in &diff.added {
                    println!("+ {name}");
                }
                for name in &diff.removed {
                    println!("- {name}");
                }
                for name in &diff.changed {
                    println!("~ {name}");
                }
                println!(
                    "{} added, {} removed, {} changed",
                    diff.added.len(),
                    diff.removed.len(),
                    diff.changed.len()
                );
            }
        }
    }

    Ok(())
}
