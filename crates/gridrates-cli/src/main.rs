use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gridrates_extract::parse_document;
use gridrates_ingest::{
    connect_pool, maybe_build_scheduler, IngestConfig, IngestPipeline, TargetRegistry,
};

#[derive(Debug, Parser)]
#[command(name = "gridrates")]
#[command(about = "Retail energy offer ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass over every enabled target.
    Ingest,
    /// Replay the extraction engine over a saved HTML page and print the
    /// parsed result as JSON.
    Parse {
        html: PathBuf,
        #[arg(long)]
        slug: String,
        #[arg(long, default_value = "./targets.yaml")]
        targets: PathBuf,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let report = gridrates_ingest::run_ingest_once_from_env().await?;
            println!(
                "ingest complete: run_id={} date={} targets={} applied={} skipped={} failed={}",
                report.run_id,
                report.capture_date,
                report.outcomes.len(),
                report.rows_applied,
                report.rows_skipped,
                report.rows_failed
            );
        }
        Commands::Parse {
            html,
            slug,
            targets,
        } => {
            let registry = TargetRegistry::load(&targets).await?;
            let Some(target) = registry.targets.into_iter().find(|t| t.slug == slug) else {
                bail!("no target with slug {slug} in {}", targets.display());
            };
            let text = tokio::fs::read_to_string(&html)
                .await
                .with_context(|| format!("reading {}", html.display()))?;
            let capture_date = chrono::Utc::now().date_naive();
            let parsed = parse_document(&text, &target, capture_date)?;
            println!("{}", serde_json::to_string_pretty(&parsed)?);
        }
        Commands::Schedule => {
            let config = IngestConfig::from_env()?;
            if !config.scheduler_enabled {
                bail!("set GRIDRATES_SCHEDULER_ENABLED=1 to run the scheduler");
            }
            let pool = connect_pool(&config).await?;
            let pipeline = Arc::new(IngestPipeline::new(config)?);
            let Some(scheduler) = maybe_build_scheduler(pipeline, pool).await? else {
                bail!("scheduler not enabled");
            };
            scheduler.start().await.context("starting scheduler")?;
            println!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}
