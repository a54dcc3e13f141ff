use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lotwatch_core::EnqueueOptions;
use lotwatch_sync::{IngestConfig, RefreshMode, Runtime};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lotwatch")]
#[command(about = "Auction sale ingestion: collection scheduler, fresh/permanent tiers, migration sweep")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Restore jobs, seed from the catalogue, run until ctrl-c.
    Run,
    /// Collect one make (or one model) once and exit.
    Collect(CollectArgs),
    /// Run one migration sweep.
    Sweep,
    /// Apply SQL migrations.
    Migrate,
    /// Print scheduler status as JSON.
    Status {
        /// Include the per-make progress rollup.
        #[arg(long)]
        progress: bool,
    },
    /// Collect every catalogue make in one tier.
    AutoCollect {
        #[arg(long)]
        tier: u8,
    },
}

#[derive(Debug, Args)]
struct CollectArgs {
    make: String,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    site: Option<i32>,
    #[arg(long)]
    year_from: Option<i32>,
    #[arg(long)]
    year_to: Option<i32>,
    #[arg(long)]
    days_back: Option<u32>,
    #[arg(long)]
    priority: Option<u8>,
}

impl From<CollectArgs> for EnqueueOptions {
    fn from(args: CollectArgs) -> Self {
        Self {
            year_from: args.year_from,
            year_to: args.year_to,
            days_back: args.days_back,
            site: args.site,
            specific_model: args.model,
            priority: args.priority,
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await?,
        Commands::Collect(args) => {
            let runtime = Runtime::from_config(IngestConfig {
                refresh_mode: RefreshMode::OneShot,
                ..config
            })
            .await?;
            let make = args.make.clone();
            let job = runtime
                .scheduler
                .enqueue(&make, args.into())
                .await
                .with_context(|| format!("enqueueing {make}"))?;
            info!(job_id = %job.id, key = %job.key, "collecting");
            runtime.scheduler.run_until_idle().await;
            print_json(&runtime.scheduler.get_queue_snapshot().await)?;
        }
        Commands::Sweep => {
            let runtime = Runtime::from_config(config).await?;
            let report = runtime
                .migration
                .migrate_expired()
                .await
                .context("running migration sweep")?;
            print_json(&report)?;
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to apply migrations")?;
            let pool = lotwatch_storage::connect(url).await.context("connecting to postgres")?;
            lotwatch_storage::run_migrations(&pool)
                .await
                .context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Status { progress } => {
            let runtime = Runtime::from_config(config).await?;
            runtime.scheduler.restore().await.context("restoring jobs")?;
            let status = runtime.scheduler.get_status().await.context("building status")?;
            if progress {
                print_json(&serde_json::json!({
                    "status": status,
                    "progress": runtime.scheduler.get_vehicle_progress_summary().await,
                }))?;
            } else {
                print_json(&status)?;
            }
        }
        Commands::AutoCollect { tier } => {
            let runtime = Runtime::from_config(config).await?;
            let catalogue = runtime.load_catalogue()?;
            let report = runtime.auto_collector(catalogue).collect_tier(tier).await;
            print_json(&report)?;
        }
    }

    Ok(())
}

async fn run(config: IngestConfig) -> Result<()> {
    let runtime = Runtime::from_config(config).await?;
    runtime.scheduler.restore().await.context("restoring jobs")?;

    if runtime.config.catalogue_path.exists() {
        let catalogue = runtime.load_catalogue()?;
        runtime
            .scheduler
            .seed_from_catalogue(&catalogue, &EnqueueOptions::default())
            .await
            .context("seeding queue from catalogue")?;
    } else {
        warn!(
            path = %runtime.config.catalogue_path.display(),
            "catalogue not found, starting with restored jobs only"
        );
    }

    let mut sweeps = runtime.migration.clone().spawn_interval().await?;
    runtime.scheduler.start().await;
    info!("lotwatch running, ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    runtime.scheduler.shutdown().await;
    sweeps.shutdown().await.context("stopping migration scheduler")?;
    Ok(())
}
