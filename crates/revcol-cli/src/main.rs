use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use revcol_core::Platform;
use revcol_storage::PgReviewStore;
use revcol_sync::{CollectorConfig, CollectorRuntime, Strategy};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "revcol-cli")]
#[command(about = "App review collector command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyKind {
    Complete,
    Incremental,
    Targeted,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one collection job in the foreground and print its final state.
    Collect {
        #[arg(long)]
        app_id: String,
        #[arg(long, default_value = "appstore")]
        platform: Platform,
        #[arg(long, value_enum, default_value = "complete")]
        strategy: StrategyKind,
        /// Country codes or region names for the targeted strategy.
        #[arg(long, value_delimiter = ',')]
        countries: Vec<String>,
        #[arg(long)]
        max_pages: Option<u32>,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the JSON API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Collect {
            app_id,
            platform,
            strategy,
            countries,
            max_pages,
        } => {
            let strategy = match strategy {
                StrategyKind::Complete => Strategy::Complete,
                StrategyKind::Incremental => Strategy::Incremental,
                StrategyKind::Targeted => Strategy::Targeted {
                    countries,
                    max_pages_per_country: max_pages,
                },
            };
            collect(&app_id, platform, strategy).await?;
        }
        Commands::Migrate => {
            let config = CollectorConfig::from_env();
            let Some(url) = config.database_url else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgReviewStore::connect(&url).await.context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve { port } => match port {
            Some(port) => revcol_web::serve(CollectorRuntime::from_env().await?, port).await?,
            None => revcol_web::serve_from_env().await?,
        },
    }

    Ok(())
}

async fn collect(app_id: &str, platform: Platform, strategy: Strategy) -> Result<()> {
    let runtime = CollectorRuntime::from_env().await?;
    let started = runtime.manager.create_job(app_id, platform, strategy).await?;
    info!(job_id = %started.job_id, "collection started");

    let mut last_progress = None;
    let job = loop {
        let job = runtime
            .manager
            .get_status(&started.job_id)
            .await
            .context("job disappeared from the registry")?;
        // Terminal, or paused with its partial results stored.
        if job.status.is_terminal() || job.stats.is_some() {
            break job;
        }
        if last_progress != Some(job.progress) {
            println!(
                "{}: {}% ({}/{} countries, {} reviews)",
                job.id, job.progress, job.completed_countries, job.total_countries, job.reviews_collected
            );
            last_progress = Some(job.progress);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    };

    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}
