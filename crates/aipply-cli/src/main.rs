use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aipply_store::OpportunityStore;
use aipply_sync::{
    maybe_build_scheduler, AppConfig, FixtureScraper, HttpScraper, RefreshOrchestrator,
    ScrapeHints, Scraper, SourceRegistry,
};
use aipply_web::AppState;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "aipply-cli")]
#[command(about = "AIpply opportunity search service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (with the optional cron refresh scheduler).
    Serve,
    /// Scrape once and upsert into the store, then print the counts.
    Refresh {
        #[arg(long)]
        keyword: Option<String>,
        #[arg(long)]
        region: Option<String>,
        #[arg(long = "type")]
        kind: Option<String>,
        /// Load candidates from a JSON fixture file instead of the live sources.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Create the opportunities table if it does not exist.
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    let store = OpportunityStore::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    store.init_schema().await.context("initializing schema")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let scraper = live_scraper(&config)?;
            let orchestrator = Arc::new(RefreshOrchestrator::new(store.clone(), scraper));
            if let Some(scheduler) = maybe_build_scheduler(&config, Arc::clone(&orchestrator)).await? {
                scheduler.start().await.context("starting scheduler")?;
            }
            let state = AppState {
                store,
                orchestrator,
                stale_after_hours: config.stale_after_hours,
            };
            aipply_web::serve(state, config.port).await?;
        }
        Commands::Refresh {
            keyword,
            region,
            kind,
            fixtures,
        } => {
            let scraper: Arc<dyn Scraper> = match fixtures {
                Some(path) => Arc::new(FixtureScraper::new(path)),
                None => live_scraper(&config)?,
            };
            let orchestrator = RefreshOrchestrator::new(store, scraper);
            let outcome = orchestrator
                .refresh(&ScrapeHints {
                    keyword,
                    region,
                    kind,
                })
                .await?;
            println!(
                "refresh complete: run_id={} scraped={} added={}",
                outcome.run_id, outcome.scraped, outcome.added
            );
        }
        Commands::InitDb => {
            println!("schema ready at {}", config.database_url);
        }
    }

    Ok(())
}

fn live_scraper(config: &AppConfig) -> Result<Arc<dyn Scraper>> {
    let registry = if config.sources_path.exists() {
        SourceRegistry::from_yaml_path(&config.sources_path)?
    } else {
        warn!(
            path = %config.sources_path.display(),
            "no source registry found, live scrapes will yield nothing"
        );
        SourceRegistry::default()
    };
    let scraper = HttpScraper::new(
        registry,
        &config.user_agent,
        Duration::from_secs(config.http_timeout_secs),
    )?;
    Ok(Arc::new(scraper))
}
