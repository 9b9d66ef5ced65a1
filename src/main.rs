use clap::{Parser, Subcommand};
use occasion_scraper::apis::gaspedaal::GaspedaalClient;
use occasion_scraper::apis::LiveEnrichment;
use occasion_scraper::config::Config;
use occasion_scraper::logging;
use occasion_scraper::pipeline::{scrape_into_store, Normalizer};
use occasion_scraper::storage::{SqliteStorage, Storage};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "occasion_scraper")]
#[command(about = "Used-car occasion scraper and enrichment pipeline")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape the search results page into the raw listing store
    Scrape,
    /// Enrich today's raw listings into the normalized store
    Normalize,
    /// Run both scrape and normalize sequentially
    Run,
}

async fn run_scrape(config: &Config, storage: Arc<dyn Storage>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔄 Scraping search results...");
    let client = GaspedaalClient::new(config)?;
    match scrape_into_store(&client, storage).await {
        Ok(count) => {
            info!("Scrape finished");
            println!("✅ Scraped {count} raw listings");
        }
        Err(e) => {
            error!("Scrape failed: {}", e);
            println!("❌ Scrape failed: {e}");
        }
    }
    Ok(())
}

async fn run_normalize(config: &Config, storage: Arc<dyn Storage>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔧 Normalizing today's listings...");
    let enrichment = Arc::new(LiveEnrichment::new(config)?);
    let normalizer = Normalizer::new(storage, enrichment, config);

    match normalizer.run().await {
        Ok(result) => {
            info!("Normalize run finished");
            println!("\n📊 Normalize results:");
            println!("   Total listings: {}", result.total_listings);
            println!("   Normalized: {}", result.normalized);
            println!("   Skipped: {}", result.skipped);
            println!("   Errors: {}", result.errors.len());

            if !result.errors.is_empty() {
                println!("\n⚠️  Errors encountered:");
                for error in &result.errors {
                    println!("   - {error}");
                }
            }
        }
        Err(e) => {
            error!("Normalize run failed: {}", e);
            println!("❌ Normalize run failed: {e}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    logging::init_logging();

    let cli = Cli::parse();
    let config = Config::load()?;
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(&config.database_path)?);

    match cli.command {
        Commands::Scrape => {
            run_scrape(&config, storage).await?;
        }
        Commands::Normalize => {
            run_normalize(&config, storage).await?;
        }
        Commands::Run => {
            println!("🚀 Running full pipeline (scrape + normalize)...\n");
            run_scrape(&config, storage.clone()).await?;
            println!();
            run_normalize(&config, storage).await?;
        }
    }
    Ok(())
}
