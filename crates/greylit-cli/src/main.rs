use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use greylit_core::SearchQueryTier;
use greylit_search::{Accumulator, CseClient, CseConfig};
use greylit_store::{AirtableClient, AirtableConfig, UpsertClient, UpsertOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "greylit")]
#[command(about = "Greylit Searcher command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web UI.
    Serve,
    /// Run a search from the terminal and optionally save the results.
    Search(SearchArgs),
}

#[derive(Debug, Args)]
struct SearchArgs {
    /// Website to search; repeat for multiple sites.
    #[arg(long = "site", required = true)]
    sites: Vec<String>,
    /// "All these words" terms; each occurrence fills the next search tier.
    #[arg(long = "all")]
    all: Vec<String>,
    /// "This exact word or phrase"; each occurrence fills the next tier.
    #[arg(long = "exact")]
    exact: Vec<String>,
    /// "Any of these words"; each occurrence fills the next tier.
    #[arg(long = "any")]
    any: Vec<String>,
    /// "None of these words"; each occurrence fills the next tier.
    #[arg(long = "exclude")]
    exclude: Vec<String>,
    /// Upsert the results to Airtable after searching.
    #[arg(long)]
    save: bool,
    /// Skip the per-link duplicate lookup before each write.
    #[arg(long)]
    no_check_duplicates: bool,
}

impl SearchArgs {
    fn tiers(&self) -> Vec<SearchQueryTier> {
        (0..3)
            .map(|i| SearchQueryTier {
                all_terms: self.all.get(i).cloned().unwrap_or_default(),
                exact_phrase: self.exact.get(i).cloned().unwrap_or_default(),
                any_terms: self.any.get(i).cloned().unwrap_or_default(),
                none_terms: self.exclude.get(i).cloned().unwrap_or_default(),
            })
            .collect()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,greylit_search=debug,greylit_store=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve => greylit_web::serve_from_env().await,
        Commands::Search(args) => run_search(args).await,
    }
}

async fn run_search(args: SearchArgs) -> Result<()> {
    let tiers = args.tiers();
    if !tiers.iter().any(SearchQueryTier::is_active) {
        bail!("at least one of --all/--exact/--any/--exclude is required");
    }

    let config = CseConfig::from_env();
    if config.credentials.is_empty() {
        bail!("no search credentials; set GREYLIT_CSE_KEYS and GREYLIT_CSE_CX");
    }
    let client = CseClient::new(config)?;

    let accumulator = Accumulator::new(&client);
    let run = accumulator.run(&args.sites, &tiers).await;

    for site in &run.sites {
        println!("{}: {} results ({})", site.site, site.len(), site.query_label);
        for item in &site.items {
            println!("  [{}] {}  {}", item.priority, item.title, item.link);
        }
    }
    println!("{} total results", run.total_results());
    if run.limit_exceeded {
        eprintln!("rate limit exceeded; results may be incomplete");
    }

    if args.save {
        let config = AirtableConfig::from_env();
        if !config.is_configured() {
            bail!("airtable is not configured; set AIRTABLE_TOKEN and AIRTABLE_BASE_ID");
        }
        let store = AirtableClient::new(config)?;
        let options = UpsertOptions {
            verify_duplicates: !args.no_check_duplicates,
            ..Default::default()
        };
        let upserter = UpsertClient::new(&store, options);
        let stats = upserter
            .save_results(&run.sites, |progress| {
                eprintln!("saved {}/{}", progress.processed, progress.total);
            })
            .await;
        println!(
            "save complete: processed={} created={} duplicates={} errors={}",
            stats.processed, stats.created, stats.duplicates, stats.errors
        );
    }

    Ok(())
}
