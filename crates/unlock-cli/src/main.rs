use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use unlock_core::CatalogFilter;
use unlock_provider::{LockerProviderClient, OfferProvider};
use unlock_session::{
    controller_from_env, load_catalog, LoadOutcome, Navigator, SessionConfig, EMPTY_MESSAGE,
    FAILED_MESSAGE, PREPARING_MESSAGE, READY_MESSAGE,
};

#[derive(Debug, Parser)]
#[command(name = "unlock-cli")]
#[command(about = "Offer-gated script unlock command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List catalog entries.
    Catalog {
        #[arg(long, default_value = "all")]
        filter: CatalogFilter,
    },
    /// Fetch one offer batch and print it.
    Offers {
        #[arg(long)]
        ip: Option<String>,
        #[arg(long)]
        max: Option<usize>,
    },
    /// Run an unlock session for ITEM and print the revealed URL.
    Unlock {
        item: String,
        #[arg(long, default_value_t = 0)]
        offer: usize,
    },
    /// Run the web surface.
    Serve,
}

struct PrintNavigator;

impl Navigator for PrintNavigator {
    fn open(&self, url: &str) {
        println!("open offer: {url}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Catalog {
        filter: CatalogFilter::All,
    }) {
        Commands::Catalog { filter } => {
            let catalog = load_catalog(&SessionConfig::from_env())?;
            for entry in catalog.filtered(filter) {
                println!("{:<22} {:<26} {}", entry.id, entry.name, entry.script_url);
            }
        }
        Commands::Offers { ip, max } => {
            let client = LockerProviderClient::from_env()?;
            let address = match ip {
                Some(ip) => ip,
                None => client.resolve_client_address().await,
            };
            let config = SessionConfig::from_env();
            let batch = client
                .fetch_offers(&address, &config.client_agent, max.unwrap_or(config.max_offers))
                .await;
            if !batch.success {
                bail!(
                    "{FAILED_MESSAGE}: {}",
                    batch.error.unwrap_or_else(|| "unknown error".into())
                );
            }
            if batch.is_empty() {
                println!("{EMPTY_MESSAGE}");
            }
            for (index, offer) in batch.offers.iter().enumerate() {
                println!("[{index}] {} ({}) {}", offer.title, offer.difficulty, offer.url);
            }
        }
        Commands::Unlock { item, offer } => run_unlock(&item, offer).await?,
        Commands::Serve => unlock_web::serve_from_env().await?,
    }

    Ok(())
}

async fn run_unlock(item: &str, offer_index: usize) -> Result<()> {
    let controller = controller_from_env(Arc::new(PrintNavigator))?;
    controller.open(item);

    match controller.load_offers().await {
        LoadOutcome::Shown { count: 0 } => bail!(EMPTY_MESSAGE),
        LoadOutcome::Shown { count } => info!(count, "offers loaded"),
        LoadOutcome::Failed { message } => bail!("{FAILED_MESSAGE}: {message}"),
        other => bail!("offer load did not complete: {other:?}"),
    }

    let offers = controller.offers();
    let chosen = offers
        .get(offer_index)
        .with_context(|| format!("offer index {offer_index} out of range (0..{})", offers.len()))?;
    controller.select_offer(chosen)?;
    println!("{PREPARING_MESSAGE}");

    let poll = controller.config().tick_period;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                controller.close();
                bail!("interrupted before the countdown finished");
            }
            _ = tokio::time::sleep(poll) => {}
        }
        let view = controller.view();
        if view.reveal_ready {
            println!("{READY_MESSAGE}");
            if let Some(url) = view.reveal_url {
                println!("{url}");
            }
            return Ok(());
        }
    }
}
