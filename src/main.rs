use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config as LogConfig, Root};
use log4rs::encode::pattern::PatternEncoder;
use sqlx::postgres::PgPoolOptions;

use folio_credits::clock::SystemClock;
use folio_credits::repositories::auth::RemoteTokenVerifier;
use folio_credits::repositories::store::{DocumentStore, MemoryStore, PgStore};
use folio_credits::services;
use folio_credits::settings::{Settings, StoreBackend};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "folio.toml")]
    config: String,
    #[arg(short, long)]
    listen: Option<String>,
    #[arg(long, default_value = "log4rs.yaml")]
    log4rs: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    let mut settings = Settings::new(&args.config).expect("Could not load config file.");
    if let Some(listen) = args.listen {
        settings.http.listen = listen;
    }

    init_logging(&args.log4rs)?;
    log::info!("Starting folio credits service.");

    let store = open_store(&settings).await?;
    let verifier = Arc::new(RemoteTokenVerifier::new(settings.auth.verify_url.clone()));

    services::start_services(store, Arc::new(SystemClock), verifier, settings).await
}

async fn open_store(settings: &Settings) -> Result<Arc<dyn DocumentStore>> {
    match settings.store.backend {
        StoreBackend::Memory => {
            log::warn!("Using the in-memory store; balances are lost on restart.");
            Ok(Arc::new(MemoryStore::with_max_retries(settings.store.max_retries)))
        }
        StoreBackend::Postgres => {
            let Some(postgres) = &settings.postgres else {
                anyhow::bail!("store.backend is postgres but no [postgres] section is configured");
            };
            let conn = PgPoolOptions::new()
                .max_connections(postgres.max_connections)
                .connect(&postgres.url)
                .await?;

            let store = PgStore::new(conn, settings.store.max_retries);
            store.migrate().await?;
            log::info!("Connected to Postgres document store.");
            Ok(Arc::new(store))
        }
    }
}

fn init_logging(path: &str) -> Result<()> {
    if !Path::new("logs").exists() {
        fs::create_dir("logs")?;
    }

    match log4rs::init_file(path, Default::default()) {
        Ok(_) => {
            println!("[*] Logging initialized from {}.", path);
            Ok(())
        }
        Err(e) => {
            println!("[WARN] Could not load {} ({}), logging to stdout.", path, e);
            let stdout = ConsoleAppender::builder()
                .encoder(Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S)} {l} {t} - {m}{n}")))
                .build();
            let config = LogConfig::builder()
                .appender(Appender::builder().build("stdout", Box::new(stdout)))
                .build(Root::builder().appender("stdout").build(LevelFilter::Info))?;
            log4rs::init_config(config)?;
            Ok(())
        }
    }
}
