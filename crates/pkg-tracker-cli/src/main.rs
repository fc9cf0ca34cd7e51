use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use pkg_tracker_core::db::migrate::Migrator;
use pkg_tracker_core::email::{EmailPipeline, EmailScanner, GmailClient, HttpGateway};
use pkg_tracker_core::extractor::{Extractor, HttpLlmExtractor};
use pkg_tracker_core::repository::Store;
use pkg_tracker_core::Config;

#[derive(Parser)]
#[command(
    name = "pkg-tracker",
    about = "Self-hosted package tracking: API server, tracking updater, email scanner",
    version
)]
struct Cli {
    #[arg(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[arg(short, long, help = "Enable verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Start the HTTP API server with the background workers
    Server {
        #[arg(short = 'H', long, help = "Bind address override")]
        host: Option<String>,

        #[arg(short = 'P', long, help = "Port override")]
        port: Option<u16>,
    },

    /// Run the standalone email-scanning daemon (talks to the API over
    /// loopback HTTP)
    EmailScanner,

    /// Run database migrations and exit
    Migrate,

    /// Check database health
    Health,

    /// Show or validate the effective configuration
    Config {
        #[arg(short, long, help = "Print the full configuration")]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    info!("pkg-tracker v{}", pkg_tracker_core::VERSION);

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Some(Commands::Server { host, port }) => {
            let mut config = config;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            pkg_tracker_api::run(config).await?;
        }

        Some(Commands::EmailScanner) => {
            run_email_scanner(config).await?;
        }

        Some(Commands::Migrate) => {
            let pool = pkg_tracker_core::create_pool(&config.database.path).await?;
            let migrator = Migrator::new(pool);
            migrator.migrate().await?;
            info!("migrations complete ({} applied)", migrator.applied_count().await?);
        }

        Some(Commands::Health) => {
            run_health_check(&config).await?;
        }

        Some(Commands::Config { show }) => {
            config.validate()?;
            info!("configuration is valid");
            if show {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }

        None => {
            info!("no command specified, starting server");
            pkg_tracker_api::run(config).await?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let directive = if verbose {
        "pkg_tracker=debug,tower_http=debug,sqlx=warn"
    } else {
        "pkg_tracker=info,tower_http=warn,sqlx=error"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive)),
        )
        .with_target(false)
        .init();
}

/// The standalone scanner keeps its email entities in its own database file
/// (or the main one if no separate path is configured) and creates shipments
/// through the API like any other client.
async fn run_email_scanner(config: Config) -> Result<()> {
    let db_path = config
        .database
        .email_path
        .clone()
        .unwrap_or_else(|| config.database.path.clone());
    let pool = pkg_tracker_core::create_pool(&db_path).await?;
    pkg_tracker_core::auto_migrate(&pool).await?;
    let store = Store::new(pool);

    let mailbox = Arc::new(GmailClient::new(config.email.oauth.clone()));
    let extractor = if config.llm.enabled {
        Extractor::with_llm(Arc::new(HttpLlmExtractor::new(config.llm.clone())))
    } else {
        Extractor::new()
    };
    let gateway = Arc::new(HttpGateway::new(
        config.email.api_url.clone(),
        config.email.api_retry_count,
        config.email.api_retry_delay_secs,
    ));
    let pipeline = EmailPipeline::new(
        store.emails.clone(),
        gateway,
        extractor,
        config.email.clone(),
    );
    let scanner = Arc::new(EmailScanner::new(
        mailbox,
        pipeline,
        store.emails.clone(),
        config.email.clone(),
    ));

    info!(
        api_url = %config.email.api_url,
        dry_run = config.email.dry_run,
        "email scanner starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = scanner.spawn(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    handle.await?;

    Ok(())
}

async fn run_health_check(config: &Config) -> Result<()> {
    let pool = pkg_tracker_core::create_pool(&config.database.path).await?;
    let migrator = Migrator::new(pool.clone());
    let applied = migrator.applied_count().await?;
    let store = Store::new(pool);

    match store.shipments.health_check().await {
        Ok(()) => {
            let stats = store.shipments.dashboard_stats().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "healthy": true,
                    "migrations_applied": applied,
                    "shipments": stats.total_shipments,
                    "delivered": stats.delivered,
                }))?
            );
            Ok(())
        }
        Err(e) => {
            error!("store is unhealthy: {}", e);
            std::process::exit(1);
        }
    }
}
