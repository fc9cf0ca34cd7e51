//! Server assembly: store, carrier factory, gate, background workers, and
//! the axum listener with bounded graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use pkg_tracker_core::carriers::ClientFactory;
use pkg_tracker_core::db::migrate::auto_migrate;
use pkg_tracker_core::email::{
    EmailPipeline, EmailScanner, GmailClient, MailboxClient, StoreGateway,
};
use pkg_tracker_core::extractor::{Extractor, HttpLlmExtractor};
use pkg_tracker_core::refresh::{evictor, RefreshGate};
use pkg_tracker_core::repository::Store;
use pkg_tracker_core::updater::TrackingUpdater;
use pkg_tracker_core::{Config, Error, Result};

use crate::routes::create_router;
use crate::state::AppState;

/// Run the API server plus its background workers until shutdown.
pub async fn run(config: Config) -> Result<()> {
    let pool = pkg_tracker_core::create_pool(&config.database.path).await?;
    auto_migrate(&pool).await?;
    let store = Store::new(pool);

    let factory = Arc::new(ClientFactory::new(config.carriers.clone()));
    let gate = Arc::new(RefreshGate::new(
        store.clone(),
        factory.clone(),
        config.cache.ttl_secs,
        config.cache.disabled,
    ));
    let updater = Arc::new(TrackingUpdater::new(
        store.clone(),
        gate.clone(),
        factory.clone(),
        config.update.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers: Vec<(&str, JoinHandle<()>)> = Vec::new();

    workers.push(("updater", updater.clone().spawn(shutdown_rx.clone())));
    workers.push((
        "cache-evictor",
        evictor::spawn(store.cache.clone(), shutdown_rx.clone()),
    ));

    // The mailbox scanner runs in-process when credentials are configured;
    // it can also be run as its own daemon via the email-scanner command
    if mailbox_configured(&config) {
        let scanner = build_scanner(&config, &store);
        workers.push(("email-scanner", scanner.spawn(shutdown_rx.clone())));
        info!("in-process email scanner enabled");
    }

    let state = AppState::new(
        store,
        factory.clone(),
        gate,
        updater,
        config.admin.clone(),
    );
    let app = create_router(state, &config.server);

    let addr = SocketAddr::from((
        config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .map_err(|e| Error::Config(format!("Invalid host: {}", e)))?,
        config.server.port,
    ));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Network(format!("failed to bind {}: {}", addr, e)))?;
    info!("pkg-tracker API listening on http://{}", addr);

    let signal_tx = shutdown_tx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(signal_tx))
        .await
        .map_err(|e| Error::Network(e.to_string()))?;

    // The listener is closed; give workers a bounded window to wind down
    let _ = shutdown_tx.send(true);
    let deadline = Duration::from_secs(config.server.graceful_shutdown_secs);
    for (name, handle) in workers {
        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(())) => info!(worker = name, "worker stopped"),
            Ok(Err(e)) => error!(worker = name, "worker panicked: {}", e),
            Err(_) => warn!(worker = name, "worker did not stop within the shutdown window"),
        }
    }
    factory.shutdown().await;

    Ok(())
}

pub fn mailbox_configured(config: &Config) -> bool {
    !config.email.oauth.client_id.is_empty() && !config.email.oauth.refresh_token.is_empty()
}

/// Scanner wired for in-process use: store-backed gateway, optional LLM.
pub fn build_scanner(config: &Config, store: &Store) -> Arc<EmailScanner> {
    let mailbox: Arc<dyn MailboxClient> = Arc::new(GmailClient::new(config.email.oauth.clone()));
    let extractor = if config.llm.enabled {
        Extractor::with_llm(Arc::new(HttpLlmExtractor::new(config.llm.clone())))
    } else {
        Extractor::new()
    };
    let gateway = Arc::new(StoreGateway::new(store.shipments.clone()));
    let pipeline = EmailPipeline::new(
        store.emails.clone(),
        gateway,
        extractor,
        config.email.clone(),
    );
    Arc::new(EmailScanner::new(
        mailbox,
        pipeline,
        store.emails.clone(),
        config.email.clone(),
    ))
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install ctrl-c handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
