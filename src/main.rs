mod app;
mod args;
mod config;
mod db;
mod util;
mod version;

use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{
    fmt::layer as fmt_layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::app::{edev_app, load_templates, sessions, state::*};
use crate::config::SiteConfig;
use crate::db::Gateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = args::Args::parse();
    // Config comes first, since it doesn't need tracing and tracing might
    // someday need it.
    let config = SiteConfig::load(args.config.as_deref())?;

    // Set up tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt_layer())
        .init();
    info!(
        commit = version::commit_sha(),
        built = version::build_date(),
        "starting up"
    );

    // Storage
    let db = Gateway::open(&config.database_url, config.database).await?;
    if let Err(e) = db::apply_schema(&db).await {
        db.close().await;
        return Err(e.into());
    }

    // Build the app state
    let listen_addr = config.listen_addr();
    let templates = load_templates()?;
    let state: AppState = Arc::new(AppInner::new(db.clone(), config, templates)?);

    // Background sweeps
    state
        .task_tracker
        .spawn(sessions::janitor(state.clone(), sessions::CLEANUP_INTERVAL));

    let app = edev_app(state.clone());
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("listening on {}", listen_addr);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(e) = &served {
        error!("server stopped with an error: {}", e);
    }

    // Wind down: stop background tasks, wait for them, then close storage.
    info!("shutting down");
    state.cancel_token.cancel();
    state.task_tracker.close();
    state.task_tracker.wait().await;
    db.close().await;

    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("couldn't install ctrl-c handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("couldn't install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
