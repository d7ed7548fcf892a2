use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pixwatch_ingestor::http::{router, AppState};
use pixwatch_ingestor::{
    BankClient, Config, CredentialManager, FanOut, IngestionPipeline, PollError, Publisher,
    SqliteStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pixwatch_ingestor=debug")),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    info!(
        "Starting pixwatch ({:?} bank environment, listening on {})",
        config.environment, config.http_bind
    );

    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("failed to open store at {}", config.database_path.display()))?;
    info!("Store ready at {}", config.database_path.display());

    let tokens = CredentialManager::new(config.oauth.clone()).context("failed to build token client")?;
    let source = BankClient::new(config.bank.clone()).context("failed to build bank client")?;

    let fanout = match &config.redis_url {
        Some(url) => match Publisher::connect(url, config.redis_channel.clone()).await {
            Ok(publisher) => {
                info!("Mirroring realtime events to Redis channel {}", publisher.channel());
                FanOut::with_mirror(publisher)
            }
            Err(e) => {
                warn!("Redis unavailable, continuing without mirror: {}", e);
                FanOut::new()
            }
        },
        None => FanOut::new(),
    };

    let pipeline = Arc::new(IngestionPipeline::new(
        Arc::new(tokens),
        Arc::new(source),
        Arc::new(store),
        Arc::new(fanout),
        config.poll_window,
    ));

    match config.poll_interval {
        Some(period) => {
            info!("Polling the bank API every {}s", period.as_secs());
            tokio::spawn(run_scheduler(Arc::clone(&pipeline), period));
        }
        None => info!("Built-in scheduler disabled; POST /poll to trigger a cycle"),
    }

    let app = router(AppState::new(pipeline, config.webhook_secret.clone()));
    let listener = TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind))?;
    info!("HTTP server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Shutdown complete");
    Ok(())
}

async fn run_scheduler(pipeline: Arc<IngestionPipeline>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        match pipeline.run_poll_cycle().await {
            Ok(_) => {}
            Err(PollError::AlreadyRunning) => warn!("Skipping tick: previous poll cycle still running"),
            // Already logged by the pipeline
            Err(_) => {}
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
