//! Herald binary entrypoint: HTTP API, due poller and delivery workers in one
//! process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::queue::{Queue, RedisQueue};
use herald_common::redis_pool::create_redis_pool;
use herald_common::store::{RedisStore, Store};
use herald_notifier::{
    ConsumerPool, NotificationSender, RetryPolicy, email_from_config, telegram_from_config,
};
use herald_poller::{DuePoller, PollerConfig};
use herald_scheduler::NotificationScheduler;

use herald_api::routes::create_router;
use herald_api::state::AppState;

/// Largest accepted request body. A maximal notification is well below this.
const MAX_REQUEST_BYTES: usize = 16 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                "herald=info,herald_api=info,herald_common=info,herald_scheduler=info,\
                 herald_poller=info,herald_notifier=info,tower_http=info",
            )
        }))
        .init();

    tracing::info!("Starting Herald...");

    let config = AppConfig::from_env()?;

    let redis = create_redis_pool(&config.redis_url).await?;
    let store: Arc<dyn Store> = Arc::new(RedisStore::new(redis));

    let queue: Arc<dyn Queue> = Arc::new(RedisQueue::new(
        &config.redis_url,
        config.queue_name.as_str(),
    )?);
    queue
        .connect_with_retry(config.broker_connect_attempts, config.broker_connect_pause())
        .await
        .context("Failed to connect to the notification queue")?;

    let cancel = CancellationToken::new();

    // Queue -> bounded channel -> worker pool
    let (messages_tx, messages_rx) = mpsc::channel(config.consumer_buffer);
    let consume_task = tokio::spawn({
        let queue = queue.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(e) = queue.consume(messages_tx, cancel.clone()).await {
                tracing::error!(error = %e, "Queue consumer failed, shutting down");
                cancel.cancel();
            }
        }
    });

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let sender = NotificationSender::new(
        store.clone(),
        email_from_config(&config, &http_client),
        telegram_from_config(&config, &http_client),
        RetryPolicy::from_config(&config),
    )
    .with_status_retention(config.status_retention());
    let pool = ConsumerPool::new(Arc::new(sender), config.consumer_workers);
    let pool_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { pool.run(messages_rx, cancel).await }
    });

    let poller = DuePoller::new(store.clone(), queue.clone(), PollerConfig::from_config(&config));
    let poller_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { poller.run(cancel).await }
    });

    let scheduler = Arc::new(NotificationScheduler::new(
        store.clone(),
        config.delayed_set_name.as_str(),
    ));
    let app = create_router(AppState::new(store.clone(), scheduler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.http_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.http_address))?;
    tracing::info!("API server listening on {}", config.http_address);

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received");
            cancel.cancel();
        }
    });

    let served = axum::serve(listener, app)
        .with_graceful_shutdown({
            let cancel = cancel.clone();
            async move { cancel.cancelled().await }
        })
        .await;

    // Stop producing first, then let in-flight deliveries record their status.
    cancel.cancel();
    if let Err(e) = poller_task.await {
        tracing::error!(error = %e, "Poller task panicked");
    }
    if let Err(e) = consume_task.await {
        tracing::error!(error = %e, "Queue consumer task panicked");
    }
    if let Err(e) = pool_task.await {
        tracing::error!(error = %e, "Consumer pool task panicked");
    }
    if let Err(e) = queue.close().await {
        tracing::warn!(error = %e, "Failed to close queue");
    }

    tracing::info!("Herald stopped");
    served.context("HTTP server failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
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
