use std::sync::Arc;

use sea_orm::Database;
use tokio::sync::watch;
use tracing::{info, warn};

use courier_core::config::Config;
use courier_core::tracing::init_tracing;
use courier_relay::channel::DurableChannel;
use courier_relay::config::{LockBackendKind, RelayConfig};
use courier_relay::infra::broker::{RedisStreamConsumer, RedisStreamPublisher};
use courier_relay::infra::cache::RedisProcessedLog;
use courier_relay::infra::db::DbOutboxStore;
use courier_relay::infra::lock::{LocalLockRegistry, LockBackend, RedisLockRegistry};
use courier_relay::relay::RelayScheduler;
use courier_relay::router::build_router;
use courier_relay::state::AppState;
use courier_relay::usecase::consume::{ConsumeUseCase, LoggingHandler};

const CONSUMER_BATCH_SIZE: usize = 16;

#[tokio::main]
async fn main() {
    init_tracing("info,sqlx=warn");

    let config = RelayConfig::from_env();

    let db = Database::connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    let redis_cfg = deadpool_redis::Config::from_url(&config.redis_url);
    let redis = redis_cfg
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .expect("failed to create Redis pool");

    let channel = Arc::new(
        DurableChannel::new(DbOutboxStore { db: db.clone() }, config.outbox_capacity)
            .with_poll_interval(config.poll_interval()),
    );

    let locks = match config.lock_backend {
        LockBackendKind::Redis => {
            LockBackend::Redis(RedisLockRegistry::new(redis.clone(), config.lock_lease()))
        }
        LockBackendKind::Local => {
            warn!("local lock backend selected; run a single relay instance only");
            LockBackend::Local(LocalLockRegistry::new(config.lock_lease()))
        }
    };
    let publisher = RedisStreamPublisher::new(redis.clone(), config.outbox_topic.clone())
        .with_max_len(config.stream_max_len);
    let scheduler = RelayScheduler::new(
        Arc::clone(&channel),
        locks,
        publisher,
        config.relay_settings(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay_task = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { scheduler.run(shutdown).await }
    });

    let consumer_task = config.consumer_enabled.then(|| {
        let consumer = RedisStreamConsumer {
            pool: redis.clone(),
            stream: config.outbox_topic.clone(),
            group: config.consumer_group.clone(),
            consumer: config.consumer_name.clone(),
            block: config.consumer_block(),
            batch_size: CONSUMER_BATCH_SIZE,
            claim_idle: config.consumer_claim_idle(),
            max_deliveries: config.consumer_max_deliveries.max(1),
            dead_letter_stream: config.dead_letter_stream(),
        };
        let usecase = ConsumeUseCase {
            handler: LoggingHandler,
            processed: RedisProcessedLog::new(
                redis.clone(),
                config.processed_ttl(),
                config.processing_lease(),
            ),
        };
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = consumer.run(&usecase, shutdown).await {
                tracing::error!(error = %e.detail(), "consumer exited");
            }
        })
    });

    let state = AppState { db, channel };
    let router = build_router(state);
    let addr = format!("0.0.0.0:{}", config.relay_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind");

    info!("relay service listening on {addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .expect("server error");

    if let Err(e) = relay_task.await {
        warn!(error = %e, "relay task panicked");
    }
    if let Some(task) = consumer_task {
        if let Err(e) = task.await {
            warn!(error = %e, "consumer task panicked");
        }
    }
    info!("relay service stopped");
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
    let _ = shutdown.send(true);
}
