use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clinic_relay::cache::SqliteTtlCache;
use clinic_relay::clients::{HttpMessagingClient, SquareOrdersClient};
use clinic_relay::config::Config;
use clinic_relay::db::Database;
use clinic_relay::delayed::{DelayedTaskQueue, DelayedTaskRunner, RunnerConfig};
use clinic_relay::leads::{DEPOSIT_STATUS_TASK, DepositStatusTaskHandler, LeadRepository, SqliteLeadRepository};
use clinic_relay::messaging::{HostedOrderStore, MessageStore};
use clinic_relay::notify::PaymentConfirmationHandler;
use clinic_relay::numbers::StaticNumberResolver;
use clinic_relay::outbox::{Deliverer, FanoutHandler, LoggingHandler, OutboxStore};
use clinic_relay::server::{AppState, build_router};
use clinic_relay::velocity::{SqliteCounterStore, VelocityChecker};
use clinic_relay::webhooks::{
    PAYMENT_SUCCEEDED_V1, PaymentIngestor, ProviderRegistry, SquareProvider, StripeProvider,
};
use clinic_relay::worker::{ExpirySweeper, HostedPoller, RetrySender, run_periodic};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clinic_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let db = Database::connect(&config.database_url, config.database_max_connections).await?;

    // Collaborators
    let leads: Arc<dyn LeadRepository> = Arc::new(SqliteLeadRepository::new(db.clone()));
    let numbers = StaticNumberResolver::parse(&config.default_from_numbers);
    if numbers.is_empty() {
        warn!("No default from numbers configured; confirmations need a from_number in metadata");
    }
    let tasks = DelayedTaskQueue::new(db.clone());
    let messaging = HttpMessagingClient::new(
        &config.messaging_api_url,
        config.messaging_api_key.clone(),
        config.http_timeout,
    )?;

    let velocity = VelocityChecker::new(Arc::new(SqliteCounterStore::new(db.clone())), config.velocity.clone());
    let mut ingestor = PaymentIngestor::new(db.clone(), leads.clone(), Arc::new(numbers))
        .with_task_queue(tasks.clone())
        .with_velocity(velocity);
    if config.square_access_token.is_empty() {
        info!("Square access token not set; order metadata fallback disabled");
    } else {
        let orders = SquareOrdersClient::new(
            config.square_access_token.clone(),
            &config.square_api_url,
            config.http_timeout,
        )?;
        ingestor = ingestor.with_order_fetcher(Arc::new(orders));
    }

    let registry = ProviderRegistry::new()
        .register(Arc::new(SquareProvider::new(config.square_signature_key.as_bytes())))
        .register(Arc::new(
            StripeProvider::new(config.stripe_webhook_secret.as_bytes()).with_tolerance(config.stripe_tolerance),
        ));
    for name in registry.names() {
        info!(provider = name, path = %format!("/webhooks/{name}"), "Provider registered");
    }

    // Workers
    let shutdown = CancellationToken::new();
    let message_store = MessageStore::new(db.clone());

    let fanout = FanoutHandler::new()
        .route(PAYMENT_SUCCEEDED_V1, Arc::new(LoggingHandler))
        .route(
            PAYMENT_SUCCEEDED_V1,
            Arc::new(PaymentConfirmationHandler::new(message_store.clone(), messaging.clone())),
        );
    let deliverer = Deliverer::new(OutboxStore::new(db.clone()), fanout)
        .with_interval(config.outbox_interval)
        .with_batch_size(config.outbox_batch_size);

    let retry = RetrySender::new(message_store, messaging.clone())
        .with_max_attempts(config.retry.max_attempts)
        .with_base_delay(config.retry.base_delay)
        .with_interval(config.retry.interval)
        .with_batch_size(config.retry.batch_size);

    let poller = HostedPoller::new(HostedOrderStore::new(db.clone()), messaging)
        .with_interval(config.hosted_poll_interval);

    let runner = DelayedTaskRunner::new(tasks, RunnerConfig::default())
        .with_handler(DEPOSIT_STATUS_TASK, Arc::new(DepositStatusTaskHandler::new(leads)));

    let sweeper = ExpirySweeper::new(SqliteTtlCache::new(db.clone()), SqliteCounterStore::new(db.clone()));

    let workers = vec![
        tokio::spawn(run_periodic(deliverer, shutdown.clone())),
        tokio::spawn(run_periodic(retry, shutdown.clone())),
        tokio::spawn(run_periodic(poller, shutdown.clone())),
        tokio::spawn(run_periodic(runner, shutdown.clone())),
        tokio::spawn(run_periodic(sweeper, shutdown.clone())),
    ];

    // HTTP
    let app = build_router(AppState::new(
        registry,
        ingestor,
        db.clone(),
        config.public_base_url.clone(),
    ));
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!("listening on {}", config.listen_addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Could not listen for shutdown signal");
            }
            info!("Shutdown requested");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Worker task panicked");
        }
    }
    db.close().await;
    info!("Shutdown complete");
    Ok(())
}
