#![forbid(unsafe_code)]

pub mod charging;
pub mod clock;
pub mod config;
pub mod db;
pub mod discount;
pub mod error;
pub mod event_log;
pub mod price;
pub mod queue;
pub mod release;
pub mod reservation;
pub mod server;
pub mod store;
pub mod task_registry;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context;
use aws_sdk_sqs::Client as SqsClient;
use tokio::net::TcpListener;
use tracing::info;

use crate::charging::{longrun::LongrunCharger, oneshot::OneshotCharger, storage::StorageCharger};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, StoreBackend};
use crate::db::RuntimeDb;
use crate::queue::{
    longrun::LongrunConsumer, oneshot::OneshotConsumer, storage::StorageConsumer, QueueConsumer,
    QueueRuntime,
};
use crate::release::ReleaseService;
use crate::reservation::ReservationService;
use crate::server::AppState;

/// Everything the runtime needs to serve HTTP requests and drive the six
/// background loops (three chargers, three queue consumers). Built once at
/// startup from `Config` and handed to `axum::serve` / `tokio::spawn`.
pub struct RuntimeState {
    pub app_state: AppState,
    db: Option<Arc<RuntimeDb>>,
    config: Config,
    clock: Arc<dyn Clock>,
}

impl RuntimeState {
    pub async fn build(config: Config) -> Result<Self, anyhow::Error> {
        let db = match config.store_backend {
            StoreBackend::Memory => None,
            StoreBackend::Postgres => Some(Arc::new(RuntimeDb::connect(&config).await?)),
        };

        let ledger = match db.clone() {
            Some(db) => crate::store::postgres(db),
            None => crate::store::memory(),
        };
        let prices = match db.clone() {
            Some(db) => crate::price::postgres(db),
            None => crate::price::memory(),
        };
        let discounts = match db.clone() {
            Some(db) => crate::discount::postgres(db),
            None => crate::discount::memory(),
        };
        let events = match db.clone() {
            Some(db) => crate::event_log::postgres(db),
            None => crate::event_log::memory(),
        };
        let task_registry = match db.clone() {
            Some(db) => crate::task_registry::postgres(db),
            None => crate::task_registry::memory(),
        };

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let sqs_client = build_sqs_client(&config).await?;

        let reservations = Arc::new(ReservationService::new(ledger.clone(), prices.clone(), clock.clone()));
        let releases = Arc::new(ReleaseService::new(ledger.clone(), clock.clone()));

        let app_state = AppState::new(
            config.clone(),
            ledger.clone(),
            prices.clone(),
            discounts.clone(),
            reservations,
            releases,
            sqs_client.clone(),
            db.clone(),
        );

        let runtime_state = Self {
            app_state,
            db,
            config,
            clock,
        };

        runtime_state.spawn_chargers(ledger, prices, discounts, task_registry);
        runtime_state.spawn_queue_consumers(sqs_client, events).await?;

        Ok(runtime_state)
    }

    fn spawn_chargers(
        &self,
        ledger: Arc<dyn crate::store::LedgerStore>,
        prices: Arc<dyn crate::price::PriceStore>,
        discounts: Arc<dyn crate::discount::DiscountStore>,
        task_registry: Arc<dyn crate::task_registry::TaskRegistryStore>,
    ) {
        let oneshot = Arc::new(OneshotCharger::new(
            ledger.clone(),
            prices.clone(),
            discounts.clone(),
            self.clock.clone(),
            self.config.charge_oneshot.clone(),
        ));
        let longrun = Arc::new(LongrunCharger::new(
            ledger.clone(),
            prices.clone(),
            discounts.clone(),
            self.clock.clone(),
            self.config.charge_longrun.clone(),
            self.config.longrun_expiration_interval_seconds,
        ));
        let storage = Arc::new(StorageCharger::new(
            ledger,
            prices,
            discounts,
            self.clock.clone(),
            self.config.charge_storage.clone(),
        ));

        tokio::spawn(crate::task_registry::run_forever(
            task_registry.clone(),
            oneshot,
            StdDuration::ZERO,
            StdDuration::from_secs(self.config.charge_oneshot.loop_sleep_seconds),
            StdDuration::from_secs(self.config.charge_oneshot.error_sleep_seconds),
            0,
        ));
        tokio::spawn(crate::task_registry::run_forever(
            task_registry.clone(),
            longrun,
            StdDuration::ZERO,
            StdDuration::from_secs(self.config.charge_longrun.loop_sleep_seconds),
            StdDuration::from_secs(self.config.charge_longrun.error_sleep_seconds),
            0,
        ));
        tokio::spawn(crate::task_registry::run_forever(
            task_registry,
            storage,
            StdDuration::ZERO,
            StdDuration::from_secs(self.config.charge_storage.loop_sleep_seconds),
            StdDuration::from_secs(self.config.charge_storage.error_sleep_seconds),
            0,
        ));
    }

    async fn spawn_queue_consumers(
        &self,
        client: SqsClient,
        events: Arc<dyn crate::event_log::EventStore>,
    ) -> Result<(), anyhow::Error> {
        let ledger = match self.db.clone() {
            Some(db) => crate::store::postgres(db),
            None => crate::store::memory(),
        };

        self.spawn_one_consumer(
            client.clone(),
            events.clone(),
            self.config.sqs_oneshot_queue_name.clone(),
            self.config.queue_oneshot.clone(),
            Arc::new(OneshotConsumer::new(
                ledger.clone(),
                self.config.event_max_past_days,
                self.config.event_max_future_seconds,
            )) as Arc<dyn QueueConsumer>,
        );
        self.spawn_one_consumer(
            client.clone(),
            events.clone(),
            self.config.sqs_longrun_queue_name.clone(),
            self.config.queue_longrun.clone(),
            Arc::new(LongrunConsumer::new(
                ledger.clone(),
                self.config.event_max_past_days,
                self.config.event_max_future_seconds,
            )) as Arc<dyn QueueConsumer>,
        );
        self.spawn_one_consumer(
            client,
            events,
            self.config.sqs_storage_queue_name.clone(),
            self.config.queue_storage.clone(),
            Arc::new(StorageConsumer::new(
                ledger,
                self.config.event_max_past_days,
                self.config.event_max_future_seconds,
            )) as Arc<dyn QueueConsumer>,
        );

        Ok(())
    }

    fn spawn_one_consumer(
        &self,
        client: SqsClient,
        events: Arc<dyn crate::event_log::EventStore>,
        queue_name: String,
        tuning: crate::config::QueueTuning,
        consumer: Arc<dyn QueueConsumer>,
    ) {
        let runtime = Arc::new(QueueRuntime {
            client,
            queue_name,
            max_messages: tuning.max_messages,
            visibility_timeout_seconds: tuning.visibility_timeout_seconds,
            wait_time_seconds: tuning.wait_time_seconds,
            events,
            clock: self.clock.clone(),
        });
        tokio::spawn(crate::queue::run_forever(
            runtime,
            consumer,
            StdDuration::from_secs(tuning.initial_delay_seconds),
            StdDuration::from_secs(self.config.sqs_client_error_sleep_seconds),
        ));
    }
}

pub async fn serve(config: Config) -> Result<(), anyhow::Error> {
    let bind_addr = config.bind_addr;
    let runtime_state = RuntimeState::build(config).await?;
    let router = crate::server::build_router(runtime_state.app_state.clone());

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(%bind_addr, "accounting service listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited with an error")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received SIGINT, shutting down");
}

/// One pooled SQS client per process (§9 "queue client lifecycle"), shared
/// by the HTTP surface's usage-event publisher and the three consumers.
async fn build_sqs_client(config: &Config) -> Result<SqsClient, anyhow::Error> {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = &config.sqs_region {
        loader = loader.region(aws_sdk_sqs::config::Region::new(region.clone()));
    }
    let mut conf = loader.load().await;
    if let Some(endpoint) = &config.sqs_endpoint_url {
        let mut builder = aws_sdk_sqs::config::Builder::from(&conf);
        builder.set_endpoint_url(Some(endpoint.clone()));
        conf = builder.build().into();
    }
    Ok(SqsClient::new(&conf))
}
