//! Purchase-order batch dispatch and lifecycle engine.
//!
//! Ingests PO worklists, groups them into per-supplier batches, and
//! dispatches automated voice-agent calls to resolve each PO via CANCEL,
//! EXPEDITE, or PUSH_OUT. This crate is the batch dispatch and lifecycle
//! engine: the priority queue, the supplier-exclusivity interlock, the
//! callback scheduler, the webhook reconciler, and the event bus.
//!
//! `Application` wires the Durable Store (Postgres), the Queue Store
//! (Redis), the Event Bus, the Dispatcher loop, the Callback Scheduler
//! loop, and the Axum HTTP server together under one Tokio runtime,
//! following the teacher's `Application::new` / `Application::serve` split.

pub mod agent_provider;
pub mod api;
pub mod batch_builder;
pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod model;
pub mod queue;
pub mod reconciler;
pub mod scheduler;
pub mod spreadsheet;
pub mod state;
pub mod store;
pub mod upload;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agent_provider::{AgentProviderClient, ReqwestAgentProvider};
use crate::config::EngineConfig;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::events::EventBus;
use crate::queue::redis::RedisQueueStore;
use crate::queue::QueueStore;
use crate::reconciler::Reconciler;
use crate::scheduler::CallbackScheduler;
use crate::state::AppState;
use crate::store::Store;
use crate::upload::UploadJobCoordinator;

#[cfg(feature = "postgres")]
use crate::store::postgres::PostgresStore;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

/// The running process: an HTTP server plus the background dispatcher,
/// callback scheduler, and upload-job housekeeping loops. Owns the process
/// lifetime; `serve` returns once the shutdown future resolves and
/// in-flight work has a chance to finish.
pub struct Application {
    router: Router,
    bind_addr: String,
}

impl Application {
    /// Build the whole application: run migrations, construct the
    /// connection pools, the Event Bus, and the background loops, and
    /// assemble the HTTP router. Does not bind a socket yet.
    pub async fn new(config: EngineConfig) -> anyhow::Result<Self> {
        #[cfg(feature = "postgres")]
        let store: Arc<dyn Store> = {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(20)
                .connect(&config.database_url)
                .await?;
            sqlx::migrate!("./migrations").run(&pool).await?;
            Arc::new(PostgresStore::new(pool))
        };
        #[cfg(not(feature = "postgres"))]
        let store: Arc<dyn Store> = Arc::new(crate::store::in_memory::InMemoryStore::new());

        let queue: Arc<dyn QueueStore> = Arc::new(RedisQueueStore::connect(&config.queue_store_url).await?);

        let events = EventBus::new();

        let provider: Option<Arc<dyn AgentProviderClient>> = config
            .agent_provider_url
            .as_deref()
            .map(|url| Arc::new(ReqwestAgentProvider::new(url)) as Arc<dyn AgentProviderClient>);

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            queue.clone(),
            events.clone(),
            provider.clone(),
            DispatcherConfig {
                max_concurrent_calls: config.max_concurrent_calls,
                call_timeout: CALL_TIMEOUT,
                callback_base_url: config.app_url.clone(),
            },
        ));

        let reconciler = Arc::new(Reconciler::new(store.clone(), queue.clone(), events.clone()));

        let scheduler = Arc::new(CallbackScheduler::new(store.clone(), queue.clone(), events.clone()));

        let uploads = UploadJobCoordinator::new(
            store.clone(),
            queue.clone(),
            events.clone(),
            config.max_pos_per_batch,
            config.batch_processing_chunk_size,
        );

        let config = Arc::new(config);

        let state = AppState {
            store,
            queue,
            events,
            dispatcher: dispatcher.clone(),
            reconciler,
            scheduler: scheduler.clone(),
            uploads: uploads.clone(),
            provider,
            config: config.clone(),
        };

        tokio::spawn(dispatcher.run(config.queue_poll_interval()));
        tokio::spawn(scheduler.run(config.queue_poll_interval()));
        tokio::spawn(housekeeping_loop(uploads));

        let router = api::router(state, config.max_upload_bytes)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http());

        Ok(Self {
            router,
            bind_addr: config.bind_addr.clone(),
        })
    }

    /// Bind and serve until `shutdown` resolves, then return once the
    /// in-flight request set has drained (`axum::serve`'s graceful
    /// shutdown contract). Background loops are detached tasks that exit
    /// with the process; they have no in-flight state worth draining
    /// beyond what the Durable Store's transactions already guarantee.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        tracing::info!(addr = %self.bind_addr, "dispatch engine listening");
        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

/// Sweeps expired upload-job records and idle event-bus channels on a fixed
/// interval, same cadence the callback scheduler uses for its own
/// housekeeping (§4.9 "expires after its TTL regardless of outcome").
async fn housekeeping_loop(uploads: UploadJobCoordinator) {
    let mut interval = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    loop {
        interval.tick().await;
        uploads.sweep_expired();
    }
}
