//! Process-wide shared state handed to every Axum handler.
//!
//! Grounded in the teacher's `AppState` (`dwctl/src/lib.rs`): a single
//! `Clone`-able struct holding pooled connections and long-lived service
//! handles, built once in `Application::new` and threaded through
//! `Router::with_state`. No other mutable process-global state is
//! permitted (spec §5 "Shared-resource policy").

use std::sync::Arc;

use crate::agent_provider::AgentProviderClient;
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::events::EventBus;
use crate::queue::QueueStore;
use crate::reconciler::Reconciler;
use crate::scheduler::CallbackScheduler;
use crate::store::Store;
use crate::upload::UploadJobCoordinator;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn QueueStore>,
    pub events: EventBus,
    pub dispatcher: Arc<Dispatcher>,
    pub reconciler: Arc<Reconciler>,
    pub scheduler: Arc<CallbackScheduler>,
    pub uploads: UploadJobCoordinator,
    pub provider: Option<Arc<dyn AgentProviderClient>>,
    pub config: Arc<EngineConfig>,
}
