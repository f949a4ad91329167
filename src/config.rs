//! Process configuration, loaded once at startup from the environment.

use std::collections::HashMap;
use std::time::Duration;

use clap::Parser;

/// Configuration for the dispatch engine process.
///
/// Every field is settable via an environment variable (see the `env`
/// attribute) or the matching CLI flag; CLI flags take precedence. Defaults
/// match spec §6.
#[derive(Parser, Debug, Clone)]
#[command(name = "dispatch-engine", about = "Batch dispatch and lifecycle engine")]
pub struct EngineConfig {
    /// Durable Store connection string.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Queue Store (Redis) connection string.
    #[arg(long, env = "QUEUE_STORE_URL")]
    pub queue_store_url: String,

    /// Base URL of the voice-agent provider. Absent ⇒ dispatch returns ConfigurationMissing.
    #[arg(long, env = "AGENT_PROVIDER_URL")]
    pub agent_provider_url: Option<String>,

    /// Shared secret checked against the inbound `x-api-key` webhook header.
    #[arg(long, env = "AGENT_WEBHOOK_SECRET")]
    pub agent_webhook_secret: String,

    /// Base URL used to build callback URLs handed to the Agent Provider.
    #[arg(long, env = "APP_URL")]
    pub app_url: String,

    /// Maximum POs per batch.
    #[arg(long, env = "MAX_POS_PER_BATCH", default_value_t = 10)]
    pub max_pos_per_batch: usize,

    /// Chunk size for parallel batch creation during upload processing.
    #[arg(long, env = "BATCH_PROCESSING_CHUNK_SIZE", default_value_t = 50)]
    pub batch_processing_chunk_size: usize,

    /// Dispatcher / callback-scheduler tick interval, in milliseconds.
    #[arg(long, env = "QUEUE_POLL_INTERVAL_MS", default_value_t = 5000)]
    pub queue_poll_interval_ms: u64,

    /// Maximum number of batches the dispatcher processes concurrently per tick.
    #[arg(long, env = "MAX_CONCURRENT_CALLS", default_value_t = 5)]
    pub max_concurrent_calls: usize,

    #[arg(long, env = "BUSINESS_HOURS_START", default_value = "08:00")]
    pub business_hours_start: String,

    #[arg(long, env = "BUSINESS_HOURS_END", default_value = "18:00")]
    pub business_hours_end: String,

    #[arg(long, env = "BUSINESS_TIMEZONE", default_value = "UTC")]
    pub business_timezone: String,

    /// HTTP listen address.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    /// Multipart upload size cap, in bytes.
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = 50 * 1024 * 1024)]
    pub max_upload_bytes: usize,

    /// Maximum retry attempts per batch before it is left FAILED.
    #[arg(long, env = "MAX_BATCH_ATTEMPTS", default_value_t = 5)]
    pub max_batch_attempts: u32,
}

impl EngineConfig {
    /// Parse configuration from `std::env` (loading a `.env` file first, if present).
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();
        Self::parse()
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    /// Build the callback URL the Agent Provider should hit for a given batch.
    pub fn callback_url(&self, batch_id: uuid::Uuid) -> String {
        format!("{}/webhooks/agent?batch_id={}", self.app_url.trim_end_matches('/'), batch_id)
    }

    pub fn to_metadata_map(&self) -> HashMap<&'static str, String> {
        let mut m = HashMap::new();
        m.insert("max_pos_per_batch", self.max_pos_per_batch.to_string());
        m.insert("max_concurrent_calls", self.max_concurrent_calls.to_string());
        m
    }
}
