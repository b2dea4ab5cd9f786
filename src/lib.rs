//! arcana-gateway: an LLM request gateway for interpretation, reading
//! synthesis and narration tasks. It enforces per-account quotas, reuses
//! completions through a shared cache with single-flight population, routes
//! across upstream providers with failover, and gates abusive traffic.

pub mod abuse;
pub mod cache;
pub mod client;
pub mod config;
mod error;
pub mod gateway;
pub mod http;
pub mod observability;
pub mod orchestrator;
pub mod quota;
pub mod store;
pub mod types;

pub use abuse::{AbuseConfig, AbuseDetector, AbuseVerdict, EnforcementLevel};
pub use cache::{ResponseCache, normalize_prompt, prompt_key};
pub use client::{
    Completion, CompletionClient, CompletionRequest, OpenAiCompatibleClient, estimate_tokens,
};
pub use config::{
    GatewayConfig, PipelineConfig, ProviderConfig, SingleFlightConfig, TaskConfig, TaskTable,
};
pub use error::{GatewayError, Result, StoreError};
pub use gateway::Gateway;
pub use http::{HttpState, router};
pub use observability::{Observability, ObservabilitySnapshot};
pub use orchestrator::ProviderOrchestrator;
pub use quota::{QuotaManager, Reservation, TierLimitTable, TierLimits, WindowKind};
pub use store::{AbuseState, CachedCompletion, GatewayStore, MemoryStore, UsageRecord};
#[cfg(feature = "store-redis")]
pub use store::RedisStore;
#[cfg(feature = "store-sqlite")]
pub use store::SqliteStore;
pub use types::{Clock, SystemClock, TaskReply, TaskRequest, TaskType, Tier};
