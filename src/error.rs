use thiserror::Error;

use crate::abuse::EnforcementLevel;
use crate::quota::WindowKind;

/// Terminal request outcomes. Denials are return values, never panics; the
/// pipeline resolves quota and abuse rejections without touching upstream.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },
    #[error("rate limited: {window}")]
    RateLimited {
        window: WindowKind,
        retry_after_secs: u64,
    },
    #[error("budget exceeded: {window}")]
    BudgetExceeded {
        window: WindowKind,
        retry_after_secs: u64,
    },
    #[error("abuse enforcement: {level}")]
    AbuseDetected {
        level: EnforcementLevel,
        retry_after_secs: Option<u64>,
    },
    #[error("no upstream provider available")]
    ProviderUnavailable,
    #[error("upstream error: {message}")]
    Upstream { message: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl GatewayError {
    /// Stable outcome tag recorded in the usage log.
    pub fn outcome(&self) -> &'static str {
        match self {
            GatewayError::InvalidInput { .. } => "invalid_input",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::BudgetExceeded { .. } => "budget_exceeded",
            GatewayError::AbuseDetected { .. } => "abuse_detected",
            GatewayError::ProviderUnavailable => "provider_unavailable",
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::Store(_) => "store_error",
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited {
                retry_after_secs, ..
            }
            | GatewayError::BudgetExceeded {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            GatewayError::AbuseDetected {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[cfg(feature = "store-redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
