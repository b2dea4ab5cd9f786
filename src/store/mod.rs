//! Durable backing for quota counters, cache entries, abuse state and the
//! usage log. This is the only shared mutable state in the gateway; every
//! mutation here is atomic per scope so horizontally scaled instances stay
//! correct without cross-instance locks.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::abuse::EnforcementLevel;
use crate::error::StoreError;
use crate::types::{TaskType, Tier};

#[cfg(feature = "store-redis")]
mod redis;
#[cfg(feature = "store-sqlite")]
mod sqlite;

#[cfg(feature = "store-redis")]
pub use redis::RedisStore;
#[cfg(feature = "store-sqlite")]
pub use sqlite::SqliteStore;

/// A completion kept for reuse. `hit_count` is bumped on every read that
/// serves it; entries past `expires_at` are logically absent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedCompletion {
    pub text: String,
    pub token_cost: u64,
    pub created_at: u64,
    pub expires_at: u64,
    #[serde(default)]
    pub hit_count: u64,
}

/// Per-account abuse tracking: decaying score plus the enforcement level,
/// which only the detector (escalation/decay) or an explicit reset mutates.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AbuseState {
    pub score: f64,
    pub level: EnforcementLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<u64>,
    pub updated_at: u64,
}

/// Append-only audit row, one per completed or rejected request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageRecord {
    pub account: String,
    pub ts_ms: u64,
    pub task: TaskType,
    pub tokens: u64,
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub outcome: String,
}

#[async_trait]
pub trait GatewayStore: Send + Sync {
    /// Resolve the account's tier, creating the account as `free` on first
    /// sight. Tier writes come from the external billing collaborator.
    async fn ensure_account(&self, account: &str) -> Result<Tier, StoreError>;

    async fn set_account_tier(&self, account: &str, tier: Tier) -> Result<(), StoreError>;

    /// Conditional increment-if-below-limit on a fixed window counter. The
    /// counter resets when `window_start` moves. Returns false (and leaves
    /// the counter untouched) when the increment would exceed `limit`.
    async fn try_consume_window(
        &self,
        scope: &str,
        window_start: u64,
        amount: u64,
        limit: u64,
    ) -> Result<bool, StoreError>;

    /// Commit/release adjustment, floored at zero. No-op if the window has
    /// already rolled past `window_start`.
    async fn adjust_window(
        &self,
        scope: &str,
        window_start: u64,
        delta: i64,
    ) -> Result<(), StoreError>;

    /// Unconditional counter bump returning the new total. Used for
    /// observation (request velocity), not enforcement.
    async fn bump_window(
        &self,
        scope: &str,
        window_start: u64,
        amount: u64,
    ) -> Result<u64, StoreError>;

    /// Lazy-expiring read; a served entry has its hit count bumped. Stale
    /// entries are never returned.
    async fn cache_get(&self, key: &str, now: u64)
    -> Result<Option<CachedCompletion>, StoreError>;

    /// Idempotent: a second populate for the same key is an overwrite.
    async fn cache_put(&self, key: &str, entry: &CachedCompletion) -> Result<(), StoreError>;

    /// Single-flight coordination token. Succeeds when the key is free, the
    /// previous lease expired, or `owner` already holds it. The TTL bounds
    /// how long a crashed holder can starve a key.
    async fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        now: u64,
        ttl_secs: u64,
    ) -> Result<bool, StoreError>;

    /// Releases only the caller's own lease; another owner's token is left
    /// alone.
    async fn release_lease(&self, key: &str, owner: &str) -> Result<(), StoreError>;

    async fn abuse_state(&self, account: &str) -> Result<Option<AbuseState>, StoreError>;

    async fn put_abuse_state(&self, account: &str, state: &AbuseState) -> Result<(), StoreError>;

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), StoreError>;

    async fn list_usage(
        &self,
        limit: usize,
        since_ts_ms: Option<u64>,
    ) -> Result<Vec<UsageRecord>, StoreError>;
}

// Only the redis integration test needs wall-clock millis for a unique
// key prefix; everything else takes time from the caller.
#[cfg(all(test, feature = "store-redis"))]
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Default)]
struct MemoryInner {
    accounts: HashMap<String, Tier>,
    windows: HashMap<String, (u64, u64)>,
    cache: HashMap<String, CachedCompletion>,
    leases: HashMap<String, (String, u64)>,
    abuse: HashMap<String, AbuseState>,
    usage: Vec<UsageRecord>,
}

/// In-process store for tests and single-instance deployments. The same
/// contract as the durable backends, minus the durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GatewayStore for MemoryStore {
    async fn ensure_account(&self, account: &str) -> Result<Tier, StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        Ok(*inner
            .accounts
            .entry(account.to_string())
            .or_insert(Tier::Free))
    }

    async fn set_account_tier(&self, account: &str, tier: Tier) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.accounts.insert(account.to_string(), tier);
        Ok(())
    }

    async fn try_consume_window(
        &self,
        scope: &str,
        window_start: u64,
        amount: u64,
        limit: u64,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let entry = inner
            .windows
            .entry(scope.to_string())
            .or_insert((window_start, 0));
        if entry.0 != window_start {
            *entry = (window_start, 0);
        }
        let next = entry.1.saturating_add(amount);
        if next > limit {
            return Ok(false);
        }
        entry.1 = next;
        Ok(true)
    }

    async fn adjust_window(
        &self,
        scope: &str,
        window_start: u64,
        delta: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        if let Some(entry) = inner.windows.get_mut(scope) {
            if entry.0 == window_start {
                entry.1 = entry.1.saturating_add_signed(delta);
            }
        }
        Ok(())
    }

    async fn bump_window(
        &self,
        scope: &str,
        window_start: u64,
        amount: u64,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let entry = inner
            .windows
            .entry(scope.to_string())
            .or_insert((window_start, 0));
        if entry.0 != window_start {
            *entry = (window_start, 0);
        }
        entry.1 = entry.1.saturating_add(amount);
        Ok(entry.1)
    }

    async fn cache_get(
        &self,
        key: &str,
        now: u64,
    ) -> Result<Option<CachedCompletion>, StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let expired = match inner.cache.get(key) {
            Some(entry) => now >= entry.expires_at,
            None => return Ok(None),
        };
        if expired {
            inner.cache.remove(key);
            return Ok(None);
        }
        let entry = inner.cache.get_mut(key).expect("checked above");
        entry.hit_count = entry.hit_count.saturating_add(1);
        Ok(Some(entry.clone()))
    }

    async fn cache_put(&self, key: &str, entry: &CachedCompletion) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.cache.insert(key.to_string(), entry.clone());
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        now: u64,
        ttl_secs: u64,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        if let Some((holder, expires_at)) = inner.leases.get(key) {
            if *expires_at > now && holder != owner {
                return Ok(false);
            }
        }
        inner.leases.insert(
            key.to_string(),
            (owner.to_string(), now.saturating_add(ttl_secs)),
        );
        Ok(true)
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        if inner
            .leases
            .get(key)
            .is_some_and(|(holder, _)| holder == owner)
        {
            inner.leases.remove(key);
        }
        Ok(())
    }

    async fn abuse_state(&self, account: &str) -> Result<Option<AbuseState>, StoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.abuse.get(account).cloned())
    }

    async fn put_abuse_state(&self, account: &str, state: &AbuseState) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.abuse.insert(account.to_string(), state.clone());
        Ok(())
    }

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.usage.push(record.clone());
        Ok(())
    }

    async fn list_usage(
        &self,
        limit: usize,
        since_ts_ms: Option<u64>,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let mut out: Vec<UsageRecord> = inner
            .usage
            .iter()
            .filter(|record| since_ts_ms.is_none_or(|since| record.ts_ms >= since))
            .cloned()
            .collect();
        out.reverse();
        out.truncate(limit.max(1));
        Ok(out)
    }
}
