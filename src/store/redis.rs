use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::StoreError;
use crate::types::{TaskType, Tier};

use super::{AbuseState, CachedCompletion, GatewayStore, UsageRecord};

#[derive(Clone, Debug)]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "arcana".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(format!("{}:__ping__", self.prefix)).await?;
        Ok(())
    }

    fn key_account(&self, account: &str) -> String {
        format!("{}:account:{account}", self.prefix)
    }

    fn key_window(&self, scope: &str) -> String {
        format!("{}:window:{scope}", self.prefix)
    }

    fn key_cache(&self, key: &str) -> String {
        format!("{}:cache:{key}", self.prefix)
    }

    fn key_lease(&self, key: &str) -> String {
        format!("{}:lease:{key}", self.prefix)
    }

    fn key_abuse(&self, account: &str) -> String {
        format!("{}:abuse:{account}", self.prefix)
    }

    fn key_usage_seq(&self) -> String {
        format!("{}:usage_seq", self.prefix)
    }

    fn key_usage_by_ts(&self) -> String {
        format!("{}:usage_by_ts", self.prefix)
    }

    fn key_usage_record(&self, id: &str) -> String {
        format!("{}:usage:{id}", self.prefix)
    }
}

#[async_trait]
impl GatewayStore for RedisStore {
    async fn ensure_account(&self, account: &str) -> Result<Tier, StoreError> {
        let mut conn = self.connection().await?;
        let key = self.key_account(account);
        let _: bool = conn.set_nx(&key, Tier::Free.as_str()).await?;
        let raw: Option<String> = conn.get(&key).await?;
        Ok(raw
            .as_deref()
            .and_then(Tier::parse)
            .unwrap_or_default())
    }

    async fn set_account_tier(&self, account: &str, tier: Tier) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.set(self.key_account(account), tier.as_str()).await?;
        Ok(())
    }

    async fn try_consume_window(
        &self,
        scope: &str,
        window_start: u64,
        amount: u64,
        limit: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;

        let script = redis::Script::new(
            r#"
local window_key = KEYS[1]

local window_start = ARGV[1]
local amount = tonumber(ARGV[2]) or 0
local limit = tonumber(ARGV[3]) or 0

local stored_start = redis.call("HGET", window_key, "window_start")
if stored_start ~= window_start then
  redis.call("HSET", window_key, "window_start", window_start, "consumed", 0)
end

local consumed = tonumber(redis.call("HGET", window_key, "consumed") or "0") or 0
if consumed + amount > limit then
  return 0
end

redis.call("HSET", window_key, "consumed", consumed + amount)
return 1
"#,
        );

        let admitted: i64 = script
            .key(self.key_window(scope))
            .arg(window_start)
            .arg(amount)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(admitted == 1)
    }

    async fn adjust_window(
        &self,
        scope: &str,
        window_start: u64,
        delta: i64,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;

        let script = redis::Script::new(
            r#"
local window_key = KEYS[1]

local window_start = ARGV[1]
local delta = tonumber(ARGV[2]) or 0

local stored_start = redis.call("HGET", window_key, "window_start")
if stored_start ~= window_start then
  return 0
end

local consumed = tonumber(redis.call("HGET", window_key, "consumed") or "0") or 0
local next = consumed + delta
if next < 0 then
  next = 0
end
redis.call("HSET", window_key, "consumed", next)
return 1
"#,
        );

        let _: i64 = script
            .key(self.key_window(scope))
            .arg(window_start)
            .arg(delta)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn bump_window(
        &self,
        scope: &str,
        window_start: u64,
        amount: u64,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;

        let script = redis::Script::new(
            r#"
local window_key = KEYS[1]

local window_start = ARGV[1]
local amount = tonumber(ARGV[2]) or 0

local stored_start = redis.call("HGET", window_key, "window_start")
if stored_start ~= window_start then
  redis.call("HSET", window_key, "window_start", window_start, "consumed", 0)
end

return redis.call("HINCRBY", window_key, "consumed", amount)
"#,
        );

        let total: i64 = script
            .key(self.key_window(scope))
            .arg(window_start)
            .arg(amount)
            .invoke_async(&mut conn)
            .await?;
        Ok(total.max(0) as u64)
    }

    async fn cache_get(
        &self,
        key: &str,
        now: u64,
    ) -> Result<Option<CachedCompletion>, StoreError> {
        let mut conn = self.connection().await?;

        let script = redis::Script::new(
            r#"
local cache_key = KEYS[1]

local now = tonumber(ARGV[1]) or 0

if redis.call("EXISTS", cache_key) == 0 then
  return false
end

local expires_at = tonumber(redis.call("HGET", cache_key, "expires_at") or "0") or 0
if now >= expires_at then
  redis.call("DEL", cache_key)
  return false
end

redis.call("HINCRBY", cache_key, "hit_count", 1)
return redis.call("HGETALL", cache_key)
"#,
        );

        let raw: Option<HashMap<String, String>> = script
            .key(self.key_cache(key))
            .arg(now)
            .invoke_async(&mut conn)
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let field = |name: &str| -> u64 {
            raw.get(name)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(0)
        };

        Ok(Some(CachedCompletion {
            text: raw.get("text").cloned().unwrap_or_default(),
            token_cost: field("token_cost"),
            created_at: field("created_at"),
            expires_at: field("expires_at"),
            hit_count: field("hit_count"),
        }))
    }

    async fn cache_put(&self, key: &str, entry: &CachedCompletion) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let cache_key = self.key_cache(key);
        let ttl = entry.expires_at.saturating_sub(entry.created_at).max(1);

        let _: () = redis::pipe()
            .atomic()
            .del(&cache_key)
            .hset(&cache_key, "text", &entry.text)
            .hset(&cache_key, "token_cost", entry.token_cost)
            .hset(&cache_key, "created_at", entry.created_at)
            .hset(&cache_key, "expires_at", entry.expires_at)
            .hset(&cache_key, "hit_count", entry.hit_count)
            .expire(&cache_key, ttl as i64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        now: u64,
        ttl_secs: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;

        let script = redis::Script::new(
            r#"
local lease_key = KEYS[1]

local owner = ARGV[1]
local now = tonumber(ARGV[2]) or 0
local ttl_secs = tonumber(ARGV[3]) or 0

local holder = redis.call("HGET", lease_key, "owner")
local expires_at = tonumber(redis.call("HGET", lease_key, "expires_at") or "0") or 0

if holder and expires_at > now and holder ~= owner then
  return 0
end

redis.call("HSET", lease_key, "owner", owner, "expires_at", now + ttl_secs)
redis.call("EXPIRE", lease_key, ttl_secs)
return 1
"#,
        );

        let acquired: i64 = script
            .key(self.key_lease(key))
            .arg(owner)
            .arg(now)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;

        let script = redis::Script::new(
            r#"
local lease_key = KEYS[1]

local owner = ARGV[1]

if redis.call("HGET", lease_key, "owner") == owner then
  redis.call("DEL", lease_key)
end
return 1
"#,
        );

        let _: i64 = script
            .key(self.key_lease(key))
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn abuse_state(&self, account: &str) -> Result<Option<AbuseState>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(self.key_abuse(account)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_abuse_state(&self, account: &str, state: &AbuseState) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let serialized = serde_json::to_string(state)?;
        let _: () = conn.set(self.key_abuse(account), serialized).await?;
        Ok(())
    }

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let id: i64 = conn.incr(self.key_usage_seq(), 1).await?;
        let member = format!("{id:020}");
        let serialized = serde_json::to_string(record)?;

        let _: () = redis::pipe()
            .atomic()
            .set(self.key_usage_record(&member), serialized)
            .zadd(self.key_usage_by_ts(), member, record.ts_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_usage(
        &self,
        limit: usize,
        since_ts_ms: Option<u64>,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let idx_key = self.key_usage_by_ts();
        let limit = limit.clamp(1, 1000);

        let floor = since_ts_ms
            .map(|since| since.to_string())
            .unwrap_or_else(|| "-inf".to_string());
        let members: Vec<String> = redis::cmd("ZREVRANGEBYSCORE")
            .arg(&idx_key)
            .arg("+inf")
            .arg(floor)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        let mut out = Vec::with_capacity(members.len());
        for member in members {
            let raw: Option<String> = conn.get(self.key_usage_record(&member)).await?;
            let Some(raw) = raw else {
                continue;
            };
            out.push(serde_json::from_str(&raw)?);
        }
        Ok(out)
    }
}
