use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::OptionalExtension;

use crate::error::StoreError;
use crate::types::{TaskType, Tier};

use super::{AbuseState, CachedCompletion, GatewayStore, UsageRecord};

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.blocking(|conn| {
            init_schema(conn)?;
            Ok(())
        })
        .await
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            work(&mut conn)
        })
        .await?
    }
}

#[async_trait]
impl GatewayStore for SqliteStore {
    async fn ensure_account(&self, account: &str) -> Result<Tier, StoreError> {
        let account = account.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO accounts (id, tier) VALUES (?1, 'free')",
                rusqlite::params![account],
            )?;
            let raw: String = conn.query_row(
                "SELECT tier FROM accounts WHERE id=?1",
                rusqlite::params![account],
                |row| row.get(0),
            )?;
            Ok(Tier::parse(&raw).unwrap_or_default())
        })
        .await
    }

    async fn set_account_tier(&self, account: &str, tier: Tier) -> Result<(), StoreError> {
        let account = account.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO accounts (id, tier) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET tier=excluded.tier",
                rusqlite::params![account, tier.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    async fn try_consume_window(
        &self,
        scope: &str,
        window_start: u64,
        amount: u64,
        limit: u64,
    ) -> Result<bool, StoreError> {
        let scope = scope.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let row: Option<(i64, i64)> = tx
                .query_row(
                    "SELECT window_start, consumed FROM quota_window WHERE scope=?1",
                    rusqlite::params![scope],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let consumed = match row {
                Some((stored_start, consumed)) if stored_start == window_start as i64 => {
                    consumed.max(0) as u64
                }
                _ => 0,
            };

            let next = consumed.saturating_add(amount);
            if next > limit {
                // Persist the rollover even on denial so observers see a
                // fresh counter for the current window.
                tx.execute(
                    "INSERT INTO quota_window (scope, window_start, consumed)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(scope) DO UPDATE
                     SET window_start=excluded.window_start, consumed=excluded.consumed
                     WHERE quota_window.window_start != excluded.window_start",
                    rusqlite::params![scope, window_start as i64, consumed as i64],
                )?;
                tx.commit()?;
                return Ok(false);
            }

            tx.execute(
                "INSERT INTO quota_window (scope, window_start, consumed)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(scope) DO UPDATE
                 SET window_start=excluded.window_start, consumed=excluded.consumed",
                rusqlite::params![scope, window_start as i64, next as i64],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn adjust_window(
        &self,
        scope: &str,
        window_start: u64,
        delta: i64,
    ) -> Result<(), StoreError> {
        let scope = scope.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE quota_window
                 SET consumed = MAX(0, consumed + ?3)
                 WHERE scope=?1 AND window_start=?2",
                rusqlite::params![scope, window_start as i64, delta],
            )?;
            Ok(())
        })
        .await
    }

    async fn bump_window(
        &self,
        scope: &str,
        window_start: u64,
        amount: u64,
    ) -> Result<u64, StoreError> {
        let scope = scope.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO quota_window (scope, window_start, consumed)
                 VALUES (?1, ?2, 0)
                 ON CONFLICT(scope) DO UPDATE
                 SET window_start=excluded.window_start, consumed=0
                 WHERE quota_window.window_start != excluded.window_start",
                rusqlite::params![scope, window_start as i64],
            )?;
            tx.execute(
                "UPDATE quota_window SET consumed = consumed + ?3
                 WHERE scope=?1 AND window_start=?2",
                rusqlite::params![scope, window_start as i64, amount as i64],
            )?;
            let total: i64 = tx.query_row(
                "SELECT consumed FROM quota_window WHERE scope=?1",
                rusqlite::params![scope],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(total.max(0) as u64)
        })
        .await
    }

    async fn cache_get(
        &self,
        key: &str,
        now: u64,
    ) -> Result<Option<CachedCompletion>, StoreError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let row: Option<(String, i64, i64, i64, i64)> = tx
                .query_row(
                    "SELECT text, token_cost, created_at, expires_at, hit_count
                     FROM llm_cache WHERE key=?1",
                    rusqlite::params![key],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                        ))
                    },
                )
                .optional()?;

            let Some((text, token_cost, created_at, expires_at, hit_count)) = row else {
                tx.commit()?;
                return Ok(None);
            };

            if now as i64 >= expires_at {
                tx.execute("DELETE FROM llm_cache WHERE key=?1", rusqlite::params![key])?;
                tx.commit()?;
                return Ok(None);
            }

            tx.execute(
                "UPDATE llm_cache SET hit_count = hit_count + 1 WHERE key=?1",
                rusqlite::params![key],
            )?;
            tx.commit()?;

            Ok(Some(CachedCompletion {
                text,
                token_cost: token_cost.max(0) as u64,
                created_at: created_at.max(0) as u64,
                expires_at: expires_at.max(0) as u64,
                hit_count: hit_count.max(0) as u64 + 1,
            }))
        })
        .await
    }

    async fn cache_put(&self, key: &str, entry: &CachedCompletion) -> Result<(), StoreError> {
        let key = key.to_string();
        let entry = entry.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO llm_cache (key, text, token_cost, created_at, expires_at, hit_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(key) DO UPDATE SET
                     text=excluded.text,
                     token_cost=excluded.token_cost,
                     created_at=excluded.created_at,
                     expires_at=excluded.expires_at,
                     hit_count=excluded.hit_count",
                rusqlite::params![
                    key,
                    entry.text,
                    entry.token_cost as i64,
                    entry.created_at as i64,
                    entry.expires_at as i64,
                    entry.hit_count as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        now: u64,
        ttl_secs: u64,
    ) -> Result<bool, StoreError> {
        let key = key.to_string();
        let owner = owner.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let row: Option<(String, i64)> = tx
                .query_row(
                    "SELECT owner, expires_at FROM cache_lease WHERE key=?1",
                    rusqlite::params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if let Some((holder, expires_at)) = row {
                if expires_at > now as i64 && holder != owner {
                    tx.commit()?;
                    return Ok(false);
                }
            }

            tx.execute(
                "INSERT INTO cache_lease (key, owner, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE
                 SET owner=excluded.owner, expires_at=excluded.expires_at",
                rusqlite::params![key, owner, (now.saturating_add(ttl_secs)) as i64],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        let owner = owner.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "DELETE FROM cache_lease WHERE key=?1 AND owner=?2",
                rusqlite::params![key, owner],
            )?;
            Ok(())
        })
        .await
    }

    async fn abuse_state(&self, account: &str) -> Result<Option<AbuseState>, StoreError> {
        let account = account.to_string();
        self.blocking(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT state_json FROM abuse_state WHERE account=?1",
                    rusqlite::params![account],
                    |row| row.get(0),
                )
                .optional()?;
            match raw {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn put_abuse_state(&self, account: &str, state: &AbuseState) -> Result<(), StoreError> {
        let account = account.to_string();
        let state_json = serde_json::to_string(state)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO abuse_state (account, state_json) VALUES (?1, ?2)
                 ON CONFLICT(account) DO UPDATE SET state_json=excluded.state_json",
                rusqlite::params![account, state_json],
            )?;
            Ok(())
        })
        .await
    }

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO usage_log (account, ts_ms, task, tokens, cache_hit, provider, outcome)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    record.account,
                    record.ts_ms as i64,
                    record.task.as_str(),
                    record.tokens as i64,
                    record.cache_hit as i64,
                    record.provider,
                    record.outcome,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_usage(
        &self,
        limit: usize,
        since_ts_ms: Option<u64>,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        self.blocking(move |conn| {
            let since = since_ts_ms.map(|v| v as i64).unwrap_or(0);
            let mut stmt = conn.prepare(
                "SELECT account, ts_ms, task, tokens, cache_hit, provider, outcome
                 FROM usage_log
                 WHERE ts_ms >= ?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![since, limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (account, ts_ms, task, tokens, cache_hit, provider, outcome) = row?;
                out.push(UsageRecord {
                    account,
                    ts_ms: ts_ms.max(0) as u64,
                    task: TaskType::parse(&task).unwrap_or(TaskType::InterpretCard),
                    tokens: tokens.max(0) as u64,
                    cache_hit: cache_hit != 0,
                    provider,
                    outcome,
                });
            }
            Ok(out)
        })
        .await
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY NOT NULL,
            tier TEXT NOT NULL DEFAULT 'free'
        );

        CREATE TABLE IF NOT EXISTS quota_window (
            scope TEXT PRIMARY KEY NOT NULL,
            window_start INTEGER NOT NULL,
            consumed INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS llm_cache (
            key TEXT PRIMARY KEY NOT NULL,
            text TEXT NOT NULL,
            token_cost INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            hit_count INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_llm_cache_expires_at
            ON llm_cache(expires_at);

        CREATE TABLE IF NOT EXISTS cache_lease (
            key TEXT PRIMARY KEY NOT NULL,
            owner TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS abuse_state (
            account TEXT PRIMARY KEY NOT NULL,
            state_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS usage_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account TEXT NOT NULL,
            ts_ms INTEGER NOT NULL,
            task TEXT NOT NULL,
            tokens INTEGER NOT NULL,
            cache_hit INTEGER NOT NULL,
            provider TEXT,
            outcome TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_log_ts_ms
            ON usage_log(ts_ms);
        CREATE INDEX IF NOT EXISTS idx_usage_log_account_ts_ms
            ON usage_log(account, ts_ms);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("gateway.sqlite"));
        store.init().await.expect("init");
        (dir, store)
    }

    #[tokio::test]
    async fn sqlite_store_enforces_window_limit() {
        let (_dir, store) = store().await;

        assert!(store.try_consume_window("q", 60, 2, 3).await.unwrap());
        assert!(!store.try_consume_window("q", 60, 2, 3).await.unwrap());
        assert!(store.try_consume_window("q", 60, 1, 3).await.unwrap());

        // Rollover resets the counter.
        assert!(store.try_consume_window("q", 120, 3, 3).await.unwrap());
    }

    #[tokio::test]
    async fn sqlite_store_adjust_releases_within_the_same_window() {
        let (_dir, store) = store().await;

        store.try_consume_window("q", 60, 3, 3).await.unwrap();
        store.adjust_window("q", 60, -3).await.unwrap();
        assert!(store.try_consume_window("q", 60, 3, 3).await.unwrap());

        // Stale adjust against a rolled window is ignored.
        store.try_consume_window("q", 120, 2, 3).await.unwrap();
        store.adjust_window("q", 60, -2).await.unwrap();
        assert!(!store.try_consume_window("q", 120, 2, 3).await.unwrap());
    }

    #[tokio::test]
    async fn sqlite_store_cache_round_trip_and_expiry() {
        let (_dir, store) = store().await;

        let entry = CachedCompletion {
            text: "three of cups".to_string(),
            token_cost: 17,
            created_at: 100,
            expires_at: 160,
            hit_count: 0,
        };
        store.cache_put("k", &entry).await.unwrap();

        let hit = store.cache_get("k", 120).await.unwrap().expect("hit");
        assert_eq!(hit.text, "three of cups");
        assert_eq!(hit.hit_count, 1);

        assert!(store.cache_get("k", 160).await.unwrap().is_none());
        // Expired entry was evicted, not resurrected.
        assert!(store.cache_get("k", 120).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_store_lease_is_exclusive_until_expiry() {
        let (_dir, store) = store().await;

        assert!(store.try_acquire_lease("k", "a", 100, 30).await.unwrap());
        assert!(!store.try_acquire_lease("k", "b", 110, 30).await.unwrap());
        assert!(store.try_acquire_lease("k", "a", 110, 30).await.unwrap());

        store.release_lease("k", "b").await.unwrap();
        assert!(!store.try_acquire_lease("k", "b", 110, 30).await.unwrap());

        store.release_lease("k", "a").await.unwrap();
        assert!(store.try_acquire_lease("k", "b", 110, 30).await.unwrap());
    }

    #[tokio::test]
    async fn sqlite_store_persists_accounts_and_abuse_state() {
        let (_dir, store) = store().await;

        assert_eq!(store.ensure_account("acct").await.unwrap(), Tier::Free);
        store
            .set_account_tier("acct", Tier::Premium)
            .await
            .unwrap();
        assert_eq!(store.ensure_account("acct").await.unwrap(), Tier::Premium);

        let state = AbuseState {
            score: 2.5,
            level: crate::abuse::EnforcementLevel::Warn,
            locked_until: None,
            updated_at: 100,
        };
        store.put_abuse_state("acct", &state).await.unwrap();
        let loaded = store.abuse_state("acct").await.unwrap().expect("state");
        assert_eq!(loaded.level, crate::abuse::EnforcementLevel::Warn);
        assert!((loaded.score - 2.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn sqlite_store_appends_and_lists_usage() {
        let (_dir, store) = store().await;

        let record = UsageRecord {
            account: "acct".to_string(),
            ts_ms: 1_000,
            task: TaskType::Narrate,
            tokens: 12,
            cache_hit: false,
            provider: Some("primary".to_string()),
            outcome: "ok".to_string(),
        };
        store.append_usage(&record).await.unwrap();

        let rows = store.list_usage(10, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].task, TaskType::Narrate);
        assert_eq!(rows[0].provider.as_deref(), Some("primary"));

        let none = store.list_usage(10, Some(2_000)).await.unwrap();
        assert!(none.is_empty());
    }
}
