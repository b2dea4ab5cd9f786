//! The request pipeline: validate, quota reserve, abuse gate, cache lookup,
//! single-flight upstream call, cache populate, quota commit, usage record.
//!
//! `handle` takes `&self` so one `Arc<Gateway>` serves all connections; the
//! only shared mutable state lives in the store and the atomic counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::abuse::{AbuseDetector, AbuseVerdict};
use crate::cache::{ResponseCache, prompt_key};
use crate::client::{CompletionClient, CompletionRequest, OpenAiCompatibleClient, estimate_tokens};
use crate::config::{GatewayConfig, ProviderConfig};
use crate::error::{GatewayError, Result};
use crate::observability::{Observability, ObservabilitySnapshot};
use crate::orchestrator::ProviderOrchestrator;
use crate::quota::QuotaManager;
use crate::store::{GatewayStore, UsageRecord};
use crate::types::{Clock, SystemClock, TaskReply, TaskRequest, Tier};

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct Gateway {
    config: GatewayConfig,
    store: Arc<dyn GatewayStore>,
    quota: QuotaManager,
    cache: ResponseCache,
    abuse: AbuseDetector,
    orchestrator: ProviderOrchestrator,
    observability: Arc<Observability>,
    clock: Arc<dyn Clock>,
    instance_id: String,
}

impl Gateway {
    pub fn new(config: GatewayConfig, store: Arc<dyn GatewayStore>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: GatewayConfig,
        store: Arc<dyn GatewayStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let quota = QuotaManager::new(store.clone(), config.tiers.clone());
        let cache = ResponseCache::new(store.clone());
        let abuse = AbuseDetector::new(store.clone(), config.abuse.clone());
        let observability = Arc::new(Observability::new());
        let orchestrator = ProviderOrchestrator::new(
            store.clone(),
            config.pipeline.failover_attempts,
            observability.clone(),
        );
        Self {
            config,
            store,
            quota,
            cache,
            abuse,
            orchestrator,
            observability,
            clock,
            instance_id: format!("gw-{}", std::process::id()),
        }
    }

    /// Wire up every provider from the configuration with a real HTTP
    /// client. Used by the server binary; tests register fakes instead.
    pub fn connect_configured_providers(&mut self) -> Result<()> {
        let timeout = Duration::from_secs(self.config.pipeline.request_timeout_secs);
        for provider in self.config.providers.clone() {
            let client = OpenAiCompatibleClient::from_config(&provider, timeout)?;
            self.register_provider(provider, Arc::new(client));
        }
        Ok(())
    }

    pub fn register_provider(&mut self, config: ProviderConfig, client: Arc<dyn CompletionClient>) {
        self.orchestrator.register(config, client);
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn metrics(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }

    pub async fn set_account_tier(&self, account: &str, tier: Tier) -> Result<()> {
        self.store.set_account_tier(account, tier).await?;
        Ok(())
    }

    pub async fn reset_abuse(&self, account: &str) -> Result<()> {
        self.abuse.reset(account, self.clock.now_epoch_seconds()).await
    }

    pub async fn usage(&self, limit: usize, since_ts_ms: Option<u64>) -> Result<Vec<UsageRecord>> {
        Ok(self.store.list_usage(limit, since_ts_ms).await?)
    }

    /// Run one request through the full pipeline. Every terminal outcome,
    /// success or rejection, lands in the usage log and the counters.
    pub async fn handle(&self, request: &TaskRequest) -> Result<TaskReply> {
        self.observability.record_request();

        let result = self.handle_inner(request).await;
        match &result {
            Ok(reply) => {
                if reply.cache_hit {
                    self.observability.record_cache_hit();
                }
                self.record_usage(request, reply.tokens_used, reply.cache_hit, reply.provider.clone(), "ok")
                    .await;
            }
            Err(error) => {
                match error {
                    GatewayError::RateLimited { .. } => self.observability.record_rate_limited(),
                    GatewayError::BudgetExceeded { .. } => {
                        self.observability.record_budget_exceeded()
                    }
                    GatewayError::AbuseDetected { .. } => self.observability.record_abuse_blocked(),
                    GatewayError::Upstream { .. } | GatewayError::ProviderUnavailable => {
                        self.observability.record_upstream_error()
                    }
                    _ => {}
                }
                self.record_usage(request, 0, false, None, error.outcome()).await;
            }
        }
        result
    }

    async fn handle_inner(&self, request: &TaskRequest) -> Result<TaskReply> {
        self.validate(request)?;
        let now = self.clock.now_epoch_seconds();

        let tier = self.store.ensure_account(&request.account).await?;
        let task = self.config.task(request.task);
        let estimated = estimate_tokens(&request.prompt) + task.max_output_tokens;

        let reservation = self
            .quota
            .check_and_reserve(&request.account, tier, estimated, now)
            .await?;

        // Everything past this point runs under the reservation; settling it
        // happens here and nowhere else, so no exit path can leak it.
        let result = self.serve_reserved(request, tier, task, estimated).await;
        match &result {
            Ok(reply) if reply.cache_hit => {
                // Cache hits are free: hand the whole reservation back.
                self.quota.release(&reservation).await?;
            }
            Ok(reply) => {
                self.quota.commit(&reservation, reply.tokens_used).await?;
            }
            Err(_) => {
                if let Err(release_error) = self.quota.release(&reservation).await {
                    tracing::warn!(
                        %release_error,
                        account = %request.account,
                        "failed to release quota reservation"
                    );
                }
            }
        }
        result
    }

    async fn serve_reserved(
        &self,
        request: &TaskRequest,
        tier: Tier,
        task: &crate::config::TaskConfig,
        estimated: u64,
    ) -> Result<TaskReply> {
        let now = self.clock.now_epoch_seconds();
        let limits = self.config.tier_limits(tier);

        let verdict = self
            .abuse
            .evaluate(request, limits.requests_per_minute, now)
            .await?;
        if !verdict.allowed {
            return Err(GatewayError::AbuseDetected {
                level: verdict.level,
                retry_after_secs: verdict.retry_after_secs,
            });
        }
        if let Some(delay_ms) = verdict.throttle_delay_ms {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        let key = prompt_key(request, &task.model);
        if let Some(entry) = self.cache.lookup(&key, now).await? {
            return Ok(Self::reply_from_cache(entry.text, &verdict));
        }

        let owner = format!(
            "{}:{}",
            self.instance_id,
            REQUEST_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let lease_ttl = self.config.single_flight.lease_ttl_secs;
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.single_flight.wait_timeout_ms);
        let poll = Duration::from_millis(self.config.single_flight.poll_interval_ms.max(1));

        let mut waited = false;
        loop {
            let now = self.clock.now_epoch_seconds();
            if self
                .store
                .try_acquire_lease(&key, &owner, now, lease_ttl)
                .await?
            {
                // Someone may have populated between our miss and the grab.
                if let Some(entry) = self.cache.lookup(&key, now).await? {
                    self.store.release_lease(&key, &owner).await?;
                    return Ok(Self::reply_from_cache(entry.text, &verdict));
                }
                let outcome = self
                    .call_and_populate(request, &key, task.model.clone(), task, estimated, now, &verdict)
                    .await;
                self.store.release_lease(&key, &owner).await?;
                return outcome;
            }

            if !waited {
                waited = true;
                self.observability.record_single_flight_wait();
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::Upstream {
                    message: "timed out waiting for an in-flight identical request".to_string(),
                });
            }
            tokio::time::sleep(poll).await;

            let now = self.clock.now_epoch_seconds();
            if let Some(entry) = self.cache.lookup(&key, now).await? {
                return Ok(Self::reply_from_cache(entry.text, &verdict));
            }
        }
    }

    async fn call_and_populate(
        &self,
        request: &TaskRequest,
        key: &str,
        model: String,
        task: &crate::config::TaskConfig,
        estimated: u64,
        now: u64,
        verdict: &AbuseVerdict,
    ) -> Result<TaskReply> {
        let mut prompt = request.prompt.clone();
        if !request.context.is_empty() {
            let rendered: Vec<String> = request
                .context
                .iter()
                .map(|(name, value)| format!("{name}: {value}"))
                .collect();
            prompt = format!("{}\n\n{}", rendered.join("\n"), prompt);
        }
        let mut system_prompt = task.system_prompt.clone();
        if let Some(persona) = &request.persona {
            system_prompt = Some(match system_prompt {
                Some(base) => format!("{base}\nPersona: {persona}"),
                None => format!("Persona: {persona}"),
            });
        }

        let completion_request = CompletionRequest {
            model,
            system_prompt,
            prompt,
            max_output_tokens: task.max_output_tokens,
        };

        // A miss is only counted once we are actually the request that goes
        // upstream; waiters served from the populated entry count as hits.
        self.observability.record_cache_miss();
        let (provider, completion) = self
            .orchestrator
            .call_with_failover(&completion_request, estimated, now)
            .await?;

        self.cache
            .populate(
                key,
                completion.text.clone(),
                completion.tokens_used,
                now,
                task.cache_ttl_secs,
            )
            .await?;

        Ok(TaskReply {
            text: completion.text,
            tokens_used: completion.tokens_used,
            cache_hit: false,
            provider: Some(provider),
            notice: verdict.notice.clone(),
        })
    }

    fn reply_from_cache(text: String, verdict: &AbuseVerdict) -> TaskReply {
        TaskReply {
            text,
            tokens_used: 0,
            cache_hit: true,
            provider: None,
            notice: verdict.notice.clone(),
        }
    }

    fn validate(&self, request: &TaskRequest) -> Result<()> {
        if request.account.trim().is_empty() {
            return Err(GatewayError::InvalidInput {
                reason: "account must not be empty".to_string(),
            });
        }
        if request.prompt.trim().is_empty() {
            return Err(GatewayError::InvalidInput {
                reason: "prompt must not be empty".to_string(),
            });
        }
        let max_chars = self.config.pipeline.max_prompt_chars;
        if request.prompt.chars().count() > max_chars {
            return Err(GatewayError::InvalidInput {
                reason: format!("prompt exceeds {max_chars} characters"),
            });
        }
        Ok(())
    }

    async fn record_usage(
        &self,
        request: &TaskRequest,
        tokens: u64,
        cache_hit: bool,
        provider: Option<String>,
        outcome: &str,
    ) {
        let record = UsageRecord {
            account: request.account.clone(),
            ts_ms: self.clock.now_epoch_seconds() * 1_000,
            task: request.task,
            tokens,
            cache_hit,
            provider,
            outcome: outcome.to_string(),
        };
        if let Err(error) = self.store.append_usage(&record).await {
            tracing::warn!(%error, account = %request.account, "failed to append usage record");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::client::Completion;
    use crate::error::StoreError;
    use crate::quota::{TierLimitTable, TierLimits};
    use crate::store::{AbuseState, CachedCompletion, MemoryStore};
    use crate::types::TaskType;

    struct CountingClient {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl CountingClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: true,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                fail: false,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionClient for CountingClient {
        async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(GatewayError::Upstream {
                    message: "scripted failure".to_string(),
                });
            }
            Ok(Completion {
                text: format!("reading for: {}", request.prompt),
                tokens_used: 40,
            })
        }
    }

    struct FixedClock(u64);

    impl Clock for FixedClock {
        fn now_epoch_seconds(&self) -> u64 {
            self.0
        }
    }

    /// Delegates to a real in-memory store but fails the next N cache reads.
    struct FlakyStore {
        inner: MemoryStore,
        failing_cache_reads: AtomicUsize,
    }

    impl FlakyStore {
        fn failing_cache_reads(count: usize) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStore::new(),
                failing_cache_reads: AtomicUsize::new(count),
            })
        }

        fn scripted_error() -> StoreError {
            serde_json::from_str::<serde_json::Value>("not json")
                .expect_err("invalid on purpose")
                .into()
        }
    }

    #[async_trait]
    impl GatewayStore for FlakyStore {
        async fn ensure_account(&self, account: &str) -> std::result::Result<Tier, StoreError> {
            self.inner.ensure_account(account).await
        }

        async fn set_account_tier(
            &self,
            account: &str,
            tier: Tier,
        ) -> std::result::Result<(), StoreError> {
            self.inner.set_account_tier(account, tier).await
        }

        async fn try_consume_window(
            &self,
            scope: &str,
            window_start: u64,
            amount: u64,
            limit: u64,
        ) -> std::result::Result<bool, StoreError> {
            self.inner
                .try_consume_window(scope, window_start, amount, limit)
                .await
        }

        async fn adjust_window(
            &self,
            scope: &str,
            window_start: u64,
            delta: i64,
        ) -> std::result::Result<(), StoreError> {
            self.inner.adjust_window(scope, window_start, delta).await
        }

        async fn bump_window(
            &self,
            scope: &str,
            window_start: u64,
            amount: u64,
        ) -> std::result::Result<u64, StoreError> {
            self.inner.bump_window(scope, window_start, amount).await
        }

        async fn cache_get(
            &self,
            key: &str,
            now: u64,
        ) -> std::result::Result<Option<CachedCompletion>, StoreError> {
            let remaining = self.failing_cache_reads.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_cache_reads.store(remaining - 1, Ordering::SeqCst);
                return Err(Self::scripted_error());
            }
            self.inner.cache_get(key, now).await
        }

        async fn cache_put(
            &self,
            key: &str,
            entry: &CachedCompletion,
        ) -> std::result::Result<(), StoreError> {
            self.inner.cache_put(key, entry).await
        }

        async fn try_acquire_lease(
            &self,
            key: &str,
            owner: &str,
            now: u64,
            ttl_secs: u64,
        ) -> std::result::Result<bool, StoreError> {
            self.inner.try_acquire_lease(key, owner, now, ttl_secs).await
        }

        async fn release_lease(
            &self,
            key: &str,
            owner: &str,
        ) -> std::result::Result<(), StoreError> {
            self.inner.release_lease(key, owner).await
        }

        async fn abuse_state(
            &self,
            account: &str,
        ) -> std::result::Result<Option<AbuseState>, StoreError> {
            self.inner.abuse_state(account).await
        }

        async fn put_abuse_state(
            &self,
            account: &str,
            state: &AbuseState,
        ) -> std::result::Result<(), StoreError> {
            self.inner.put_abuse_state(account, state).await
        }

        async fn append_usage(&self, record: &UsageRecord) -> std::result::Result<(), StoreError> {
            self.inner.append_usage(record).await
        }

        async fn list_usage(
            &self,
            limit: usize,
            since_ts_ms: Option<u64>,
        ) -> std::result::Result<Vec<UsageRecord>, StoreError> {
            self.inner.list_usage(limit, since_ts_ms).await
        }
    }

    fn provider(name: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            base_url: String::new(),
            api_key_env: String::new(),
            model: "gpt-4o-mini".to_string(),
            rpm: None,
            tpm: None,
            failure_threshold: 3,
            cooldown_secs: 30,
            headers: BTreeMap::new(),
        }
    }

    fn config(free: TierLimits) -> GatewayConfig {
        GatewayConfig {
            tiers: TierLimitTable {
                free,
                ..TierLimitTable::default()
            },
            ..GatewayConfig::default()
        }
    }

    fn gateway(free: TierLimits, client: Arc<dyn CompletionClient>) -> Gateway {
        let mut gateway = Gateway::with_clock(
            config(free),
            Arc::new(MemoryStore::new()),
            Arc::new(FixedClock(1_700_000_000)),
        );
        gateway.register_provider(provider("primary"), client);
        gateway
    }

    fn request(prompt: &str) -> TaskRequest {
        TaskRequest {
            account: "acct".to_string(),
            task: TaskType::InterpretCard,
            persona: None,
            prompt: prompt.to_string(),
            context: BTreeMap::new(),
            correlation_flagged: false,
        }
    }

    #[tokio::test]
    async fn identical_prompt_is_served_from_cache_without_spending_quota() {
        let client = CountingClient::new();
        let gateway = gateway(
            TierLimits {
                tokens_per_day: Some(2_000),
                ..TierLimits::default()
            },
            client.clone(),
        );

        let first = gateway.handle(&request("what does the fool mean?")).await.unwrap();
        assert!(!first.cache_hit);
        assert_eq!(first.tokens_used, 40);
        assert_eq!(first.provider.as_deref(), Some("primary"));

        let second = gateway
            .handle(&request("what  does the fool\tmean?"))
            .await
            .unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.tokens_used, 0);
        assert!(second.provider.is_none());
        assert_eq!(client.calls(), 1);

        let metrics = gateway.metrics();
        assert_eq!(metrics.requests, 2);
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.cache_misses, 1);
    }

    #[tokio::test]
    async fn daily_request_budget_rejects_the_third_call() {
        let client = CountingClient::new();
        let gateway = gateway(
            TierLimits {
                requests_per_day: Some(2),
                ..TierLimits::default()
            },
            client.clone(),
        );

        gateway.handle(&request("first question")).await.unwrap();
        gateway.handle(&request("second question")).await.unwrap();
        let err = gateway
            .handle(&request("third question"))
            .await
            .expect_err("budget");
        assert!(matches!(err, GatewayError::BudgetExceeded { .. }));
        assert_eq!(client.calls(), 2);
        assert_eq!(gateway.metrics().budget_exceeded, 1);
    }

    #[tokio::test]
    async fn upstream_failure_releases_the_reservation() {
        let gateway = gateway(
            TierLimits {
                tokens_per_day: Some(600),
                ..TierLimits::default()
            },
            CountingClient::failing(),
        );

        // Estimate per call is ~518 tokens; a leaked reservation would make
        // the retry impossible within the 600 token day budget.
        let err = gateway.handle(&request("q")).await.expect_err("upstream");
        assert!(matches!(err, GatewayError::Upstream { .. }));

        let err = gateway.handle(&request("q")).await.expect_err("upstream again");
        assert!(matches!(err, GatewayError::Upstream { .. }));
        assert_eq!(gateway.metrics().upstream_errors, 2);
        assert_eq!(gateway.metrics().provider_failures, 2);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_reach_upstream_once() {
        let client = CountingClient::slow(Duration::from_millis(100));
        let gateway = Arc::new(gateway(TierLimits::default(), client.clone()));

        let a = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.handle(&request("shared question")).await })
        };
        let b = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.handle(&request("shared question")).await })
        };

        let first = a.await.expect("join").expect("reply");
        let second = b.await.expect("join").expect("reply");

        assert_eq!(client.calls(), 1);
        assert_eq!(first.text, second.text);
        assert!(first.cache_hit != second.cache_hit);
        assert_eq!(gateway.metrics().single_flight_waits, 1);
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected_before_any_accounting() {
        let client = CountingClient::new();
        let gateway = gateway(TierLimits::default(), client.clone());

        let err = gateway.handle(&request("   ")).await.expect_err("invalid");
        assert!(matches!(err, GatewayError::InvalidInput { .. }));
        assert_eq!(client.calls(), 0);

        let usage = gateway.usage(10, None).await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].outcome, "invalid_input");
    }

    #[tokio::test]
    async fn every_terminal_outcome_is_recorded_in_the_usage_log() {
        let client = CountingClient::new();
        let gateway = gateway(
            TierLimits {
                requests_per_day: Some(1),
                ..TierLimits::default()
            },
            client.clone(),
        );

        gateway.handle(&request("only question")).await.unwrap();
        let _ = gateway.handle(&request("denied question")).await;

        let usage = gateway.usage(10, None).await.unwrap();
        assert_eq!(usage.len(), 2);
        // Newest first.
        assert_eq!(usage[0].outcome, "budget_exceeded");
        assert_eq!(usage[1].outcome, "ok");
        assert_eq!(usage[1].tokens, 40);
        assert_eq!(usage[1].provider.as_deref(), Some("primary"));
    }

    #[tokio::test]
    async fn store_error_after_reservation_hands_the_quota_back() {
        let client = CountingClient::new();
        let mut gateway = Gateway::with_clock(
            config(TierLimits {
                tokens_per_day: Some(600),
                ..TierLimits::default()
            }),
            FlakyStore::failing_cache_reads(1),
            Arc::new(FixedClock(1_700_000_000)),
        );
        gateway.register_provider(provider("primary"), client.clone());

        let err = gateway.handle(&request("q")).await.expect_err("store error");
        assert!(matches!(err, GatewayError::Store(_)));
        assert_eq!(client.calls(), 0);

        // The failed request reserved ~513 tokens; had that leaked, this
        // retry would not fit in the 600 token day budget.
        let reply = gateway.handle(&request("q")).await.expect("retry admitted");
        assert!(!reply.cache_hit);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn abuse_denial_releases_the_reserved_request_slot() {
        let client = CountingClient::new();
        let mut cfg = config(TierLimits {
            requests_per_day: Some(1),
            ..TierLimits::default()
        });
        cfg.abuse.injection_weight = 10.0;
        cfg.abuse.lockout_threshold = 6.0;
        cfg.abuse.suspend_threshold = 100.0;
        let mut gateway = Gateway::with_clock(
            cfg,
            Arc::new(MemoryStore::new()),
            Arc::new(FixedClock(1_700_000_000)),
        );
        gateway.register_provider(provider("primary"), client.clone());

        let err = gateway
            .handle(&request("jailbreak please"))
            .await
            .expect_err("locked out");
        assert!(matches!(err, GatewayError::AbuseDetected { .. }));
        assert_eq!(client.calls(), 0);

        gateway.reset_abuse("acct").await.unwrap();

        // The denied request must not have burned the single daily slot.
        gateway
            .handle(&request("what does the sun mean?"))
            .await
            .expect("slot intact");
    }

    #[tokio::test]
    async fn waiter_past_the_single_flight_deadline_fails_and_returns_quota() {
        let client = CountingClient::slow(Duration::from_millis(400));
        let mut cfg = config(TierLimits {
            tokens_per_day: Some(1_040),
            ..TierLimits::default()
        });
        cfg.single_flight.wait_timeout_ms = 100;
        cfg.single_flight.poll_interval_ms = 10;
        let mut gateway = Gateway::with_clock(
            cfg,
            Arc::new(MemoryStore::new()),
            Arc::new(FixedClock(1_700_000_000)),
        );
        gateway.register_provider(provider("primary"), client.clone());
        let gateway = Arc::new(gateway);

        let a = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.handle(&request("slow question")).await })
        };
        let b = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.handle(&request("slow question")).await })
        };

        let results = [a.await.expect("join"), b.await.expect("join")];
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        let err = results
            .into_iter()
            .find_map(|result| result.err())
            .expect("one waiter timed out");
        assert!(matches!(err, GatewayError::Upstream { .. }));
        assert_eq!(client.calls(), 1);

        // Both sides reserved ~516 tokens against the 1040 budget. With the
        // waiter's share handed back only the leader's 40 committed tokens
        // remain, so a fresh prompt still fits.
        gateway
            .handle(&request("follow up"))
            .await
            .expect("quota handed back");
    }

    #[tokio::test]
    async fn no_providers_registered_is_provider_unavailable() {
        let gateway = Gateway::with_clock(
            config(TierLimits::default()),
            Arc::new(MemoryStore::new()),
            Arc::new(FixedClock(1_700_000_000)),
        );
        let err = gateway.handle(&request("q")).await.expect_err("no providers");
        assert!(matches!(err, GatewayError::ProviderUnavailable));
    }
}
