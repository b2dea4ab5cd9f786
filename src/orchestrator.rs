//! Provider selection and failover. Health is tracked in-process per
//! instance; capacity counters live in the shared store so all instances
//! see the same per-provider minute usage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::client::{Completion, CompletionClient, CompletionRequest};
use crate::config::ProviderConfig;
use crate::error::{GatewayError, Result};
use crate::observability::Observability;
use crate::store::GatewayStore;

const CAPACITY_WINDOW_SECS: u64 = 60;

#[derive(Clone, Debug, Default)]
struct ProviderHealth {
    consecutive_failures: u32,
    disabled_until: Option<u64>,
}

impl ProviderHealth {
    fn available(&self, now: u64) -> bool {
        match self.disabled_until {
            Some(until) => now >= until,
            None => true,
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.disabled_until = None;
    }

    fn record_failure(&mut self, now: u64, threshold: u32, cooldown_secs: u64) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= threshold {
            self.disabled_until = Some(now.saturating_add(cooldown_secs));
            self.consecutive_failures = 0;
        }
    }
}

pub struct RegisteredProvider {
    pub config: ProviderConfig,
    pub client: Arc<dyn CompletionClient>,
}

pub struct ProviderOrchestrator {
    store: Arc<dyn GatewayStore>,
    providers: Vec<RegisteredProvider>,
    health: Mutex<HashMap<String, ProviderHealth>>,
    max_attempts: usize,
    observability: Arc<Observability>,
}

impl ProviderOrchestrator {
    pub fn new(
        store: Arc<dyn GatewayStore>,
        max_attempts: usize,
        observability: Arc<Observability>,
    ) -> Self {
        Self {
            store,
            providers: Vec::new(),
            health: Mutex::new(HashMap::new()),
            max_attempts: max_attempts.max(1),
            observability,
        }
    }

    pub fn register(&mut self, config: ProviderConfig, client: Arc<dyn CompletionClient>) {
        self.providers.push(RegisteredProvider { config, client });
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|provider| provider.config.name.clone())
            .collect()
    }

    fn rpm_scope(name: &str) -> String {
        format!("provider:{name}:rpm")
    }

    fn tpm_scope(name: &str) -> String {
        format!("provider:{name}:tpm")
    }

    fn window_start(now: u64) -> u64 {
        now - now % CAPACITY_WINDOW_SECS
    }

    async fn window_used(&self, scope: &str, now: u64) -> Result<u64> {
        // Zero-amount bump reads the counter without moving it.
        Ok(self
            .store
            .bump_window(scope, Self::window_start(now), 0)
            .await?)
    }

    /// Fraction of this provider's minute capacity still unused, the
    /// smaller of the request and token dimensions. Unlimited providers
    /// score a flat 1.0.
    async fn remaining_capacity(
        &self,
        provider: &RegisteredProvider,
        estimated_tokens: u64,
        now: u64,
    ) -> Result<Option<f64>> {
        let name = &provider.config.name;
        let mut fraction = 1.0_f64;

        if let Some(rpm) = provider.config.rpm {
            let used = self.window_used(&Self::rpm_scope(name), now).await?;
            if used.saturating_add(1) > rpm {
                return Ok(None);
            }
            fraction = fraction.min((rpm - used) as f64 / rpm.max(1) as f64);
        }
        if let Some(tpm) = provider.config.tpm {
            let used = self.window_used(&Self::tpm_scope(name), now).await?;
            if used.saturating_add(estimated_tokens) > tpm {
                return Ok(None);
            }
            fraction = fraction.min((tpm - used) as f64 / tpm.max(1) as f64);
        }
        Ok(Some(fraction))
    }

    async fn select(
        &self,
        estimated_tokens: u64,
        now: u64,
        exclude: &[String],
    ) -> Result<Option<usize>> {
        let mut best: Option<(usize, f64)> = None;
        for (index, provider) in self.providers.iter().enumerate() {
            let name = &provider.config.name;
            if exclude.contains(name) {
                continue;
            }
            {
                let health = self.health.lock().expect("health poisoned");
                if !health.get(name).cloned().unwrap_or_default().available(now) {
                    continue;
                }
            }
            let Some(fraction) = self.remaining_capacity(provider, estimated_tokens, now).await?
            else {
                continue;
            };
            if best.is_none_or(|(_, best_fraction)| fraction > best_fraction) {
                best = Some((index, fraction));
            }
        }
        Ok(best.map(|(index, _)| index))
    }

    fn mark_success(&self, name: &str) {
        let mut health = self.health.lock().expect("health poisoned");
        health.entry(name.to_string()).or_default().record_success();
    }

    fn mark_failure(&self, provider: &ProviderConfig, now: u64) {
        let mut health = self.health.lock().expect("health poisoned");
        let entry = health.entry(provider.name.clone()).or_default();
        entry.record_failure(now, provider.failure_threshold, provider.cooldown_secs);
        if let Some(until) = entry.disabled_until {
            tracing::warn!(
                provider = %provider.name,
                disabled_until = until,
                "provider disabled after repeated failures"
            );
        }
    }

    /// Call the best available provider, failing over across providers on
    /// upstream errors. `ProviderUnavailable` only when nothing could even
    /// be attempted; once a call has gone out, failures surface as
    /// `Upstream`.
    pub async fn call_with_failover(
        &self,
        request: &CompletionRequest,
        estimated_tokens: u64,
        now: u64,
    ) -> Result<(String, Completion)> {
        let mut tried: Vec<String> = Vec::new();
        let mut last_error: Option<GatewayError> = None;

        while tried.len() < self.max_attempts {
            let Some(index) = self.select(estimated_tokens, now, &tried).await? else {
                break;
            };
            let provider = &self.providers[index];
            let name = provider.config.name.clone();
            tried.push(name.clone());

            let window_start = Self::window_start(now);
            self.store
                .bump_window(&Self::rpm_scope(&name), window_start, 1)
                .await?;

            let mut attempt = request.clone();
            if attempt.model.is_empty() {
                attempt.model = provider.config.model.clone();
            }

            // One counter bump per attempt, not per gateway request, so
            // failover retries are visible on the metrics endpoint.
            self.observability.record_provider_call();
            match provider.client.complete(&attempt).await {
                Ok(completion) => {
                    self.mark_success(&name);
                    self.store
                        .bump_window(&Self::tpm_scope(&name), window_start, completion.tokens_used)
                        .await?;
                    return Ok((name, completion));
                }
                Err(error) => {
                    tracing::warn!(provider = %name, %error, "provider call failed");
                    self.observability.record_provider_failure();
                    self.mark_failure(&provider.config, now);
                    last_error = Some(error);
                }
            }
        }

        match last_error {
            Some(error) => Err(error),
            None => Err(GatewayError::ProviderUnavailable),
        }
    }
}
