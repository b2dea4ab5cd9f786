use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::abuse::AbuseConfig;
use crate::quota::{TierLimitTable, TierLimits};
use crate::types::TaskType;

/// Whole configuration surface of the gateway. Everything here is data the
/// operator tunes; nothing in the pipeline hard-codes limits or thresholds.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub tiers: TierLimitTable,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub tasks: TaskTable,
    #[serde(default)]
    pub abuse: AbuseConfig,
    #[serde(default)]
    pub single_flight: SingleFlightConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl GatewayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&raw)?)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|provider| provider.name == name)
    }

    pub fn tier_limits(&self, tier: crate::types::Tier) -> &TierLimits {
        self.tiers.for_tier(tier)
    }

    pub fn task(&self, task: TaskType) -> &TaskConfig {
        self.tasks.for_task(task)
    }
}

/// Upstream provider registry entry. Credentials are referenced by
/// environment variable name, never stored inline.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key_env: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub rpm: Option<u64>,
    #[serde(default)]
    pub tpm: Option<u64>,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_secs: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key_env", &self.api_key_env)
            .field("model", &self.model)
            .field("rpm", &self.rpm)
            .field("tpm", &self.tpm)
            .field("failure_threshold", &self.failure_threshold)
            .field("cooldown_secs", &self.cooldown_secs)
            .field("headers", &"<redacted>")
            .finish()
    }
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_seconds() -> u64 {
    30
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            cache_ttl_secs: default_cache_ttl_seconds(),
            max_output_tokens: default_max_output_tokens(),
            system_prompt: None,
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_cache_ttl_seconds() -> u64 {
    24 * 60 * 60
}

fn default_max_output_tokens() -> u64 {
    512
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskTable {
    #[serde(default)]
    pub interpret_card: Option<TaskConfig>,
    #[serde(default)]
    pub synthesize_reading: Option<TaskConfig>,
    #[serde(default)]
    pub narrate: Option<TaskConfig>,
}

impl TaskTable {
    pub fn for_task(&self, task: TaskType) -> &TaskConfig {
        static DEFAULT: std::sync::OnceLock<TaskConfig> = std::sync::OnceLock::new();
        let fallback = DEFAULT.get_or_init(TaskConfig::default);
        let slot = match task {
            TaskType::InterpretCard => &self.interpret_card,
            TaskType::SynthesizeReading => &self.synthesize_reading,
            TaskType::Narrate => &self.narrate,
        };
        slot.as_ref().unwrap_or(fallback)
    }
}

/// Tuning for the per-key coordination token that enforces single-flight
/// cache population across gateway instances.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SingleFlightConfig {
    #[serde(default = "default_lease_ttl_seconds")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for SingleFlightConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: default_lease_ttl_seconds(),
            wait_timeout_ms: default_wait_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_lease_ttl_seconds() -> u64 {
    30
}

fn default_wait_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    50
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_failover_attempts")]
    pub failover_attempts: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_prompt_chars: default_max_prompt_chars(),
            request_timeout_secs: default_request_timeout_seconds(),
            failover_attempts: default_failover_attempts(),
        }
    }
}

fn default_max_prompt_chars() -> usize {
    8_000
}

fn default_request_timeout_seconds() -> u64 {
    60
}

fn default_failover_attempts() -> usize {
    3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tier;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let raw = r#"
            [tiers.free]
            requests_per_minute = 5
            requests_per_day = 20
            tokens_per_day = 10000

            [[providers]]
            name = "primary"
            base_url = "https://llm.example.com/v1"
            api_key_env = "PRIMARY_API_KEY"
            model = "gpt-4o-mini"
            rpm = 60

            [tasks.narrate]
            model = "gpt-4o"
            cache_ttl_secs = 600
        "#;
        let config = GatewayConfig::from_toml_str(raw).expect("parse");

        let free = config.tier_limits(Tier::Free);
        assert_eq!(free.requests_per_minute, Some(5));
        assert_eq!(free.tokens_per_day, Some(10_000));
        assert_eq!(free.tokens_per_minute, None);

        let provider = config.provider("primary").expect("provider");
        assert_eq!(provider.failure_threshold, 3);
        assert_eq!(provider.cooldown_secs, 30);

        assert_eq!(config.task(TaskType::Narrate).cache_ttl_secs, 600);
        assert_eq!(
            config.task(TaskType::InterpretCard).model,
            "gpt-4o-mini".to_string()
        );
        assert_eq!(config.single_flight.lease_ttl_secs, 30);
    }

    #[test]
    fn provider_debug_redacts_headers() {
        let provider = ProviderConfig {
            name: "p".to_string(),
            base_url: String::new(),
            api_key_env: String::new(),
            model: String::new(),
            rpm: None,
            tpm: None,
            failure_threshold: 3,
            cooldown_secs: 30,
            headers: BTreeMap::from([("authorization".to_string(), "secret".to_string())]),
        };
        let rendered = format!("{provider:?}");
        assert!(!rendered.contains("secret"));
    }
}
