//! Abuse detection: a decaying per-account score fed by request velocity,
//! prompt injection markers and the external correlation flag, driving a
//! one-way enforcement ladder.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::{AbuseState, GatewayStore};
use crate::types::TaskRequest;

const VELOCITY_WINDOW_SECS: u64 = 60;

/// Enforcement ladder, ordered. Escalation moves up only; decay may lower
/// `Throttle` back to `Warn` but never below, and `Lockout`/`Suspend` come
/// down only through an explicit operator reset.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementLevel {
    #[default]
    None,
    Warn,
    Throttle,
    Lockout,
    Suspend,
}

impl EnforcementLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnforcementLevel::None => "none",
            EnforcementLevel::Warn => "warn",
            EnforcementLevel::Throttle => "throttle",
            EnforcementLevel::Lockout => "lockout",
            EnforcementLevel::Suspend => "suspend",
        }
    }
}

impl std::fmt::Display for EnforcementLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AbuseConfig {
    /// Requests per minute beyond which the velocity signal fires, as a
    /// multiple of the tier's per-minute request limit.
    #[serde(default = "default_velocity_multiplier")]
    pub velocity_multiplier: f64,
    /// Velocity baseline when the tier has no per-minute request limit.
    #[serde(default = "default_baseline_rpm")]
    pub baseline_rpm: u64,
    #[serde(default = "default_velocity_weight")]
    pub velocity_weight: f64,
    #[serde(default = "default_injection_weight")]
    pub injection_weight: f64,
    #[serde(default = "default_correlation_weight")]
    pub correlation_weight: f64,
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: f64,
    #[serde(default = "default_throttle_threshold")]
    pub throttle_threshold: f64,
    #[serde(default = "default_lockout_threshold")]
    pub lockout_threshold: f64,
    #[serde(default = "default_suspend_threshold")]
    pub suspend_threshold: f64,
    #[serde(default = "default_decay_half_life_seconds")]
    pub decay_half_life_secs: u64,
    #[serde(default = "default_lockout_seconds")]
    pub lockout_secs: u64,
    #[serde(default = "default_throttle_delay_ms")]
    pub throttle_delay_ms: u64,
    /// Operator-supplied marker patterns checked in addition to the built-in
    /// set. Invalid patterns are skipped.
    #[serde(default)]
    pub injection_markers: Vec<String>,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            velocity_multiplier: default_velocity_multiplier(),
            baseline_rpm: default_baseline_rpm(),
            velocity_weight: default_velocity_weight(),
            injection_weight: default_injection_weight(),
            correlation_weight: default_correlation_weight(),
            warn_threshold: default_warn_threshold(),
            throttle_threshold: default_throttle_threshold(),
            lockout_threshold: default_lockout_threshold(),
            suspend_threshold: default_suspend_threshold(),
            decay_half_life_secs: default_decay_half_life_seconds(),
            lockout_secs: default_lockout_seconds(),
            throttle_delay_ms: default_throttle_delay_ms(),
            injection_markers: Vec::new(),
        }
    }
}

fn default_velocity_multiplier() -> f64 {
    3.0
}

fn default_baseline_rpm() -> u64 {
    30
}

fn default_velocity_weight() -> f64 {
    1.0
}

fn default_injection_weight() -> f64 {
    2.0
}

fn default_correlation_weight() -> f64 {
    2.0
}

fn default_warn_threshold() -> f64 {
    1.0
}

fn default_throttle_threshold() -> f64 {
    3.0
}

fn default_lockout_threshold() -> f64 {
    6.0
}

fn default_suspend_threshold() -> f64 {
    10.0
}

fn default_decay_half_life_seconds() -> u64 {
    15 * 60
}

fn default_lockout_seconds() -> u64 {
    10 * 60
}

fn default_throttle_delay_ms() -> u64 {
    1_500
}

fn builtin_injection_markers() -> &'static [Regex] {
    static MARKERS: OnceLock<Vec<Regex>> = OnceLock::new();
    MARKERS.get_or_init(|| {
        [
            r"(?i)ignore\s+(all\s+)?(previous|prior|above)\s+(instructions|prompts)",
            r"(?i)disregard\s+(your|the)\s+(system\s+)?(prompt|instructions)",
            r"(?i)you\s+are\s+now\s+(dan|developer\s+mode)",
            r"(?i)reveal\s+(your|the)\s+(system\s+)?prompt",
            r"(?i)pretend\s+(you\s+have|there\s+are)\s+no\s+(rules|restrictions|guidelines)",
            r"(?i)\bjailbreak\b",
            r"(?i)print\s+your\s+(initial|hidden)\s+instructions",
        ]
        .into_iter()
        .map(|pattern| Regex::new(pattern).expect("builtin marker pattern"))
        .collect()
    })
}

/// Verdict attached to one request. `allowed == false` maps to an
/// `AbuseDetected` rejection before the cache is consulted.
#[derive(Clone, Debug)]
pub struct AbuseVerdict {
    pub level: EnforcementLevel,
    pub allowed: bool,
    pub retry_after_secs: Option<u64>,
    pub throttle_delay_ms: Option<u64>,
    pub notice: Option<String>,
}

pub struct AbuseDetector {
    store: Arc<dyn GatewayStore>,
    config: AbuseConfig,
    extra_markers: Vec<Regex>,
}

impl AbuseDetector {
    pub fn new(store: Arc<dyn GatewayStore>, config: AbuseConfig) -> Self {
        let extra_markers = config
            .injection_markers
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(error) => {
                    tracing::warn!(%pattern, %error, "skipping invalid abuse marker pattern");
                    None
                }
            })
            .collect();
        Self {
            store,
            config,
            extra_markers,
        }
    }

    fn velocity_scope(account: &str) -> String {
        format!("abusevel:{account}")
    }

    fn matches_injection_marker(&self, prompt: &str) -> bool {
        builtin_injection_markers()
            .iter()
            .chain(self.extra_markers.iter())
            .any(|marker| marker.is_match(prompt))
    }

    fn decayed_score(&self, state: &AbuseState, now: u64) -> f64 {
        let half_life = self.config.decay_half_life_secs.max(1) as f64;
        let elapsed = now.saturating_sub(state.updated_at) as f64;
        state.score * 0.5_f64.powf(elapsed / half_life)
    }

    fn level_for_score(&self, score: f64) -> EnforcementLevel {
        if score >= self.config.suspend_threshold {
            EnforcementLevel::Suspend
        } else if score >= self.config.lockout_threshold {
            EnforcementLevel::Lockout
        } else if score >= self.config.throttle_threshold {
            EnforcementLevel::Throttle
        } else if score >= self.config.warn_threshold {
            EnforcementLevel::Warn
        } else {
            EnforcementLevel::None
        }
    }

    /// Ladder transition rule: escalation is monotonic, decay lowers at most
    /// `Throttle -> Warn`, and `Lockout`/`Suspend` are sticky.
    fn next_level(current: EnforcementLevel, candidate: EnforcementLevel) -> EnforcementLevel {
        if candidate >= current {
            return candidate;
        }
        match current {
            EnforcementLevel::Throttle => candidate.max(EnforcementLevel::Warn),
            EnforcementLevel::Lockout | EnforcementLevel::Suspend => current,
            other => other,
        }
    }

    /// Score this request and persist the updated state. The velocity
    /// counter is bumped for every evaluated request, cache hits included.
    pub async fn evaluate(
        &self,
        request: &TaskRequest,
        tier_rpm: Option<u64>,
        now: u64,
    ) -> Result<AbuseVerdict> {
        let account = &request.account;
        let mut state = self
            .store
            .abuse_state(account)
            .await?
            .unwrap_or_default();

        // Suspended accounts short-circuit; nothing they send changes state.
        if state.level == EnforcementLevel::Suspend {
            return Ok(Self::denied_verdict(EnforcementLevel::Suspend, None));
        }

        if state.level == EnforcementLevel::Lockout {
            if let Some(locked_until) = state.locked_until {
                if now < locked_until {
                    return Ok(Self::denied_verdict(
                        EnforcementLevel::Lockout,
                        Some(locked_until - now),
                    ));
                }
            }
        }

        let window_start = now - now % VELOCITY_WINDOW_SECS;
        let velocity = self
            .store
            .bump_window(&Self::velocity_scope(account), window_start, 1)
            .await?;
        let baseline = tier_rpm.unwrap_or(self.config.baseline_rpm).max(1);
        let velocity_limit = (baseline as f64 * self.config.velocity_multiplier).ceil() as u64;

        let mut score = self.decayed_score(&state, now);
        if velocity > velocity_limit {
            score += self.config.velocity_weight;
        }
        if self.matches_injection_marker(&request.prompt) {
            score += self.config.injection_weight;
        }
        if request.correlation_flagged {
            score += self.config.correlation_weight;
        }

        let candidate = self.level_for_score(score);
        let level = Self::next_level(state.level, candidate);
        if candidate >= EnforcementLevel::Lockout
            && !state.locked_until.is_some_and(|until| now < until)
        {
            state.locked_until = Some(now.saturating_add(self.config.lockout_secs));
        }

        if level != state.level {
            tracing::info!(
                %account,
                from = %state.level,
                to = %level,
                score,
                "abuse enforcement level changed"
            );
        }

        state.score = score;
        state.level = level;
        state.updated_at = now;
        self.store.put_abuse_state(account, &state).await?;

        Ok(match level {
            EnforcementLevel::None => AbuseVerdict {
                level,
                allowed: true,
                retry_after_secs: None,
                throttle_delay_ms: None,
                notice: None,
            },
            EnforcementLevel::Warn => AbuseVerdict {
                level,
                allowed: true,
                retry_after_secs: None,
                throttle_delay_ms: None,
                notice: Some(
                    "unusual activity detected on this account; continued anomalies may limit access"
                        .to_string(),
                ),
            },
            EnforcementLevel::Throttle => AbuseVerdict {
                level,
                allowed: true,
                retry_after_secs: None,
                throttle_delay_ms: Some(self.config.throttle_delay_ms),
                notice: Some("requests are being slowed due to unusual activity".to_string()),
            },
            EnforcementLevel::Lockout => match state.locked_until {
                Some(until) if now < until => Self::denied_verdict(level, Some(until - now)),
                // Lock window over: admit, flagged and slowed, until an
                // operator reset clears the level.
                _ => AbuseVerdict {
                    level,
                    allowed: true,
                    retry_after_secs: None,
                    throttle_delay_ms: Some(self.config.throttle_delay_ms),
                    notice: Some(
                        "account remains under review after a temporary lockout".to_string(),
                    ),
                },
            },
            EnforcementLevel::Suspend => Self::denied_verdict(level, None),
        })
    }

    fn denied_verdict(level: EnforcementLevel, retry_after_secs: Option<u64>) -> AbuseVerdict {
        AbuseVerdict {
            level,
            allowed: false,
            retry_after_secs,
            throttle_delay_ms: None,
            notice: None,
        }
    }

    /// Operator reset: the only path that lowers `Lockout` or `Suspend`.
    pub async fn reset(&self, account: &str, now: u64) -> Result<()> {
        let state = AbuseState {
            score: 0.0,
            level: EnforcementLevel::None,
            locked_until: None,
            updated_at: now,
        };
        self.store.put_abuse_state(account, &state).await?;
        tracing::info!(%account, "abuse state reset");
        Ok(())
    }
}
