use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::store::GatewayStore;
use crate::types::Tier;

const MINUTE_SECS: u64 = 60;
const DAY_SECS: u64 = 24 * 60 * 60;

/// Fixed quota windows, not sliding. Rollover happens at wall-clock
/// boundaries (minute, UTC day) so consumption lines up with billing days.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    RequestsPerMinute,
    RequestsPerDay,
    TokensPerMinute,
    TokensPerDay,
}

impl WindowKind {
    pub const ALL: [WindowKind; 4] = [
        WindowKind::RequestsPerMinute,
        WindowKind::RequestsPerDay,
        WindowKind::TokensPerMinute,
        WindowKind::TokensPerDay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::RequestsPerMinute => "requests_per_minute",
            WindowKind::RequestsPerDay => "requests_per_day",
            WindowKind::TokensPerMinute => "tokens_per_minute",
            WindowKind::TokensPerDay => "tokens_per_day",
        }
    }

    pub fn len_secs(&self) -> u64 {
        match self {
            WindowKind::RequestsPerMinute | WindowKind::TokensPerMinute => MINUTE_SECS,
            WindowKind::RequestsPerDay | WindowKind::TokensPerDay => DAY_SECS,
        }
    }

    pub fn window_start(&self, now: u64) -> u64 {
        now - now % self.len_secs()
    }

    pub fn retry_after_secs(&self, now: u64) -> u64 {
        self.window_start(now) + self.len_secs() - now
    }

    fn counts_requests(&self) -> bool {
        matches!(
            self,
            WindowKind::RequestsPerMinute | WindowKind::RequestsPerDay
        )
    }

    fn is_daily(&self) -> bool {
        matches!(self, WindowKind::RequestsPerDay | WindowKind::TokensPerDay)
    }
}

impl std::fmt::Display for WindowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits for one tier. `None` disables the window; `Some(0)` denies all.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TierLimits {
    #[serde(default)]
    pub requests_per_minute: Option<u64>,
    #[serde(default)]
    pub requests_per_day: Option<u64>,
    #[serde(default)]
    pub tokens_per_minute: Option<u64>,
    #[serde(default)]
    pub tokens_per_day: Option<u64>,
}

impl TierLimits {
    pub fn limit(&self, kind: WindowKind) -> Option<u64> {
        match kind {
            WindowKind::RequestsPerMinute => self.requests_per_minute,
            WindowKind::RequestsPerDay => self.requests_per_day,
            WindowKind::TokensPerMinute => self.tokens_per_minute,
            WindowKind::TokensPerDay => self.tokens_per_day,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TierLimitTable {
    #[serde(default)]
    pub free: TierLimits,
    #[serde(default)]
    pub basic: TierLimits,
    #[serde(default)]
    pub premium: TierLimits,
}

impl TierLimitTable {
    pub fn for_tier(&self, tier: Tier) -> &TierLimits {
        match tier {
            Tier::Free => &self.free,
            Tier::Basic => &self.basic,
            Tier::Premium => &self.premium,
        }
    }
}

#[derive(Clone, Debug)]
struct ReservedWindow {
    kind: WindowKind,
    window_start: u64,
    amount: u64,
}

/// A provisional hold on every applicable window. Must be either committed
/// (after a successful upstream call) or released (cache hit, any failure
/// before the call); never dropped silently.
#[derive(Clone, Debug)]
pub struct Reservation {
    account: String,
    estimated_tokens: u64,
    parts: Vec<ReservedWindow>,
}

impl Reservation {
    pub fn estimated_tokens(&self) -> u64 {
        self.estimated_tokens
    }
}

pub struct QuotaManager {
    store: Arc<dyn GatewayStore>,
    limits: TierLimitTable,
}

impl QuotaManager {
    pub fn new(store: Arc<dyn GatewayStore>, limits: TierLimitTable) -> Self {
        Self { store, limits }
    }

    fn scope(account: &str, kind: WindowKind) -> String {
        format!("quota:{account}:{kind}")
    }

    /// Reserve 1 request plus the token estimate in every applicable window.
    /// Denied if any window would be exceeded; partially reserved windows are
    /// rolled back before the denial is returned. Minute windows deny as
    /// `RateLimited`, day windows as `BudgetExceeded`.
    pub async fn check_and_reserve(
        &self,
        account: &str,
        tier: Tier,
        estimated_tokens: u64,
        now: u64,
    ) -> Result<Reservation> {
        let limits = self.limits.for_tier(tier);
        let mut parts: Vec<ReservedWindow> = Vec::new();

        for kind in WindowKind::ALL {
            let Some(limit) = limits.limit(kind) else {
                continue;
            };
            let amount = if kind.counts_requests() {
                1
            } else {
                estimated_tokens
            };
            if amount == 0 {
                continue;
            }

            let window_start = kind.window_start(now);
            let scope = Self::scope(account, kind);
            let admitted = self
                .store
                .try_consume_window(&scope, window_start, amount, limit)
                .await?;

            if !admitted {
                self.rollback(account, &parts).await?;
                let retry_after_secs = kind.retry_after_secs(now);
                return Err(if kind.is_daily() {
                    GatewayError::BudgetExceeded {
                        window: kind,
                        retry_after_secs,
                    }
                } else {
                    GatewayError::RateLimited {
                        window: kind,
                        retry_after_secs,
                    }
                });
            }

            parts.push(ReservedWindow {
                kind,
                window_start,
                amount,
            });
        }

        Ok(Reservation {
            account: account.to_string(),
            estimated_tokens,
            parts,
        })
    }

    /// Finalize consumption. The committed token count is capped at the
    /// reservation so a window never observes consumed > limit; the unused
    /// remainder of the estimate is handed back.
    pub async fn commit(&self, reservation: &Reservation, actual_tokens: u64) -> Result<()> {
        for part in &reservation.parts {
            if part.kind.counts_requests() {
                continue;
            }
            let committed = actual_tokens.min(part.amount);
            let delta = committed as i64 - part.amount as i64;
            if delta != 0 {
                let scope = Self::scope(&reservation.account, part.kind);
                self.store
                    .adjust_window(&scope, part.window_start, delta)
                    .await?;
            }
        }
        Ok(())
    }

    /// Roll the whole reservation back. Used on cache hits (hits are free)
    /// and on any failure path that ends before the upstream call.
    pub async fn release(&self, reservation: &Reservation) -> Result<()> {
        self.rollback(&reservation.account, &reservation.parts)
            .await
    }

    async fn rollback(&self, account: &str, parts: &[ReservedWindow]) -> Result<()> {
        for part in parts {
            let scope = Self::scope(account, part.kind);
            self.store
                .adjust_window(&scope, part.window_start, -(part.amount as i64))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager(limits: TierLimits) -> QuotaManager {
        let table = TierLimitTable {
            free: limits,
            ..TierLimitTable::default()
        };
        QuotaManager::new(Arc::new(MemoryStore::new()), table)
    }

    #[tokio::test]
    async fn denies_third_request_on_daily_request_budget() {
        let quota = manager(TierLimits {
            requests_per_day: Some(2),
            ..TierLimits::default()
        });

        let now = 1_700_000_000;
        for _ in 0..2 {
            let reservation = quota
                .check_and_reserve("acct", Tier::Free, 100, now)
                .await
                .expect("reserve");
            quota.commit(&reservation, 80).await.expect("commit");
        }

        let err = quota
            .check_and_reserve("acct", Tier::Free, 100, now)
            .await
            .expect_err("deny");
        assert!(matches!(
            err,
            GatewayError::BudgetExceeded {
                window: WindowKind::RequestsPerDay,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn minute_window_denial_is_rate_limited_with_retry_after() {
        let quota = manager(TierLimits {
            requests_per_minute: Some(1),
            ..TierLimits::default()
        });

        // 30 seconds into the current minute window.
        let window = WindowKind::RequestsPerMinute;
        let now = window.window_start(1_700_000_000) + 30;
        quota
            .check_and_reserve("acct", Tier::Free, 10, now)
            .await
            .expect("first");
        let err = quota
            .check_and_reserve("acct", Tier::Free, 10, now)
            .await
            .expect_err("second denied");
        match err {
            GatewayError::RateLimited {
                window,
                retry_after_secs,
            } => {
                assert_eq!(window, WindowKind::RequestsPerMinute);
                assert_eq!(retry_after_secs, 30);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn denial_rolls_back_windows_reserved_earlier_in_the_pass() {
        // Token budget blocks the request; the request counter consumed
        // before it must be handed back.
        let quota = manager(TierLimits {
            requests_per_minute: Some(10),
            tokens_per_day: Some(50),
            ..TierLimits::default()
        });

        let now = 1_700_000_000;
        let err = quota
            .check_and_reserve("acct", Tier::Free, 100, now)
            .await
            .expect_err("deny");
        assert!(matches!(err, GatewayError::BudgetExceeded { .. }));

        // All ten request slots must still be available.
        for _ in 0..10 {
            quota
                .check_and_reserve("acct", Tier::Free, 1, now)
                .await
                .expect("slot available");
        }
    }

    #[tokio::test]
    async fn release_returns_the_full_reservation() {
        let quota = manager(TierLimits {
            tokens_per_day: Some(100),
            ..TierLimits::default()
        });

        let now = 1_700_000_000;
        let reservation = quota
            .check_and_reserve("acct", Tier::Free, 100, now)
            .await
            .expect("reserve");
        quota.release(&reservation).await.expect("release");

        quota
            .check_and_reserve("acct", Tier::Free, 100, now)
            .await
            .expect("full budget available again");
    }

    #[tokio::test]
    async fn commit_with_smaller_actual_releases_the_difference() {
        let quota = manager(TierLimits {
            tokens_per_day: Some(100),
            ..TierLimits::default()
        });

        let now = 1_700_000_000;
        let reservation = quota
            .check_and_reserve("acct", Tier::Free, 80, now)
            .await
            .expect("reserve");
        quota.commit(&reservation, 30).await.expect("commit");

        // 30 committed, 70 free again.
        quota
            .check_and_reserve("acct", Tier::Free, 70, now)
            .await
            .expect("remainder available");
        let err = quota
            .check_and_reserve("acct", Tier::Free, 1, now)
            .await
            .expect_err("budget full");
        assert!(matches!(err, GatewayError::BudgetExceeded { .. }));
    }

    #[tokio::test]
    async fn windows_reset_at_the_boundary() {
        let quota = manager(TierLimits {
            requests_per_minute: Some(1),
            ..TierLimits::default()
        });

        let now = 1_700_000_000;
        quota
            .check_and_reserve("acct", Tier::Free, 1, now)
            .await
            .expect("first");
        quota
            .check_and_reserve("acct", Tier::Free, 1, now + 60)
            .await
            .expect("next minute admits again");
    }

    #[tokio::test]
    async fn zero_limit_denies_everything() {
        let quota = manager(TierLimits {
            requests_per_minute: Some(0),
            ..TierLimits::default()
        });

        let err = quota
            .check_and_reserve("acct", Tier::Free, 1, 1_700_000_000)
            .await
            .expect_err("deny");
        assert!(matches!(err, GatewayError::RateLimited { .. }));
    }
}
