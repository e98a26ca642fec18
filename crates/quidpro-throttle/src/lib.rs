//! QuidPro Throttle - Per-client rolling-hour action budgets
//!
//! Every outbound action a client takes - negotiation messages and reward
//! dispatch alike - passes through [`RateLimiter::allow`]. Budgets are
//! tiered by account age: fresh accounts act sparingly, established ones
//! get the largest cap. Denial is a normal control-flow value, never an
//! error; callers defer the action and try again later.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use quidpro_types::{AccountAgeTier, ClientId};

/// Hourly caps per account-age tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierCaps {
    pub new: u32,
    pub warming: u32,
    pub established: u32,
}

impl TierCaps {
    pub fn cap(&self, tier: AccountAgeTier) -> u32 {
        match tier {
            AccountAgeTier::New => self.new,
            AccountAgeTier::Warming => self.warming,
            AccountAgeTier::Established => self.established,
        }
    }
}

impl Default for TierCaps {
    fn default() -> Self {
        Self {
            new: 6,
            warming: 20,
            established: 60,
        }
    }
}

/// Throttle configuration.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub enabled: bool,
    /// Budget window; one hour in production, shorter in tests
    pub window: Duration,
    pub caps: TierCaps,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(3600),
            caps: TierCaps::default(),
        }
    }
}

/// Per-client budget state for the current window.
#[derive(Debug, Clone)]
struct ActionWindow {
    count: u32,
    window_start: Instant,
}

/// Remaining-budget snapshot for operational introspection.
#[derive(Debug, Clone)]
pub struct QuotaInfo {
    pub cap: u32,
    pub used: u32,
    pub resets_in: Duration,
}

/// Per-client rolling-hour rate limiter.
///
/// Counters mutate under the map's write lock; concurrent `allow` calls
/// for the same client serialize there.
#[derive(Clone)]
pub struct RateLimiter {
    config: ThrottleConfig,
    windows: Arc<RwLock<HashMap<ClientId, ActionWindow>>>,
}

impl RateLimiter {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            windows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Charge one action against the client's budget.
    ///
    /// Resets the window first if it has elapsed. Returns `true` and
    /// increments when under the tier cap; returns `false` without
    /// mutating anything when the budget is spent.
    pub async fn allow(&self, client: &ClientId, tier: AccountAgeTier) -> bool {
        if !self.config.enabled {
            return true;
        }

        let cap = self.config.caps.cap(tier);
        let mut windows = self.windows.write().await;
        let now = Instant::now();

        let window = windows.entry(client.clone()).or_insert(ActionWindow {
            count: 0,
            window_start: now,
        });

        if now.duration_since(window.window_start) >= self.config.window {
            window.count = 0;
            window.window_start = now;
        }

        if window.count < cap {
            window.count += 1;
            true
        } else {
            tracing::debug!(client = %client, ?tier, cap, "action budget spent, deferring");
            false
        }
    }

    /// Snapshot of the client's current budget.
    pub async fn quota(&self, client: &ClientId, tier: AccountAgeTier) -> QuotaInfo {
        let cap = self.config.caps.cap(tier);
        let windows = self.windows.read().await;
        let now = Instant::now();

        match windows.get(client) {
            Some(window) if now.duration_since(window.window_start) < self.config.window => {
                QuotaInfo {
                    cap,
                    used: window.count,
                    resets_in: self.config.window - now.duration_since(window.window_start),
                }
            }
            _ => QuotaInfo {
                cap,
                used: 0,
                resets_in: self.config.window,
            },
        }
    }

    /// Drop a client's window (admin/test hook).
    pub async fn reset(&self, client: &ClientId) {
        self.windows.write().await.remove(client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(window: Duration) -> RateLimiter {
        RateLimiter::new(ThrottleConfig {
            enabled: true,
            window,
            caps: TierCaps {
                new: 2,
                warming: 4,
                established: 6,
            },
        })
    }

    #[tokio::test]
    async fn test_allows_up_to_tier_cap() {
        let limiter = limiter(Duration::from_secs(3600));
        let client = ClientId::new();

        for _ in 0..6 {
            assert!(limiter.allow(&client, AccountAgeTier::Established).await);
        }
        assert!(!limiter.allow(&client, AccountAgeTier::Established).await);
    }

    #[tokio::test]
    async fn test_denial_does_not_mutate_counter() {
        let limiter = limiter(Duration::from_secs(3600));
        let client = ClientId::new();

        for _ in 0..2 {
            assert!(limiter.allow(&client, AccountAgeTier::New).await);
        }
        for _ in 0..5 {
            assert!(!limiter.allow(&client, AccountAgeTier::New).await);
        }
        let quota = limiter.quota(&client, AccountAgeTier::New).await;
        assert_eq!(quota.used, 2);
        assert_eq!(quota.cap, 2);
    }

    #[tokio::test]
    async fn test_window_elapse_resets_budget() {
        let limiter = limiter(Duration::from_millis(40));
        let client = ClientId::new();

        for _ in 0..2 {
            assert!(limiter.allow(&client, AccountAgeTier::New).await);
        }
        assert!(!limiter.allow(&client, AccountAgeTier::New).await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(limiter.allow(&client, AccountAgeTier::New).await);
        let quota = limiter.quota(&client, AccountAgeTier::New).await;
        assert_eq!(quota.used, 1);
    }

    #[tokio::test]
    async fn test_clients_budget_independently() {
        let limiter = limiter(Duration::from_secs(3600));
        let a = ClientId::new();
        let b = ClientId::new();

        for _ in 0..2 {
            assert!(limiter.allow(&a, AccountAgeTier::New).await);
        }
        assert!(!limiter.allow(&a, AccountAgeTier::New).await);
        assert!(limiter.allow(&b, AccountAgeTier::New).await);
    }

    #[tokio::test]
    async fn test_disabled_throttle_always_allows() {
        let limiter = RateLimiter::new(ThrottleConfig {
            enabled: false,
            ..ThrottleConfig::default()
        });
        let client = ClientId::new();
        for _ in 0..100 {
            assert!(limiter.allow(&client, AccountAgeTier::New).await);
        }
    }

    #[tokio::test]
    async fn test_concurrent_allows_respect_cap() {
        let limiter = limiter(Duration::from_secs(3600));
        let client = ClientId::new();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                limiter.allow(&client, AccountAgeTier::Established).await
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 6);
    }
}
