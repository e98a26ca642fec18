//! Client account profiles and age tiers
//!
//! A client is one chat account operated by this system. Its age tier
//! controls the hourly action budget the throttle grants it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ClientId;

/// Account-age bucket controlling the hourly action quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountAgeTier {
    /// Registered within the last week
    New,
    /// Past the first week, still under a month
    Warming,
    /// A month or older
    Established,
}

impl AccountAgeTier {
    /// Derive the tier from an account's age.
    pub fn for_age(age: Duration) -> Self {
        if age < Duration::days(7) {
            Self::New
        } else if age < Duration::days(30) {
            Self::Warming
        } else {
            Self::Established
        }
    }
}

/// One chat account operated by this system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientProfile {
    pub id: ClientId,
    /// Platform handle the account presents to counterparties
    pub handle: String,
    pub registered_at: DateTime<Utc>,
}

impl ClientProfile {
    pub fn new(handle: impl Into<String>, registered_at: DateTime<Utc>) -> Self {
        Self {
            id: ClientId::new(),
            handle: handle.into(),
            registered_at,
        }
    }

    /// The tier this account currently falls in.
    pub fn age_tier(&self, now: DateTime<Utc>) -> AccountAgeTier {
        AccountAgeTier::for_age(now - self.registered_at)
    }
}
