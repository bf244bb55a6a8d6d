//! Wallet and quota accounting rules.
//!
//! The ledger has two credit tiers. An active subscription draws from a
//! per-day quota counter; otherwise one coin is spent, gold before silver.
//! [`WalletState::plan_consumption`] decides which branch applies; the
//! store applies it under a row lock and hands back a [`Consumption`] that
//! names exactly what was taken, so a refund can put back exactly that.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Daily allowance for subscribers: `monthly_quota / 30`, rounded down.
#[must_use]
pub const fn daily_quota_limit(monthly_quota: u32) -> u32 {
    monthly_quota / 30
}

/// The UTC calendar day a quota counter is keyed on.
#[must_use]
pub fn quota_day(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletState {
    pub gold: u32,
    pub silver: u32,
    pub subscription_until: Option<DateTime<Utc>>,
}

impl WalletState {
    #[must_use]
    pub fn is_subscribed(&self, now: DateTime<Utc>) -> bool {
        self.subscription_until.is_some_and(|until| until > now)
    }

    /// Decide what a single consumption would take. `used_today` is only
    /// consulted for subscribers.
    #[must_use]
    pub fn plan_consumption(
        &self,
        now: DateTime<Utc>,
        used_today: u32,
        daily_limit: u32,
    ) -> ConsumePlan {
        if self.is_subscribed(now) {
            if used_today >= daily_limit {
                return ConsumePlan::Reject(ConsumeRejection::DailyQuotaReached);
            }
            return ConsumePlan::IncrementQuota;
        }
        if self.gold > 0 {
            ConsumePlan::Spend(CreditTier::Gold)
        } else if self.silver > 0 {
            ConsumePlan::Spend(CreditTier::Silver)
        } else {
            ConsumePlan::Reject(ConsumeRejection::NoCoins)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditTier {
    Gold,
    Silver,
}

impl CreditTier {
    /// Column name in the `users` table.
    #[must_use]
    pub const fn column(self) -> &'static str {
        match self {
            Self::Gold => "gold",
            Self::Silver => "silver",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumePlan {
    IncrementQuota,
    Spend(CreditTier),
    Reject(ConsumeRejection),
}

/// What a successful consumption took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Consumption {
    /// Subscriber quota; never refunded.
    Quota { used_today: u32, daily_limit: u32 },
    Gold { prior_gold: u32, prior_silver: u32 },
    Silver { prior_gold: u32, prior_silver: u32 },
}

impl Consumption {
    /// The balance a refund would credit, if any.
    #[must_use]
    pub const fn refund_tier(&self) -> Option<CreditTier> {
        match self {
            Self::Quota { .. } => None,
            Self::Gold { .. } => Some(CreditTier::Gold),
            Self::Silver { .. } => Some(CreditTier::Silver),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Quota { .. } => "quota",
            Self::Gold { .. } => "gold",
            Self::Silver { .. } => "silver",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeRejection {
    DailyQuotaReached,
    NoCoins,
    AccountNotFound,
}

impl ConsumeRejection {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DailyQuotaReached => "daily_quota_reached",
            Self::NoCoins => "no_coins",
            Self::AccountNotFound => "account_not_found",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Charged(Consumption),
    Rejected(ConsumeRejection),
}
