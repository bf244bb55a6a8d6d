//! Account rows and operator-side wallet management.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use yijing_types::{UserId, WalletState};

use crate::{Database, format_timestamp, parse_optional_timestamp, parse_timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountPlan {
    Free,
    Subscriber,
}

impl AccountPlan {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Subscriber => "subscriber",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Self::Free),
            "subscriber" => Some(Self::Subscriber),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub id: UserId,
    pub display_name: Option<String>,
    pub plan: AccountPlan,
    pub wallet: WalletState,
    /// Readings completed with non-empty text.
    pub request_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct AccountRow {
    id: String,
    display_name: Option<String>,
    plan: String,
    gold: i64,
    silver: i64,
    subscription_until: Option<String>,
    request_count: i64,
    created_at: String,
    updated_at: String,
}

impl AccountRow {
    fn into_account(self) -> Result<Account> {
        let plan = AccountPlan::parse(&self.plan)
            .with_context(|| format!("Unknown plan {:?} for account {}", self.plan, self.id))?;
        Ok(Account {
            id: UserId::new(self.id).context("Empty account id in database")?,
            display_name: self.display_name,
            plan,
            wallet: WalletState {
                gold: u32::try_from(self.gold).context("gold balance out of range")?,
                silver: u32::try_from(self.silver).context("silver balance out of range")?,
                subscription_until: parse_optional_timestamp(self.subscription_until)?,
            },
            request_count: u64::try_from(self.request_count).unwrap_or(0),
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

impl Database {
    /// Create an empty free account. Fails if the id is taken.
    pub fn create_account(&self, user: &UserId, display_name: Option<&str>) -> Result<Account> {
        let now = format_timestamp(Utc::now());
        let conn = self.conn();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO users (id, display_name, plan, created_at, updated_at)
                 VALUES (?1, ?2, 'free', ?3, ?3)",
                params![user.as_str(), display_name, now],
            )
            .context("Failed to insert account")?;
        drop(conn);
        if inserted == 0 {
            bail!("Account {user} already exists");
        }
        tracing::info!(user_id = %user, "Created account");
        self.load_account(user)?
            .with_context(|| format!("Account {user} vanished after insert"))
    }

    pub fn load_account(&self, user: &UserId) -> Result<Option<Account>> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, display_name, plan, gold, silver, subscription_until,
                        request_count, created_at, updated_at
                 FROM users WHERE id = ?1",
                params![user.as_str()],
                |row| {
                    Ok(AccountRow {
                        id: row.get(0)?,
                        display_name: row.get(1)?,
                        plan: row.get(2)?,
                        gold: row.get(3)?,
                        silver: row.get(4)?,
                        subscription_until: row.get(5)?,
                        request_count: row.get(6)?,
                        created_at: row.get(7)?,
                        updated_at: row.get(8)?,
                    })
                },
            )
            .optional()
            .context("Failed to load account")?;
        row.map(AccountRow::into_account).transpose()
    }

    pub fn load_wallet(&self, user: &UserId) -> Result<Option<WalletState>> {
        Ok(self.load_account(user)?.map(|account| account.wallet))
    }

    /// Add gold and silver to an account. Returns the new wallet.
    /// Add to both balances, saturating each at `u32::MAX`.
    pub fn grant_credits(&self, user: &UserId, gold: u32, silver: u32) -> Result<WalletState> {
        let updated = self
            .conn()
            .execute(
                "UPDATE users
                 SET gold = MIN(gold + ?2, ?5), silver = MIN(silver + ?3, ?5), updated_at = ?4
                 WHERE id = ?1",
                params![
                    user.as_str(),
                    i64::from(gold),
                    i64::from(silver),
                    format_timestamp(Utc::now()),
                    i64::from(u32::MAX)
                ],
            )
            .context("Failed to grant credits")?;
        if updated == 0 {
            bail!("Account {user} not found");
        }
        tracing::info!(user_id = %user, gold, silver, "Granted credits");
        self.load_wallet(user)?
            .with_context(|| format!("Account {user} not found"))
    }

    /// Set (or clear, with `until = None`) the subscription window.
    pub fn set_subscription(
        &self,
        user: &UserId,
        plan: AccountPlan,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let updated = self
            .conn()
            .execute(
                "UPDATE users
                 SET plan = ?2, subscription_until = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![
                    user.as_str(),
                    plan.as_str(),
                    until.map(format_timestamp),
                    format_timestamp(Utc::now())
                ],
            )
            .context("Failed to update subscription")?;
        if updated == 0 {
            bail!("Account {user} not found");
        }
        tracing::info!(user_id = %user, plan = plan.as_str(), until = ?until, "Updated subscription");
        Ok(())
    }

    /// Bump the lifetime count of completed readings.
    pub fn record_completed_request(&self, user: &UserId) -> Result<()> {
        let updated = self
            .conn()
            .execute(
                "UPDATE users SET request_count = request_count + 1, updated_at = ?2 WHERE id = ?1",
                params![user.as_str(), format_timestamp(Utc::now())],
            )
            .context("Failed to record completed request")?;
        if updated == 0 {
            bail!("Account {user} not found");
        }
        Ok(())
    }
}
