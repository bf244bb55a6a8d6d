//! Try-consume / refund accounting.
//!
//! Every consumption takes exactly one of: a quota increment (subscribers),
//! a gold decrement, or a silver decrement. The whole read-decide-write runs
//! inside one `BEGIN IMMEDIATE` transaction. The ledger never deduplicates
//! refunds; callers refund at most once per consumption.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use yijing_types::{
    ConsumeOutcome, ConsumePlan, ConsumeRejection, Consumption, CreditTier, UserId, WalletState,
    daily_quota_limit, quota_day,
};

use crate::{Database, format_timestamp, parse_optional_timestamp};

impl Database {
    pub fn try_consume(&self, user: &UserId) -> Result<ConsumeOutcome> {
        self.try_consume_at(user, Utc::now())
    }

    /// [`Self::try_consume`] with an explicit clock.
    pub fn try_consume_at(&self, user: &UserId, now: DateTime<Utc>) -> Result<ConsumeOutcome> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to start consume transaction")?;

        let row: Option<(i64, i64, Option<String>)> = tx
            .query_row(
                "SELECT gold, silver, subscription_until FROM users WHERE id = ?1",
                params![user.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .context("Failed to read wallet")?;

        let Some((gold, silver, until)) = row else {
            tracing::info!(user_id = %user, "Consume rejected: no such account");
            return Ok(ConsumeOutcome::Rejected(ConsumeRejection::AccountNotFound));
        };
        let wallet = WalletState {
            gold: u32::try_from(gold).context("gold balance out of range")?,
            silver: u32::try_from(silver).context("silver balance out of range")?,
            subscription_until: parse_optional_timestamp(until)?,
        };

        let day = quota_day(now).to_string();
        let daily_limit = daily_quota_limit(self.settings.monthly_quota);
        let used_today = if wallet.is_subscribed(now) {
            tx.query_row(
                "SELECT used_count FROM usage_quotas WHERE user_id = ?1 AND usage_date = ?2",
                params![user.as_str(), day],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("Failed to read usage quota")?
            .map_or(0, |used| u32::try_from(used).unwrap_or(u32::MAX))
        } else {
            0
        };

        let outcome = match wallet.plan_consumption(now, used_today, daily_limit) {
            ConsumePlan::IncrementQuota => {
                tx.execute(
                    "INSERT INTO usage_quotas (user_id, usage_date, used_count)
                     VALUES (?1, ?2, 1)
                     ON CONFLICT(user_id, usage_date) DO UPDATE SET used_count = used_count + 1",
                    params![user.as_str(), day],
                )
                .context("Failed to increment usage quota")?;
                ConsumeOutcome::Charged(Consumption::Quota {
                    used_today: used_today + 1,
                    daily_limit,
                })
            }
            ConsumePlan::Spend(tier) => {
                let column = tier.column();
                let sql = format!(
                    "UPDATE users SET {column} = {column} - 1, updated_at = ?2
                     WHERE id = ?1 AND {column} > 0"
                );
                let updated = tx
                    .execute(&sql, params![user.as_str(), format_timestamp(now)])
                    .with_context(|| format!("Failed to spend {column}"))?;
                anyhow::ensure!(updated == 1, "{column} balance changed under lock");

                let prior_gold = wallet.gold;
                let prior_silver = wallet.silver;
                ConsumeOutcome::Charged(match tier {
                    CreditTier::Gold => Consumption::Gold {
                        prior_gold,
                        prior_silver,
                    },
                    CreditTier::Silver => Consumption::Silver {
                        prior_gold,
                        prior_silver,
                    },
                })
            }
            ConsumePlan::Reject(rejection) => ConsumeOutcome::Rejected(rejection),
        };

        tx.commit().context("Failed to commit consume transaction")?;

        match &outcome {
            ConsumeOutcome::Charged(consumption) => {
                tracing::info!(user_id = %user, kind = consumption.kind(), "Consumed credit");
            }
            ConsumeOutcome::Rejected(rejection) => {
                tracing::info!(user_id = %user, reason = rejection.as_str(), "Consume rejected");
            }
        }
        Ok(outcome)
    }

    /// Put back what `consumption` took. Quota consumption is never refunded
    /// and returns `false`.
    pub fn refund(&self, user: &UserId, consumption: &Consumption) -> Result<bool> {
        let Some(tier) = consumption.refund_tier() else {
            return Ok(false);
        };

        let column = tier.column();
        let sql = format!("UPDATE users SET {column} = {column} + 1, updated_at = ?2 WHERE id = ?1");
        let updated = self
            .conn()
            .execute(&sql, params![user.as_str(), format_timestamp(Utc::now())])
            .with_context(|| format!("Failed to refund {column}"))?;

        let refunded = updated == 1;
        if refunded {
            tracing::info!(user_id = %user, kind = consumption.kind(), "Refunded credit");
        } else {
            tracing::warn!(user_id = %user, kind = consumption.kind(), "Refund target account missing");
        }
        Ok(refunded)
    }

    /// Subscriber quota used on `day`.
    pub fn quota_used(&self, user: &UserId, day: NaiveDate) -> Result<u32> {
        let used = self
            .conn()
            .query_row(
                "SELECT used_count FROM usage_quotas WHERE user_id = ?1 AND usage_date = ?2",
                params![user.as_str(), day.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("Failed to read usage quota")?;
        Ok(used.map_or(0, |used| u32::try_from(used).unwrap_or(u32::MAX)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccountPlan, StoreSettings};
    use chrono::Duration;
    use std::sync::Arc;

    fn user() -> UserId {
        UserId::new("google:42").unwrap()
    }

    fn db_with(gold: u32, silver: u32) -> Database {
        let db = Database::open_in_memory(StoreSettings::default()).unwrap();
        db.create_account(&user(), None).unwrap();
        db.grant_credits(&user(), gold, silver).unwrap();
        db
    }

    fn charged(outcome: ConsumeOutcome) -> Consumption {
        match outcome {
            ConsumeOutcome::Charged(consumption) => consumption,
            ConsumeOutcome::Rejected(r) => panic!("expected a charge, got {r:?}"),
        }
    }

    #[test]
    fn silver_is_spent_until_empty() {
        let db = db_with(0, 2);

        assert!(matches!(
            charged(db.try_consume(&user()).unwrap()),
            Consumption::Silver {
                prior_gold: 0,
                prior_silver: 2
            }
        ));
        assert!(matches!(
            charged(db.try_consume(&user()).unwrap()),
            Consumption::Silver {
                prior_gold: 0,
                prior_silver: 1
            }
        ));
        assert_eq!(
            db.try_consume(&user()).unwrap(),
            ConsumeOutcome::Rejected(ConsumeRejection::NoCoins)
        );
        assert_eq!(db.load_wallet(&user()).unwrap().unwrap().silver, 0);
    }

    #[test]
    fn gold_goes_before_silver() {
        let db = db_with(1, 1);
        assert!(matches!(
            charged(db.try_consume(&user()).unwrap()),
            Consumption::Gold { .. }
        ));
        let wallet = db.load_wallet(&user()).unwrap().unwrap();
        assert_eq!((wallet.gold, wallet.silver), (0, 1));
    }

    #[test]
    fn refund_restores_exactly_one_gold() {
        let db = db_with(3, 0);
        let consumption = charged(db.try_consume(&user()).unwrap());
        assert_eq!(db.load_wallet(&user()).unwrap().unwrap().gold, 2);

        assert!(db.refund(&user(), &consumption).unwrap());
        let wallet = db.load_wallet(&user()).unwrap().unwrap();
        assert_eq!((wallet.gold, wallet.silver), (3, 0));
    }

    #[test]
    fn quota_refund_is_a_no_op() {
        let db = db_with(0, 0);
        db.set_subscription(
            &user(),
            AccountPlan::Subscriber,
            Some(Utc::now() + Duration::days(10)),
        )
        .unwrap();

        let consumption = charged(db.try_consume(&user()).unwrap());
        assert!(matches!(consumption, Consumption::Quota { used_today: 1, .. }));
        assert!(!db.refund(&user(), &consumption).unwrap());
        assert_eq!(db.quota_used(&user(), quota_day(Utc::now())).unwrap(), 1);
    }

    #[test]
    fn subscriber_quota_caps_at_a_thirtieth_of_monthly() {
        let settings = StoreSettings {
            monthly_quota: 90,
            ..StoreSettings::default()
        };
        let db = Database::open_in_memory(settings).unwrap();
        db.create_account(&user(), None).unwrap();
        db.grant_credits(&user(), 5, 5).unwrap();
        let now = Utc::now();
        db.set_subscription(
            &user(),
            AccountPlan::Subscriber,
            Some(now + Duration::days(1)),
        )
        .unwrap();

        for _ in 0..3 {
            assert!(matches!(
                charged(db.try_consume_at(&user(), now).unwrap()),
                Consumption::Quota { daily_limit: 3, .. }
            ));
        }
        assert_eq!(
            db.try_consume_at(&user(), now).unwrap(),
            ConsumeOutcome::Rejected(ConsumeRejection::DailyQuotaReached)
        );

        // Coins are untouched while subscribed.
        let wallet = db.load_wallet(&user()).unwrap().unwrap();
        assert_eq!((wallet.gold, wallet.silver), (5, 5));
    }

    #[test]
    fn quota_counter_resets_on_the_next_utc_day() {
        let db = db_with(0, 0);
        let now = Utc::now();
        db.set_subscription(
            &user(),
            AccountPlan::Subscriber,
            Some(now + Duration::days(5)),
        )
        .unwrap();

        let today = charged(db.try_consume_at(&user(), now).unwrap());
        let tomorrow = charged(db.try_consume_at(&user(), now + Duration::days(1)).unwrap());
        assert!(matches!(today, Consumption::Quota { used_today: 1, .. }));
        assert!(matches!(tomorrow, Consumption::Quota { used_today: 1, .. }));
    }

    #[test]
    fn unknown_account_is_rejected() {
        let db = Database::open_in_memory(StoreSettings::default()).unwrap();
        assert_eq!(
            db.try_consume(&user()).unwrap(),
            ConsumeOutcome::Rejected(ConsumeRejection::AccountNotFound)
        );
    }

    #[test]
    fn shared_handle_never_overdraws() {
        let db = Arc::new(db_with(0, 5));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || db.try_consume(&user()).unwrap())
            })
            .collect();

        let charged = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| matches!(o, ConsumeOutcome::Charged(_)))
            .count();
        assert_eq!(charged, 5);
        assert_eq!(db.load_wallet(&user()).unwrap().unwrap().silver, 0);
    }

    #[test]
    fn separate_connections_never_overdraw() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        {
            let db = Database::open(&path, StoreSettings::default()).unwrap();
            db.create_account(&user(), None).unwrap();
            db.grant_credits(&user(), 2, 3).unwrap();
        }

        let databases: Vec<Database> = (0..8)
            .map(|_| Database::open(&path, StoreSettings::default()).unwrap())
            .collect();
        let handles: Vec<_> = databases
            .into_iter()
            .map(|db| {
                std::thread::spawn(move || {
                    (0..2)
                        .map(|_| db.try_consume(&user()).unwrap())
                        .filter(|o| matches!(o, ConsumeOutcome::Charged(_)))
                        .count()
                })
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 5);

        let db = Database::open(&path, StoreSettings::default()).unwrap();
        let wallet = db.load_wallet(&user()).unwrap().unwrap();
        assert_eq!((wallet.gold, wallet.silver), (0, 0));
    }

    #[test]
    fn saturated_gold_is_spent_before_silver() {
        let db = db_with(u32::MAX, 1);
        db.grant_credits(&user(), 10, 0).unwrap();

        assert_eq!(
            charged(db.try_consume(&user()).unwrap()),
            Consumption::Gold {
                prior_gold: u32::MAX,
                prior_silver: 1
            }
        );
        let wallet = db.load_wallet(&user()).unwrap().unwrap();
        assert_eq!((wallet.gold, wallet.silver), (u32::MAX - 1, 1));
    }

    #[test]
    fn out_of_range_balance_is_an_error_not_an_empty_wallet() {
        let db = db_with(0, 1);
        db.conn()
            .execute(
                "UPDATE users SET gold = ?2 WHERE id = ?1",
                rusqlite::params![user().as_str(), i64::from(u32::MAX) + 1],
            )
            .unwrap();

        let err = db.try_consume(&user()).unwrap_err();
        assert!(format!("{err:#}").contains("gold balance out of range"), "{err:#}");
        let silver: i64 = db
            .conn()
            .query_row(
                "SELECT silver FROM users WHERE id = ?1",
                rusqlite::params![user().as_str()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(silver, 1);
    }
}
