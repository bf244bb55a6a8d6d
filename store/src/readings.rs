//! Reading archive.
//!
//! Subscribers' unpinned readings expire after the configured retention;
//! everyone else's readings have no expiry. Pinning clears the expiry,
//! unpinning restores it for subscribers.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use yijing_types::{HexagramCode, ReadingId, UserId};

use crate::{Database, format_timestamp, parse_optional_timestamp, parse_timestamp};

const SUMMARY_CHARS: usize = 220;

/// List-view summary: newlines flattened, cut at 220 characters with `…`.
#[must_use]
pub fn make_summary(text: &str) -> String {
    let flat = text.trim().replace(['\r', '\n'], " ");
    if flat.chars().count() <= SUMMARY_CHARS {
        flat
    } else {
        let mut cut: String = flat.chars().take(SUMMARY_CHARS).collect();
        cut.push('…');
        cut
    }
}

#[derive(Debug, Clone)]
pub struct NewReading {
    pub user: UserId,
    pub question: String,
    pub code: HexagramCode,
    pub changing_lines: Vec<u8>,
    pub content: String,
    pub derived_from: Option<ReadingId>,
}

/// A reading a client kept while offline, as it uploads it.
#[derive(Debug, Clone, Deserialize)]
pub struct OfflineReading {
    #[serde(default)]
    pub question: String,
    pub hexagram_code: String,
    #[serde(default)]
    pub changing_lines: Vec<u8>,
    pub result_text: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// An offline upload: either the `{"records": [...]}` envelope clients post
/// or a bare array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OfflineUpload {
    Envelope { records: Vec<OfflineReading> },
    Records(Vec<OfflineReading>),
}

impl OfflineUpload {
    #[must_use]
    pub fn into_records(self) -> Vec<OfflineReading> {
        match self {
            Self::Envelope { records } | Self::Records(records) => records,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadingSummary {
    pub id: ReadingId,
    pub question: String,
    pub hexagram_code: String,
    pub changing_lines: Vec<u8>,
    pub summary: String,
    pub derived_from: Option<ReadingId>,
    pub is_pinned: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadingDetail {
    #[serde(flatten)]
    pub summary: ReadingSummary,
    pub content: String,
}

const SUMMARY_COLUMNS: &str = "id, question, hexagram_code, changing_lines, summary, \
                               derived_from, is_pinned, expires_at, created_at";

struct SummaryRow {
    id: i64,
    question: String,
    hexagram_code: String,
    changing_lines: String,
    summary: String,
    derived_from: Option<i64>,
    is_pinned: bool,
    expires_at: Option<String>,
    created_at: String,
}

impl SummaryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            question: row.get(1)?,
            hexagram_code: row.get(2)?,
            changing_lines: row.get(3)?,
            summary: row.get(4)?,
            derived_from: row.get(5)?,
            is_pinned: row.get(6)?,
            expires_at: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_summary(self) -> Result<ReadingSummary> {
        let changing_lines = serde_json::from_str(&self.changing_lines).unwrap_or_else(|e| {
            tracing::warn!(reading_id = self.id, %e, "Unreadable changing_lines column");
            Vec::new()
        });
        Ok(ReadingSummary {
            id: ReadingId::new(self.id),
            question: self.question,
            hexagram_code: self.hexagram_code,
            changing_lines,
            summary: self.summary,
            derived_from: self.derived_from.map(ReadingId::new),
            is_pinned: self.is_pinned,
            expires_at: parse_optional_timestamp(self.expires_at)?,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

impl Database {
    fn is_subscriber_at(&self, user: &UserId, now: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .load_wallet(user)?
            .is_some_and(|wallet| wallet.is_subscribed(now)))
    }

    fn retention(&self) -> Duration {
        Duration::days(i64::from(self.settings.retention_days))
    }

    pub fn record_reading(&self, reading: &NewReading) -> Result<ReadingId> {
        self.record_reading_at(reading, Utc::now())
    }

    pub fn record_reading_at(&self, reading: &NewReading, now: DateTime<Utc>) -> Result<ReadingId> {
        let expires_at = self
            .is_subscriber_at(&reading.user, now)?
            .then(|| now + self.retention());
        let changing_lines =
            serde_json::to_string(&reading.changing_lines).context("Failed to encode lines")?;

        let conn = self.conn();
        conn.execute(
            "INSERT INTO readings (
                user_id, question, hexagram_code, changing_lines, content,
                summary, derived_from, is_pinned, expires_at, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)",
            params![
                reading.user.as_str(),
                reading.question,
                reading.code.as_str(),
                changing_lines,
                reading.content,
                make_summary(&reading.content),
                reading.derived_from.map(ReadingId::value),
                expires_at.map(format_timestamp),
                format_timestamp(now),
            ],
        )
        .context("Failed to insert reading")?;
        let id = ReadingId::new(conn.last_insert_rowid());
        tracing::info!(user_id = %reading.user, reading_id = %id, "Recorded reading");
        Ok(id)
    }

    /// Archive readings made offline. Records with a bad code, out-of-range
    /// line positions, or no text are skipped; the ids of the saved ones are
    /// returned in input order.
    pub fn import_readings(&self, user: &UserId, records: &[OfflineReading]) -> Result<Vec<ReadingId>> {
        if self.load_wallet(user)?.is_none() {
            bail!("Account {user} not found");
        }

        let now = Utc::now();
        let mut saved = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            let code = match HexagramCode::parse(&record.hexagram_code) {
                Ok(code) => code,
                Err(e) => {
                    tracing::warn!(user_id = %user, index, %e, "Skipping offline reading");
                    continue;
                }
            };
            if record.result_text.trim().is_empty() {
                tracing::warn!(user_id = %user, index, "Skipping offline reading without text");
                continue;
            }
            if let Some(line) = record.changing_lines.iter().find(|&&line| !(1..=6).contains(&line)) {
                tracing::warn!(user_id = %user, index, line, "Skipping offline reading with bad line position");
                continue;
            }

            let reading = NewReading {
                user: user.clone(),
                question: record.question.trim().to_string(),
                code,
                changing_lines: record.changing_lines.clone(),
                content: record.result_text.trim().to_string(),
                derived_from: None,
            };
            saved.push(self.record_reading_at(&reading, record.created_at.unwrap_or(now))?);
        }

        tracing::info!(
            user_id = %user,
            received = records.len(),
            saved = saved.len(),
            "Imported offline readings"
        );
        Ok(saved)
    }

    /// Pinned first, then newest first. Expired readings are hidden unless asked for.
    pub fn list_readings(
        &self,
        user: &UserId,
        limit: u32,
        offset: u32,
        include_expired: bool,
    ) -> Result<Vec<ReadingSummary>> {
        self.list_readings_at(user, limit, offset, include_expired, Utc::now())
    }

    pub fn list_readings_at(
        &self,
        user: &UserId,
        limit: u32,
        offset: u32,
        include_expired: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReadingSummary>> {
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM readings
             WHERE user_id = ?1
               AND (?2 OR is_pinned = 1 OR expires_at IS NULL OR expires_at >= ?3)
             ORDER BY is_pinned DESC, created_at DESC, id DESC
             LIMIT ?4 OFFSET ?5"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql).context("Failed to prepare history query")?;
        let rows = stmt
            .query_map(
                params![
                    user.as_str(),
                    include_expired,
                    format_timestamp(now),
                    i64::from(limit),
                    i64::from(offset)
                ],
                SummaryRow::from_row,
            )
            .context("Failed to query history")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read history row")?;
        rows.into_iter().map(SummaryRow::into_summary).collect()
    }

    /// Full reading, only if it belongs to `user`.
    pub fn reading_detail(&self, user: &UserId, id: ReadingId) -> Result<Option<ReadingDetail>> {
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS}, content FROM readings WHERE id = ?1 AND user_id = ?2"
        );
        let row = self
            .conn()
            .query_row(&sql, params![id.value(), user.as_str()], |row| {
                Ok((SummaryRow::from_row(row)?, row.get::<_, String>(9)?))
            })
            .optional()
            .context("Failed to load reading")?;

        row.map(|(summary, content)| {
            Ok(ReadingDetail {
                summary: summary.into_summary()?,
                content,
            })
        })
        .transpose()
    }

    /// Returns `false` when no such reading belongs to `user`.
    pub fn set_pin(&self, user: &UserId, id: ReadingId, pin: bool) -> Result<bool> {
        self.set_pin_at(user, id, pin, Utc::now())
    }

    pub fn set_pin_at(
        &self,
        user: &UserId,
        id: ReadingId,
        pin: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let expires_at = if pin {
            None
        } else {
            self.is_subscriber_at(user, now)?
                .then(|| now + self.retention())
        };
        let updated = self
            .conn()
            .execute(
                "UPDATE readings SET is_pinned = ?3, expires_at = ?4
                 WHERE id = ?1 AND user_id = ?2",
                params![id.value(), user.as_str(), pin, expires_at.map(format_timestamp)],
            )
            .context("Failed to update pin")?;
        Ok(updated == 1)
    }

    pub fn delete_reading(&self, user: &UserId, id: ReadingId) -> Result<bool> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM readings WHERE id = ?1 AND user_id = ?2",
                params![id.value(), user.as_str()],
            )
            .context("Failed to delete reading")?;
        Ok(deleted == 1)
    }

    /// Delete unpinned readings whose expiry has passed. Returns how many went.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let purged = self
            .conn()
            .execute(
                "DELETE FROM readings
                 WHERE is_pinned = 0 AND expires_at IS NOT NULL AND expires_at < ?1",
                params![format_timestamp(now)],
            )
            .context("Failed to purge expired readings")?;
        if purged > 0 {
            tracing::info!(purged, "Purged expired readings");
        }
        Ok(purged)
    }
}
