//! The storage seams the orchestrator drives.
//!
//! All three are synchronous; the orchestrator runs them on the blocking
//! pool. [`Database`] implements every one of them.

use anyhow::Result;
use yijing_store::{Database, NewReading};
use yijing_types::{
    ConsumeOutcome, Consumption, HexagramCode, HexagramRecord, LineText, ReadingId, UserId,
};

pub trait WalletLedger: Send + Sync {
    /// Atomically take one unit of entitlement from `user`.
    fn try_consume(&self, user: &UserId) -> Result<ConsumeOutcome>;
    /// Give back exactly what `consumption` took. `false` when nothing is refundable.
    fn refund(&self, user: &UserId, consumption: &Consumption) -> Result<bool>;
    fn record_completed_request(&self, user: &UserId) -> Result<()>;
}

pub trait HexagramTexts: Send + Sync {
    fn lookup_hexagram(&self, code: &HexagramCode) -> Result<Option<HexagramRecord>>;
    fn lookup_line_texts(&self, hexagram_id: i64, positions: &[u8]) -> Result<Vec<LineText>>;
}

pub trait ReadingArchive: Send + Sync {
    fn record_reading(&self, reading: &NewReading) -> Result<ReadingId>;
}

impl WalletLedger for Database {
    fn try_consume(&self, user: &UserId) -> Result<ConsumeOutcome> {
        Database::try_consume(self, user)
    }

    fn refund(&self, user: &UserId, consumption: &Consumption) -> Result<bool> {
        Database::refund(self, user, consumption)
    }

    fn record_completed_request(&self, user: &UserId) -> Result<()> {
        Database::record_completed_request(self, user)
    }
}

impl HexagramTexts for Database {
    fn lookup_hexagram(&self, code: &HexagramCode) -> Result<Option<HexagramRecord>> {
        Database::lookup_hexagram(self, code)
    }

    fn lookup_line_texts(&self, hexagram_id: i64, positions: &[u8]) -> Result<Vec<LineText>> {
        Database::lookup_line_texts(self, hexagram_id, positions)
    }
}

impl ReadingArchive for Database {
    fn record_reading(&self, reading: &NewReading) -> Result<ReadingId> {
        Database::record_reading(self, reading)
    }
}
