//! Reference texts: the 64 hexagrams and their line statements.

use anyhow::{Context, Result, bail};
use rusqlite::{OptionalExtension, params, params_from_iter};
use serde::{Deserialize, Serialize};
use yijing_types::{HexagramCode, HexagramRecord, LINE_COUNT, LineText};

use crate::Database;

/// Import file layout (JSON).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextsFile {
    pub hexagrams: Vec<HexagramEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HexagramEntry {
    pub id: i64,
    pub name: String,
    pub binary_code: HexagramCode,
    pub judgment: String,
    #[serde(default)]
    pub lines: Vec<LineEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntry {
    /// Traditional line name, e.g. "九三".
    pub position: String,
    pub position_num: u8,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub hexagrams: usize,
    pub lines: usize,
}

impl TextsFile {
    fn validate(&self) -> Result<()> {
        for entry in &self.hexagrams {
            for line in &entry.lines {
                if line.position_num == 0 || usize::from(line.position_num) > LINE_COUNT {
                    bail!(
                        "Hexagram {} line {:?} has position_num {}; expected 1..={LINE_COUNT}",
                        entry.id,
                        line.position,
                        line.position_num
                    );
                }
            }
        }
        Ok(())
    }
}

impl Database {
    pub fn lookup_hexagram(&self, code: &HexagramCode) -> Result<Option<HexagramRecord>> {
        self.conn()
            .query_row(
                "SELECT id, name, judgment FROM hexagrams WHERE binary_code = ?1",
                params![code.as_str()],
                |row| {
                    Ok(HexagramRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        judgment: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("Failed to look up hexagram")
    }

    /// Line texts for the given positions, ordered by position. Missing rows are skipped.
    pub fn lookup_line_texts(&self, hexagram_id: i64, positions: &[u8]) -> Result<Vec<LineText>> {
        if positions.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; positions.len()].join(", ");
        let sql = format!(
            "SELECT position_num, position, text FROM lines
             WHERE hexagram_id = ? AND position_num IN ({placeholders})
             ORDER BY position_num"
        );

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql).context("Failed to prepare line query")?;
        let args = std::iter::once(hexagram_id).chain(positions.iter().map(|&p| i64::from(p)));
        let lines = stmt
            .query_map(params_from_iter(args), |row| {
                Ok(LineText {
                    position_num: row.get(0)?,
                    position: row.get(1)?,
                    text: row.get(2)?,
                })
            })
            .context("Failed to query line texts")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read line text row")?;
        Ok(lines)
    }

    /// Upsert every hexagram and line in one transaction.
    pub fn import_texts(&self, file: &TextsFile) -> Result<ImportReport> {
        file.validate()?;

        let mut conn = self.conn();
        let tx = conn.transaction().context("Failed to begin import")?;
        let mut report = ImportReport::default();
        for entry in &file.hexagrams {
            tx.execute(
                "INSERT INTO hexagrams (id, name, binary_code, judgment)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    binary_code = excluded.binary_code,
                    judgment = excluded.judgment",
                params![entry.id, entry.name, entry.binary_code.as_str(), entry.judgment],
            )
            .with_context(|| format!("Failed to import hexagram {}", entry.id))?;
            report.hexagrams += 1;

            for line in &entry.lines {
                tx.execute(
                    "INSERT INTO lines (hexagram_id, position, position_num, text)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(hexagram_id, position_num) DO UPDATE SET
                        position = excluded.position,
                        text = excluded.text",
                    params![entry.id, line.position, line.position_num, line.text],
                )
                .with_context(|| {
                    format!(
                        "Failed to import line {} of hexagram {}",
                        line.position_num, entry.id
                    )
                })?;
                report.lines += 1;
            }
        }
        tx.commit().context("Failed to commit import")?;

        tracing::info!(
            hexagrams = report.hexagrams,
            lines = report.lines,
            "Imported reference texts"
        );
        Ok(report)
    }
}
