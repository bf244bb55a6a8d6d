//! Hexagram resolution.
//!
//! Six throws, entered bottom line first, become a hexagram figure:
//!
//! - the binary `code` is built top line first (throws reversed), so the
//!   first throw lands as the last character
//! - the upper trigram is the first three characters, the lower trigram the last three
//! - changing positions are 1-based indices into the *unreversed* throws
//!
//! Everything here is pure. Looking up the canonical name, judgment and line
//! texts is the job of a text store; [`HexagramContext`] bundles the figure
//! with whatever that store returned.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of lines (and throws) in a hexagram.
pub const LINE_COUNT: usize = 6;

// ============================================================================
// Throws
// ============================================================================

/// One thrown line value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Throw {
    /// 6: yin, changing.
    OldYin,
    /// 7: yang, stable.
    YoungYang,
    /// 8: yin, stable.
    YoungYin,
    /// 9: yang, changing.
    OldYang,
}

impl Throw {
    #[must_use]
    pub const fn from_value(value: u8) -> Option<Self> {
        match value {
            6 => Some(Self::OldYin),
            7 => Some(Self::YoungYang),
            8 => Some(Self::YoungYin),
            9 => Some(Self::OldYang),
            _ => None,
        }
    }

    #[must_use]
    pub const fn value(self) -> u8 {
        match self {
            Self::OldYin => 6,
            Self::YoungYang => 7,
            Self::YoungYin => 8,
            Self::OldYang => 9,
        }
    }

    #[must_use]
    pub const fn is_yang(self) -> bool {
        matches!(self, Self::YoungYang | Self::OldYang)
    }

    #[must_use]
    pub const fn is_changing(self) -> bool {
        matches!(self, Self::OldYin | Self::OldYang)
    }

    const fn bit(self) -> u8 {
        if self.is_yang() { b'1' } else { b'0' }
    }
}

impl TryFrom<u8> for Throw {
    type Error = ThrowError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_value(value).ok_or(ThrowError::InvalidValue {
            position: 0,
            value: i64::from(value),
        })
    }
}

impl From<Throw> for u8 {
    fn from(value: Throw) -> Self {
        value.value()
    }
}

impl fmt::Display for Throw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThrowError {
    #[error("expected exactly {LINE_COUNT} throws, got {0}")]
    WrongCount(usize),
    /// `position` is 1-based; 0 means the value was checked outside a sequence.
    #[error("throw {position} has value {value}; expected 6, 7, 8 or 9")]
    InvalidValue { position: usize, value: i64 },
}

/// Validate raw throw values as received from a caller.
pub fn parse_throws(values: &[i64]) -> Result<[Throw; LINE_COUNT], ThrowError> {
    if values.len() != LINE_COUNT {
        return Err(ThrowError::WrongCount(values.len()));
    }

    let mut throws = [Throw::YoungYin; LINE_COUNT];
    for (idx, &value) in values.iter().enumerate() {
        throws[idx] = u8::try_from(value)
            .ok()
            .and_then(Throw::from_value)
            .ok_or(ThrowError::InvalidValue {
                position: idx + 1,
                value,
            })?;
    }
    Ok(throws)
}

// ============================================================================
// Trigrams
// ============================================================================

/// The eight trigrams, named by their lines read top to bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Trigram {
    Qian,
    Xun,
    Li,
    Gen,
    Dui,
    Kan,
    Zhen,
    Kun,
}

impl Trigram {
    /// Every yin/yang combination maps to exactly one trigram.
    #[must_use]
    pub const fn from_lines(top: bool, middle: bool, bottom: bool) -> Self {
        match (top, middle, bottom) {
            (true, true, true) => Self::Qian,
            (true, true, false) => Self::Xun,
            (true, false, true) => Self::Li,
            (true, false, false) => Self::Gen,
            (false, true, true) => Self::Dui,
            (false, true, false) => Self::Kan,
            (false, false, true) => Self::Zhen,
            (false, false, false) => Self::Kun,
        }
    }

    /// Top-down bit pattern, e.g. `"110"` for Xun.
    #[must_use]
    pub const fn bits(self) -> &'static str {
        match self {
            Self::Qian => "111",
            Self::Xun => "110",
            Self::Li => "101",
            Self::Gen => "100",
            Self::Dui => "011",
            Self::Kan => "010",
            Self::Zhen => "001",
            Self::Kun => "000",
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Qian => "乾",
            Self::Xun => "巽",
            Self::Li => "離",
            Self::Gen => "艮",
            Self::Dui => "兌",
            Self::Kan => "坎",
            Self::Zhen => "震",
            Self::Kun => "坤",
        }
    }

    #[must_use]
    pub const fn element(self) -> &'static str {
        match self {
            Self::Qian => "天",
            Self::Xun => "風",
            Self::Li => "火",
            Self::Gen => "山",
            Self::Dui => "澤",
            Self::Kan => "水",
            Self::Zhen => "雷",
            Self::Kun => "地",
        }
    }
}

impl fmt::Display for Trigram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}) bits={}", self.name(), self.element(), self.bits())
    }
}

// ============================================================================
// Hexagram code
// ============================================================================

/// Six-character binary code, most significant character = top line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HexagramCode(String);

#[derive(Debug, Error)]
#[error("hexagram code must be six '0'/'1' characters (got {0:?})")]
pub struct HexagramCodeError(String);

impl HexagramCode {
    pub fn parse(raw: &str) -> Result<Self, HexagramCodeError> {
        let trimmed = raw.trim();
        if trimmed.len() == LINE_COUNT && trimmed.bytes().all(|b| b == b'0' || b == b'1') {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(HexagramCodeError(raw.to_string()))
        }
    }

    fn from_throws(throws: &[Throw; LINE_COUNT]) -> Self {
        Self(throws.iter().rev().map(|throw| char::from(throw.bit())).collect())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lines from top to bottom, `true` for yang.
    #[must_use]
    pub fn lines_top_down(&self) -> [bool; LINE_COUNT] {
        let mut lines = [false; LINE_COUNT];
        for (line, byte) in lines.iter_mut().zip(self.0.bytes()) {
            *line = byte == b'1';
        }
        lines
    }

    #[must_use]
    pub fn upper_trigram(&self) -> Trigram {
        let [a, b, c, _, _, _] = self.lines_top_down();
        Trigram::from_lines(a, b, c)
    }

    #[must_use]
    pub fn lower_trigram(&self) -> Trigram {
        let [_, _, _, d, e, f] = self.lines_top_down();
        Trigram::from_lines(d, e, f)
    }
}

impl TryFrom<String> for HexagramCode {
    type Error = HexagramCodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<HexagramCode> for String {
    fn from(value: HexagramCode) -> Self {
        value.0
    }
}

impl fmt::Display for HexagramCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Figure
// ============================================================================

/// The pure, lookup-free part of a reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexagramFigure {
    throws: [Throw; LINE_COUNT],
    code: HexagramCode,
    upper: Trigram,
    lower: Trigram,
    changing_positions: Vec<u8>,
}

impl HexagramFigure {
    #[must_use]
    pub fn resolve(throws: [Throw; LINE_COUNT]) -> Self {
        let code = HexagramCode::from_throws(&throws);
        let upper = code.upper_trigram();
        let lower = code.lower_trigram();
        let changing_positions = throws
            .iter()
            .enumerate()
            .filter(|(_, throw)| throw.is_changing())
            .map(|(idx, _)| (idx + 1) as u8)
            .collect();

        Self {
            throws,
            code,
            upper,
            lower,
            changing_positions,
        }
    }

    pub fn resolve_values(values: &[i64]) -> Result<Self, ThrowError> {
        parse_throws(values).map(Self::resolve)
    }

    /// Throws in entry order (bottom line first).
    #[must_use]
    pub fn throws(&self) -> &[Throw; LINE_COUNT] {
        &self.throws
    }

    #[must_use]
    pub fn code(&self) -> &HexagramCode {
        &self.code
    }

    #[must_use]
    pub fn upper_trigram(&self) -> Trigram {
        self.upper
    }

    #[must_use]
    pub fn lower_trigram(&self) -> Trigram {
        self.lower
    }

    /// 1-based, bottom = 1.
    #[must_use]
    pub fn changing_positions(&self) -> &[u8] {
        &self.changing_positions
    }

    /// Traditional names of the changing lines, in position order.
    #[must_use]
    pub fn changing_line_labels(&self) -> Vec<String> {
        self.changing_positions
            .iter()
            .map(|&pos| line_label(pos, self.throws[usize::from(pos) - 1]))
            .collect()
    }

    /// 陽/陰 for each line, top line first.
    #[must_use]
    pub fn top_down_polarity(&self) -> [&'static str; LINE_COUNT] {
        self.code
            .lines_top_down()
            .map(|yang| if yang { "陽" } else { "陰" })
    }
}

/// Traditional line name: 初九, 六二, 九三, 六四, 九五, 上六, ...
#[must_use]
pub fn line_label(position: u8, throw: Throw) -> String {
    let yao = if throw.is_yang() { "九" } else { "六" };
    match position {
        1 => format!("初{yao}"),
        6 => format!("上{yao}"),
        2 => format!("{yao}二"),
        3 => format!("{yao}三"),
        4 => format!("{yao}四"),
        5 => format!("{yao}五"),
        other => format!("line-{other}"),
    }
}

// ============================================================================
// Reference text
// ============================================================================

/// Canonical hexagram text as stored in the reference database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HexagramRecord {
    pub id: i64,
    pub name: String,
    pub judgment: String,
}

/// Canonical text for one line of a hexagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineText {
    pub position_num: u8,
    /// Stored line name, e.g. "初九".
    pub position: String,
    pub text: String,
}

/// A resolved figure together with its looked-up reference text.
#[derive(Debug, Clone)]
pub struct HexagramContext {
    figure: HexagramFigure,
    record: HexagramRecord,
    line_texts: Vec<LineText>,
}

impl HexagramContext {
    #[must_use]
    pub fn new(figure: HexagramFigure, record: HexagramRecord, line_texts: Vec<LineText>) -> Self {
        Self {
            figure,
            record,
            line_texts,
        }
    }

    #[must_use]
    pub fn figure(&self) -> &HexagramFigure {
        &self.figure
    }

    #[must_use]
    pub fn code(&self) -> &HexagramCode {
        self.figure.code()
    }

    #[must_use]
    pub fn hexagram_id(&self) -> i64 {
        self.record.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.record.name
    }

    #[must_use]
    pub fn judgment(&self) -> &str {
        &self.record.judgment
    }

    #[must_use]
    pub fn changing_positions(&self) -> &[u8] {
        self.figure.changing_positions()
    }

    #[must_use]
    pub fn line_texts(&self) -> &[LineText] {
        &self.line_texts
    }

    /// First whitespace-separated token of the stored name, e.g. "乾" from "乾 乾為天".
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.record
            .name
            .split_whitespace()
            .next()
            .unwrap_or(self.record.name.as_str())
    }

    /// Remainder of the stored name after the display name.
    #[must_use]
    pub fn trigram_title(&self) -> String {
        self.record
            .name
            .split_whitespace()
            .skip(1)
            .collect::<Vec<_>>()
            .join(" ")
    }
}
