use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;
use thiserror::Error;

pub const DAYS: [&str; 6] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

pub const BREAK_CELL: &str = "BREAK";

#[derive(Debug, Error, PartialEq)]
pub enum TimetableError {
    #[error("invalid periods: {0}")]
    InvalidPeriods(String),
    #[error("invalid cell at {day}/{period}: {reason}")]
    InvalidCell {
        day: String,
        period: String,
        reason: String,
    },
    #[error("unknown day: {0}")]
    UnknownDay(String),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    Class,
    Break,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: PeriodKind,
}

fn default_kind() -> PeriodKind {
    PeriodKind::Class
}

impl Period {
    fn class(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: PeriodKind::Class,
        }
    }

    pub fn is_break(&self) -> bool {
        self.kind == PeriodKind::Break
    }
}

/// Cell shapes found in stored documents. Older documents hold bare strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StoredCell {
    Legacy(String),
    Structured {
        #[serde(default)]
        subject: Option<String>,
        #[serde(default)]
        span: Option<i64>,
        #[serde(default)]
        conflict: Option<bool>,
    },
}

/// Normalised cell. `span` is always >= 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cell {
    pub subject: String,
    pub span: u32,
    #[serde(skip_serializing_if = "is_false")]
    pub conflict: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl Cell {
    pub fn text(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            span: 1,
            conflict: false,
        }
    }
}

impl From<StoredCell> for Cell {
    fn from(raw: StoredCell) -> Self {
        match raw {
            StoredCell::Legacy(s) => Cell::text(s),
            StoredCell::Structured {
                subject,
                span,
                conflict,
            } => Cell {
                subject: subject.unwrap_or_default(),
                span: span.filter(|s| *s >= 1).map(|s| s.min(u32::MAX as i64) as u32).unwrap_or(1),
                conflict: conflict.unwrap_or(false),
            },
        }
    }
}

/// day -> period id -> cell
pub type Schedule = BTreeMap<String, BTreeMap<String, Cell>>;

pub fn canonical_day(raw: &str) -> Option<&'static str> {
    let t = raw.trim();
    DAYS.iter().copied().find(|d| d.eq_ignore_ascii_case(t))
}

pub fn default_periods() -> Vec<Period> {
    let mut out = vec![
        Period::class("p1", "1"),
        Period::class("p2", "2"),
        Period::class("p3", "3"),
        Period {
            id: "break1".to_string(),
            name: "Lunch".to_string(),
            kind: PeriodKind::Break,
        },
    ];
    for n in 4..=8 {
        out.push(Period::class(format!("p{}", n), n.to_string()));
    }
    out
}

/// Periods for a generated grid: `per_day` class periods with one lunch break
/// after `lunch_after` of them (no break when 0 or past the end).
pub fn build_periods(per_day: usize, lunch_after: usize) -> Vec<Period> {
    let mut out = Vec::with_capacity(per_day + 1);
    for n in 1..=per_day {
        out.push(Period::class(format!("p{}", n), n.to_string()));
        if n == lunch_after && n < per_day {
            out.push(Period {
                id: "break1".to_string(),
                name: "Lunch".to_string(),
                kind: PeriodKind::Break,
            });
        }
    }
    out
}

pub fn validate_periods(periods: &[Period]) -> Result<(), TimetableError> {
    if periods.is_empty() {
        return Err(TimetableError::InvalidPeriods(
            "at least one period is required".into(),
        ));
    }
    let mut seen = HashSet::new();
    for p in periods {
        if p.id.trim().is_empty() {
            return Err(TimetableError::InvalidPeriods("period id must not be empty".into()));
        }
        if !seen.insert(p.id.as_str()) {
            return Err(TimetableError::InvalidPeriods(format!(
                "duplicate period id: {}",
                p.id
            )));
        }
    }
    Ok(())
}

pub fn periods_from_value(v: Option<&Value>) -> Result<Vec<Period>, TimetableError> {
    match v {
        None | Some(Value::Null) => Ok(default_periods()),
        Some(raw) => {
            let periods: Vec<Period> = serde_json::from_value(raw.clone())
                .map_err(|e| TimetableError::InvalidPeriods(e.to_string()))?;
            validate_periods(&periods)?;
            Ok(periods)
        }
    }
}

/// Strict parse used on writes: unknown days and malformed cells are rejected.
pub fn schedule_from_value(v: Option<&Value>) -> Result<Schedule, TimetableError> {
    let mut out = Schedule::new();
    let obj = match v {
        None | Some(Value::Null) => return Ok(out),
        Some(Value::Object(o)) => o,
        Some(_) => {
            return Err(TimetableError::InvalidSchedule(
                "schedule must be an object".into(),
            ))
        }
    };
    for (day_raw, row) in obj {
        let day = canonical_day(day_raw).ok_or_else(|| TimetableError::UnknownDay(day_raw.clone()))?;
        let Some(row) = row.as_object() else {
            return Err(TimetableError::InvalidSchedule(format!(
                "{} must map period ids to cells",
                day_raw
            )));
        };
        let day_map = out.entry(day.to_string()).or_default();
        for (period_id, cell) in row {
            if cell.is_null() {
                continue;
            }
            let stored: StoredCell =
                serde_json::from_value(cell.clone()).map_err(|e| TimetableError::InvalidCell {
                    day: day.to_string(),
                    period: period_id.clone(),
                    reason: e.to_string(),
                })?;
            if let StoredCell::Structured { span: Some(s), .. } = &stored {
                if *s < 1 {
                    return Err(TimetableError::InvalidCell {
                        day: day.to_string(),
                        period: period_id.clone(),
                        reason: "span must be >= 1".into(),
                    });
                }
            }
            day_map.insert(period_id.clone(), Cell::from(stored));
        }
    }
    Ok(out)
}

/// Lenient parse used on reads of stored documents: bad cells are dropped.
pub fn schedule_from_stored(v: &Value) -> Schedule {
    let mut out = Schedule::new();
    let Some(obj) = v.as_object() else {
        return out;
    };
    for (day_raw, row) in obj {
        let day = canonical_day(day_raw)
            .map(|d| d.to_string())
            .unwrap_or_else(|| day_raw.clone());
        let Some(row) = row.as_object() else {
            continue;
        };
        let day_map = out.entry(day).or_default();
        for (period_id, cell) in row {
            match serde_json::from_value::<StoredCell>(cell.clone()) {
                Ok(stored) => {
                    day_map.insert(period_id.clone(), Cell::from(stored));
                }
                Err(_) => {
                    tracing::debug!(period = %period_id, "dropping unreadable stored cell");
                }
            }
        }
    }
    out
}

/// Period ids hidden behind a preceding cell's span on one day.
pub fn covered_period_ids(periods: &[Period], row: &BTreeMap<String, Cell>) -> HashSet<String> {
    let mut covered = HashSet::new();
    let mut i = 0;
    while i < periods.len() {
        let span = row.get(&periods[i].id).map(|c| c.span as usize).unwrap_or(1);
        for p in periods.iter().skip(i + 1).take(span.saturating_sub(1)) {
            covered.insert(p.id.clone());
        }
        i += span.max(1);
    }
    covered
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub period_id: String,
    pub period_name: String,
    pub is_break: bool,
    pub subject: Option<String>,
    pub span: u32,
}

/// Visible slots of one day in period order; covered periods are omitted and
/// a span running past the last period is clamped.
pub fn visible_slots(periods: &[Period], row: &BTreeMap<String, Cell>) -> Vec<Slot> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < periods.len() {
        let p = &periods[i];
        let cell = row.get(&p.id);
        let remaining = (periods.len() - i) as u32;
        let span = cell.map(|c| c.span).unwrap_or(1).clamp(1, remaining);
        out.push(Slot {
            period_id: p.id.clone(),
            period_name: p.name.clone(),
            is_break: p.is_break(),
            subject: cell.map(|c| c.subject.clone()),
            span,
        });
        i += span as usize;
    }
    out
}

fn annotation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(([^()]*)\)").expect("static annotation regex"))
}

/// Every parenthesised name in a cell, trimmed, empties skipped.
pub fn annotated_names(text: &str) -> Vec<String> {
    annotation_re()
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Display text for a subject/teacher pair.
pub fn cell_text(subject: &str, teacher: Option<&str>) -> String {
    match teacher.map(str::trim).filter(|t| !t.is_empty()) {
        Some(t) => format!("{} ({})", subject.trim(), t),
        None => subject.trim().to_string(),
    }
}
