//! Timetable drafts produced by a text model. The model is asked for JSON but
//! nothing enforces it, so the payload is cut out of whatever surrounds it.

use crate::schedule::{
    canonical_day, cell_text, periods_from_value, schedule_from_value, validate_periods, Cell, Period, PeriodKind,
    Schedule, TimetableError, BREAK_CELL, DAYS,
};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DraftError {
    #[error("no JSON payload found in draft text")]
    NoPayload,
    #[error("draft is not valid JSON: {0}")]
    Json(String),
    #[error("unrecognised draft shape: {0}")]
    Shape(String),
    #[error(transparent)]
    Timetable(#[from] TimetableError),
}

/// Parses the span from the first `[` or `{` to the last `]` or `}`.
pub fn extract_json(text: &str) -> Result<Value, DraftError> {
    let start = text.find(['[', '{']);
    let end = text.rfind([']', '}']);
    let payload = match (start, end) {
        (Some(s), Some(e)) if e > s => &text[s..=e],
        _ => return Err(DraftError::NoPayload),
    };
    serde_json::from_str(payload).map_err(|e| DraftError::Json(e.to_string()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub periods: Vec<Period>,
    pub schedule: Schedule,
}

/// Accepts the stored shape (`{periods, schedule}`), a day-keyed object of
/// slot arrays, or an array of `{day, slots}` rows.
pub fn normalize(value: &Value) -> Result<Draft, DraftError> {
    match value {
        Value::Object(obj) if obj.contains_key("schedule") => {
            let periods = periods_from_value(obj.get("periods"))?;
            let schedule = schedule_from_value(obj.get("schedule"))?;
            Ok(Draft { periods, schedule })
        }
        Value::Object(obj) if obj.contains_key("timetable") => normalize(&obj["timetable"]),
        Value::Object(obj) => day_rows(obj.iter().map(|(k, v)| (k.as_str(), v))),
        Value::Array(items) => {
            let mut rows = Map::new();
            for item in items {
                let day = item.get("day").and_then(Value::as_str).ok_or_else(|| {
                    DraftError::Shape("array entries need a \"day\" field".into())
                })?;
                let slots = item
                    .get("slots")
                    .or_else(|| item.get("periods"))
                    .cloned()
                    .unwrap_or(Value::Array(Vec::new()));
                rows.insert(day.to_string(), slots);
            }
            day_rows(rows.iter().map(|(k, v)| (k.as_str(), v)))
        }
        other => Err(DraftError::Shape(format!("expected object or array, got {}", other))),
    }
}

struct Slot {
    subject: String,
    teacher: Option<String>,
    span: u32,
}

fn read_slot(v: &Value) -> Option<Slot> {
    match v {
        Value::String(s) => Some(Slot {
            subject: s.trim().to_string(),
            teacher: None,
            span: 1,
        }),
        Value::Object(o) => {
            let subject = o.get("subject").and_then(Value::as_str)?.trim().to_string();
            let teacher = o
                .get("teacher")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|t| !t.is_empty() && *t != "-")
                .map(str::to_string);
            let span = o
                .get("span")
                .and_then(Value::as_u64)
                .map(|s| s.clamp(1, u32::MAX as u64) as u32)
                .unwrap_or(1);
            Some(Slot { subject, teacher, span })
        }
        _ => None,
    }
}

fn is_break_slot(v: &Value) -> bool {
    let flagged = v
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| t.eq_ignore_ascii_case("break"));
    flagged || read_slot(v).is_some_and(|s| s.subject.eq_ignore_ascii_case(BREAK_CELL))
}

fn day_rows<'a, I>(rows: I) -> Result<Draft, DraftError>
where
    I: Iterator<Item = (&'a str, &'a Value)>,
{
    let mut days: Vec<(&'static str, &'a Vec<Value>)> = Vec::new();
    for (raw, slots) in rows {
        let day = canonical_day(raw).ok_or_else(|| TimetableError::UnknownDay(raw.to_string()))?;
        let slots = slots
            .as_array()
            .ok_or_else(|| DraftError::Shape(format!("{} must be an array of slots", raw)))?;
        days.push((day, slots));
    }
    days.sort_by_key(|(d, _)| DAYS.iter().position(|x| x == d));

    let width = days.iter().map(|(_, s)| s.len()).max().unwrap_or(0);
    let mut periods = Vec::with_capacity(width);
    let (mut classes, mut breaks) = (0, 0);
    for i in 0..width {
        let is_break = days.iter().any(|(_, s)| s.get(i).is_some_and(is_break_slot));
        periods.push(if is_break {
            breaks += 1;
            Period {
                id: format!("break{}", breaks),
                name: if breaks == 1 { "Lunch".into() } else { format!("Break {}", breaks) },
                kind: PeriodKind::Break,
            }
        } else {
            classes += 1;
            Period {
                id: format!("p{}", classes),
                name: classes.to_string(),
                kind: PeriodKind::Class,
            }
        });
    }
    validate_periods(&periods)?;

    let mut schedule = Schedule::new();
    for (day, slots) in days {
        let row = schedule.entry(day.to_string()).or_default();
        for (period, raw) in periods.iter().zip(slots) {
            if period.is_break() {
                row.insert(period.id.clone(), Cell::text(BREAK_CELL));
                continue;
            }
            let Some(slot) = read_slot(raw).filter(|s| !s.subject.is_empty()) else {
                continue;
            };
            let mut cell = Cell::text(cell_text(&slot.subject, slot.teacher.as_deref()));
            cell.span = slot.span;
            row.insert(period.id.clone(), cell);
        }
    }
    Ok(Draft { periods, schedule })
}
