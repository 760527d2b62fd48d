use crate::db;
use crate::rewrite::BoundaryPolicy;
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupSection {
    Rewriter,
    Generator,
    Allotments,
}

impl SetupSection {
    pub const ALL: [SetupSection; 3] = [Self::Rewriter, Self::Generator, Self::Allotments];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rewriter" => Some(Self::Rewriter),
            "generator" => Some(Self::Generator),
            "allotments" => Some(Self::Allotments),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Rewriter => "rewriter",
            Self::Generator => "generator",
            Self::Allotments => "allotments",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Rewriter => "setup.rewriter",
            Self::Generator => "setup.generator",
            Self::Allotments => "setup.allotments",
        }
    }
}

pub fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Rewriter => json!({
            "boundaryPolicy": "word"
        }),
        SetupSection::Generator => json!({
            "periodsPerDay": 8,
            "lunchAfter": 3,
            "markConflicts": true
        }),
        SetupSection::Allotments => json!({
            "duplicatePolicy": "reject",
            "healOnList": true
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v.as_i64().ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_choice(v: &Value, key: &str, choices: &[&str]) -> Result<String, String> {
    let s = v
        .as_str()
        .ok_or_else(|| format!("{} must be string", key))?
        .trim()
        .to_ascii_lowercase();
    if !choices.contains(&s.as_str()) {
        return Err(format!("{} must be one of: {}", key, choices.join(", ")));
    }
    Ok(s)
}

/// Validates every patched field before touching `current`.
pub fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let mut staged = Map::new();
    for (k, v) in patch {
        let value = match (section, k.as_str()) {
            (SetupSection::Rewriter, "boundaryPolicy") => {
                Value::String(parse_choice(v, k, &["word", "substring"])?)
            }
            (SetupSection::Generator, "periodsPerDay") => Value::from(parse_i64_range(v, k, 1, 12)?),
            (SetupSection::Generator, "lunchAfter") => Value::from(parse_i64_range(v, k, 0, 12)?),
            (SetupSection::Generator, "markConflicts") => Value::Bool(parse_bool(v, k)?),
            (SetupSection::Allotments, "duplicatePolicy") => {
                Value::String(parse_choice(v, k, &["reject", "confirm"])?)
            }
            (SetupSection::Allotments, "healOnList") => Value::Bool(parse_bool(v, k)?),
            _ => return Err(format!("unknown {} field: {}", section.name(), k)),
        };
        staged.insert(k.clone(), value);
    }
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    obj.extend(staged);
    Ok(())
}

pub fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Per-field best effort: one bad stored value keeps its default.
            for (k, v) in saved_obj {
                let single = Map::from_iter([(k.clone(), v.clone())]);
                if let Err(e) = merge_section_patch(section, &mut current, &single) {
                    tracing::debug!(section = section.name(), error = %e, "ignoring stored setting");
                }
            }
        }
    }
    Ok(current)
}

pub fn update_section(conn: &Connection, section: SetupSection, patch: &Map<String, Value>) -> Result<Value, UpdateError> {
    let mut current = load_section(conn, section).map_err(UpdateError::Db)?;
    merge_section_patch(section, &mut current, patch).map_err(UpdateError::Invalid)?;
    db::settings_set_json(conn, section.key(), &current).map_err(UpdateError::Db)?;
    tracing::info!(section = section.name(), "settings updated");
    Ok(current)
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Db(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    Reject,
    Confirm,
}

#[derive(Debug, Clone, Copy)]
pub struct AllotmentSettings {
    pub duplicate_policy: DuplicatePolicy,
    pub heal_on_list: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct GeneratorSettings {
    pub periods_per_day: usize,
    pub lunch_after: usize,
    pub mark_conflicts: bool,
}

pub fn boundary_policy(conn: &Connection) -> anyhow::Result<BoundaryPolicy> {
    let v = load_section(conn, SetupSection::Rewriter)?;
    Ok(v.get("boundaryPolicy")
        .and_then(Value::as_str)
        .and_then(BoundaryPolicy::parse)
        .unwrap_or_default())
}

pub fn allotment_settings(conn: &Connection) -> anyhow::Result<AllotmentSettings> {
    let v = load_section(conn, SetupSection::Allotments)?;
    Ok(AllotmentSettings {
        duplicate_policy: match v.get("duplicatePolicy").and_then(Value::as_str) {
            Some("confirm") => DuplicatePolicy::Confirm,
            _ => DuplicatePolicy::Reject,
        },
        heal_on_list: v.get("healOnList").and_then(Value::as_bool).unwrap_or(true),
    })
}

pub fn generator_settings(conn: &Connection) -> anyhow::Result<GeneratorSettings> {
    let v = load_section(conn, SetupSection::Generator)?;
    let num = |k: &str, d: u64| v.get(k).and_then(Value::as_u64).unwrap_or(d) as usize;
    Ok(GeneratorSettings {
        periods_per_day: num("periodsPerDay", 8),
        lunch_after: num("lunchAfter", 3),
        mark_conflicts: v.get("markConflicts").and_then(Value::as_bool).unwrap_or(true),
    })
}
