use crate::classkey::{compare_classes, normalize_class, normalize_section, same_class};
use crate::db::now_rfc3339;
use crate::schedule::{default_periods, schedule_from_stored, validate_periods, Period, Schedule, TimetableError};
use crate::tenancy::{merge_by_id, OWNED_BY_CREATOR, OWNED_BY_INSTITUTION};
use rusqlite::{Connection, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimetableDoc {
    pub id: String,
    pub institution_id: Option<String>,
    pub created_by: Option<String>,
    #[serde(rename = "class")]
    pub class_name: String,
    pub section: String,
    pub periods: Vec<Period>,
    pub schedule: Schedule,
    pub updated_by: Option<String>,
    pub updated_at: Option<String>,
}

impl TimetableDoc {
    /// Content hash over periods and schedule. Equal content, equal revision.
    pub fn revision(&self) -> String {
        revision_of(&self.periods, &self.schedule)
    }

    pub fn matches(&self, class_name: &str, section: &str) -> bool {
        same_class(&self.class_name, class_name)
            && normalize_section(&self.section) == normalize_section(section)
    }
}

pub fn revision_of(periods: &[Period], schedule: &Schedule) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(periods).unwrap_or_default());
    hasher.update([0u8]);
    hasher.update(serde_json::to_vec(schedule).unwrap_or_default());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("timetable changed since it was read (expected {expected}, found {actual})")]
    RevisionConflict { expected: String, actual: String },
    #[error(transparent)]
    Invalid(#[from] TimetableError),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

const SELECT: &str = "SELECT id, institution_id, created_by, class_name, section,
        periods_json, schedule_json, updated_by, updated_at
 FROM timetables";

fn map_row(r: &Row<'_>) -> rusqlite::Result<TimetableDoc> {
    let periods_json: String = r.get(5)?;
    let schedule_json: String = r.get(6)?;
    let periods: Vec<Period> = serde_json::from_str(&periods_json)
        .ok()
        .filter(|p: &Vec<Period>| validate_periods(p).is_ok())
        .unwrap_or_else(default_periods);
    let schedule = serde_json::from_str::<serde_json::Value>(&schedule_json)
        .map(|v| schedule_from_stored(&v))
        .unwrap_or_default();
    Ok(TimetableDoc {
        id: r.get(0)?,
        institution_id: r.get(1)?,
        created_by: r.get(2)?,
        class_name: r.get(3)?,
        section: r.get(4)?,
        periods,
        schedule,
        updated_by: r.get(7)?,
        updated_at: r.get(8)?,
    })
}

fn query_owned(conn: &Connection, filter: &str, tenant: &str) -> rusqlite::Result<Vec<TimetableDoc>> {
    let mut stmt = conn.prepare(&format!("{} WHERE {}", SELECT, filter))?;
    let rows = stmt
        .query_map([tenant], map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// All timetables the tenant owns, school order.
pub fn list_for_tenant(conn: &Connection, tenant: &str) -> rusqlite::Result<Vec<TimetableDoc>> {
    let by_institution = query_owned(conn, OWNED_BY_INSTITUTION, tenant)?;
    let by_creator = query_owned(conn, OWNED_BY_CREATOR, tenant)?;
    let mut docs = merge_by_id(by_institution, by_creator, |d| d.id.as_str());
    docs.sort_by(|a, b| {
        compare_classes(&a.class_name, &b.class_name)
            .then_with(|| a.section.cmp(&b.section))
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(docs)
}

/// Every stored document for the class, whichever class spelling it was saved under.
pub fn find_all_for_class(
    conn: &Connection,
    tenant: &str,
    class_name: &str,
    section: &str,
) -> rusqlite::Result<Vec<TimetableDoc>> {
    Ok(list_for_tenant(conn, tenant)?
        .into_iter()
        .filter(|d| d.matches(class_name, section))
        .collect())
}

/// The document shown for a class: the normalised spelling first, then the
/// spelling as requested, then any equivalent one.
pub fn find_for_class(
    conn: &Connection,
    tenant: &str,
    class_name: &str,
    section: &str,
) -> rusqlite::Result<Option<TimetableDoc>> {
    let mut docs = find_all_for_class(conn, tenant, class_name, section)?;
    let normalized = normalize_class(class_name);
    let raw = class_name.trim();
    let rank = |d: &TimetableDoc| {
        if d.class_name == normalized {
            0
        } else if d.class_name == raw {
            1
        } else {
            2
        }
    };
    docs.sort_by_key(|d| rank(d));
    Ok(docs.into_iter().next())
}

/// Whole-document overwrite of periods and schedule.
pub fn write(conn: &Connection, doc: &TimetableDoc) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO timetables(id, institution_id, created_by, class_name, section, periods_json, schedule_json, updated_by, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
           class_name = excluded.class_name,
           section = excluded.section,
           periods_json = excluded.periods_json,
           schedule_json = excluded.schedule_json,
           updated_by = excluded.updated_by,
           updated_at = excluded.updated_at",
        rusqlite::params![
            doc.id,
            doc.institution_id,
            doc.created_by,
            doc.class_name,
            doc.section,
            serde_json::to_string(&doc.periods).unwrap_or_else(|_| "[]".into()),
            serde_json::to_string(&doc.schedule).unwrap_or_else(|_| "{}".into()),
            doc.updated_by,
            doc.updated_at,
        ],
    )?;
    Ok(())
}

/// Saves a full grid for one class. With `expected_revision` the write only
/// happens when the stored content still hashes to it; without it the last
/// writer wins.
#[allow(clippy::too_many_arguments)]
pub fn save_for_class(
    conn: &Connection,
    tenant: &str,
    actor: &str,
    class_name: &str,
    section: &str,
    periods: Vec<Period>,
    schedule: Schedule,
    expected_revision: Option<&str>,
) -> Result<TimetableDoc, StoreError> {
    validate_periods(&periods)?;
    let tx = conn.unchecked_transaction()?;
    let existing = find_for_class(&tx, tenant, class_name, section)?;

    if let Some(expected) = expected_revision {
        let actual = existing
            .as_ref()
            .map(TimetableDoc::revision)
            .unwrap_or_else(|| revision_of(&default_periods(), &Schedule::new()));
        if actual != expected {
            return Err(StoreError::RevisionConflict {
                expected: expected.to_string(),
                actual,
            });
        }
    }

    let doc = TimetableDoc {
        id: existing
            .as_ref()
            .map(|d| d.id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        institution_id: Some(tenant.to_string()),
        created_by: existing
            .as_ref()
            .and_then(|d| d.created_by.clone())
            .or_else(|| Some(actor.to_string())),
        class_name: existing
            .as_ref()
            .map(|d| d.class_name.clone())
            .unwrap_or_else(|| normalize_class(class_name)),
        section: normalize_section(section),
        periods,
        schedule,
        updated_by: Some(actor.to_string()),
        updated_at: Some(now_rfc3339()),
    };
    write(&tx, &doc)?;
    tx.commit()?;
    Ok(doc)
}
