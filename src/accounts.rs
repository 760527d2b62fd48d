use crate::classkey::normalize_section;
use crate::db::now_rfc3339;
use crate::tenancy::Role;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const MAX_BATCH: usize = 50;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub institution_id: String,
    pub role: Role,
    pub name: String,
    pub class_name: Option<String>,
    pub section: Option<String>,
    pub subject: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "class")]
    pub class_name: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("{0}")]
    Validation(String),
    #[error("account {0} belongs to another institution")]
    ForeignAccount(String),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

fn clean(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn map_row(r: &Row<'_>) -> rusqlite::Result<Account> {
    let role: String = r.get(2)?;
    Ok(Account {
        id: r.get(0)?,
        institution_id: r.get(1)?,
        role: Role::parse(&role).unwrap_or(Role::Student),
        name: r.get(3)?,
        class_name: r.get(4)?,
        section: r.get(5)?,
        subject: r.get(6)?,
        email: r.get(7)?,
    })
}

const SELECT: &str =
    "SELECT id, institution_id, role, name, class_name, section, subject, email FROM accounts";

pub fn list(conn: &Connection, tenant: &str, role: Option<Role>) -> rusqlite::Result<Vec<Account>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE institution_id = ?1 AND (?2 IS NULL OR role = ?2) ORDER BY name, id",
        SELECT
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![tenant, role.map(Role::as_str)], map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get(conn: &Connection, id: &str) -> rusqlite::Result<Option<Account>> {
    conn.query_row(&format!("{} WHERE id = ?", SELECT), [id], map_row)
        .optional()
}

/// Creates or updates one account inside the tenant. An id already owned by
/// another institution is refused.
pub fn upsert(conn: &Connection, tenant: &str, input: &AccountInput) -> Result<Account, AccountError> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(AccountError::Validation("name must not be empty".into()));
    }
    let role = match input.role.as_deref() {
        None => Role::Student,
        Some(r) => Role::parse(r)
            .ok_or_else(|| AccountError::Validation(format!("unknown role: {}", r)))?,
    };
    if matches!(role, Role::Institution | Role::Admin) {
        return Err(AccountError::Validation(
            "only student and teacher accounts can be registered".into(),
        ));
    }

    let id = clean(&input.id).unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Some(existing) = get(conn, &id)? {
        if existing.institution_id != tenant {
            return Err(AccountError::ForeignAccount(id));
        }
    }

    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO accounts(id, institution_id, role, name, class_name, section, subject, email, created_at, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
         ON CONFLICT(id) DO UPDATE SET
           role = excluded.role,
           name = excluded.name,
           class_name = excluded.class_name,
           section = excluded.section,
           subject = excluded.subject,
           email = excluded.email,
           updated_at = excluded.updated_at",
        rusqlite::params![
            id,
            tenant,
            role.as_str(),
            name,
            clean(&input.class_name),
            clean(&input.section).map(|s| normalize_section(&s)),
            clean(&input.subject),
            clean(&input.email),
            now,
        ],
    )?;

    get(conn, &id)?.ok_or_else(|| AccountError::Validation("account vanished after write".into()))
}

#[derive(Debug, Default, Serialize)]
pub struct BatchOutcome {
    pub success: Vec<Account>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Serialize)]
pub struct BatchFailure {
    pub index: usize,
    pub name: String,
    pub error: String,
}

/// Registers up to `MAX_BATCH` accounts. Each entry stands alone: a failure
/// is recorded and the loop moves on.
pub fn batch_create(conn: &Connection, tenant: &str, inputs: &[AccountInput]) -> Result<BatchOutcome, AccountError> {
    if inputs.is_empty() {
        return Err(AccountError::Validation("no accounts provided".into()));
    }
    if inputs.len() > MAX_BATCH {
        return Err(AccountError::Validation(format!(
            "batch size limit exceeded: max {} per request",
            MAX_BATCH
        )));
    }
    let mut out = BatchOutcome::default();
    for (index, input) in inputs.iter().enumerate() {
        match upsert(conn, tenant, input) {
            Ok(acc) => out.success.push(acc),
            Err(e) => {
                tracing::warn!(index, name = %input.name, error = %e, "batch account rejected");
                out.failed.push(BatchFailure {
                    index,
                    name: input.name.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
    Ok(out)
}
