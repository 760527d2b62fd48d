use crate::classkey::{normalize_section, same_class};
use crate::db::now_rfc3339;
use crate::tenancy::{merge_by_id, OWNED_BY_CREATOR, OWNED_BY_INSTITUTION};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RosterKind {
    Teacher,
    Student,
}

impl RosterKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "teacher" | "teachers" => Some(Self::Teacher),
            "student" | "students" => Some(Self::Student),
            _ => None,
        }
    }

    fn table(self) -> &'static str {
        match self {
            Self::Teacher => "teacher_allotments",
            Self::Student => "student_allotments",
        }
    }

    /// Per-kind detail column: the taught subject, or the student's age.
    pub fn detail_key(self) -> &'static str {
        match self {
            Self::Teacher => "subject",
            Self::Student => "age",
        }
    }

    fn detail_column(self) -> &'static str {
        self.detail_key()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Allotment {
    pub id: String,
    pub kind: RosterKind,
    pub name: String,
    pub class_assigned: String,
    pub section: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
    pub user_id: Option<String>,
    pub institution_id: Option<String>,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: Option<String>,
}

impl Allotment {
    pub fn detail(&self) -> &str {
        self.subject
            .as_deref()
            .or(self.age.as_deref())
            .unwrap_or_default()
    }

    pub fn is_linked(&self) -> bool {
        self.user_id.as_deref().is_some_and(|u| !u.trim().is_empty())
    }

    pub fn in_class(&self, class_name: &str, section: &str) -> bool {
        same_class(&self.class_assigned, class_name)
            && normalize_section(&self.section) == normalize_section(section)
    }
}

#[derive(Debug, Clone)]
pub struct NewAllotment {
    pub kind: RosterKind,
    pub name: String,
    pub class_assigned: String,
    pub section: String,
    /// Subject for teachers, age for students.
    pub detail: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("{0}")]
    Validation(String),
    #[error("{name} is already allotted to {detail} in {class_assigned}-{section}")]
    Duplicate {
        existing_id: String,
        name: String,
        detail: String,
        class_assigned: String,
        section: String,
    },
    #[error("allotment not found")]
    NotFound,
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

fn select_sql(kind: RosterKind, filter: &str) -> String {
    format!(
        "SELECT id, name, class_assigned, section, {detail}, user_id,
                institution_id, created_by, created_at, updated_at
         FROM {table}
         WHERE {filter}",
        detail = kind.detail_column(),
        table = kind.table(),
        filter = filter
    )
}

fn map_row(kind: RosterKind, r: &Row<'_>) -> rusqlite::Result<Allotment> {
    let detail: String = r.get(4)?;
    Ok(Allotment {
        id: r.get(0)?,
        kind,
        name: r.get(1)?,
        class_assigned: r.get(2)?,
        section: r.get(3)?,
        subject: (kind == RosterKind::Teacher).then(|| detail.clone()),
        age: (kind == RosterKind::Student).then_some(detail),
        user_id: r.get(5)?,
        institution_id: r.get(6)?,
        created_by: r.get(7)?,
        created_at: r.get(8)?,
        updated_at: r.get(9)?,
    })
}

fn query_owned(conn: &Connection, kind: RosterKind, filter: &str, tenant: &str) -> rusqlite::Result<Vec<Allotment>> {
    let mut stmt = conn.prepare(&select_sql(kind, filter))?;
    let rows = stmt
        .query_map([tenant], |r| map_row(kind, r))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Every allotment of one kind the tenant owns under either ownership field.
pub fn list_for_tenant(conn: &Connection, kind: RosterKind, tenant: &str) -> rusqlite::Result<Vec<Allotment>> {
    let by_institution = query_owned(conn, kind, OWNED_BY_INSTITUTION, tenant)?;
    let by_creator = query_owned(conn, kind, OWNED_BY_CREATOR, tenant)?;
    let mut merged = merge_by_id(by_institution, by_creator, |a| a.id.as_str());
    merged.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(merged)
}

pub fn list_class(
    conn: &Connection,
    kind: RosterKind,
    tenant: &str,
    class_name: &str,
    section: &str,
) -> rusqlite::Result<Vec<Allotment>> {
    Ok(list_for_tenant(conn, kind, tenant)?
        .into_iter()
        .filter(|a| a.in_class(class_name, section))
        .collect())
}

pub fn get(conn: &Connection, kind: RosterKind, tenant: &str, id: &str) -> rusqlite::Result<Option<Allotment>> {
    let sql = format!(
        "{} AND id = ?2",
        select_sql(
            kind,
            "(institution_id = ?1 OR (created_by = ?1 AND (institution_id IS NULL OR institution_id = '')))"
        )
    );
    conn.query_row(&sql, [tenant, id], |r| map_row(kind, r))
        .optional()
}

/// Looks an id up in both rosters.
pub fn find(conn: &Connection, tenant: &str, id: &str) -> rusqlite::Result<Option<Allotment>> {
    if let Some(a) = get(conn, RosterKind::Teacher, tenant, id)? {
        return Ok(Some(a));
    }
    get(conn, RosterKind::Student, tenant, id)
}

fn validate(new: &NewAllotment) -> Result<(), RosterError> {
    let missing = [
        ("name", new.name.trim()),
        ("classAssigned", new.class_assigned.trim()),
        ("section", new.section.trim()),
        (new.kind.detail_key(), new.detail.trim()),
    ]
    .into_iter()
    .find(|(_, v)| v.is_empty());
    if let Some((field, _)) = missing {
        return Err(RosterError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn find_duplicate(existing: &[Allotment], name: &str, subject: &str, skip_id: Option<&str>) -> Option<Allotment> {
    existing
        .iter()
        .find(|a| {
            Some(a.id.as_str()) != skip_id
                && a.name.trim().eq_ignore_ascii_case(name.trim())
                && a.detail().trim().eq_ignore_ascii_case(subject.trim())
        })
        .cloned()
}

/// Teacher uniqueness key is (name, class, section, subject), checked against
/// the destination class inside the caller's transaction. Students are never
/// checked: two pupils may share a name in one section.
fn ensure_unique(
    conn: &Connection,
    tenant: &str,
    class_assigned: &str,
    section: &str,
    name: &str,
    subject: &str,
    skip_id: Option<&str>,
) -> Result<(), RosterError> {
    let existing = list_class(conn, RosterKind::Teacher, tenant, class_assigned, section)?;
    match find_duplicate(&existing, name, subject, skip_id) {
        None => Ok(()),
        Some(dup) => {
            let detail = dup.detail().to_string();
            Err(RosterError::Duplicate {
                existing_id: dup.id,
                name: dup.name,
                detail,
                class_assigned: dup.class_assigned,
                section: dup.section,
            })
        }
    }
}

/// Inserts one allotment. The uniqueness check and the insert share one
/// transaction so two writers cannot both pass the check.
pub fn insert(
    conn: &Connection,
    tenant: &str,
    created_by: &str,
    new: &NewAllotment,
    allow_duplicate: bool,
) -> Result<Allotment, RosterError> {
    validate(new)?;
    let tx = conn.unchecked_transaction()?;

    if new.kind == RosterKind::Teacher && !allow_duplicate {
        ensure_unique(
            &tx,
            tenant,
            &new.class_assigned,
            &new.section,
            &new.name,
            &new.detail,
            None,
        )?;
    }

    let id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    tx.execute(
        &format!(
            "INSERT INTO {}(id, institution_id, created_by, name, class_assigned, section, {}, user_id, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            new.kind.table(),
            new.kind.detail_column()
        ),
        rusqlite::params![
            id,
            tenant,
            created_by,
            new.name.trim(),
            new.class_assigned.trim(),
            normalize_section(&new.section),
            new.detail.trim(),
            new.user_id.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            now,
            now,
        ],
    )?;
    tx.commit()?;

    get(conn, new.kind, tenant, &id)?.ok_or(RosterError::NotFound)
}

fn expect_one(changed: usize) -> Result<(), RosterError> {
    if changed == 0 {
        return Err(RosterError::NotFound);
    }
    Ok(())
}

/// Replace-teacher: the record keeps its id, class, section and subject.
pub fn update_person(
    conn: &Connection,
    kind: RosterKind,
    tenant: &str,
    id: &str,
    name: &str,
    user_id: Option<&str>,
    allow_duplicate: bool,
) -> Result<(), RosterError> {
    if name.trim().is_empty() {
        return Err(RosterError::Validation("name must not be empty".into()));
    }
    let tx = conn.unchecked_transaction()?;
    let current = get(&tx, kind, tenant, id)?.ok_or(RosterError::NotFound)?;
    if kind == RosterKind::Teacher && !allow_duplicate {
        ensure_unique(
            &tx,
            tenant,
            &current.class_assigned,
            &current.section,
            name,
            current.detail(),
            Some(id),
        )?;
    }
    let changed = tx.execute(
        &format!(
            "UPDATE {} SET name = ?, user_id = ?, updated_at = ? WHERE id = ?",
            kind.table()
        ),
        rusqlite::params![
            name.trim(),
            user_id.map(str::trim).filter(|s| !s.is_empty()),
            now_rfc3339(),
            id
        ],
    )?;
    expect_one(changed)?;
    tx.commit()?;
    Ok(())
}

/// Transfer: the record is moved in place, not recreated.
pub fn update_placement(
    conn: &Connection,
    kind: RosterKind,
    tenant: &str,
    id: &str,
    class_assigned: &str,
    section: &str,
    allow_duplicate: bool,
) -> Result<(), RosterError> {
    if class_assigned.trim().is_empty() || section.trim().is_empty() {
        return Err(RosterError::Validation(
            "classAssigned and section must not be empty".into(),
        ));
    }
    let tx = conn.unchecked_transaction()?;
    let current = get(&tx, kind, tenant, id)?.ok_or(RosterError::NotFound)?;
    if kind == RosterKind::Teacher && !allow_duplicate {
        ensure_unique(
            &tx,
            tenant,
            class_assigned,
            section,
            &current.name,
            current.detail(),
            Some(id),
        )?;
    }
    let changed = tx.execute(
        &format!(
            "UPDATE {} SET class_assigned = ?, section = ?, updated_at = ? WHERE id = ?",
            kind.table()
        ),
        rusqlite::params![class_assigned.trim(), normalize_section(section), now_rfc3339(), id],
    )?;
    expect_one(changed)?;
    tx.commit()?;
    Ok(())
}

/// Fills `user_id` only when it is still empty. Returns whether a row changed.
pub fn backfill_user_id(conn: &Connection, kind: RosterKind, id: &str, user_id: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        &format!(
            "UPDATE {} SET user_id = ?, updated_at = ?
             WHERE id = ? AND (user_id IS NULL OR TRIM(user_id) = '')",
            kind.table()
        ),
        rusqlite::params![user_id, now_rfc3339(), id],
    )?;
    Ok(changed > 0)
}

pub fn delete(conn: &Connection, kind: RosterKind, id: &str) -> Result<(), RosterError> {
    let changed = conn.execute(&format!("DELETE FROM {} WHERE id = ?", kind.table()), [id])?;
    expect_one(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_db;

    fn temp_conn(tag: &str) -> Connection {
        let dir = std::env::temp_dir().join(format!("rosterd-roster-{}-{}", tag, Uuid::new_v4()));
        open_db(&dir).expect("open db")
    }

    fn teacher(name: &str, class_assigned: &str, section: &str, subject: &str) -> NewAllotment {
        NewAllotment {
            kind: RosterKind::Teacher,
            name: name.into(),
            class_assigned: class_assigned.into(),
            section: section.into(),
            detail: subject.into(),
            user_id: None,
        }
    }

    #[test]
    fn duplicate_teacher_allotment_is_rejected_across_class_spellings() {
        let conn = temp_conn("dup");
        insert(&conn, "inst-a", "inst-a", &teacher("Mary", "10", "a", "Maths"), false).expect("first");
        let again = insert(&conn, "inst-a", "inst-a", &teacher("mary", "10th", "A", "maths"), false);
        assert!(matches!(again, Err(RosterError::Duplicate { .. })));
        insert(&conn, "inst-a", "inst-a", &teacher("Mary", "10", "A", "Maths"), true).expect("override");
        insert(&conn, "inst-b", "inst-b", &teacher("Mary", "10", "A", "Maths"), false).expect("other tenant");
        assert_eq!(list_class(&conn, RosterKind::Teacher, "inst-a", "10", "A").expect("list").len(), 2);
    }

    fn student(name: &str, age: &str) -> NewAllotment {
        NewAllotment {
            kind: RosterKind::Student,
            name: name.into(),
            class_assigned: "10".into(),
            section: "A".into(),
            detail: age.into(),
            user_id: None,
        }
    }

    #[test]
    fn students_sharing_a_name_can_join_one_section() {
        let conn = temp_conn("students");
        insert(&conn, "inst-a", "inst-a", &student("Aarav", "15"), false).expect("first");
        insert(&conn, "inst-a", "inst-a", &student("Aarav", "14"), false).expect("second");
        insert(&conn, "inst-a", "inst-a", &student("aarav", "15"), false).expect("third");
        assert_eq!(list_class(&conn, RosterKind::Student, "inst-a", "10", "A").expect("list").len(), 3);
    }

    #[test]
    fn moves_and_renames_cannot_create_a_second_teacher_allotment() {
        let conn = temp_conn("moves");
        let a = insert(&conn, "inst-a", "inst-a", &teacher("Mary", "10", "A", "Maths"), false).expect("10-A");
        let b = insert(&conn, "inst-a", "inst-a", &teacher("Mary", "10", "B", "Maths"), false).expect("10-B");
        let raj = insert(&conn, "inst-a", "inst-a", &teacher("Raj", "10", "A", "Maths"), false).expect("raj");

        let moved = update_placement(&conn, RosterKind::Teacher, "inst-a", &a.id, "10th", "b", false);
        assert!(matches!(moved, Err(RosterError::Duplicate { ref existing_id, .. }) if *existing_id == b.id));
        let renamed = update_person(&conn, RosterKind::Teacher, "inst-a", &raj.id, "mary", None, false);
        assert!(matches!(renamed, Err(RosterError::Duplicate { ref existing_id, .. }) if *existing_id == a.id));

        let unchanged = get(&conn, RosterKind::Teacher, "inst-a", &a.id).expect("get").expect("row");
        assert_eq!(unchanged.section, "A");
        // Renaming to the same name, or moving onto itself, is not a collision.
        update_person(&conn, RosterKind::Teacher, "inst-a", &a.id, "Mary", Some("u1"), false).expect("self");
        update_placement(&conn, RosterKind::Teacher, "inst-a", &a.id, "10", "A", false).expect("self move");
        update_placement(&conn, RosterKind::Teacher, "inst-a", &a.id, "10", "B", true).expect("override");
        assert_eq!(list_class(&conn, RosterKind::Teacher, "inst-a", "10", "B").expect("list").len(), 2);
    }

    #[test]
    fn missing_fields_fail_before_any_write() {
        let conn = temp_conn("validate");
        let err = insert(&conn, "inst-a", "inst-a", &teacher("Mary", "10", "A", " "), false);
        assert!(matches!(err, Err(RosterError::Validation(_))));
        assert!(list_for_tenant(&conn, RosterKind::Teacher, "inst-a").expect("list").is_empty());
    }

    #[test]
    fn legacy_creator_owned_rows_are_merged_but_foreign_stamped_rows_are_not() {
        let conn = temp_conn("owners");
        for (id, inst, created_by) in [
            ("r1", Some("inst-a"), "someone"),
            ("r2", None, "inst-a"),
            ("r3", Some("inst-b"), "inst-a"),
        ] {
            conn.execute(
                "INSERT INTO teacher_allotments(id, institution_id, created_by, name, class_assigned, section, subject, created_at)
                 VALUES(?, ?, ?, 'T', '10', 'A', 'Maths', 'now')",
                rusqlite::params![id, inst, created_by],
            )
            .expect("seed");
        }
        let ids: Vec<String> = list_for_tenant(&conn, RosterKind::Teacher, "inst-a")
            .expect("list")
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["r1", "r2"]);
    }

    #[test]
    fn backfill_never_overwrites_a_link() {
        let conn = temp_conn("backfill");
        let a = insert(&conn, "inst-a", "inst-a", &teacher("Mary", "10", "A", "Maths"), false).expect("insert");
        assert!(backfill_user_id(&conn, RosterKind::Teacher, &a.id, "u1").expect("first"));
        assert!(!backfill_user_id(&conn, RosterKind::Teacher, &a.id, "u2").expect("second"));
        let got = get(&conn, RosterKind::Teacher, "inst-a", &a.id).expect("get").expect("row");
        assert_eq!(got.user_id.as_deref(), Some("u1"));
    }
}
