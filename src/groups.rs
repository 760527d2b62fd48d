use crate::classkey::{normalize_class, normalize_section};
use crate::db::now_rfc3339;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;

/// Subject cohort record. A cache of who is in a class's subject group,
/// rebuilt from rosters and timetables; never authoritative.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub group_name: String,
    pub subject: String,
    pub class_name: String,
    pub section: String,
    pub teacher_name: Option<String>,
    pub teacher_id: Option<String>,
    pub member_ids: Vec<String>,
    pub kind: String,
    pub updated_at: Option<String>,
}

/// `Maths`, `10th`, `a` -> `MATHS_10_A`.
pub fn group_key(subject: &str, class_name: &str, section: &str) -> String {
    let raw = format!(
        "{}_{}_{}",
        subject.trim(),
        normalize_class(class_name),
        normalize_section(section)
    );
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_uppercase()
}

const SELECT: &str = "SELECT id, group_name, subject, class_name, section, teacher_name,
        teacher_id, member_ids_json, kind, updated_at
 FROM study_groups";

fn map_row(r: &Row<'_>) -> rusqlite::Result<Group> {
    let members: String = r.get(7)?;
    Ok(Group {
        id: r.get(0)?,
        group_name: r.get(1)?,
        subject: r.get(2)?,
        class_name: r.get(3)?,
        section: r.get(4)?,
        teacher_name: r.get(5)?,
        teacher_id: r.get(6)?,
        member_ids: serde_json::from_str(&members).unwrap_or_default(),
        kind: r.get(8)?,
        updated_at: r.get(9)?,
    })
}

pub fn get(conn: &Connection, tenant: &str, id: &str) -> rusqlite::Result<Option<Group>> {
    conn.query_row(
        &format!("{} WHERE institution_id = ? AND id = ?", SELECT),
        [tenant, id],
        map_row,
    )
    .optional()
}

pub fn list(conn: &Connection, tenant: &str) -> rusqlite::Result<Vec<Group>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE institution_id = ? ORDER BY class_name, section, subject",
        SELECT
    ))?;
    let rows = stmt
        .query_map([tenant], map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn write(conn: &Connection, tenant: &str, actor: &str, g: &Group) -> rusqlite::Result<()> {
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO study_groups(institution_id, id, group_name, subject, class_name, section,
                                  teacher_name, teacher_id, member_ids_json, kind, created_by, created_at, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
         ON CONFLICT(institution_id, id) DO UPDATE SET
           group_name = excluded.group_name,
           teacher_name = excluded.teacher_name,
           teacher_id = excluded.teacher_id,
           member_ids_json = excluded.member_ids_json,
           updated_at = excluded.updated_at",
        rusqlite::params![
            tenant,
            g.id,
            g.group_name,
            g.subject,
            g.class_name,
            g.section,
            g.teacher_name,
            g.teacher_id,
            serde_json::to_string(&g.member_ids).unwrap_or_else(|_| "[]".into()),
            g.kind,
            actor,
            now,
        ],
    )?;
    Ok(())
}

fn blank(subject: &str, class_name: &str, section: &str) -> Group {
    let class_name = normalize_class(class_name);
    let section = normalize_section(section);
    Group {
        id: group_key(subject, &class_name, &section),
        group_name: format!("{} ({}-{})", subject.trim(), class_name, section),
        subject: subject.trim().to_string(),
        class_name,
        section,
        teacher_name: None,
        teacher_id: None,
        member_ids: Vec::new(),
        kind: "academic".to_string(),
        updated_at: None,
    }
}

pub struct TeacherSlot<'a> {
    pub name: &'a str,
    pub id: Option<&'a str>,
}

/// Binds a teacher to the subject group, creating the group if needed.
/// Existing members pass through `keep_member`; the new teacher id is added.
#[allow(clippy::too_many_arguments)]
pub fn assign_teacher<F>(
    conn: &Connection,
    tenant: &str,
    actor: &str,
    subject: &str,
    class_name: &str,
    section: &str,
    teacher: Option<TeacherSlot<'_>>,
    keep_member: F,
) -> rusqlite::Result<Group>
where
    F: Fn(&str) -> bool,
{
    let fresh = blank(subject, class_name, section);
    let mut g = get(conn, tenant, &fresh.id)?.unwrap_or(fresh);
    g.member_ids.retain(|m| keep_member(m));
    match teacher {
        Some(t) => {
            g.teacher_name = Some(t.name.trim().to_string());
            g.teacher_id = t.id.map(str::to_string);
            if let Some(id) = t.id {
                if !g.member_ids.iter().any(|m| m == id) {
                    g.member_ids.push(id.to_string());
                }
            }
        }
        None => {
            g.teacher_name = None;
            g.teacher_id = None;
        }
    }
    write(conn, tenant, actor, &g)?;
    Ok(g)
}

/// Unbinds a teacher from a subject group. Only the teacher the group still
/// names is cleared; a group already handed to someone else keeps them.
#[allow(clippy::too_many_arguments)]
pub fn detach_teacher(
    conn: &Connection,
    tenant: &str,
    actor: &str,
    subject: &str,
    class_name: &str,
    section: &str,
    teacher_name: &str,
    teacher_id: Option<&str>,
) -> rusqlite::Result<bool> {
    let key = group_key(subject, class_name, section);
    let Some(mut g) = get(conn, tenant, &key)? else {
        return Ok(false);
    };
    let names_match = g
        .teacher_name
        .as_deref()
        .is_some_and(|n| n.trim().eq_ignore_ascii_case(teacher_name.trim()));
    let ids_match = teacher_id.is_some() && g.teacher_id.as_deref() == teacher_id;
    let before = g.member_ids.len();
    if let Some(id) = teacher_id {
        g.member_ids.retain(|m| m != id);
    }
    if names_match || ids_match {
        g.teacher_name = None;
        g.teacher_id = None;
    } else if g.member_ids.len() == before {
        return Ok(false);
    }
    write(conn, tenant, actor, &g)?;
    Ok(true)
}

/// Adds or removes one member id on every group of a class.
pub fn set_class_membership(
    conn: &Connection,
    tenant: &str,
    actor: &str,
    class_name: &str,
    section: &str,
    member_id: &str,
    present: bool,
) -> rusqlite::Result<usize> {
    let class_name = normalize_class(class_name);
    let section = normalize_section(section);
    let mut changed = 0;
    for mut g in list(conn, tenant)? {
        if normalize_class(&g.class_name) != class_name || g.section != section {
            continue;
        }
        let has = g.member_ids.iter().any(|m| m == member_id);
        if present && !has {
            g.member_ids.push(member_id.to_string());
        } else if !present && has {
            g.member_ids.retain(|m| m != member_id);
        } else {
            continue;
        }
        write(conn, tenant, actor, &g)?;
        changed += 1;
    }
    Ok(changed)
}
