use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "rosterd.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts(
            id TEXT PRIMARY KEY,
            institution_id TEXT NOT NULL,
            role TEXT NOT NULL,
            name TEXT NOT NULL,
            class_name TEXT,
            section TEXT,
            subject TEXT,
            email TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_accounts_institution ON accounts(institution_id, role)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_allotments(
            id TEXT PRIMARY KEY,
            institution_id TEXT,
            created_by TEXT,
            name TEXT NOT NULL,
            class_assigned TEXT NOT NULL,
            section TEXT NOT NULL,
            subject TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_allotments(
            id TEXT PRIMARY KEY,
            institution_id TEXT,
            created_by TEXT,
            name TEXT NOT NULL,
            class_assigned TEXT NOT NULL,
            section TEXT NOT NULL,
            age TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // Workspaces created before self-healing links have no user_id column.
    for table in ["teacher_allotments", "student_allotments"] {
        ensure_allotment_link_columns(&conn, table)?;
    }
    for table in ["teacher_allotments", "student_allotments"] {
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{t}_institution ON {t}(institution_id)",
                t = table
            ),
            [],
        )?;
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{t}_created_by ON {t}(created_by)",
                t = table
            ),
            [],
        )?;
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{t}_user ON {t}(user_id)",
                t = table
            ),
            [],
        )?;
    }

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetables(
            id TEXT PRIMARY KEY,
            institution_id TEXT,
            created_by TEXT,
            class_name TEXT NOT NULL,
            section TEXT NOT NULL,
            periods_json TEXT NOT NULL,
            schedule_json TEXT NOT NULL,
            updated_by TEXT,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetables_institution ON timetables(institution_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetables_created_by ON timetables(created_by)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS study_groups(
            institution_id TEXT NOT NULL,
            id TEXT NOT NULL,
            group_name TEXT NOT NULL,
            subject TEXT NOT NULL,
            class_name TEXT NOT NULL,
            section TEXT NOT NULL,
            teacher_name TEXT,
            teacher_id TEXT,
            member_ids_json TEXT NOT NULL DEFAULT '[]',
            kind TEXT NOT NULL DEFAULT 'academic',
            created_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            PRIMARY KEY(institution_id, id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_allotment_link_columns(conn: &Connection, table: &str) -> anyhow::Result<()> {
    if !table_has_column(conn, table, "user_id")? {
        conn.execute(&format!("ALTER TABLE {} ADD COLUMN user_id TEXT", table), [])?;
    }
    if !table_has_column(conn, table, "updated_at")? {
        conn.execute(&format!("ALTER TABLE {} ADD COLUMN updated_at TEXT", table), [])?;
    }
    Ok(())
}

pub fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value_json FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        None => Ok(None),
        // A corrupt stored value reads as unset.
        Some(s) => Ok(serde_json::from_str(&s).ok()),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let raw = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, raw),
    )?;
    Ok(())
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
