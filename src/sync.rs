//! Secondary reconciliation after a roster write.
//!
//! A roster write is the record of truth. Timetable text and group membership
//! follow it here, and whatever happens in this module is reported next to the
//! primary result instead of replacing it.

use crate::db::now_rfc3339;
use crate::rewrite::{rewrite_schedule, BoundaryPolicy, RewriteMode, TeacherChange};
use crate::timetables;
use anyhow::Context;
use rusqlite::Connection;
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub modes: Vec<RewriteMode>,
    pub documents_scanned: usize,
    pub documents_updated: usize,
    pub cells_changed: usize,
    pub groups_updated: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncOutcome {
    pub fn clean() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    /// Folds another step into this outcome. The first error wins.
    pub fn absorb(&mut self, other: SyncOutcome) {
        self.ok &= other.ok;
        for m in other.modes {
            if !self.modes.contains(&m) {
                self.modes.push(m);
            }
        }
        self.documents_scanned += other.documents_scanned;
        self.documents_updated += other.documents_updated;
        self.cells_changed += other.cells_changed;
        self.groups_updated += other.groups_updated;
        if self.error.is_none() {
            self.error = other.error;
        }
    }
}

/// Turns a failed secondary step into a reported outcome. Never propagates.
pub fn settle(step: &str, result: anyhow::Result<SyncOutcome>) -> SyncOutcome {
    match result {
        Ok(out) => out,
        Err(e) => {
            tracing::warn!(step, error = %format!("{:#}", e), "secondary reconciliation failed");
            SyncOutcome {
                ok: false,
                error: Some(format!("{}: {:#}", step, e)),
                ..SyncOutcome::default()
            }
        }
    }
}

/// Rewrites the teacher annotation for one subject in every timetable
/// document of the class, under any class spelling the tenant owns. Each
/// changed document is overwritten whole; all of them commit together.
pub fn propagate_teacher_change(
    conn: &Connection,
    tenant: &str,
    actor: &str,
    class_name: &str,
    section: &str,
    change: &TeacherChange<'_>,
    policy: BoundaryPolicy,
) -> anyhow::Result<SyncOutcome> {
    let mut out = SyncOutcome::clean();
    out.modes.push(change.mode());
    if change.subject.is_empty() {
        return Ok(out);
    }

    let tx = conn
        .unchecked_transaction()
        .context("begin timetable rewrite")?;
    let docs = timetables::find_all_for_class(&tx, tenant, class_name, section)
        .context("load class timetables")?;
    out.documents_scanned = docs.len();

    for mut doc in docs {
        let changed = rewrite_schedule(&mut doc.schedule, &doc.periods, change, policy);
        if changed == 0 {
            continue;
        }
        doc.updated_by = Some(actor.to_string());
        doc.updated_at = Some(now_rfc3339());
        timetables::write(&tx, &doc).with_context(|| format!("rewrite timetable {}", doc.id))?;
        out.documents_updated += 1;
        out.cells_changed += changed;
    }
    tx.commit().context("commit timetable rewrite")?;

    tracing::info!(
        tenant,
        class = class_name,
        section,
        subject = change.subject,
        mode = ?change.mode(),
        documents = out.documents_updated,
        cells = out.cells_changed,
        "timetable cells rewritten"
    );
    Ok(out)
}
