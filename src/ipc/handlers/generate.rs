use super::timetables::{doc_json, store_err};
use crate::groups::{self, TeacherSlot};
use crate::ipc::helpers::{
    conn, get_class_section, get_opt_bool, get_opt_str, get_opt_usize, parse_caller, require_reader,
    require_staff, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::roster::{self, Allotment, RosterKind};
use crate::schedule::build_periods;
use crate::scheduler::{generate, BusyMap, GeneratedGrid, GeneratorConfig, TeacherRef};
use crate::settings;
use crate::sync::{settle, SyncOutcome};
use crate::tenancy::Caller;
use crate::timetables;
use anyhow::Context;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

fn get_subjects(params: &Value) -> Result<Vec<String>, HandlerErr> {
    let Some(raw) = params.get("subjects").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("subjects must be an array"));
    };
    raw.iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.trim().to_string())
                .ok_or_else(|| HandlerErr::bad_params("subjects must be strings"))
        })
        .collect()
}

/// `teacherAssignments`: subject -> teacher allotment id of this tenant.
fn get_assignments(
    conn: &Connection,
    caller: &Caller,
    params: &Value,
) -> Result<(HashMap<String, TeacherRef>, HashMap<String, Allotment>), HandlerErr> {
    let mut refs = HashMap::new();
    let mut by_key = HashMap::new();
    let Some(raw) = params.get("teacherAssignments").filter(|v| !v.is_null()) else {
        return Ok((refs, by_key));
    };
    let Some(obj) = raw.as_object() else {
        return Err(HandlerErr::bad_params("teacherAssignments must be an object"));
    };
    for (subject, id) in obj {
        let Some(id) = id.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            continue;
        };
        let allotment = roster::get(conn, RosterKind::Teacher, caller.tenant(), id)
            .map_err(HandlerErr::db("db_query_failed"))?
            .ok_or_else(|| {
                HandlerErr::new("not_found", format!("teacher allotment not found: {}", id))
                    .with_details(json!({ "subject": subject, "allotmentId": id }))
            })?;
        let key = match allotment.user_id.as_deref() {
            Some(u) if allotment.is_linked() => u.to_string(),
            _ => allotment.id.clone(),
        };
        refs.insert(
            subject.trim().to_string(),
            TeacherRef {
                key: key.clone(),
                name: allotment.name.clone(),
            },
        );
        by_key.insert(key, allotment);
    }
    Ok((refs, by_key))
}

/// One group per subject that landed in the grid. Members that are neither
/// the institution nor a rostered student are dropped.
fn derive_groups(
    conn: &Connection,
    caller: &Caller,
    class_name: &str,
    section: &str,
    grid: &GeneratedGrid,
    by_key: &HashMap<String, Allotment>,
) -> anyhow::Result<SyncOutcome> {
    let students: HashSet<String> = roster::list_class(conn, RosterKind::Student, caller.tenant(), class_name, section)
        .context("load class students")?
        .into_iter()
        .filter(Allotment::is_linked)
        .filter_map(|a| a.user_id)
        .collect();
    let tenant = caller.tenant();
    let mut out = SyncOutcome::clean();
    for (subject, teacher) in &grid.teachers_used {
        let account_id = by_key.get(&teacher.key).and_then(|a| a.user_id.as_deref()).filter(|u| !u.trim().is_empty());
        groups::assign_teacher(
            conn,
            tenant,
            &caller.user_id,
            subject,
            class_name,
            section,
            Some(TeacherSlot {
                name: &teacher.name,
                id: account_id,
            }),
            |m| m == tenant || students.contains(m),
        )
        .with_context(|| format!("update group for {}", subject))?;
        out.groups_updated += 1;
    }
    Ok(out)
}

fn handle_timetables_generate(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let caller = parse_caller(&req.params)?;
    let apply = get_opt_bool(&req.params, "apply")?.unwrap_or(false);
    if apply {
        require_staff(&caller)?;
    } else {
        require_reader(&caller)?;
    }
    let (class_name, section) = get_class_section(&req.params)?;
    let subjects = get_subjects(&req.params)?;
    let (assignments, by_key) = get_assignments(conn, &caller, &req.params)?;

    let defaults = settings::generator_settings(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let per_day = get_opt_usize(&req.params, "periodsPerDay", 1, 12)?.unwrap_or(defaults.periods_per_day);
    let lunch_after = get_opt_usize(&req.params, "lunchAfter", 0, 12)?.unwrap_or(defaults.lunch_after);

    let config = GeneratorConfig {
        subjects,
        assignments,
        periods: build_periods(per_day, lunch_after),
        mark_conflicts: defaults.mark_conflicts,
    };

    // Busy slots come from every other class; this class's own grid is being replaced.
    let others: Vec<_> = timetables::list_for_tenant(conn, caller.tenant())
        .map_err(HandlerErr::db("db_query_failed"))?
        .into_iter()
        .filter(|d| !d.matches(&class_name, &section))
        .collect();
    let teachers: Vec<TeacherRef> = config.assignments.values().cloned().collect();
    let mut busy = BusyMap::from_timetables(others.iter().map(|d| (d.periods.as_slice(), &d.schedule)), &teachers);

    let grid = generate(&config, &mut busy).map_err(|e| HandlerErr::bad_params(e.to_string()))?;
    tracing::info!(
        tenant = caller.tenant(),
        class = %class_name,
        section = %section,
        conflicts = grid.conflicts.len(),
        apply,
        "timetable generated"
    );

    let mut out = json!({
        "periods": grid.periods,
        "schedule": grid.schedule,
        "usage": grid.usage,
        "conflicts": grid.conflicts,
        "applied": false,
    });
    if !apply {
        return Ok(out);
    }

    let expected = get_opt_str(&req.params, "expectedRevision");
    let doc = timetables::save_for_class(
        conn,
        caller.tenant(),
        &caller.user_id,
        &class_name,
        &section,
        grid.periods.clone(),
        grid.schedule.clone(),
        expected.as_deref(),
    )
    .map_err(store_err)?;
    let sync = settle(
        "group derivation",
        derive_groups(conn, &caller, &class_name, &section, &grid, &by_key),
    );

    let saved = doc_json(&doc);
    out["applied"] = Value::Bool(true);
    out["timetable"] = saved["timetable"].clone();
    out["revision"] = saved["revision"].clone();
    out["sync"] = json!(sync);
    Ok(out)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "timetables.generate" => Some(respond(req, handle_timetables_generate(state, req))),
        _ => None,
    }
}
