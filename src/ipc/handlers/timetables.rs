use crate::accounts;
use crate::classkey::{normalize_class, normalize_section};
use crate::draft::{self, DraftError};
use crate::ipc::helpers::{
    conn, get_class_section, get_opt_bool, get_opt_str, parse_caller, require_class_access, require_reader,
    require_staff, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::personal;
use crate::rewrite::TeacherChange;
use crate::roster::{self, RosterKind};
use crate::schedule::{default_periods, periods_from_value, schedule_from_value, visible_slots, Schedule, DAYS};
use crate::settings;
use crate::sync::{self, settle, SyncOutcome};
use crate::tenancy::Role;
use crate::timetables::{self, revision_of, StoreError, TimetableDoc};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub(super) fn store_err(e: StoreError) -> HandlerErr {
    match e {
        StoreError::RevisionConflict { ref expected, ref actual } => {
            HandlerErr::new("revision_conflict", e.to_string()).with_details(json!({
                "expectedRevision": expected,
                "currentRevision": actual,
            }))
        }
        StoreError::Invalid(e) => HandlerErr::bad_params(e.to_string()),
        StoreError::Db(e) => HandlerErr::new("db_update_failed", e.to_string()),
    }
}

pub(super) fn doc_json(doc: &TimetableDoc) -> Value {
    json!({ "timetable": doc, "revision": doc.revision(), "exists": true })
}

fn handle_timetables_get(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let caller = parse_caller(&req.params)?;
    let (class_name, section) = get_class_section(&req.params)?;
    require_class_access(conn, &caller, &class_name, &section)?;

    let found = timetables::find_for_class(conn, caller.tenant(), &class_name, &section)
        .map_err(HandlerErr::db("db_query_failed"))?;
    Ok(match found {
        Some(doc) => doc_json(&doc),
        None => {
            let periods = default_periods();
            let schedule = Schedule::new();
            json!({
                "timetable": {
                    "id": null,
                    "class": normalize_class(&class_name),
                    "section": normalize_section(&section),
                    "periods": periods,
                    "schedule": schedule,
                },
                "revision": revision_of(&periods, &schedule),
                "exists": false,
            })
        }
    })
}

fn handle_timetables_save(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let caller = parse_caller(&req.params)?;
    require_staff(&caller)?;
    let (class_name, section) = get_class_section(&req.params)?;
    let periods = periods_from_value(req.params.get("periods")).map_err(|e| HandlerErr::bad_params(e.to_string()))?;
    let schedule = schedule_from_value(req.params.get("schedule")).map_err(|e| HandlerErr::bad_params(e.to_string()))?;
    let expected = get_opt_str(&req.params, "expectedRevision");

    let doc = timetables::save_for_class(
        conn,
        caller.tenant(),
        &caller.user_id,
        &class_name,
        &section,
        periods,
        schedule,
        expected.as_deref(),
    )
    .map_err(store_err)?;
    tracing::info!(
        tenant = caller.tenant(),
        class = %doc.class_name,
        section = %doc.section,
        checked = expected.is_some(),
        "timetable saved"
    );
    Ok(doc_json(&doc))
}

fn handle_timetables_layout(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let caller = parse_caller(&req.params)?;
    let (class_name, section) = get_class_section(&req.params)?;
    require_class_access(conn, &caller, &class_name, &section)?;

    let doc = timetables::find_for_class(conn, caller.tenant(), &class_name, &section)
        .map_err(HandlerErr::db("db_query_failed"))?;
    let (periods, schedule) = match doc {
        Some(d) => (d.periods, d.schedule),
        None => (default_periods(), Schedule::new()),
    };
    let empty = BTreeMap::new();
    let days: Vec<Value> = DAYS
        .iter()
        .map(|day| {
            let row = schedule.get(*day).unwrap_or(&empty);
            json!({ "day": day, "slots": visible_slots(&periods, row) })
        })
        .collect();
    Ok(json!({ "periods": periods, "days": days }))
}

fn handle_timetables_overview(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let caller = parse_caller(&req.params)?;
    require_reader(&caller)?;
    let docs = timetables::list_for_tenant(conn, caller.tenant()).map_err(HandlerErr::db("db_query_failed"))?;
    let rows: Vec<Value> = docs.iter().map(doc_json).collect();
    Ok(json!({ "timetables": rows }))
}

fn handle_timetables_personal(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let caller = parse_caller(&req.params)?;
    require_reader(&caller)?;
    let target = get_opt_str(&req.params, "teacherUserId").unwrap_or_else(|| caller.user_id.clone());
    if target != caller.user_id && !caller.is_staff() {
        return Err(HandlerErr::new("forbidden", "teachers may only read their own timetable"));
    }

    let account = accounts::get(conn, &target)
        .map_err(HandlerErr::db("db_query_failed"))?
        .filter(|a| a.institution_id == caller.tenant() && a.role == Role::Teacher);
    let name = if target == caller.user_id {
        caller.name.clone().or_else(|| account.as_ref().map(|a| a.name.clone()))
    } else {
        account.as_ref().map(|a| a.name.clone())
    };
    let subject = account.as_ref().and_then(|a| a.subject.clone());

    let week = personal::personal_week(conn, caller.tenant(), &target, name.as_deref(), subject.as_deref())
        .map_err(|e| HandlerErr::new("db_query_failed", format!("{:#}", e)))?;
    Ok(json!({ "teacherUserId": target, "name": name, "week": week }))
}

fn handle_timetables_import_draft(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let caller = parse_caller(&req.params)?;
    let apply = get_opt_bool(&req.params, "apply")?.unwrap_or(false);
    if apply {
        require_staff(&caller)?;
    } else {
        require_reader(&caller)?;
    }
    let Some(text) = req.params.get("text").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing text"));
    };

    let parsed = draft::extract_json(text)
        .and_then(|v| draft::normalize(&v))
        .map_err(|e: DraftError| HandlerErr::bad_params(e.to_string()))?;

    if !apply {
        return Ok(json!({ "draft": { "periods": parsed.periods, "schedule": parsed.schedule }, "applied": false }));
    }
    let (class_name, section) = get_class_section(&req.params)?;
    let expected = get_opt_str(&req.params, "expectedRevision");
    let doc = timetables::save_for_class(
        conn,
        caller.tenant(),
        &caller.user_id,
        &class_name,
        &section,
        parsed.periods,
        parsed.schedule,
        expected.as_deref(),
    )
    .map_err(store_err)?;
    tracing::info!(tenant = caller.tenant(), class = %doc.class_name, section = %doc.section, "draft timetable applied");
    let mut out = doc_json(&doc);
    out["applied"] = Value::Bool(true);
    Ok(out)
}

fn handle_timetables_resync(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let caller = parse_caller(&req.params)?;
    require_staff(&caller)?;
    let (class_name, section) = get_class_section(&req.params)?;
    let teachers = roster::list_class(conn, RosterKind::Teacher, caller.tenant(), &class_name, &section)
        .map_err(HandlerErr::db("db_query_failed"))?;
    let policy = settings::boundary_policy(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let mut total = SyncOutcome::clean();
    for t in &teachers {
        let change = TeacherChange::new(t.detail(), None, Some(t.name.as_str()));
        total.absorb(settle(
            "timetable resync",
            sync::propagate_teacher_change(conn, caller.tenant(), &caller.user_id, &class_name, &section, &change, policy),
        ));
    }
    tracing::info!(
        tenant = caller.tenant(),
        class = %class_name,
        section = %section,
        teachers = teachers.len(),
        cells = total.cells_changed,
        "timetable resync"
    );
    Ok(json!({ "allotments": teachers.len(), "sync": total }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "timetables.get" => Some(respond(req, handle_timetables_get(state, req))),
        "timetables.save" => Some(respond(req, handle_timetables_save(state, req))),
        "timetables.layout" => Some(respond(req, handle_timetables_layout(state, req))),
        "timetables.overview" => Some(respond(req, handle_timetables_overview(state, req))),
        "timetables.personal" => Some(respond(req, handle_timetables_personal(state, req))),
        "timetables.importDraft" => Some(respond(req, handle_timetables_import_draft(state, req))),
        "timetables.resync" => Some(respond(req, handle_timetables_resync(state, req))),
        _ => None,
    }
}
