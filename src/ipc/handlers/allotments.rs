use crate::accounts;
use crate::groups::{self, TeacherSlot};
use crate::ipc::helpers::{
    conn, get_class_section, get_opt_bool, get_opt_str, get_required_str, parse_caller, require_reader,
    require_staff, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::linking;
use crate::rewrite::{BoundaryPolicy, TeacherChange};
use crate::roster::{self, Allotment, NewAllotment, RosterError, RosterKind};
use crate::settings::{self, DuplicatePolicy};
use crate::sync::{self, settle, SyncOutcome};
use crate::tenancy::Caller;
use rusqlite::Connection;
use serde_json::{json, Value};

fn roster_err(db_code: &'static str) -> impl Fn(RosterError) -> HandlerErr {
    move |e| match e {
        RosterError::Validation(m) => HandlerErr::bad_params(m),
        RosterError::NotFound => HandlerErr::new("not_found", "allotment not found"),
        RosterError::Duplicate {
            ref existing_id,
            ref name,
            ref detail,
            ref class_assigned,
            ref section,
        } => HandlerErr::new("duplicate_allotment", e.to_string()).with_details(json!({
            "existingId": existing_id,
            "name": name,
            "detail": detail,
            "classAssigned": class_assigned,
            "section": section,
        })),
        RosterError::Db(e) => HandlerErr::new(db_code, e.to_string()),
    }
}

/// Reads `allotments.duplicatePolicy` and `confirmDuplicate` for one write.
/// Returns whether the uniqueness check is skipped and an error mapper that
/// tells the client whether a refused duplicate may be confirmed.
fn duplicate_policy(
    conn: &Connection,
    params: &Value,
    db_code: &'static str,
) -> Result<(bool, impl Fn(RosterError) -> HandlerErr), HandlerErr> {
    let confirm = get_opt_bool(params, "confirmDuplicate")?.unwrap_or(false);
    let policy = settings::allotment_settings(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .duplicate_policy;
    let overridable = policy == DuplicatePolicy::Confirm;
    let on_err = move |e: RosterError| {
        let mut he = roster_err(db_code)(e);
        if he.code == "duplicate_allotment" {
            if let Some(Value::Object(d)) = he.details.as_mut() {
                d.insert("overridable".into(), Value::Bool(overridable));
            }
        }
        he
    };
    Ok((overridable && confirm, on_err))
}

fn get_kind(params: &Value) -> Result<RosterKind, HandlerErr> {
    let raw = get_required_str(params, "kind")?;
    RosterKind::parse(&raw).ok_or_else(|| HandlerErr::bad_params(format!("unknown kind: {}", raw)))
}

fn load_allotment(conn: &Connection, caller: &Caller, params: &Value) -> Result<Allotment, HandlerErr> {
    let id = get_required_str(params, "allotmentId")?;
    roster::find(conn, caller.tenant(), &id)
        .map_err(HandlerErr::db("db_query_failed"))?
        .ok_or_else(|| HandlerErr::new("not_found", format!("allotment not found: {}", id)))
}

fn policy(conn: &Connection) -> BoundaryPolicy {
    settings::boundary_policy(conn).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "rewriter settings unreadable, using defaults");
        BoundaryPolicy::default()
    })
}

/// Timetable rewrite for one class, reported rather than propagated.
fn rewrite_class(
    conn: &Connection,
    caller: &Caller,
    class_name: &str,
    section: &str,
    change: TeacherChange<'_>,
) -> SyncOutcome {
    settle(
        "timetable rewrite",
        sync::propagate_teacher_change(
            conn,
            caller.tenant(),
            &caller.user_id,
            class_name,
            section,
            &change,
            policy(conn),
        ),
    )
}

fn group_step(step: &str, result: rusqlite::Result<usize>) -> SyncOutcome {
    settle(
        step,
        result
            .map(|n| SyncOutcome {
                groups_updated: n,
                ..SyncOutcome::clean()
            })
            .map_err(anyhow::Error::from),
    )
}

fn bind_group(conn: &Connection, caller: &Caller, a: &Allotment, drop_member: Option<&str>) -> SyncOutcome {
    let res = groups::assign_teacher(
        conn,
        caller.tenant(),
        &caller.user_id,
        a.detail(),
        &a.class_assigned,
        &a.section,
        Some(TeacherSlot {
            name: &a.name,
            id: a.user_id.as_deref(),
        }),
        |m| Some(m) != drop_member,
    );
    group_step("group update", res.map(|_| 1))
}

fn unbind_group(conn: &Connection, caller: &Caller, a: &Allotment) -> SyncOutcome {
    let res = groups::detach_teacher(
        conn,
        caller.tenant(),
        &caller.user_id,
        a.detail(),
        &a.class_assigned,
        &a.section,
        &a.name,
        a.user_id.as_deref(),
    );
    group_step("group update", res.map(usize::from))
}

fn student_membership(conn: &Connection, caller: &Caller, a: &Allotment, present: bool) -> SyncOutcome {
    let Some(user_id) = a.user_id.as_deref().filter(|_| a.is_linked()) else {
        return SyncOutcome::clean();
    };
    let res = groups::set_class_membership(
        conn,
        caller.tenant(),
        &caller.user_id,
        &a.class_assigned,
        &a.section,
        user_id,
        present,
    );
    group_step("group membership", res)
}

fn handle_allotments_list(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let caller = parse_caller(&req.params)?;
    require_reader(&caller)?;
    let kind = get_kind(&req.params)?;
    let (class_name, section) = get_class_section(&req.params)?;

    let list = || {
        roster::list_class(conn, kind, caller.tenant(), &class_name, &section).map_err(HandlerErr::db("db_query_failed"))
    };
    let mut rows = list()?;

    let heal_on_list = settings::allotment_settings(conn)
        .map(|s| s.heal_on_list)
        .unwrap_or(true);
    let mut heal = Value::Null;
    if heal_on_list && caller.is_staff() && rows.iter().any(|a| !a.is_linked()) {
        let pass = accounts::list(conn, caller.tenant(), None)
            .map_err(anyhow::Error::from)
            .and_then(|pool| linking::reconcile_rows(conn, &rows, &pool));
        match pass {
            Ok(report) => {
                if report.linked > 0 {
                    rows = list()?;
                }
                heal = json!(report);
            }
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), class = %class_name, "link repair on list failed");
                heal = json!({ "ok": false, "error": format!("{:#}", e) });
            }
        }
    }
    Ok(json!({ "allotments": rows, "heal": heal }))
}

fn handle_allotments_create(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let caller = parse_caller(&req.params)?;
    require_staff(&caller)?;
    let kind = get_kind(&req.params)?;
    let (class_assigned, section) = get_class_section(&req.params)?;
    let new = NewAllotment {
        kind,
        name: get_required_str(&req.params, "name")?,
        class_assigned,
        section,
        detail: get_required_str(&req.params, kind.detail_key())?,
        user_id: get_opt_str(&req.params, "userId"),
    };

    let (allow_duplicate, on_err) = duplicate_policy(conn, &req.params, "db_insert_failed")?;
    let allotment =
        roster::insert(conn, caller.tenant(), &caller.user_id, &new, allow_duplicate).map_err(on_err)?;
    tracing::info!(
        tenant = caller.tenant(),
        kind = ?kind,
        class = %allotment.class_assigned,
        section = %allotment.section,
        allotment = %allotment.id,
        "allotment created"
    );

    let mut sync = SyncOutcome::clean();
    match kind {
        RosterKind::Teacher => {
            sync.absorb(rewrite_class(
                conn,
                &caller,
                &allotment.class_assigned,
                &allotment.section,
                TeacherChange::new(allotment.detail(), None, Some(allotment.name.as_str())),
            ));
            sync.absorb(bind_group(conn, &caller, &allotment, None));
        }
        RosterKind::Student => sync.absorb(student_membership(conn, &caller, &allotment, true)),
    }
    Ok(json!({ "allotment": allotment, "sync": sync }))
}

fn handle_allotments_replace_teacher(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let caller = parse_caller(&req.params)?;
    require_staff(&caller)?;
    let before = load_allotment(conn, &caller, &req.params)?;
    if before.kind != RosterKind::Teacher {
        return Err(HandlerErr::bad_params("only teacher allotments can be replaced"));
    }
    let name = get_required_str(&req.params, "name")?;
    let user_id = get_opt_str(&req.params, "userId");

    let (allow_duplicate, on_err) = duplicate_policy(conn, &req.params, "db_update_failed")?;
    roster::update_person(
        conn,
        RosterKind::Teacher,
        caller.tenant(),
        &before.id,
        &name,
        user_id.as_deref(),
        allow_duplicate,
    )
    .map_err(on_err)?;
    let after = roster::get(conn, RosterKind::Teacher, caller.tenant(), &before.id)
        .map_err(HandlerErr::db("db_query_failed"))?
        .ok_or_else(|| HandlerErr::new("not_found", "allotment not found"))?;
    tracing::info!(
        tenant = caller.tenant(),
        allotment = %after.id,
        from = %before.name,
        to = %after.name,
        "teacher replaced"
    );

    let mut sync = rewrite_class(
        conn,
        &caller,
        &after.class_assigned,
        &after.section,
        TeacherChange::new(after.detail(), Some(before.name.as_str()), Some(after.name.as_str())),
    );
    let stale_member = before.user_id.as_deref().filter(|old| after.user_id.as_deref() != Some(*old));
    sync.absorb(bind_group(conn, &caller, &after, stale_member));
    Ok(json!({ "allotment": after, "sync": sync }))
}

fn handle_allotments_transfer(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let caller = parse_caller(&req.params)?;
    require_staff(&caller)?;
    let before = load_allotment(conn, &caller, &req.params)?;
    let (class_assigned, section) = get_class_section(&req.params)?;

    let (allow_duplicate, on_err) = duplicate_policy(conn, &req.params, "db_update_failed")?;
    roster::update_placement(
        conn,
        before.kind,
        caller.tenant(),
        &before.id,
        &class_assigned,
        &section,
        allow_duplicate,
    )
    .map_err(on_err)?;
    let after = roster::get(conn, before.kind, caller.tenant(), &before.id)
        .map_err(HandlerErr::db("db_query_failed"))?
        .ok_or_else(|| HandlerErr::new("not_found", "allotment not found"))?;
    tracing::info!(
        tenant = caller.tenant(),
        allotment = %after.id,
        from = %format!("{}-{}", before.class_assigned, before.section),
        to = %format!("{}-{}", after.class_assigned, after.section),
        "allotment transferred"
    );

    let mut sync = SyncOutcome::clean();
    match after.kind {
        RosterKind::Teacher => {
            sync.absorb(rewrite_class(
                conn,
                &caller,
                &before.class_assigned,
                &before.section,
                TeacherChange::new(before.detail(), Some(before.name.as_str()), None),
            ));
            sync.absorb(rewrite_class(
                conn,
                &caller,
                &after.class_assigned,
                &after.section,
                TeacherChange::new(after.detail(), None, Some(after.name.as_str())),
            ));
            sync.absorb(unbind_group(conn, &caller, &before));
            sync.absorb(bind_group(conn, &caller, &after, None));
        }
        RosterKind::Student => {
            sync.absorb(student_membership(conn, &caller, &before, false));
            sync.absorb(student_membership(conn, &caller, &after, true));
        }
    }
    Ok(json!({ "allotment": after, "sync": sync }))
}

fn handle_allotments_delete(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let caller = parse_caller(&req.params)?;
    require_staff(&caller)?;
    let gone = load_allotment(conn, &caller, &req.params)?;
    roster::delete(conn, gone.kind, &gone.id).map_err(roster_err("db_delete_failed"))?;
    tracing::info!(tenant = caller.tenant(), allotment = %gone.id, kind = ?gone.kind, "allotment deleted");

    let sync = match gone.kind {
        RosterKind::Teacher => {
            let mut s = rewrite_class(
                conn,
                &caller,
                &gone.class_assigned,
                &gone.section,
                TeacherChange::new(gone.detail(), Some(gone.name.as_str()), None),
            );
            s.absorb(unbind_group(conn, &caller, &gone));
            s
        }
        RosterKind::Student => student_membership(conn, &caller, &gone, false),
    };
    Ok(json!({ "ok": true, "allotmentId": gone.id, "sync": sync }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "allotments.list" => Some(respond(req, handle_allotments_list(state, req))),
        "allotments.create" => Some(respond(req, handle_allotments_create(state, req))),
        "allotments.replaceTeacher" => Some(respond(req, handle_allotments_replace_teacher(state, req))),
        "allotments.transfer" => Some(respond(req, handle_allotments_transfer(state, req))),
        "allotments.delete" => Some(respond(req, handle_allotments_delete(state, req))),
        _ => None,
    }
}
