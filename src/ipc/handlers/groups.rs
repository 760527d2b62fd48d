use crate::classkey::{normalize_section, same_class};
use crate::groups;
use crate::ipc::helpers::{conn, get_opt_str, parse_caller, require_reader, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};

fn handle_groups_list(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let caller = parse_caller(&req.params)?;
    require_reader(&caller)?;
    let class_name = get_opt_str(&req.params, "classAssigned").or_else(|| get_opt_str(&req.params, "class"));
    let section = get_opt_str(&req.params, "section");

    let rows: Vec<groups::Group> = groups::list(conn, caller.tenant())
        .map_err(HandlerErr::db("db_query_failed"))?
        .into_iter()
        .filter(|g| class_name.as_deref().map_or(true, |c| same_class(&g.class_name, c)))
        .filter(|g| {
            section
                .as_deref()
                .map_or(true, |s| normalize_section(&g.section) == normalize_section(s))
        })
        .collect();
    Ok(json!({ "groups": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "groups.list" => Some(respond(req, handle_groups_list(state, req))),
        _ => None,
    }
}
