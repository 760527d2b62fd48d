use crate::ipc::helpers::{conn, get_opt_str, parse_caller, require_staff, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::linking::{self, LinkScope};
use serde_json::{json, Value};

fn handle_links_reconcile(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let caller = parse_caller(&req.params)?;
    require_staff(&caller)?;
    let scope = match get_opt_str(&req.params, "kind") {
        None => LinkScope::All,
        Some(k) => LinkScope::parse(&k).ok_or_else(|| HandlerErr::bad_params(format!("unknown kind: {}", k)))?,
    };
    let report = linking::reconcile_tenant(conn, caller.tenant(), scope)
        .map_err(|e| HandlerErr::new("db_update_failed", format!("{:#}", e)))?;
    Ok(json!(report))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "links.reconcile" => Some(respond(req, handle_links_reconcile(state, req))),
        _ => None,
    }
}
