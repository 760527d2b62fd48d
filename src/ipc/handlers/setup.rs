use crate::ipc::helpers::{conn, parse_caller, require_staff, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::settings::{self, SetupSection, UpdateError};
use serde_json::{json, Map, Value};

fn handle_setup_get(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    parse_caller(&req.params)?;
    let mut out = Map::new();
    for section in SetupSection::ALL {
        let v = settings::load_section(conn, section)
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
        out.insert(section.name().to_string(), v);
    }
    Ok(Value::Object(out))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let caller = parse_caller(&req.params)?;
    require_staff(&caller)?;
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing section"));
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return Err(HandlerErr::bad_params("unknown section"));
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    match settings::update_section(conn, section, patch_obj) {
        Ok(current) => Ok(json!({ "ok": true, "section": section.name(), "value": current })),
        Err(UpdateError::Invalid(msg)) => Err(HandlerErr::bad_params(msg)),
        Err(UpdateError::Db(e)) => Err(HandlerErr::new("db_update_failed", e.to_string())),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "setup.get" => Some(respond(req, handle_setup_get(state, req))),
        "setup.update" => Some(respond(req, handle_setup_update(state, req))),
        _ => None,
    }
}
