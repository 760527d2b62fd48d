use crate::accounts;
use crate::classkey::{normalize_section, same_class};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::tenancy::{Caller, Role};
use rusqlite::Connection;
use serde_json::Value;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    /// Adapter for `map_err` on store calls.
    pub fn db(code: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
        move |e| HandlerErr::new(code, e.to_string())
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn respond(req: &Request, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_opt_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn get_opt_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn get_opt_usize(params: &Value, key: &str, min: usize, max: usize) -> Result<Option<usize>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let n = v
                .as_u64()
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a non-negative integer", key)))?
                as usize;
            if !(min..=max).contains(&n) {
                return Err(HandlerErr::bad_params(format!("{} must be in {}..={}", key, min, max)));
            }
            Ok(Some(n))
        }
    }
}

/// `params.caller = {userId, role, institutionId?, name?}`.
pub fn parse_caller(params: &Value) -> Result<Caller, HandlerErr> {
    let Some(raw) = params.get("caller").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("missing caller"));
    };
    let user_id = get_required_str(raw, "userId").map_err(|_| HandlerErr::bad_params("missing caller.userId"))?;
    let role_raw = get_required_str(raw, "role").map_err(|_| HandlerErr::bad_params("missing caller.role"))?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown caller.role: {}", role_raw)))?;
    Ok(Caller {
        user_id,
        role,
        institution_id: get_opt_str(raw, "institutionId"),
        name: get_opt_str(raw, "name"),
    })
}

pub fn require_staff(caller: &Caller) -> Result<(), HandlerErr> {
    if caller.is_staff() {
        return Ok(());
    }
    Err(HandlerErr::new(
        "forbidden",
        format!("{} accounts cannot change rosters or timetables", caller.role.as_str()),
    ))
}

/// Rosters, groups and other classes' timetables are closed to students.
pub fn require_reader(caller: &Caller) -> Result<(), HandlerErr> {
    if caller.role == Role::Student {
        return Err(HandlerErr::new("forbidden", "students may only read their own class timetable"));
    }
    Ok(())
}

/// Students may read only the class their account is registered in.
pub fn require_class_access(
    conn: &Connection,
    caller: &Caller,
    class_name: &str,
    section: &str,
) -> Result<(), HandlerErr> {
    if caller.role != Role::Student {
        return Ok(());
    }
    let account = accounts::get(conn, &caller.user_id).map_err(HandlerErr::db("db_query_failed"))?;
    let own_class = account.as_ref().is_some_and(|a| {
        a.institution_id == caller.tenant()
            && a.class_name.as_deref().is_some_and(|c| same_class(c, class_name))
            && a
                .section
                .as_deref()
                .is_some_and(|s| normalize_section(s) == normalize_section(section))
    });
    if own_class {
        Ok(())
    } else {
        Err(HandlerErr::new("forbidden", "students may only read their own class timetable"))
    }
}

/// Required `classAssigned` + `section`; `class` is accepted as an alias.
pub fn get_class_section(params: &Value) -> Result<(String, String), HandlerErr> {
    let class_name = get_opt_str(params, "classAssigned")
        .or_else(|| get_opt_str(params, "class"))
        .ok_or_else(|| HandlerErr::bad_params("missing classAssigned"))?;
    let section = get_required_str(params, "section")?;
    Ok((class_name, section))
}
