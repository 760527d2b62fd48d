use crate::accounts::{self, AccountError, AccountInput, MAX_BATCH};
use crate::ipc::helpers::{conn, get_opt_str, parse_caller, require_reader, require_staff, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::tenancy::Role;
use serde_json::{json, Value};

fn account_err(e: AccountError) -> HandlerErr {
    match e {
        AccountError::Validation(m) => HandlerErr::bad_params(m),
        AccountError::ForeignAccount(_) => HandlerErr::new("forbidden", e.to_string()),
        AccountError::Db(e) => HandlerErr::new("db_update_failed", e.to_string()),
    }
}

fn handle_accounts_upsert(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let caller = parse_caller(&req.params)?;
    require_staff(&caller)?;
    let Some(raw) = req.params.get("account") else {
        return Err(HandlerErr::bad_params("missing account"));
    };
    let input: AccountInput =
        serde_json::from_value(raw.clone()).map_err(|e| HandlerErr::bad_params(format!("invalid account: {}", e)))?;
    let account = accounts::upsert(conn, caller.tenant(), &input).map_err(account_err)?;
    tracing::info!(tenant = caller.tenant(), account = %account.id, "account saved");
    Ok(json!({ "account": account }))
}

fn handle_accounts_list(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let caller = parse_caller(&req.params)?;
    require_reader(&caller)?;
    let role = match get_opt_str(&req.params, "role") {
        None => None,
        Some(r) => Some(Role::parse(&r).ok_or_else(|| HandlerErr::bad_params(format!("unknown role: {}", r)))?),
    };
    let rows = accounts::list(conn, caller.tenant(), role).map_err(HandlerErr::db("db_query_failed"))?;
    Ok(json!({ "accounts": rows }))
}

fn handle_accounts_batch_create(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let caller = parse_caller(&req.params)?;
    require_staff(&caller)?;
    let Some(raw) = req.params.get("accounts").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("accounts must be an array"));
    };
    if raw.len() > MAX_BATCH {
        return Err(HandlerErr::bad_params(format!(
            "batch size limit exceeded: max {} per request",
            MAX_BATCH
        ))
        .with_details(json!({ "max": MAX_BATCH, "received": raw.len() })));
    }
    // A shape error in one entry fails only that entry.
    let mut inputs = Vec::with_capacity(raw.len());
    let mut shape_failures = Vec::new();
    for (index, v) in raw.iter().enumerate() {
        match serde_json::from_value::<AccountInput>(v.clone()) {
            Ok(input) => inputs.push((index, input)),
            Err(e) => shape_failures.push(json!({
                "index": index,
                "name": v.get("name").and_then(|n| n.as_str()).unwrap_or_default(),
                "error": e.to_string(),
            })),
        }
    }
    let batch: Vec<AccountInput> = inputs.iter().map(|(_, i)| i.clone()).collect();
    let outcome = if batch.is_empty() && !shape_failures.is_empty() {
        accounts::BatchOutcome::default()
    } else {
        accounts::batch_create(conn, caller.tenant(), &batch).map_err(account_err)?
    };

    let mut failed: Vec<Value> = outcome
        .failed
        .iter()
        .map(|f| {
            json!({
                "index": inputs.get(f.index).map(|(i, _)| *i).unwrap_or(f.index),
                "name": f.name,
                "error": f.error,
            })
        })
        .collect();
    failed.extend(shape_failures);
    tracing::info!(
        tenant = caller.tenant(),
        created = outcome.success.len(),
        failed = failed.len(),
        "batch account registration"
    );
    Ok(json!({ "success": outcome.success, "failed": failed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "accounts.upsert" => Some(respond(req, handle_accounts_upsert(state, req))),
        "accounts.list" => Some(respond(req, handle_accounts_list(state, req))),
        "accounts.batchCreate" => Some(respond(req, handle_accounts_batch_create(state, req))),
        _ => None,
    }
}
