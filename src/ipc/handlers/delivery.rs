use crate::db;
use crate::dispatch;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::effective_now;
use crate::ipc::types::{AppState, Request};
use crate::mailer::SpoolTransport;
use rusqlite::Connection;
use serde_json::json;

const MAX_ATTEMPTS_KEY: &str = "delivery.max_attempts";

/// Request param wins, then the stored setting, then the built-in default.
fn effective_max_attempts(
    conn: &Connection,
    params: &serde_json::Value,
) -> anyhow::Result<i64> {
    if let Some(n) = params.get("maxAttempts").and_then(|v| v.as_i64()) {
        if n < 1 {
            anyhow::bail!("maxAttempts must be at least 1");
        }
        return Ok(n);
    }
    if let Some(v) = db::settings_get_json(conn, MAX_ATTEMPTS_KEY)? {
        if let Some(n) = v.as_i64() {
            return Ok(n);
        }
    }
    Ok(dispatch::DEFAULT_MAX_ATTEMPTS)
}

fn handle_run(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(workspace) = state.workspace.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let now = match effective_now(&req.params) {
        Ok(t) => t,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let max_attempts = match effective_max_attempts(conn, &req.params) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };

    let transport = SpoolTransport::new(workspace);
    match dispatch::run(conn, &transport, now, max_attempts) {
        Ok(outcome) => ok(&req.id, serde_json::to_value(outcome).unwrap_or(json!({}))),
        Err(e) => err(&req.id, "delivery_failed", e.to_string(), None),
    }
}

fn handle_configure(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(n) = req.params.get("maxAttempts").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing maxAttempts", None);
    };
    if n < 1 {
        return err(&req.id, "bad_params", "maxAttempts must be at least 1", None);
    }
    if let Err(e) = db::settings_set_json(conn, MAX_ATTEMPTS_KEY, &json!(n)) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "maxAttempts": n }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "delivery.run" => Some(handle_run(state, req)),
        "delivery.configure" => Some(handle_configure(state, req)),
        _ => None,
    }
}
