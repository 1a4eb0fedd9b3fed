use crate::directory;
use crate::ipc::error::{err, ok, validation_err};
use crate::ipc::helpers::opt_str;
use crate::ipc::types::{AppState, Request};
use crate::resolve;
use crate::target::{self, TargetSpec};
use serde_json::json;

/// Dry run of the resolver: same validation and visibility rules as a real
/// send, nothing persisted.
fn handle_preview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(sender_id) = opt_str(&req.params, "senderAccountId") else {
        return err(&req.id, "bad_params", "missing senderAccountId", None);
    };
    let sender = match directory::load_sender(conn, &sender_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "sender_not_found", "sender is missing or inactive", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let target_params = req.params.get("target").cloned().unwrap_or(json!({}));
    let spec = match TargetSpec::from_params(&target_params) {
        Ok(s) => s,
        Err(errs) => return validation_err(&req.id, &errs),
    };
    let spec = match target::validate(conn, &sender, &spec) {
        Ok(s) => s,
        Err(errs) => return validation_err(&req.id, &errs),
    };

    let search = opt_str(&req.params, "search");
    match resolve::resolve(conn, &sender, &spec, search.as_deref()) {
        Ok(accounts) => ok(
            &req.id,
            json!({
                "count": accounts.len(),
                "accounts": accounts,
                "target": spec.to_json()
            }),
        ),
        Err(e) => err(&req.id, "resolve_failed", e.to_string(), None),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(communication_id) = opt_str(&req.params, "communicationId") else {
        return err(&req.id, "bad_params", "missing communicationId", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT r.account_id, a.username, r.email, r.delivered, r.delivered_at,
                r.attempts, r.last_error, r.is_read, r.read_at
         FROM communication_recipients r
         LEFT JOIN accounts a ON a.id = r.account_id
         WHERE r.communication_id = ?
         ORDER BY a.username COLLATE NOCASE, r.email",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&communication_id], |r| {
            Ok(json!({
                "accountId": r.get::<_, Option<String>>(0)?,
                "username": r.get::<_, Option<String>>(1)?,
                "email": r.get::<_, Option<String>>(2)?,
                "delivered": r.get::<_, i64>(3)? != 0,
                "deliveredAt": r.get::<_, Option<String>>(4)?,
                "attempts": r.get::<_, i64>(5)?,
                "lastError": r.get::<_, Option<String>>(6)?,
                "isRead": r.get::<_, i64>(7)? != 0,
                "readAt": r.get::<_, Option<String>>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(recipients) => ok(&req.id, json!({ "recipients": recipients })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "recipients.preview" => Some(handle_preview(state, req)),
        "recipients.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
