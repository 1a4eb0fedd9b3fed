use crate::ipc::error::{err, ok};
use crate::ipc::helpers::opt_str;
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_branches_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "branches": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           b.id,
           b.name,
           b.address,
           (SELECT COUNT(*) FROM accounts a WHERE a.branch_id = b.id) AS account_count
         FROM branches b
         ORDER BY b.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let address: Option<String> = row.get(2)?;
            let account_count: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "address": address,
                "accountCount": account_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(branches) => ok(&req.id, json!({ "branches": branches })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_branches_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(name) = opt_str(&req.params, "name") else {
        return err(&req.id, "bad_params", "missing name", None);
    };
    let address = opt_str(&req.params, "address");

    let branch_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO branches(id, name, address) VALUES(?, ?, ?)",
        (&branch_id, &name, &address),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "branches" })),
        );
    }

    ok(&req.id, json!({ "branchId": branch_id, "name": name }))
}

fn handle_branches_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(branch_id) = opt_str(&req.params, "branchId") else {
        return err(&req.id, "bad_params", "missing branchId", None);
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM branches WHERE id = ?", [&branch_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "branch not found", None);
    }

    if let Some(name) = opt_str(&req.params, "name") {
        if let Err(e) = conn.execute(
            "UPDATE branches SET name = ? WHERE id = ?",
            (&name, &branch_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(address) = opt_str(&req.params, "address") {
        if let Err(e) = conn.execute(
            "UPDATE branches SET address = ? WHERE id = ?",
            (&address, &branch_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "branchId": branch_id }))
}

fn handle_branches_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(branch_id) = opt_str(&req.params, "branchId") else {
        return err(&req.id, "bad_params", "missing branchId", None);
    };

    let in_use: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM accounts WHERE branch_id = ? LIMIT 1",
            [&branch_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if in_use.is_some() {
        return err(
            &req.id,
            "in_use",
            "branch still has accounts; move or deactivate them first",
            None,
        );
    }

    match conn.execute("DELETE FROM branches WHERE id = ?", [&branch_id]) {
        Ok(0) => err(&req.id, "not_found", "branch not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "branches.list" => Some(handle_branches_list(state, req)),
        "branches.create" => Some(handle_branches_create(state, req)),
        "branches.update" => Some(handle_branches_update(state, req)),
        "branches.delete" => Some(handle_branches_delete(state, req)),
        _ => None,
    }
}
