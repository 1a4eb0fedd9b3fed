use crate::ipc::error::{err, ok};
use crate::ipc::helpers::opt_str;
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_teaching_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "positions": [] }));
    };
    let mut stmt = match conn.prepare(
        "SELECT id, name, is_class_teacher FROM teaching_positions ORDER BY name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let is_ct: i64 = row.get(2)?;
            Ok(json!({ "id": id, "name": name, "isClassTeacher": is_ct != 0 }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(positions) => ok(&req.id, json!({ "positions": positions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_teaching_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(name) = opt_str(&req.params, "name") else {
        return err(&req.id, "bad_params", "missing name", None);
    };
    let is_ct = req
        .params
        .get("isClassTeacher")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let position_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO teaching_positions(id, name, is_class_teacher) VALUES(?, ?, ?)",
        (&position_id, &name, is_ct as i64),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "teaching_positions" })),
        );
    }
    ok(
        &req.id,
        json!({ "positionId": position_id, "name": name, "isClassTeacher": is_ct }),
    )
}

fn handle_teaching_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(position_id) = opt_str(&req.params, "positionId") else {
        return err(&req.id, "bad_params", "missing positionId", None);
    };

    if let Some(name) = opt_str(&req.params, "name") {
        if let Err(e) = conn.execute(
            "UPDATE teaching_positions SET name = ? WHERE id = ?",
            (&name, &position_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(is_ct) = req.params.get("isClassTeacher").and_then(|v| v.as_bool()) {
        if let Err(e) = conn.execute(
            "UPDATE teaching_positions SET is_class_teacher = ? WHERE id = ?",
            (is_ct as i64, &position_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    ok(&req.id, json!({ "positionId": position_id }))
}

fn handle_teaching_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(position_id) = opt_str(&req.params, "positionId") else {
        return err(&req.id, "bad_params", "missing positionId", None);
    };

    let in_use: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM account_teaching_positions WHERE position_id = ?
             UNION
             SELECT 1 FROM staff_profiles
             WHERE primary_position_kind = 'teaching' AND primary_position_id = ?
             LIMIT 1",
            [&position_id, &position_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if in_use.is_some() {
        return err(&req.id, "in_use", "position is still assigned to staff", None);
    }

    match conn.execute("DELETE FROM teaching_positions WHERE id = ?", [&position_id]) {
        Ok(0) => err(&req.id, "not_found", "position not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

fn handle_non_teaching_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "positions": [] }));
    };
    let mut stmt = match conn.prepare("SELECT id, name FROM non_teaching_positions ORDER BY name") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            Ok(json!({ "id": id, "name": name }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(positions) => ok(&req.id, json!({ "positions": positions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_non_teaching_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(name) = opt_str(&req.params, "name") else {
        return err(&req.id, "bad_params", "missing name", None);
    };

    let position_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO non_teaching_positions(id, name) VALUES(?, ?)",
        (&position_id, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "non_teaching_positions" })),
        );
    }
    ok(&req.id, json!({ "positionId": position_id, "name": name }))
}

fn handle_non_teaching_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(position_id) = opt_str(&req.params, "positionId") else {
        return err(&req.id, "bad_params", "missing positionId", None);
    };

    let in_use: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM account_non_teaching_positions WHERE position_id = ?
             UNION
             SELECT 1 FROM staff_profiles
             WHERE primary_position_kind = 'non_teaching' AND primary_position_id = ?
             LIMIT 1",
            [&position_id, &position_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if in_use.is_some() {
        return err(&req.id, "in_use", "position is still assigned to staff", None);
    }

    match conn.execute(
        "DELETE FROM non_teaching_positions WHERE id = ?",
        [&position_id],
    ) {
        Ok(0) => err(&req.id, "not_found", "position not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "positions.teaching.list" => Some(handle_teaching_list(state, req)),
        "positions.teaching.create" => Some(handle_teaching_create(state, req)),
        "positions.teaching.update" => Some(handle_teaching_update(state, req)),
        "positions.teaching.delete" => Some(handle_teaching_delete(state, req)),
        "positions.nonTeaching.list" => Some(handle_non_teaching_list(state, req)),
        "positions.nonTeaching.create" => Some(handle_non_teaching_create(state, req)),
        "positions.nonTeaching.delete" => Some(handle_non_teaching_delete(state, req)),
        _ => None,
    }
}
