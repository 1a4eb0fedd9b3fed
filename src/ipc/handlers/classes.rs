use crate::ipc::error::{err, ok};
use crate::ipc::helpers::opt_str;
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           (SELECT COUNT(*) FROM student_profiles sp WHERE sp.current_class_id = c.id)
         FROM student_classes c
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let base = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let student_count: i64 = row.get(2)?;
            Ok((id, name, student_count))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let base = match base {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut arm_stmt = match conn.prepare(
        "SELECT a.id, a.name FROM class_arms a
         JOIN class_class_arms l ON l.arm_id = a.id
         WHERE l.class_id = ? ORDER BY a.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut classes = Vec::with_capacity(base.len());
    for (id, name, student_count) in base {
        let arms = arm_stmt
            .query_map([&id], |row| {
                let aid: String = row.get(0)?;
                let aname: String = row.get(1)?;
                Ok(json!({ "id": aid, "name": aname }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        let arms = match arms {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        classes.push(json!({
            "id": id,
            "name": name,
            "studentCount": student_count,
            "arms": arms
        }));
    }

    ok(&req.id, json!({ "classes": classes }))
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(name) = opt_str(&req.params, "name") else {
        return err(&req.id, "bad_params", "missing name", None);
    };

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO student_classes(id, name) VALUES(?, ?)",
        (&class_id, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "student_classes" })),
        );
    }
    ok(&req.id, json!({ "classId": class_id, "name": name }))
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(class_id) = opt_str(&req.params, "classId") else {
        return err(&req.id, "bad_params", "missing classId", None);
    };

    let in_use: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM student_profiles WHERE current_class_id = ?
             UNION
             SELECT 1 FROM staff_profiles WHERE managing_class_id = ?
             LIMIT 1",
            [&class_id, &class_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if in_use.is_some() {
        return err(&req.id, "in_use", "class still has students or staff", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM class_class_arms WHERE class_id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    let deleted = match tx.execute("DELETE FROM student_classes WHERE id = ?", [&class_id]) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(&req.id, "db_delete_failed", e.to_string(), None);
        }
    };
    if deleted == 0 {
        let _ = tx.rollback();
        return err(&req.id, "not_found", "class not found", None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_arms_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "arms": [] }));
    };
    let mut stmt = match conn.prepare("SELECT id, name FROM class_arms ORDER BY name") {
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
        Ok(arms) => ok(&req.id, json!({ "arms": arms })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_arms_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(name) = opt_str(&req.params, "name") else {
        return err(&req.id, "bad_params", "missing name", None);
    };

    let arm_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO class_arms(id, name) VALUES(?, ?)",
        (&arm_id, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "class_arms" })),
        );
    }
    ok(&req.id, json!({ "armId": arm_id, "name": name }))
}

fn handle_link_arm(state: &mut AppState, req: &Request, link: bool) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(class_id) = opt_str(&req.params, "classId") else {
        return err(&req.id, "bad_params", "missing classId", None);
    };
    let Some(arm_id) = opt_str(&req.params, "armId") else {
        return err(&req.id, "bad_params", "missing armId", None);
    };

    let res = if link {
        conn.execute(
            "INSERT OR IGNORE INTO class_class_arms(class_id, arm_id) VALUES(?, ?)",
            (&class_id, &arm_id),
        )
    } else {
        conn.execute(
            "DELETE FROM class_class_arms WHERE class_id = ? AND arm_id = ?",
            (&class_id, &arm_id),
        )
    };
    match res {
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        "classes.linkArm" => Some(handle_link_arm(state, req, true)),
        "classes.unlinkArm" => Some(handle_link_arm(state, req, false)),
        "arms.list" => Some(handle_arms_list(state, req)),
        "arms.create" => Some(handle_arms_create(state, req)),
        _ => None,
    }
}
