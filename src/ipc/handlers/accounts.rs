use crate::directory::{PositionKind, Role};
use crate::ipc::error::{err, ok, validation_err};
use crate::ipc::helpers::{opt_str, str_list};
use crate::ipc::types::{AppState, Request};
use crate::mailer;
use crate::target::FieldError;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn field_error(field: &str, code: &str, message: &str) -> FieldError {
    FieldError {
        field: field.to_string(),
        code: code.to_string(),
        message: message.to_string(),
    }
}

fn row_exists(conn: &Connection, sql: &str, id: &str) -> rusqlite::Result<bool> {
    let hit: Option<i64> = conn.query_row(sql, [id], |r| r.get(0)).optional()?;
    Ok(hit.is_some())
}

/// Profile numbers come from the admissions office: short, no spaces,
/// letters/digits with - or / separators, e.g. "IKJ/23/0154".
fn valid_profile_no(s: &str) -> bool {
    let ok_chars = s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '/');
    (3..=20).contains(&s.len())
        && ok_chars
        && s.starts_with(|c: char| c.is_ascii_alphanumeric())
}

fn handle_accounts_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut fields = Vec::new();

    let username = opt_str(&req.params, "username");
    if username.is_none() {
        fields.push(field_error("username", "required", "username is required"));
    }
    let email = opt_str(&req.params, "email");
    match &email {
        None => fields.push(field_error("email", "required", "email is required")),
        Some(e) if !mailer::is_valid_email(e) => {
            fields.push(field_error("email", "invalid", "email address is malformed"))
        }
        Some(_) => {}
    }

    let role = match opt_str(&req.params, "role") {
        None => {
            fields.push(field_error("role", "required", "role is required"));
            None
        }
        Some(raw) => match Role::parse(&raw) {
            Some(r) => Some(r),
            None => {
                fields.push(field_error("role", "invalid_choice", "unknown role"));
                None
            }
        },
    };

    let branch_id = opt_str(&req.params, "branchId");
    if let Some(b) = &branch_id {
        match row_exists(conn, "SELECT 1 FROM branches WHERE id = ?", b) {
            Ok(true) => {}
            Ok(false) => fields.push(field_error("branchId", "not_found", "branch not found")),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let staff_type = opt_str(&req.params, "staffType");
    let teaching = str_list(&req.params, "teachingPositions");
    let non_teaching = str_list(&req.params, "nonTeachingPositions");

    if let Some(role) = role {
        // Branch is mandatory for everyone below superadmin.
        if role != Role::Superadmin && branch_id.is_none() {
            fields.push(field_error("branchId", "required", "branch is required"));
        }
        // Non-staff roles never carry staff attributes.
        if !role.is_staff_like()
            && (staff_type.is_some() || !teaching.is_empty() || !non_teaching.is_empty())
        {
            fields.push(field_error(
                "staffType",
                "not_permitted",
                "only staff-like roles carry staff type or positions",
            ));
        }
    }
    if let Some(st) = &staff_type {
        if crate::directory::StaffType::parse(st).is_none() {
            fields.push(field_error("staffType", "invalid_choice", "unknown staff type"));
        }
    }
    for p in &teaching {
        match row_exists(conn, "SELECT 1 FROM teaching_positions WHERE id = ?", p) {
            Ok(true) => {}
            Ok(false) => {
                fields.push(field_error("teachingPositions", "not_found", "unknown position"))
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    for p in &non_teaching {
        match row_exists(conn, "SELECT 1 FROM non_teaching_positions WHERE id = ?", p) {
            Ok(true) => {}
            Ok(false) => fields.push(field_error(
                "nonTeachingPositions",
                "not_found",
                "unknown position",
            )),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    if !fields.is_empty() {
        return validation_err(&req.id, &fields);
    }
    let (Some(username), Some(email), Some(role)) = (username, email, role) else {
        return err(&req.id, "bad_params", "missing required fields", None);
    };

    let account_id = Uuid::new_v4().to_string();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO accounts(id, username, email, role, branch_id, staff_type, is_active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &account_id,
            &username,
            &email,
            role.as_str(),
            &branch_id,
            &staff_type,
            Utc::now().to_rfc3339(),
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "accounts" })),
        );
    }
    for p in &teaching {
        if let Err(e) = tx.execute(
            "INSERT INTO account_teaching_positions(account_id, position_id) VALUES(?, ?)",
            (&account_id, p),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    for p in &non_teaching {
        if let Err(e) = tx.execute(
            "INSERT INTO account_non_teaching_positions(account_id, position_id) VALUES(?, ?)",
            (&account_id, p),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "accountId": account_id, "username": username, "role": role.as_str() }),
    )
}

fn handle_accounts_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(account_id) = opt_str(&req.params, "accountId") else {
        return err(&req.id, "bad_params", "missing accountId", None);
    };

    let role_raw: Option<String> = match conn
        .query_row(
            "SELECT role FROM accounts WHERE id = ?",
            [&account_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(role_raw) = role_raw else {
        return err(&req.id, "not_found", "account not found", None);
    };
    let staff_like = Role::parse(&role_raw).map(|r| r.is_staff_like()).unwrap_or(false);

    let mut fields = Vec::new();
    let email = opt_str(&req.params, "email");
    if let Some(e) = &email {
        if !mailer::is_valid_email(e) {
            fields.push(field_error("email", "invalid", "email address is malformed"));
        }
    }
    let staff_type = opt_str(&req.params, "staffType");
    if let Some(st) = &staff_type {
        if crate::directory::StaffType::parse(st).is_none() {
            fields.push(field_error("staffType", "invalid_choice", "unknown staff type"));
        }
    }
    let has_teaching = req.params.get("teachingPositions").is_some();
    let has_non_teaching = req.params.get("nonTeachingPositions").is_some();
    if !staff_like && (staff_type.is_some() || has_teaching || has_non_teaching) {
        fields.push(field_error(
            "staffType",
            "not_permitted",
            "only staff-like roles carry staff type or positions",
        ));
    }
    if !fields.is_empty() {
        return validation_err(&req.id, &fields);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let updates: [(&str, Option<String>); 4] = [
        ("username", opt_str(&req.params, "username")),
        ("email", email),
        ("branch_id", opt_str(&req.params, "branchId")),
        ("staff_type", staff_type),
    ];
    for (column, value) in updates {
        if let Some(v) = value {
            let sql = format!("UPDATE accounts SET {} = ? WHERE id = ?", column);
            if let Err(e) = tx.execute(&sql, (&v, &account_id)) {
                let _ = tx.rollback();
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        }
    }
    if let Some(active) = req.params.get("isActive").and_then(|v| v.as_bool()) {
        if let Err(e) = tx.execute(
            "UPDATE accounts SET is_active = ? WHERE id = ?",
            (active as i64, &account_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    // Position sets are replaced wholesale when supplied.
    if has_teaching {
        if let Err(e) = tx.execute(
            "DELETE FROM account_teaching_positions WHERE account_id = ?",
            [&account_id],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        for p in str_list(&req.params, "teachingPositions") {
            if let Err(e) = tx.execute(
                "INSERT INTO account_teaching_positions(account_id, position_id) VALUES(?, ?)",
                (&account_id, &p),
            ) {
                let _ = tx.rollback();
                return err(&req.id, "db_insert_failed", e.to_string(), None);
            }
        }
    }
    if has_non_teaching {
        if let Err(e) = tx.execute(
            "DELETE FROM account_non_teaching_positions WHERE account_id = ?",
            [&account_id],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        for p in str_list(&req.params, "nonTeachingPositions") {
            if let Err(e) = tx.execute(
                "INSERT INTO account_non_teaching_positions(account_id, position_id) VALUES(?, ?)",
                (&account_id, &p),
            ) {
                let _ = tx.rollback();
                return err(&req.id, "db_insert_failed", e.to_string(), None);
            }
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "accountId": account_id }))
}

fn handle_accounts_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "accounts": [] }));
    };

    let mut sql = String::from(
        "SELECT id, username, email, role, branch_id, staff_type, is_active
         FROM accounts WHERE 1=1",
    );
    let mut params: Vec<String> = Vec::new();
    if let Some(branch) = opt_str(&req.params, "branchId") {
        sql.push_str(" AND branch_id = ?");
        params.push(branch);
    }
    if let Some(role) = opt_str(&req.params, "role") {
        sql.push_str(" AND role = ?");
        params.push(role);
    }
    if let Some(search) = opt_str(&req.params, "search") {
        sql.push_str(" AND (username LIKE ? OR email LIKE ?)");
        let pattern = format!("%{}%", search);
        params.push(pattern.clone());
        params.push(pattern);
    }
    sql.push_str(" ORDER BY username COLLATE NOCASE");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), |row| {
            let id: String = row.get(0)?;
            let username: String = row.get(1)?;
            let email: String = row.get(2)?;
            let role: String = row.get(3)?;
            let branch_id: Option<String> = row.get(4)?;
            let staff_type: Option<String> = row.get(5)?;
            let is_active: i64 = row.get(6)?;
            Ok(json!({
                "id": id,
                "username": username,
                "email": email,
                "role": role,
                "branchId": branch_id,
                "staffType": staff_type,
                "isActive": is_active != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(accounts) => ok(&req.id, json!({ "accounts": accounts })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_accounts_deactivate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(account_id) = opt_str(&req.params, "accountId") else {
        return err(&req.id, "bad_params", "missing accountId", None);
    };
    match conn.execute(
        "UPDATE accounts SET is_active = 0 WHERE id = ?",
        [&account_id],
    ) {
        Ok(0) => err(&req.id, "not_found", "account not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_staff_profile_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(account_id) = opt_str(&req.params, "accountId") else {
        return err(&req.id, "bad_params", "missing accountId", None);
    };

    let role_raw: Option<String> = match conn
        .query_row(
            "SELECT role FROM accounts WHERE id = ?",
            [&account_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(role_raw) = role_raw else {
        return err(&req.id, "not_found", "account not found", None);
    };
    if !Role::parse(&role_raw).map(|r| r.is_staff_like()).unwrap_or(false) {
        return err(&req.id, "bad_params", "account is not staff-like", None);
    }

    let mut fields = Vec::new();
    let managing_class = opt_str(&req.params, "managingClassId");
    let managing_arm = opt_str(&req.params, "managingClassArmId");
    if managing_arm.is_some() && managing_class.is_none() {
        fields.push(field_error(
            "managingClassArmId",
            "inconsistent",
            "an arm needs a class",
        ));
    }
    if let (Some(class), Some(arm)) = (&managing_class, &managing_arm) {
        let linked: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM class_class_arms WHERE class_id = ? AND arm_id = ?",
                [class, arm],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if linked.is_none() {
            fields.push(field_error(
                "managingClassArmId",
                "not_linked",
                "arm is not linked to that class",
            ));
        }
    }

    let primary_kind = opt_str(&req.params, "primaryPositionKind");
    let primary_id = opt_str(&req.params, "primaryPositionId");
    match (&primary_kind, &primary_id) {
        (None, None) => {}
        (Some(kind_raw), Some(pid)) => match PositionKind::parse(kind_raw) {
            None => fields.push(field_error(
                "primaryPositionKind",
                "invalid_choice",
                "unknown position kind",
            )),
            Some(PositionKind::Teaching) => {
                match row_exists(conn, "SELECT 1 FROM teaching_positions WHERE id = ?", pid) {
                    Ok(true) => {}
                    Ok(false) => fields.push(field_error(
                        "primaryPositionId",
                        "not_found",
                        "unknown teaching position",
                    )),
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                }
            }
            Some(PositionKind::NonTeaching) => {
                match row_exists(conn, "SELECT 1 FROM non_teaching_positions WHERE id = ?", pid) {
                    Ok(true) => {}
                    Ok(false) => fields.push(field_error(
                        "primaryPositionId",
                        "not_found",
                        "unknown non-teaching position",
                    )),
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                }
            }
        },
        _ => fields.push(field_error(
            "primaryPositionKind",
            "inconsistent",
            "primary position kind and id go together",
        )),
    }

    if !fields.is_empty() {
        return validation_err(&req.id, &fields);
    }

    if let Err(e) = conn.execute(
        "INSERT INTO staff_profiles(account_id, managing_class_id, managing_class_arm_id,
                                    primary_position_kind, primary_position_id)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(account_id) DO UPDATE SET
           managing_class_id = excluded.managing_class_id,
           managing_class_arm_id = excluded.managing_class_arm_id,
           primary_position_kind = excluded.primary_position_kind,
           primary_position_id = excluded.primary_position_id",
        (
            &account_id,
            &managing_class,
            &managing_arm,
            &primary_kind,
            &primary_id,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "accountId": account_id }))
}

fn handle_student_profile_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(account_id) = opt_str(&req.params, "accountId") else {
        return err(&req.id, "bad_params", "missing accountId", None);
    };

    let account: Option<(String, Option<String>)> = match conn
        .query_row(
            "SELECT role, branch_id FROM accounts WHERE id = ?",
            [&account_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((role_raw, branch_id)) = account else {
        return err(&req.id, "not_found", "account not found", None);
    };
    if Role::parse(&role_raw) != Some(Role::Student) {
        return err(&req.id, "bad_params", "account is not a student", None);
    }

    let mut fields = Vec::new();

    let profile_no = opt_str(&req.params, "profileNo");
    match &profile_no {
        None => fields.push(field_error("profileNo", "required", "profile number is required")),
        Some(no) if !valid_profile_no(no) => fields.push(field_error(
            "profileNo",
            "invalid_format",
            "profile number must be 3-20 letters, digits, - or /",
        )),
        Some(no) => {
            // Unique within the student's branch.
            let dup: Option<i64> = match conn
                .query_row(
                    "SELECT 1 FROM student_profiles sp
                     JOIN accounts a ON a.id = sp.account_id
                     WHERE sp.profile_no = ? AND a.branch_id IS ? AND sp.account_id <> ?",
                    (no, &branch_id, &account_id),
                    |r| r.get(0),
                )
                .optional()
            {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            if dup.is_some() {
                fields.push(field_error(
                    "profileNo",
                    "duplicate",
                    "profile number already used in this branch",
                ));
            }
        }
    }

    let class_id = opt_str(&req.params, "currentClassId");
    match &class_id {
        None => fields.push(field_error("currentClassId", "required", "class is required")),
        Some(c) => match row_exists(conn, "SELECT 1 FROM student_classes WHERE id = ?", c) {
            Ok(true) => {}
            Ok(false) => fields.push(field_error("currentClassId", "not_found", "unknown class")),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
    }
    let arm_id = opt_str(&req.params, "currentClassArmId");
    if let (Some(class), Some(arm)) = (&class_id, &arm_id) {
        let linked: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM class_class_arms WHERE class_id = ? AND arm_id = ?",
                [class, arm],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if linked.is_none() {
            fields.push(field_error(
                "currentClassArmId",
                "not_linked",
                "arm is not linked to that class",
            ));
        }
    }

    let parent_id = opt_str(&req.params, "parentAccountId");
    match &parent_id {
        None => fields.push(field_error(
            "parentAccountId",
            "required",
            "every student needs a parent account",
        )),
        Some(p) => {
            let parent_role: Option<String> = match conn
                .query_row("SELECT role FROM accounts WHERE id = ?", [p], |r| r.get(0))
                .optional()
            {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            if parent_role.as_deref() != Some("parent") {
                fields.push(field_error(
                    "parentAccountId",
                    "invalid",
                    "linked account is not a parent",
                ));
            }
        }
    }

    if !fields.is_empty() {
        return validation_err(&req.id, &fields);
    }

    if let Err(e) = conn.execute(
        "INSERT INTO student_profiles(account_id, profile_no, current_class_id,
                                      current_class_arm_id, parent_account_id)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(account_id) DO UPDATE SET
           profile_no = excluded.profile_no,
           current_class_id = excluded.current_class_id,
           current_class_arm_id = excluded.current_class_arm_id,
           parent_account_id = excluded.parent_account_id",
        (
            &account_id,
            &profile_no,
            &class_id,
            &arm_id,
            &parent_id,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "accountId": account_id }))
}

fn handle_parent_profile_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(account_id) = opt_str(&req.params, "accountId") else {
        return err(&req.id, "bad_params", "missing accountId", None);
    };

    let role_raw: Option<String> = match conn
        .query_row(
            "SELECT role FROM accounts WHERE id = ?",
            [&account_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(role_raw) = role_raw else {
        return err(&req.id, "not_found", "account not found", None);
    };
    if Role::parse(&role_raw) != Some(Role::Parent) {
        return err(&req.id, "bad_params", "account is not a parent", None);
    }

    if let Err(e) = conn.execute(
        "INSERT OR IGNORE INTO parent_profiles(account_id) VALUES(?)",
        [&account_id],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "accountId": account_id }))
}

fn handle_accounts_children(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "children": [] }));
    };
    let Some(parent_id) = opt_str(&req.params, "parentAccountId") else {
        return err(&req.id, "bad_params", "missing parentAccountId", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT a.id, a.username, sp.profile_no, sp.current_class_id, sp.current_class_arm_id
         FROM student_profiles sp
         JOIN accounts a ON a.id = sp.account_id
         WHERE sp.parent_account_id = ? AND a.is_active = 1
         ORDER BY a.username COLLATE NOCASE",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&parent_id], |row| {
            let id: String = row.get(0)?;
            let username: String = row.get(1)?;
            let profile_no: String = row.get(2)?;
            let class_id: String = row.get(3)?;
            let arm_id: Option<String> = row.get(4)?;
            Ok(json!({
                "id": id,
                "username": username,
                "profileNo": profile_no,
                "currentClassId": class_id,
                "currentClassArmId": arm_id
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(children) => ok(&req.id, json!({ "children": children })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_accounts_parent_of(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = opt_str(&req.params, "studentAccountId") else {
        return err(&req.id, "bad_params", "missing studentAccountId", None);
    };
    match crate::directory::parent_of_student(conn, &student_id) {
        Ok(parent) => ok(&req.id, json!({ "parentAccountId": parent })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "accounts.create" => Some(handle_accounts_create(state, req)),
        "accounts.update" => Some(handle_accounts_update(state, req)),
        "accounts.list" => Some(handle_accounts_list(state, req)),
        "accounts.deactivate" => Some(handle_accounts_deactivate(state, req)),
        "accounts.children" => Some(handle_accounts_children(state, req)),
        "accounts.parentOf" => Some(handle_accounts_parent_of(state, req)),
        "profiles.staff.upsert" => Some(handle_staff_profile_upsert(state, req)),
        "profiles.student.upsert" => Some(handle_student_profile_upsert(state, req)),
        "profiles.parent.upsert" => Some(handle_parent_profile_upsert(state, req)),
        _ => None,
    }
}
