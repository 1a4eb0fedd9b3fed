use crate::directory;
use crate::dispatch;
use crate::ipc::error::{err, ok, validation_err};
use crate::ipc::helpers::{effective_now, opt_str, str_list};
use crate::ipc::types::{AppState, Request};
use crate::mailer::{self, SpoolTransport};
use crate::target::{self, FieldError, TargetSpec};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const MESSAGE_TYPES: [&str; 2] = ["announcement", "message"];

fn field_error(field: &str, code: &str, message: &str) -> FieldError {
    FieldError {
        field: field.to_string(),
        code: code.to_string(),
        message: message.to_string(),
    }
}

struct ParsedAttachment {
    file_name: String,
    path: String,
    sha256: String,
}

/// Reads and digests every attachment up front. A file that cannot be read
/// fails the whole request; nothing is persisted yet at that point.
fn parse_attachments(
    params: &serde_json::Value,
) -> Result<Vec<ParsedAttachment>, Vec<FieldError>> {
    let Some(raw) = params.get("attachments").and_then(|v| v.as_array()) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    let mut errors = Vec::new();
    for entry in raw {
        let file_name = entry.get("fileName").and_then(|v| v.as_str());
        let path = entry.get("path").and_then(|v| v.as_str());
        let (Some(file_name), Some(path)) = (file_name, path) else {
            errors.push(field_error(
                "attachments",
                "invalid",
                "each attachment needs fileName and path",
            ));
            continue;
        };
        match mailer::file_sha256(std::path::Path::new(path)) {
            Ok(sha256) => out.push(ParsedAttachment {
                file_name: file_name.to_string(),
                path: path.to_string(),
                sha256,
            }),
            Err(_) => errors.push(field_error(
                "attachments",
                "unreadable",
                "attachment file could not be read",
            )),
        }
    }
    if errors.is_empty() {
        Ok(out)
    } else {
        Err(errors)
    }
}

fn check_manual_recipients(
    conn: &Connection,
    manual_accounts: &[String],
    manual_emails: &[String],
) -> Result<Vec<FieldError>, rusqlite::Error> {
    let mut errors = Vec::new();
    for id in manual_accounts {
        let hit: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM accounts WHERE id = ? AND is_active = 1",
                [id],
                |r| r.get(0),
            )
            .optional()?;
        if hit.is_none() {
            errors.push(field_error(
                "manualAccountIds",
                "not_found",
                "unknown or inactive account in manual recipients",
            ));
        }
    }
    for email in manual_emails {
        if !mailer::is_valid_email(email) {
            errors.push(field_error(
                "manualEmails",
                "invalid",
                "malformed email address in manual recipients",
            ));
        }
    }
    Ok(errors)
}

fn store_target_group(
    tx: &Connection,
    communication_id: &str,
    spec: &TargetSpec,
) -> anyhow::Result<()> {
    tx.execute(
        "INSERT INTO communication_target_groups(
            communication_id, branch_id, role, staff_type,
            teaching_position_ids, non_teaching_position_ids,
            student_class_id, class_arm_id)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(communication_id) DO UPDATE SET
           branch_id = excluded.branch_id,
           role = excluded.role,
           staff_type = excluded.staff_type,
           teaching_position_ids = excluded.teaching_position_ids,
           non_teaching_position_ids = excluded.non_teaching_position_ids,
           student_class_id = excluded.student_class_id,
           class_arm_id = excluded.class_arm_id",
        (
            communication_id,
            &spec.branch,
            spec.role.map(|r| r.as_str()),
            spec.staff_type.map(|t| t.as_str()),
            serde_json::to_string(&spec.teaching_positions)?,
            serde_json::to_string(&spec.non_teaching_positions)?,
            &spec.student_class,
            &spec.class_arm,
        ),
    )?;
    Ok(())
}

/// Immediate sends run the whole pipeline inline so the caller gets the
/// delivery outcome in the response; scheduled ones wait for delivery.run.
fn send_now(
    state: &AppState,
    communication_id: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<dispatch::DispatchOutcome> {
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("no workspace selected"))?;
    let workspace = state
        .workspace
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("no workspace selected"))?;
    dispatch::send_communication(conn, communication_id, now)?;
    let transport = SpoolTransport::new(workspace);
    dispatch::dispatch_outstanding(
        conn,
        &transport,
        now,
        dispatch::DEFAULT_MAX_ATTEMPTS,
        Some(communication_id),
    )
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let now = match effective_now(&req.params) {
        Ok(t) => t,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    let Some(sender_id) = opt_str(&req.params, "senderAccountId") else {
        return err(&req.id, "bad_params", "missing senderAccountId", None);
    };
    let sender = match directory::load_sender(conn, &sender_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "sender_not_found", "sender is missing or inactive", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut fields = Vec::new();

    let message_type = opt_str(&req.params, "messageType").unwrap_or_else(|| "message".to_string());
    if !MESSAGE_TYPES.contains(&message_type.as_str()) {
        fields.push(field_error("messageType", "invalid_choice", "unknown message type"));
    }
    let title = opt_str(&req.params, "title").unwrap_or_default();
    let body = match opt_str(&req.params, "body") {
        Some(b) => b,
        None => {
            fields.push(field_error("body", "required", "body is required"));
            String::new()
        }
    };
    let is_draft = req
        .params
        .get("isDraft")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let scheduled_time = match opt_str(&req.params, "scheduledTime") {
        Some(raw) => match raw.parse::<DateTime<Utc>>() {
            Ok(t) => Some(t.to_rfc3339()),
            Err(_) => {
                fields.push(field_error(
                    "scheduledTime",
                    "invalid",
                    "scheduled time must be an RFC 3339 timestamp",
                ));
                None
            }
        },
        None => None,
    };

    let target_params = req.params.get("target").cloned().unwrap_or(json!({}));
    let spec = match TargetSpec::from_params(&target_params) {
        Ok(s) => s,
        Err(mut errs) => {
            fields.append(&mut errs);
            TargetSpec::default()
        }
    };
    let spec = match target::validate(conn, &sender, &spec) {
        Ok(s) => Some(s),
        Err(mut errs) => {
            fields.append(&mut errs);
            None
        }
    };

    let manual_accounts = str_list(&req.params, "manualAccountIds");
    let manual_emails = str_list(&req.params, "manualEmails");
    match check_manual_recipients(conn, &manual_accounts, &manual_emails) {
        Ok(mut errs) => fields.append(&mut errs),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let attachments = match parse_attachments(&req.params) {
        Ok(a) => a,
        Err(mut errs) => {
            fields.append(&mut errs);
            Vec::new()
        }
    };

    if !fields.is_empty() {
        return validation_err(&req.id, &fields);
    }
    let spec = spec.unwrap_or_default();

    let communication_id = Uuid::new_v4().to_string();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let inserted = tx.execute(
        "INSERT INTO communications(id, sender_account_id, message_type, title, body,
                                    is_draft, scheduled_time, manual_account_ids,
                                    manual_emails, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &communication_id,
            &sender_id,
            &message_type,
            &title,
            &body,
            is_draft as i64,
            &scheduled_time,
            serde_json::to_string(&manual_accounts).unwrap_or_else(|_| "[]".into()),
            serde_json::to_string(&manual_emails).unwrap_or_else(|_| "[]".into()),
            now.to_rfc3339(),
        ],
    );
    if let Err(e) = inserted {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "communications" })),
        );
    }
    if let Err(e) = store_target_group(&tx, &communication_id, &spec) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    for att in &attachments {
        if let Err(e) = tx.execute(
            "INSERT INTO communication_attachments(id, communication_id, file_name, path, sha256)
             VALUES(?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &communication_id,
                &att.file_name,
                &att.path,
                &att.sha256,
            ),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    // Undated non-drafts go out right away; scheduled ones wait for the
    // delivery pass.
    if !is_draft && scheduled_time.is_none() {
        match send_now(state, &communication_id, now) {
            Ok(outcome) => {
                return ok(
                    &req.id,
                    json!({
                        "communicationId": communication_id,
                        "sent": true,
                        "delivery": outcome
                    }),
                )
            }
            Err(e) => return err(&req.id, "send_failed", e.to_string(), None),
        }
    }

    ok(
        &req.id,
        json!({
            "communicationId": communication_id,
            "sent": false,
            "isDraft": is_draft,
            "scheduledTime": scheduled_time
        }),
    )
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let now = match effective_now(&req.params) {
        Ok(t) => t,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let Some(communication_id) = opt_str(&req.params, "communicationId") else {
        return err(&req.id, "bad_params", "missing communicationId", None);
    };

    let row: Option<(String, i64, i64)> = match conn
        .query_row(
            "SELECT sender_account_id, is_draft, sent FROM communications WHERE id = ?",
            [&communication_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((sender_id, is_draft, sent)) = row else {
        return err(&req.id, "not_found", "communication not found", None);
    };
    // Sent communications are frozen.
    if sent != 0 {
        return err(
            &req.id,
            "communication_sent",
            "a sent communication can no longer be edited",
            None,
        );
    }
    if is_draft == 0 {
        return err(
            &req.id,
            "not_a_draft",
            "only drafts can be edited; cancel the schedule first",
            None,
        );
    }

    let sender = match directory::load_sender(conn, &sender_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "sender_not_found", "sender is missing or inactive", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut fields = Vec::new();

    if let Some(mt) = opt_str(&req.params, "messageType") {
        if !MESSAGE_TYPES.contains(&mt.as_str()) {
            fields.push(field_error("messageType", "invalid_choice", "unknown message type"));
        }
    }
    let scheduled_time = match opt_str(&req.params, "scheduledTime") {
        Some(raw) => match raw.parse::<DateTime<Utc>>() {
            Ok(t) => Some(t.to_rfc3339()),
            Err(_) => {
                fields.push(field_error(
                    "scheduledTime",
                    "invalid",
                    "scheduled time must be an RFC 3339 timestamp",
                ));
                None
            }
        },
        None => None,
    };

    let new_spec = match req.params.get("target") {
        Some(raw) => match TargetSpec::from_params(raw) {
            Ok(s) => match target::validate(conn, &sender, &s) {
                Ok(v) => Some(v),
                Err(mut errs) => {
                    fields.append(&mut errs);
                    None
                }
            },
            Err(mut errs) => {
                fields.append(&mut errs);
                None
            }
        },
        None => None,
    };

    let manual_accounts = req
        .params
        .get("manualAccountIds")
        .map(|_| str_list(&req.params, "manualAccountIds"));
    let manual_emails = req
        .params
        .get("manualEmails")
        .map(|_| str_list(&req.params, "manualEmails"));
    match check_manual_recipients(
        conn,
        manual_accounts.as_deref().unwrap_or(&[]),
        manual_emails.as_deref().unwrap_or(&[]),
    ) {
        Ok(mut errs) => fields.append(&mut errs),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    if !fields.is_empty() {
        return validation_err(&req.id, &fields);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let scalar_updates: [(&str, Option<String>); 2] = [
        ("title", opt_str(&req.params, "title")),
        ("body", opt_str(&req.params, "body")),
    ];
    for (column, value) in scalar_updates {
        if let Some(v) = value {
            let sql = format!("UPDATE communications SET {} = ? WHERE id = ?", column);
            if let Err(e) = tx.execute(&sql, (&v, &communication_id)) {
                let _ = tx.rollback();
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        }
    }
    if let Some(mt) = opt_str(&req.params, "messageType") {
        if let Err(e) = tx.execute(
            "UPDATE communications SET message_type = ? WHERE id = ?",
            (&mt, &communication_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if req.params.get("scheduledTime").is_some() {
        if let Err(e) = tx.execute(
            "UPDATE communications SET scheduled_time = ? WHERE id = ?",
            (&scheduled_time, &communication_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(accounts) = &manual_accounts {
        if let Err(e) = tx.execute(
            "UPDATE communications SET manual_account_ids = ? WHERE id = ?",
            (
                serde_json::to_string(accounts).unwrap_or_else(|_| "[]".into()),
                &communication_id,
            ),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(emails) = &manual_emails {
        if let Err(e) = tx.execute(
            "UPDATE communications SET manual_emails = ? WHERE id = ?",
            (
                serde_json::to_string(emails).unwrap_or_else(|_| "[]".into()),
                &communication_id,
            ),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(spec) = &new_spec {
        if let Err(e) = store_target_group(&tx, &communication_id, spec) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    let publish = req
        .params
        .get("isDraft")
        .and_then(|v| v.as_bool())
        .map(|d| !d)
        .unwrap_or(false);
    if publish {
        if let Err(e) = tx.execute(
            "UPDATE communications SET is_draft = 0 WHERE id = ?",
            [&communication_id],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.execute(
        "UPDATE communications SET updated_at = ? WHERE id = ?",
        (now.to_rfc3339(), &communication_id),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    // Publishing an undated draft sends it on the spot.
    if publish {
        let scheduled: Option<String> = match conn.query_row(
            "SELECT scheduled_time FROM communications WHERE id = ?",
            [&communication_id],
            |r| r.get(0),
        ) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if scheduled.is_none() {
            match send_now(state, &communication_id, now) {
                Ok(outcome) => {
                    return ok(
                        &req.id,
                        json!({
                            "communicationId": communication_id,
                            "sent": true,
                            "delivery": outcome
                        }),
                    )
                }
                Err(e) => return err(&req.id, "send_failed", e.to_string(), None),
            }
        }
    }

    ok(&req.id, json!({ "communicationId": communication_id, "sent": false }))
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(communication_id) = opt_str(&req.params, "communicationId") else {
        return err(&req.id, "bad_params", "missing communicationId", None);
    };

    let row = conn
        .query_row(
            "SELECT sender_account_id, message_type, title, body, is_draft,
                    scheduled_time, sent, sent_at, resolved_account_ids,
                    manual_account_ids, manual_emails, created_at, updated_at
             FROM communications WHERE id = ?",
            [&communication_id],
            |r| {
                Ok(json!({
                    "id": communication_id,
                    "senderAccountId": r.get::<_, String>(0)?,
                    "messageType": r.get::<_, String>(1)?,
                    "title": r.get::<_, String>(2)?,
                    "body": r.get::<_, String>(3)?,
                    "isDraft": r.get::<_, i64>(4)? != 0,
                    "scheduledTime": r.get::<_, Option<String>>(5)?,
                    "sent": r.get::<_, i64>(6)? != 0,
                    "sentAt": r.get::<_, Option<String>>(7)?,
                    "resolvedAccountIds": serde_json::from_str::<serde_json::Value>(
                        &r.get::<_, String>(8)?).unwrap_or(json!([])),
                    "manualAccountIds": serde_json::from_str::<serde_json::Value>(
                        &r.get::<_, String>(9)?).unwrap_or(json!([])),
                    "manualEmails": serde_json::from_str::<serde_json::Value>(
                        &r.get::<_, String>(10)?).unwrap_or(json!([])),
                    "createdAt": r.get::<_, String>(11)?,
                    "updatedAt": r.get::<_, Option<String>>(12)?,
                }))
            },
        )
        .optional();
    let mut comm = match row {
        Ok(Some(c)) => c,
        Ok(None) => return err(&req.id, "not_found", "communication not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    match dispatch::load_target_group(conn, &communication_id) {
        Ok(Some(spec)) => comm["target"] = spec.to_json(),
        Ok(None) => comm["target"] = TargetSpec::default().to_json(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let mut stmt = match conn.prepare(
        "SELECT file_name, sha256 FROM communication_attachments
         WHERE communication_id = ? ORDER BY file_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let atts = stmt
        .query_map([&communication_id], |r| {
            Ok(json!({ "fileName": r.get::<_, String>(0)?, "sha256": r.get::<_, String>(1)? }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match atts {
        Ok(a) => comm["attachments"] = json!(a),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let counts = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(delivered), 0),
                COALESCE(SUM(is_read), 0)
         FROM communication_recipients WHERE communication_id = ?",
        [&communication_id],
        |r| {
            Ok(json!({
                "total": r.get::<_, i64>(0)?,
                "delivered": r.get::<_, i64>(1)?,
                "read": r.get::<_, i64>(2)?,
            }))
        },
    );
    match counts {
        Ok(c) => comm["recipientCounts"] = c,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    ok(&req.id, comm)
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "communications": [] }));
    };
    let Some(account_id) = opt_str(&req.params, "accountId") else {
        return err(&req.id, "bad_params", "missing accountId", None);
    };
    let mailbox = opt_str(&req.params, "box").unwrap_or_else(|| "inbox".to_string());

    let result = match mailbox.as_str() {
        "inbox" => {
            let mut stmt = match conn.prepare(
                "SELECT c.id, c.sender_account_id, c.message_type, c.title, c.sent_at,
                        r.is_read, r.read_at
                 FROM communication_recipients r
                 JOIN communications c ON c.id = r.communication_id
                 WHERE r.account_id = ? AND c.sent = 1
                 ORDER BY c.sent_at DESC",
            ) {
                Ok(s) => s,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            stmt.query_map([&account_id], |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "senderAccountId": r.get::<_, String>(1)?,
                    "messageType": r.get::<_, String>(2)?,
                    "title": r.get::<_, String>(3)?,
                    "sentAt": r.get::<_, Option<String>>(4)?,
                    "isRead": r.get::<_, i64>(5)? != 0,
                    "readAt": r.get::<_, Option<String>>(6)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        }
        "outbox" => {
            let mut stmt = match conn.prepare(
                "SELECT id, message_type, title, is_draft, scheduled_time, sent, sent_at, created_at
                 FROM communications
                 WHERE sender_account_id = ?
                 ORDER BY created_at DESC",
            ) {
                Ok(s) => s,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            stmt.query_map([&account_id], |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "messageType": r.get::<_, String>(1)?,
                    "title": r.get::<_, String>(2)?,
                    "isDraft": r.get::<_, i64>(3)? != 0,
                    "scheduledTime": r.get::<_, Option<String>>(4)?,
                    "sent": r.get::<_, i64>(5)? != 0,
                    "sentAt": r.get::<_, Option<String>>(6)?,
                    "createdAt": r.get::<_, String>(7)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        }
        _ => return err(&req.id, "bad_params", "box must be inbox or outbox", None),
    };

    match result {
        Ok(communications) => ok(&req.id, json!({ "communications": communications })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_delete_draft(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(communication_id) = opt_str(&req.params, "communicationId") else {
        return err(&req.id, "bad_params", "missing communicationId", None);
    };

    let is_draft: Option<i64> = match conn
        .query_row(
            "SELECT is_draft FROM communications WHERE id = ?",
            [&communication_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match is_draft {
        None => return err(&req.id, "not_found", "communication not found", None),
        Some(0) => return err(&req.id, "not_a_draft", "only drafts can be deleted", None),
        Some(_) => {}
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for sql in [
        "DELETE FROM communication_target_groups WHERE communication_id = ?",
        "DELETE FROM communication_attachments WHERE communication_id = ?",
        "DELETE FROM communications WHERE id = ?",
    ] {
        if let Err(e) = tx.execute(sql, [&communication_id]) {
            let _ = tx.rollback();
            return err(&req.id, "db_delete_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_mark_read(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let now = match effective_now(&req.params) {
        Ok(t) => t,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let Some(communication_id) = opt_str(&req.params, "communicationId") else {
        return err(&req.id, "bad_params", "missing communicationId", None);
    };
    let Some(account_id) = opt_str(&req.params, "accountId") else {
        return err(&req.id, "bad_params", "missing accountId", None);
    };

    // Idempotent; read_at keeps the first read time.
    match conn.execute(
        "UPDATE communication_recipients
         SET is_read = 1, read_at = COALESCE(read_at, ?)
         WHERE communication_id = ? AND account_id = ?",
        (now.to_rfc3339(), &communication_id, &account_id),
    ) {
        Ok(0) => err(&req.id, "not_found", "no such recipient", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

/// Comments and replies hang off sent communications only; a recipient or
/// the sender may write, everyone on the thread may read.
fn author_on_thread(
    conn: &Connection,
    communication_id: &str,
    account_id: &str,
) -> rusqlite::Result<bool> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM communications WHERE id = ? AND sender_account_id = ?
             UNION
             SELECT 1 FROM communication_recipients
             WHERE communication_id = ? AND account_id = ?
             LIMIT 1",
            [communication_id, account_id, communication_id, account_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

fn sent_communication_exists(
    conn: &Connection,
    communication_id: &str,
) -> rusqlite::Result<Option<bool>> {
    let sent: Option<i64> = conn
        .query_row(
            "SELECT sent FROM communications WHERE id = ?",
            [communication_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(sent.map(|s| s != 0))
}

fn handle_thread_add(state: &mut AppState, req: &Request, table: &str) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let now = match effective_now(&req.params) {
        Ok(t) => t,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let Some(communication_id) = opt_str(&req.params, "communicationId") else {
        return err(&req.id, "bad_params", "missing communicationId", None);
    };
    let Some(author_id) = opt_str(&req.params, "authorAccountId") else {
        return err(&req.id, "bad_params", "missing authorAccountId", None);
    };
    let Some(body) = opt_str(&req.params, "body") else {
        return err(&req.id, "bad_params", "missing body", None);
    };

    match sent_communication_exists(conn, &communication_id) {
        Ok(None) => return err(&req.id, "not_found", "communication not found", None),
        Ok(Some(false)) => {
            return err(&req.id, "not_sent", "cannot respond to an unsent communication", None)
        }
        Ok(Some(true)) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    match author_on_thread(conn, &communication_id, &author_id) {
        Ok(true) => {}
        Ok(false) => {
            return err(&req.id, "not_permitted", "author is not on this thread", None)
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let entry_id = Uuid::new_v4().to_string();
    let result = if table == "message_replies" {
        let attachments = str_list(&req.params, "attachments");
        conn.execute(
            "INSERT INTO message_replies(id, communication_id, author_account_id, body,
                                         attachments, created_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                &entry_id,
                &communication_id,
                &author_id,
                &body,
                serde_json::to_string(&attachments).unwrap_or_else(|_| "[]".into()),
                now.to_rfc3339(),
            ),
        )
    } else {
        conn.execute(
            "INSERT INTO communication_comments(id, communication_id, author_account_id, body, created_at)
             VALUES(?, ?, ?, ?, ?)",
            (
                &entry_id,
                &communication_id,
                &author_id,
                &body,
                now.to_rfc3339(),
            ),
        )
    };
    match result {
        Ok(_) => ok(&req.id, json!({ "id": entry_id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_thread_list(state: &mut AppState, req: &Request, table: &str) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(communication_id) = opt_str(&req.params, "communicationId") else {
        return err(&req.id, "bad_params", "missing communicationId", None);
    };

    let key = if table == "message_replies" {
        "replies"
    } else {
        "comments"
    };
    let sql = if table == "message_replies" {
        "SELECT m.id, m.author_account_id, a.username, m.body, m.attachments, m.created_at
         FROM message_replies m
         JOIN accounts a ON a.id = m.author_account_id
         WHERE m.communication_id = ?
         ORDER BY m.created_at"
    } else {
        "SELECT m.id, m.author_account_id, a.username, m.body, NULL, m.created_at
         FROM communication_comments m
         JOIN accounts a ON a.id = m.author_account_id
         WHERE m.communication_id = ?
         ORDER BY m.created_at"
    };

    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&communication_id], |r| {
            let mut entry = json!({
                "id": r.get::<_, String>(0)?,
                "authorAccountId": r.get::<_, String>(1)?,
                "authorUsername": r.get::<_, String>(2)?,
                "body": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(5)?,
            });
            if let Some(raw) = r.get::<_, Option<String>>(4)? {
                entry["attachments"] =
                    serde_json::from_str::<serde_json::Value>(&raw).unwrap_or(json!([]));
            }
            Ok(entry)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(entries) => ok(&req.id, json!({ key: entries })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "communications.create" => Some(handle_create(state, req)),
        "communications.update" => Some(handle_update(state, req)),
        "communications.get" => Some(handle_get(state, req)),
        "communications.list" => Some(handle_list(state, req)),
        "communications.deleteDraft" => Some(handle_delete_draft(state, req)),
        "communications.markRead" => Some(handle_mark_read(state, req)),
        "comments.add" => Some(handle_thread_add(state, req, "communication_comments")),
        "comments.list" => Some(handle_thread_list(state, req, "communication_comments")),
        "replies.add" => Some(handle_thread_add(state, req, "message_replies")),
        "replies.list" => Some(handle_thread_list(state, req, "message_replies")),
        _ => None,
    }
}
