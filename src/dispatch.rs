use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::directory::{self, Role, StaffType};
use crate::mailer::{Attachment, MailTransport, OutboundEmail};
use crate::resolve;
use crate::target::TargetSpec;

pub const DEFAULT_MAX_ATTEMPTS: i64 = 5;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub materialized: usize,
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    pub skipped_registered: usize,
    pub exhausted: usize,
}

/// One scheduler tick: freeze every due communication's recipient set, then
/// push outstanding external mail. Both halves tolerate per-item failure.
pub fn run(
    conn: &Connection,
    transport: &dyn MailTransport,
    now: DateTime<Utc>,
    max_attempts: i64,
) -> anyhow::Result<DispatchOutcome> {
    let materialized = materialize_due(conn, now)?;
    let mut outcome = dispatch_outstanding(conn, transport, now, max_attempts, None)?;
    outcome.materialized = materialized;
    info!(
        materialized = outcome.materialized,
        attempted = outcome.attempted,
        delivered = outcome.delivered,
        failed = outcome.failed,
        "delivery pass complete"
    );
    Ok(outcome)
}

/// Marks due communications sent, materializing their recipient rows. A
/// communication whose send transaction fails stays pending for the next
/// tick.
pub fn materialize_due(conn: &Connection, now: DateTime<Utc>) -> anyhow::Result<usize> {
    let mut stmt = conn.prepare(
        "SELECT id FROM communications
         WHERE is_draft = 0 AND sent = 0
           AND (scheduled_time IS NULL OR scheduled_time <= ?)",
    )?;
    let due = stmt
        .query_map([now.to_rfc3339()], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut count = 0;
    for id in due {
        match send_communication(conn, &id, now) {
            Ok(()) => count += 1,
            Err(e) => warn!(communication = %id, error = %e, "send failed; will retry"),
        }
    }
    Ok(count)
}

/// The send transition: resolve the target group, merge manual recipients,
/// materialize one recipient row per unique destination and mark the
/// communication sent. All of it commits or none of it does; after commit
/// the recipient set is frozen.
pub fn send_communication(
    conn: &Connection,
    communication_id: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let row = conn
        .query_row(
            "SELECT sender_account_id, is_draft, sent, manual_account_ids, manual_emails
             FROM communications WHERE id = ?",
            [communication_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;
    let Some((sender_id, is_draft, sent, manual_accounts_raw, manual_emails_raw)) = row else {
        anyhow::bail!("communication {} not found", communication_id);
    };
    if is_draft != 0 {
        anyhow::bail!("communication {} is a draft", communication_id);
    }
    if sent != 0 {
        anyhow::bail!("communication {} is already sent", communication_id);
    }

    let Some(sender) = directory::load_sender(conn, &sender_id)? else {
        anyhow::bail!("sender account {} is missing or inactive", sender_id);
    };

    let spec = load_target_group(conn, communication_id)?.unwrap_or_default();
    let resolved = resolve::resolve(conn, &sender, &spec, None)?;

    let manual_accounts: Vec<String> = serde_json::from_str(&manual_accounts_raw)?;
    let manual_emails: Vec<String> = serde_json::from_str(&manual_emails_raw)?;

    let mut account_ids: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for id in resolved
        .iter()
        .map(|r| r.id.clone())
        .chain(manual_accounts.into_iter())
    {
        if seen.insert(id.clone()) {
            account_ids.push(id);
        }
    }

    let mut emails: Vec<String> = Vec::new();
    let mut seen_emails = std::collections::HashSet::new();
    for e in manual_emails {
        if seen_emails.insert(e.to_lowercase()) {
            emails.push(e);
        }
    }

    let now_str = now.to_rfc3339();
    let tx = conn.unchecked_transaction()?;
    for account_id in &account_ids {
        // In-app recipients are delivered the moment the row exists.
        tx.execute(
            "INSERT INTO communication_recipients(id, communication_id, account_id, delivered, delivered_at)
             VALUES(?, ?, ?, 1, ?)",
            (
                Uuid::new_v4().to_string(),
                communication_id,
                account_id,
                &now_str,
            ),
        )?;
    }
    for email in &emails {
        tx.execute(
            "INSERT INTO communication_recipients(id, communication_id, email, delivered)
             VALUES(?, ?, ?, 0)",
            (Uuid::new_v4().to_string(), communication_id, email),
        )?;
    }
    tx.execute(
        "UPDATE communications SET sent = 1, sent_at = ?, resolved_account_ids = ? WHERE id = ?",
        (
            &now_str,
            serde_json::to_string(&resolved.iter().map(|r| r.id.as_str()).collect::<Vec<_>>())?,
            communication_id,
        ),
    )?;
    tx.commit()?;
    Ok(())
}

/// Pushes outbound mail for every undelivered external recipient, across
/// all sent communications or just one. One bad recipient never blocks the
/// batch; `delivered` rows are never re-sent.
pub fn dispatch_outstanding(
    conn: &Connection,
    transport: &dyn MailTransport,
    now: DateTime<Utc>,
    max_attempts: i64,
    only_communication: Option<&str>,
) -> anyhow::Result<DispatchOutcome> {
    let mut sql = String::from(
        "SELECT r.id, r.email, r.attempts, c.id, c.title, c.body
         FROM communication_recipients r
         JOIN communications c ON c.id = r.communication_id
         WHERE r.email IS NOT NULL AND r.delivered = 0 AND c.sent = 1",
    );
    let mut params: Vec<String> = Vec::new();
    if let Some(cid) = only_communication {
        sql.push_str(" AND c.id = ?");
        params.push(cid.to_string());
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut outcome = DispatchOutcome::default();
    let now_str = now.to_rfc3339();

    for (recipient_id, email, attempts, comm_id, title, body) in rows {
        if attempts >= max_attempts {
            outcome.exhausted += 1;
            continue;
        }

        // Registered addresses read the message in-app instead.
        if directory::account_with_email_exists(conn, &email)? {
            conn.execute(
                "UPDATE communication_recipients SET delivered = 1, delivered_at = ? WHERE id = ?",
                (&now_str, &recipient_id),
            )?;
            outcome.skipped_registered += 1;
            continue;
        }

        let attachments = load_attachments(conn, &comm_id)?;
        let mail = OutboundEmail {
            to: email.clone(),
            subject: subject_for(&title, &body),
            body,
            attachments,
        };

        outcome.attempted += 1;
        match transport.send(&mail) {
            Ok(()) => {
                conn.execute(
                    "UPDATE communication_recipients
                     SET delivered = 1, delivered_at = ?, last_error = NULL
                     WHERE id = ?",
                    (&now_str, &recipient_id),
                )?;
                outcome.delivered += 1;
            }
            Err(e) => {
                warn!(recipient = %email, communication = %comm_id, error = %e, "mail send failed");
                conn.execute(
                    "UPDATE communication_recipients
                     SET attempts = attempts + 1, last_error = ?
                     WHERE id = ?",
                    (e.to_string(), &recipient_id),
                )?;
                outcome.failed += 1;
            }
        }
    }
    Ok(outcome)
}

pub fn load_target_group(
    conn: &Connection,
    communication_id: &str,
) -> anyhow::Result<Option<TargetSpec>> {
    let row = conn
        .query_row(
            "SELECT branch_id, role, staff_type, teaching_position_ids,
                    non_teaching_position_ids, student_class_id, class_arm_id
             FROM communication_target_groups WHERE communication_id = ?",
            [communication_id],
            |r| {
                Ok((
                    r.get::<_, Option<String>>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, Option<String>>(5)?,
                    r.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .optional()?;
    let Some((branch, role, staff_type, teach_raw, non_teach_raw, class, arm)) = row else {
        return Ok(None);
    };
    Ok(Some(TargetSpec {
        branch,
        role: role.as_deref().and_then(Role::parse),
        staff_type: staff_type.as_deref().and_then(StaffType::parse),
        teaching_positions: serde_json::from_str(&teach_raw)?,
        non_teaching_positions: serde_json::from_str(&non_teach_raw)?,
        student_class: class,
        class_arm: arm,
    }))
}

fn load_attachments(conn: &Connection, communication_id: &str) -> anyhow::Result<Vec<Attachment>> {
    let mut stmt = conn.prepare(
        "SELECT file_name, path, sha256 FROM communication_attachments
         WHERE communication_id = ? ORDER BY file_name",
    )?;
    let atts = stmt
        .query_map([communication_id], |r| {
            Ok(Attachment {
                file_name: r.get(0)?,
                path: r.get(1)?,
                sha256: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(atts)
}

/// Subject is the title, or the head of the body when the title is blank.
pub fn subject_for(title: &str, body: &str) -> String {
    let title = title.trim();
    if !title.is_empty() {
        return title.to_string();
    }
    let body = body.trim();
    let mut cut = body.len();
    let mut count = 0;
    for (i, _) in body.char_indices() {
        if count == 60 {
            cut = i;
            break;
        }
        count += 1;
    }
    if cut < body.len() {
        format!("{}...", &body[..cut])
    } else {
        body.to_string()
    }
}
