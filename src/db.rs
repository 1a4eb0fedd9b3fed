use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("schoolcomm.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Creates the full schema idempotently. Split out from `open_db` so tests
/// can run against an in-memory connection.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS branches(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            address TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teaching_positions(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            is_class_teacher INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS non_teaching_positions(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_arms(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_class_arms(
            class_id TEXT NOT NULL,
            arm_id TEXT NOT NULL,
            PRIMARY KEY(class_id, arm_id),
            FOREIGN KEY(class_id) REFERENCES student_classes(id),
            FOREIGN KEY(arm_id) REFERENCES class_arms(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            role TEXT NOT NULL,
            branch_id TEXT,
            staff_type TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            FOREIGN KEY(branch_id) REFERENCES branches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_accounts_branch_role ON accounts(branch_id, role)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS account_teaching_positions(
            account_id TEXT NOT NULL,
            position_id TEXT NOT NULL,
            PRIMARY KEY(account_id, position_id),
            FOREIGN KEY(account_id) REFERENCES accounts(id),
            FOREIGN KEY(position_id) REFERENCES teaching_positions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS account_non_teaching_positions(
            account_id TEXT NOT NULL,
            position_id TEXT NOT NULL,
            PRIMARY KEY(account_id, position_id),
            FOREIGN KEY(account_id) REFERENCES accounts(id),
            FOREIGN KEY(position_id) REFERENCES non_teaching_positions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_atp_position ON account_teaching_positions(position_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_antp_position ON account_non_teaching_positions(position_id)",
        [],
    )?;

    // primary_position_kind + primary_position_id form a tagged reference into
    // teaching_positions or non_teaching_positions depending on the kind.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS staff_profiles(
            account_id TEXT PRIMARY KEY,
            managing_class_id TEXT,
            managing_class_arm_id TEXT,
            primary_position_kind TEXT,
            primary_position_id TEXT,
            FOREIGN KEY(account_id) REFERENCES accounts(id),
            FOREIGN KEY(managing_class_id) REFERENCES student_classes(id),
            FOREIGN KEY(managing_class_arm_id) REFERENCES class_arms(id),
            CHECK((primary_position_kind IS NULL) = (primary_position_id IS NULL))
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_profiles(
            account_id TEXT PRIMARY KEY,
            profile_no TEXT NOT NULL,
            current_class_id TEXT NOT NULL,
            current_class_arm_id TEXT,
            parent_account_id TEXT NOT NULL,
            FOREIGN KEY(account_id) REFERENCES accounts(id),
            FOREIGN KEY(current_class_id) REFERENCES student_classes(id),
            FOREIGN KEY(current_class_arm_id) REFERENCES class_arms(id),
            FOREIGN KEY(parent_account_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_profiles_class ON student_profiles(current_class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_profiles_parent ON student_profiles(parent_account_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS parent_profiles(
            account_id TEXT PRIMARY KEY,
            FOREIGN KEY(account_id) REFERENCES accounts(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS communications(
            id TEXT PRIMARY KEY,
            sender_account_id TEXT NOT NULL,
            message_type TEXT NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            is_draft INTEGER NOT NULL DEFAULT 0,
            scheduled_time TEXT,
            sent INTEGER NOT NULL DEFAULT 0,
            sent_at TEXT,
            resolved_account_ids TEXT NOT NULL DEFAULT '[]',
            manual_account_ids TEXT NOT NULL DEFAULT '[]',
            manual_emails TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(sender_account_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_communications_sender ON communications(sender_account_id)",
        [],
    )?;

    // Position id sets are stored as JSON lists; null scalars and empty lists
    // both mean "not filtered on this dimension".
    conn.execute(
        "CREATE TABLE IF NOT EXISTS communication_target_groups(
            communication_id TEXT PRIMARY KEY,
            branch_id TEXT,
            role TEXT,
            staff_type TEXT,
            teaching_position_ids TEXT NOT NULL DEFAULT '[]',
            non_teaching_position_ids TEXT NOT NULL DEFAULT '[]',
            student_class_id TEXT,
            class_arm_id TEXT,
            FOREIGN KEY(communication_id) REFERENCES communications(id),
            FOREIGN KEY(branch_id) REFERENCES branches(id)
        )",
        [],
    )?;

    // Exactly one of account_id/email per row.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS communication_recipients(
            id TEXT PRIMARY KEY,
            communication_id TEXT NOT NULL,
            account_id TEXT,
            email TEXT,
            delivered INTEGER NOT NULL DEFAULT 0,
            delivered_at TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            is_read INTEGER NOT NULL DEFAULT 0,
            read_at TEXT,
            FOREIGN KEY(communication_id) REFERENCES communications(id),
            FOREIGN KEY(account_id) REFERENCES accounts(id),
            UNIQUE(communication_id, account_id),
            UNIQUE(communication_id, email),
            CHECK((account_id IS NULL) <> (email IS NULL))
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_comm_recipients_comm ON communication_recipients(communication_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_comm_recipients_account ON communication_recipients(account_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS communication_attachments(
            id TEXT PRIMARY KEY,
            communication_id TEXT NOT NULL,
            file_name TEXT NOT NULL,
            path TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            FOREIGN KEY(communication_id) REFERENCES communications(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_comm_attachments_comm ON communication_attachments(communication_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS communication_comments(
            id TEXT PRIMARY KEY,
            communication_id TEXT NOT NULL,
            author_account_id TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(communication_id) REFERENCES communications(id),
            FOREIGN KEY(author_account_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS message_replies(
            id TEXT PRIMARY KEY,
            communication_id TEXT NOT NULL,
            author_account_id TEXT NOT NULL,
            body TEXT NOT NULL,
            attachments TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            FOREIGN KEY(communication_id) REFERENCES communications(id),
            FOREIGN KEY(author_account_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_comm_comments_comm ON communication_comments(communication_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_message_replies_comm ON message_replies(communication_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    // Existing workspaces may predate per-recipient retry tracking.
    ensure_recipients_retry_columns(conn)?;
    ensure_communications_updated_at(conn)?;

    Ok(())
}

fn ensure_recipients_retry_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "communication_recipients", "attempts")? {
        conn.execute(
            "ALTER TABLE communication_recipients ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !table_has_column(conn, "communication_recipients", "last_error")? {
        conn.execute(
            "ALTER TABLE communication_recipients ADD COLUMN last_error TEXT",
            [],
        )?;
    }
    Ok(())
}

fn ensure_communications_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "communications", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE communications ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    use rusqlite::OptionalExtension;
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
