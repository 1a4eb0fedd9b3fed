mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::path::Path;
use std::process::{ChildStdin, ChildStdout};
use test_support::{request_ok, spawn_sidecar, temp_dir};

fn get_str(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {}: {}", key, v))
        .to_string()
}

fn outbox_count(workspace: &Path) -> usize {
    match std::fs::read_dir(workspace.join("outbox")) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

fn seed_admin(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &Path,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let branch = request_ok(
        stdin,
        reader,
        "s2",
        "branches.create",
        json!({ "name": "Ikeja Campus" }),
    );
    let admin = request_ok(
        stdin,
        reader,
        "s3",
        "accounts.create",
        json!({
            "username": "admin",
            "email": "admin@school.test",
            "role": "branch_admin",
            "branchId": get_str(&branch, "branchId")
        }),
    );
    get_str(&admin, "accountId")
}

#[test]
fn scheduled_communication_waits_for_its_moment() {
    let workspace = temp_dir("schoolcomm-scheduled");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let admin_id = seed_admin(&mut stdin, &mut reader, &workspace);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "communications.create",
        json!({
            "senderAccountId": admin_id,
            "title": "Resumption notice",
            "body": "School resumes on the 9th.",
            "scheduledTime": "2026-03-09T07:00:00Z",
            "manualEmails": ["aunt@example.test"]
        }),
    );
    assert_eq!(created.get("sent").and_then(|v| v.as_bool()), Some(false));
    let comm_id = get_str(&created, "communicationId");

    // A pass before the scheduled moment does nothing.
    let early = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "delivery.run",
        json!({ "now": "2026-03-08T07:00:00Z" }),
    );
    assert_eq!(early.get("materialized").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(outbox_count(&workspace), 0);

    // At the moment itself it goes out.
    let on_time = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "delivery.run",
        json!({ "now": "2026-03-09T07:00:00Z" }),
    );
    assert_eq!(on_time.get("materialized").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(on_time.get("delivered").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(outbox_count(&workspace), 1);

    // Further passes are no-ops: nothing re-sent, no duplicate spool files.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "delivery.run",
        json!({ "now": "2026-03-10T07:00:00Z" }),
    );
    assert_eq!(again.get("materialized").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(again.get("attempted").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(outbox_count(&workspace), 1);

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "communications.get",
        json!({ "communicationId": comm_id }),
    );
    assert_eq!(fetched.get("sent").and_then(|v| v.as_bool()), Some(true));
}

#[test]
fn registered_addresses_never_reach_the_spool() {
    let workspace = temp_dir("schoolcomm-registered");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let admin_id = seed_admin(&mut stdin, &mut reader, &workspace);

    // admin@school.test belongs to a portal account; the copy typed into the
    // manual list must be folded back in-app instead of mailed.
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "communications.create",
        json!({
            "senderAccountId": admin_id,
            "title": "Fee reminder",
            "body": "Fees are due.",
            "manualEmails": ["Admin@School.Test"]
        }),
    );
    assert_eq!(created.get("sent").and_then(|v| v.as_bool()), Some(true));
    let delivery = created.get("delivery").expect("delivery outcome");
    assert_eq!(
        delivery.get("skippedRegistered").and_then(|v| v.as_u64()),
        Some(1)
    );
    assert_eq!(delivery.get("attempted").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(outbox_count(&workspace), 0);
}

#[test]
fn max_attempts_setting_round_trips() {
    let workspace = temp_dir("schoolcomm-max-attempts");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = seed_admin(&mut stdin, &mut reader, &workspace);

    let configured = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "delivery.configure",
        json!({ "maxAttempts": 2 }),
    );
    assert_eq!(configured.get("maxAttempts").and_then(|v| v.as_i64()), Some(2));

    // A plain run picks the stored value up without complaint.
    let outcome = request_ok(&mut stdin, &mut reader, "2", "delivery.run", json!({}));
    assert_eq!(outcome.get("materialized").and_then(|v| v.as_u64()), Some(0));
}
