mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{request_err, request_ok, spawn_sidecar, temp_dir};

fn get_str(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {}: {}", key, v))
        .to_string()
}

/// Workspace with one branch, an admin (sender) and a parent (recipient).
fn seed(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> (String, String, String) {
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
    let branch_id = get_str(&branch, "branchId");
    let admin = request_ok(
        stdin,
        reader,
        "s3",
        "accounts.create",
        json!({
            "username": "admin",
            "email": "admin@school.test",
            "role": "branch_admin",
            "branchId": branch_id.clone()
        }),
    );
    let parent = request_ok(
        stdin,
        reader,
        "s4",
        "accounts.create",
        json!({
            "username": "mama",
            "email": "mama@family.test",
            "role": "parent",
            "branchId": branch_id.clone()
        }),
    );
    (
        get_str(&admin, "accountId"),
        get_str(&parent, "accountId"),
        branch_id,
    )
}

#[test]
fn draft_edit_publish_read_and_thread() {
    let workspace = temp_dir("schoolcomm-lifecycle");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (admin_id, parent_id, branch_id) = seed(&mut stdin, &mut reader, &workspace);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "communications.create",
        json!({
            "senderAccountId": admin_id.clone(),
            "messageType": "announcement",
            "title": "PTA meting",
            "body": "The meeting holds Friday.",
            "isDraft": true,
            "manualAccountIds": [parent_id.clone()],
            "manualEmails": ["aunt@example.test"]
        }),
    );
    assert_eq!(created.get("sent").and_then(|v| v.as_bool()), Some(false));
    let comm_id = get_str(&created, "communicationId");

    // Drafts stay editable; fix the typo.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "communications.update",
        json!({ "communicationId": comm_id.clone(), "title": "PTA meeting" }),
    );
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "communications.get",
        json!({ "communicationId": comm_id.clone() }),
    );
    assert_eq!(fetched.get("title").and_then(|v| v.as_str()), Some("PTA meeting"));
    assert_eq!(fetched.get("isDraft").and_then(|v| v.as_bool()), Some(true));

    // Drafts are invisible to inboxes.
    let inbox = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "communications.list",
        json!({ "accountId": parent_id.clone(), "box": "inbox" }),
    );
    assert_eq!(
        inbox.get("communications").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    // Publish: the undated draft goes out immediately.
    let published = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "communications.update",
        json!({ "communicationId": comm_id.clone(), "isDraft": false }),
    );
    assert_eq!(published.get("sent").and_then(|v| v.as_bool()), Some(true));
    let delivery = published.get("delivery").expect("delivery outcome");
    assert_eq!(delivery.get("delivered").and_then(|v| v.as_u64()), Some(1));

    // Frozen after send.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "communications.update",
        json!({ "communicationId": comm_id.clone(), "title": "Too late" }),
    );
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("communication_sent")
    );
    let error = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "communications.deleteDraft",
        json!({ "communicationId": comm_id.clone() }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("not_a_draft"));

    // Inbox and read receipt.
    let inbox = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "communications.list",
        json!({ "accountId": parent_id.clone(), "box": "inbox" }),
    );
    let items = inbox
        .get("communications")
        .and_then(|v| v.as_array())
        .expect("inbox array");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].get("isRead").and_then(|v| v.as_bool()), Some(false));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "communications.markRead",
        json!({ "communicationId": comm_id.clone(), "accountId": parent_id.clone() }),
    );
    let inbox = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "communications.list",
        json!({ "accountId": parent_id.clone(), "box": "inbox" }),
    );
    let items = inbox
        .get("communications")
        .and_then(|v| v.as_array())
        .expect("inbox array");
    assert_eq!(items[0].get("isRead").and_then(|v| v.as_bool()), Some(true));

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "communications.get",
        json!({ "communicationId": comm_id.clone() }),
    );
    let counts = fetched.get("recipientCounts").expect("recipient counts");
    assert_eq!(counts.get("total").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(counts.get("read").and_then(|v| v.as_u64()), Some(1));

    // Thread: the recipient comments, the sender replies.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "comments.add",
        json!({
            "communicationId": comm_id.clone(),
            "authorAccountId": parent_id.clone(),
            "body": "Will minutes be shared afterwards?"
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "replies.add",
        json!({
            "communicationId": comm_id.clone(),
            "authorAccountId": admin_id.clone(),
            "body": "Yes, within the week."
        }),
    );
    let comments = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "comments.list",
        json!({ "communicationId": comm_id.clone() }),
    );
    assert_eq!(
        comments.get("comments").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(1)
    );
    let replies = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "replies.list",
        json!({ "communicationId": comm_id.clone() }),
    );
    let replies = replies.get("replies").and_then(|v| v.as_array()).expect("replies");
    assert_eq!(replies.len(), 1);
    assert_eq!(
        replies[0].get("authorUsername").and_then(|v| v.as_str()),
        Some("admin")
    );

    // Outsiders stay off the thread.
    let outsider = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "accounts.create",
        json!({
            "username": "stranger",
            "email": "stranger@school.test",
            "role": "parent",
            "branchId": branch_id
        }),
    );
    let error = request_err(
        &mut stdin,
        &mut reader,
        "17",
        "comments.add",
        json!({
            "communicationId": comm_id,
            "authorAccountId": get_str(&outsider, "accountId"),
            "body": "Let me in"
        }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("not_permitted"));
}

#[test]
fn delete_draft_removes_it_from_the_outbox() {
    let workspace = temp_dir("schoolcomm-delete-draft");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (admin_id, _, _) = seed(&mut stdin, &mut reader, &workspace);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "communications.create",
        json!({
            "senderAccountId": admin_id.clone(),
            "title": "Never mind",
            "body": "Scratch that.",
            "isDraft": true
        }),
    );
    let comm_id = get_str(&created, "communicationId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "communications.deleteDraft",
        json!({ "communicationId": comm_id }),
    );
    let outbox = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "communications.list",
        json!({ "accountId": admin_id, "box": "outbox" }),
    );
    assert_eq!(
        outbox.get("communications").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
}

#[test]
fn manual_email_shape_is_validated_at_create() {
    let workspace = temp_dir("schoolcomm-bad-email");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (admin_id, _, _) = seed(&mut stdin, &mut reader, &workspace);

    let error = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "communications.create",
        json!({
            "senderAccountId": admin_id,
            "title": "Broken",
            "body": "Bad recipient.",
            "manualEmails": ["not-an-address"]
        }),
    );
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("validation_failed")
    );
    let fields = test_support::error_fields(&error);
    assert!(fields.contains(&"manualEmails".to_string()), "{:?}", fields);
}
