#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp workspace");
    dir
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let mut child = Command::new(env!("CARGO_BIN_EXE_schoolcommd"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn sidecar");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let line = serde_json::json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", line).expect("write request");
    stdin.flush().expect("flush request");

    let mut response = String::new();
    reader.read_line(&mut response).expect("read response");
    let resp: serde_json::Value = serde_json::from_str(&response).expect("parse response");
    assert_eq!(
        resp.get("id").and_then(|v| v.as_str()),
        Some(id),
        "response id mismatch: {}",
        response
    );
    resp
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let resp = request(stdin, reader, id, method, params);
    assert_eq!(
        resp.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        resp
    );
    resp.get("result").cloned().expect("result payload")
}

pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let resp = request(stdin, reader, id, method, params);
    assert_eq!(
        resp.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        resp
    );
    resp.get("error").cloned().expect("error payload")
}

/// Field names carried by a validation_failed error.
pub fn error_fields(error: &serde_json::Value) -> Vec<String> {
    error
        .get("details")
        .and_then(|d| d.get("fields"))
        .and_then(|f| f.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|e| e.get("field").and_then(|v| v.as_str()))
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}
