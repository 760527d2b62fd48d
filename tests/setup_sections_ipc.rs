use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_rosterd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rosterd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

fn staff() -> serde_json::Value {
    json!({ "userId": "inst-a", "role": "institution" })
}

#[test]
fn setup_defaults_updates_and_validation() {
    let workspace = temp_dir("rosterd-setup-sections");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let defaults = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({ "caller": staff() }));
    assert_eq!(defaults["rewriter"]["boundaryPolicy"].as_str(), Some("word"));
    assert_eq!(defaults["generator"]["periodsPerDay"].as_i64(), Some(8));
    assert_eq!(defaults["generator"]["lunchAfter"].as_i64(), Some(3));
    assert_eq!(defaults["generator"]["markConflicts"].as_bool(), Some(true));
    assert_eq!(defaults["allotments"]["duplicatePolicy"].as_str(), Some("reject"));
    assert_eq!(defaults["allotments"]["healOnList"].as_bool(), Some(true));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({ "caller": staff(), "section": "generator", "patch": { "periodsPerDay": 6, "markConflicts": false } }),
    );
    assert_eq!(updated["section"].as_str(), Some("generator"));
    assert_eq!(updated["value"]["periodsPerDay"].as_i64(), Some(6));
    assert_eq!(updated["value"]["lunchAfter"].as_i64(), Some(3));

    // One bad field rejects the whole patch.
    let invalid = request(
        &mut stdin,
        &mut reader,
        "4",
        "setup.update",
        json!({ "caller": staff(), "section": "generator", "patch": { "lunchAfter": 2, "periodsPerDay": 40 } }),
    );
    assert_eq!(error_code(&invalid), Some("bad_params"));

    let unknown_field = request(
        &mut stdin,
        &mut reader,
        "5",
        "setup.update",
        json!({ "caller": staff(), "section": "rewriter", "patch": { "colour": "blue" } }),
    );
    assert_eq!(error_code(&unknown_field), Some("bad_params"));

    let unknown_section = request(
        &mut stdin,
        &mut reader,
        "6",
        "setup.update",
        json!({ "caller": staff(), "section": "billing", "patch": {} }),
    );
    assert_eq!(error_code(&unknown_section), Some("bad_params"));

    let teacher = request(
        &mut stdin,
        &mut reader,
        "7",
        "setup.update",
        json!({
            "caller": { "userId": "u-1", "role": "teacher", "institutionId": "inst-a" },
            "section": "rewriter",
            "patch": { "boundaryPolicy": "substring" }
        }),
    );
    assert_eq!(error_code(&teacher), Some("forbidden"));

    let after = request_ok(&mut stdin, &mut reader, "8", "setup.get", json!({ "caller": staff() }));
    assert_eq!(after["generator"]["periodsPerDay"].as_i64(), Some(6));
    assert_eq!(after["generator"]["lunchAfter"].as_i64(), Some(3));
    assert_eq!(after["generator"]["markConflicts"].as_bool(), Some(false));
    assert_eq!(after["rewriter"]["boundaryPolicy"].as_str(), Some("word"));

    // Generator falls back to the saved defaults.
    let grid = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "timetables.generate",
        json!({ "caller": staff(), "classAssigned": "6", "section": "A", "subjects": ["Maths"] }),
    );
    assert_eq!(grid["periods"].as_array().map(|p| p.len()), Some(7));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

fn art_cell_after_inject(policy: &str) -> String {
    let workspace = temp_dir(&format!("rosterd-boundary-{}", policy));
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "setup.update",
        json!({ "caller": staff(), "section": "rewriter", "patch": { "boundaryPolicy": policy } }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "timetables.save",
        json!({
            "caller": staff(),
            "classAssigned": "8",
            "section": "A",
            "schedule": { "Wednesday": { "p2": "Smart Art" } }
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "allotments.create",
        json!({
            "caller": staff(),
            "kind": "teacher",
            "name": "DaVinci",
            "subject": "Art",
            "classAssigned": "8",
            "section": "A"
        }),
    );
    let tt = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "timetables.get",
        json!({ "caller": staff(), "classAssigned": "8", "section": "A" }),
    );
    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
    tt["timetable"]["schedule"]["Wednesday"]["p2"]["subject"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

#[test]
fn boundary_policy_decides_how_subjects_are_matched() {
    assert_eq!(art_cell_after_inject("word"), "Smart Art (DaVinci)");
    assert_eq!(art_cell_after_inject("substring"), "Smart (DaVinci) Art (DaVinci)");
}
