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

fn create_teacher(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
    subject: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "allotments.create",
        json!({
            "caller": staff(),
            "kind": "teacher",
            "name": name,
            "subject": subject,
            "classAssigned": "10",
            "section": "A"
        }),
    );
    created["allotment"]["id"].as_str().expect("allotment id").to_string()
}

fn class_subjects(result: &serde_json::Value, day: &str) -> Vec<String> {
    let periods = result["periods"].as_array().expect("periods");
    periods
        .iter()
        .filter(|p| p["type"] == "class")
        .map(|p| {
            let id = p["id"].as_str().expect("period id");
            result["schedule"][day][id]["subject"]
                .as_str()
                .expect("filled cell")
                .to_string()
        })
        .collect()
}

#[test]
fn balanced_grid_without_repeats_or_conflicts() {
    let workspace = temp_dir("rosterd-generate-balanced");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let mary = create_teacher(&mut stdin, &mut reader, "2", "Mary", "Maths");
    let raj = create_teacher(&mut stdin, &mut reader, "3", "Raj", "Science");

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "timetables.generate",
        json!({
            "caller": staff(),
            "classAssigned": "10",
            "section": "A",
            "subjects": ["Maths", "Science"],
            "teacherAssignments": { "Maths": mary, "Science": raj },
            "periodsPerDay": 6,
            "lunchAfter": 3
        }),
    );
    assert_eq!(result["applied"].as_bool(), Some(false));
    assert_eq!(result["conflicts"], json!([]));

    let ids: Vec<&str> = result["periods"]
        .as_array()
        .expect("periods")
        .iter()
        .filter_map(|p| p["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["p1", "p2", "p3", "break1", "p4", "p5", "p6"]);

    let usage = result["usage"].as_array().expect("usage");
    assert_eq!(usage.len(), 2);
    for u in usage {
        assert_eq!(u["count"].as_u64(), Some(18), "unbalanced usage: {}", result["usage"]);
    }

    for day in ["Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday"] {
        assert_eq!(result["schedule"][day]["break1"]["subject"].as_str(), Some("BREAK"));
        let cells = class_subjects(&result, day);
        assert_eq!(cells.len(), 6);
        for pair in cells.windows(2) {
            assert_ne!(pair[0], pair[1], "{} repeats a subject back to back", day);
        }
        assert!(cells.iter().all(|c| c == "Maths (Mary)" || c == "Science (Raj)"));
    }

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn teachers_booked_elsewhere_are_avoided_and_forced_clashes_are_flagged() {
    let workspace = temp_dir("rosterd-generate-busy");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let mary = create_teacher(&mut stdin, &mut reader, "2", "Mary", "Maths");
    let raj = create_teacher(&mut stdin, &mut reader, "3", "Raj", "Science");
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "timetables.save",
        json!({
            "caller": staff(),
            "classAssigned": "9",
            "section": "A",
            "schedule": { "Monday": { "p1": "Maths (Mary)" } }
        }),
    );

    let avoided = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "timetables.generate",
        json!({
            "caller": staff(),
            "classAssigned": "10",
            "section": "A",
            "subjects": ["Maths", "Science"],
            "teacherAssignments": { "Maths": mary, "Science": raj },
            "periodsPerDay": 6,
            "lunchAfter": 3
        }),
    );
    assert_eq!(avoided["schedule"]["Monday"]["p1"]["subject"].as_str(), Some("Science (Raj)"));
    assert_eq!(avoided["conflicts"], json!([]));

    let forced = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "timetables.generate",
        json!({
            "caller": staff(),
            "classAssigned": "10",
            "section": "A",
            "subjects": ["Maths"],
            "teacherAssignments": { "Maths": mary },
            "periodsPerDay": 6,
            "lunchAfter": 3
        }),
    );
    let conflicts = forced["conflicts"].as_array().expect("conflicts");
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0]["day"].as_str(), Some("Monday"));
    assert_eq!(conflicts[0]["periodId"].as_str(), Some("p1"));
    assert_eq!(conflicts[0]["teacher"].as_str(), Some("Mary"));
    assert_eq!(forced["schedule"]["Monday"]["p1"]["conflict"].as_bool(), Some(true));
    assert!(forced["schedule"]["Monday"]["p2"].get("conflict").is_none());

    let missing = request(
        &mut stdin,
        &mut reader,
        "7",
        "timetables.generate",
        json!({
            "caller": staff(),
            "classAssigned": "10",
            "section": "A",
            "subjects": ["Maths"],
            "teacherAssignments": { "Maths": "no-such-allotment" }
        }),
    );
    assert_eq!(error_code(&missing), Some("not_found"));

    let empty = request(
        &mut stdin,
        &mut reader,
        "8",
        "timetables.generate",
        json!({ "caller": staff(), "classAssigned": "10", "section": "A", "subjects": [] }),
    );
    assert_eq!(error_code(&empty), Some("bad_params"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn applied_grid_is_saved_with_groups_and_checked_against_revision() {
    let workspace = temp_dir("rosterd-generate-apply");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let mary = create_teacher(&mut stdin, &mut reader, "2", "Mary", "Maths");

    let params = json!({
        "caller": staff(),
        "classAssigned": "10",
        "section": "A",
        "subjects": ["Maths", "Art"],
        "teacherAssignments": { "Maths": mary },
        "periodsPerDay": 4,
        "lunchAfter": 2,
        "apply": true
    });

    let teacher = request(
        &mut stdin,
        &mut reader,
        "3",
        "timetables.generate",
        {
            let mut p = params.clone();
            p["caller"] = json!({ "userId": "u-mary", "role": "teacher", "institutionId": "inst-a" });
            p
        },
    );
    assert_eq!(error_code(&teacher), Some("forbidden"));

    let applied = request_ok(&mut stdin, &mut reader, "4", "timetables.generate", params.clone());
    assert_eq!(applied["applied"].as_bool(), Some(true));
    assert_eq!(applied["sync"]["groupsUpdated"].as_u64(), Some(1));
    let revision = applied["revision"].as_str().expect("revision").to_string();

    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "timetables.get",
        json!({ "caller": staff(), "classAssigned": "10", "section": "A" }),
    );
    assert_eq!(stored["exists"].as_bool(), Some(true));
    assert_eq!(stored["revision"].as_str(), Some(revision.as_str()));
    assert_eq!(stored["timetable"]["schedule"]["Monday"]["p1"]["subject"].as_str(), Some("Maths (Mary)"));
    assert_eq!(stored["timetable"]["schedule"]["Monday"]["p2"]["subject"].as_str(), Some("Art"));

    let groups = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "groups.list",
        json!({ "caller": staff(), "classAssigned": "10th", "section": "a" }),
    );
    let rows = groups["groups"].as_array().expect("groups");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"].as_str(), Some("MATHS_10_A"));
    assert_eq!(rows[0]["teacherName"].as_str(), Some("Mary"));

    let mut stale = params;
    stale["expectedRevision"] = json!("0000");
    let conflict = request(&mut stdin, &mut reader, "7", "timetables.generate", stale);
    assert_eq!(error_code(&conflict), Some("revision_conflict"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
