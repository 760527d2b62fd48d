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

fn slot_ids(day: &serde_json::Value) -> Vec<String> {
    day["slots"]
        .as_array()
        .expect("slots")
        .iter()
        .filter_map(|s| s["periodId"].as_str().map(str::to_string))
        .collect()
}

#[test]
fn layout_hides_periods_covered_by_a_span() {
    let workspace = temp_dir("rosterd-layout-span");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let periods: Vec<serde_json::Value> = (0..6)
        .map(|n| json!({ "id": format!("p{}", n), "name": n.to_string(), "type": "class" }))
        .collect();
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "timetables.save",
        json!({
            "caller": staff(),
            "classAssigned": "7",
            "section": "B",
            "periods": periods,
            "schedule": {
                "monday": { "p2": { "subject": "Lab", "span": 3 } },
                "Tuesday": { "p4": { "subject": "Games", "span": 5 } }
            }
        }),
    );

    let layout = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "timetables.layout",
        json!({ "caller": staff(), "classAssigned": "7", "section": "B" }),
    );
    let days = layout["days"].as_array().expect("days");
    assert_eq!(days.len(), 6);
    assert_eq!(days[0]["day"].as_str(), Some("Monday"));
    assert_eq!(slot_ids(&days[0]), vec!["p0", "p1", "p2", "p5"]);
    assert_eq!(days[0]["slots"][2]["span"].as_u64(), Some(3));
    assert_eq!(days[0]["slots"][2]["subject"].as_str(), Some("Lab"));

    assert_eq!(slot_ids(&days[1]), vec!["p0", "p1", "p2", "p3", "p4"]);
    assert_eq!(days[1]["slots"][4]["span"].as_u64(), Some(2));

    assert_eq!(slot_ids(&days[2]).len(), 6);

    let bad = request(
        &mut stdin,
        &mut reader,
        "4",
        "timetables.save",
        json!({
            "caller": staff(),
            "classAssigned": "7",
            "section": "B",
            "schedule": { "Monday": { "p1": { "subject": "Lab", "span": 0 } } }
        }),
    );
    assert_eq!(error_code(&bad), Some("bad_params"));

    let bad_day = request(
        &mut stdin,
        &mut reader,
        "5",
        "timetables.save",
        json!({
            "caller": staff(),
            "classAssigned": "7",
            "section": "B",
            "schedule": { "Funday": { "p1": "Lab" } }
        }),
    );
    assert_eq!(error_code(&bad_day), Some("bad_params"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn stale_revision_is_refused_with_the_current_one() {
    let workspace = temp_dir("rosterd-revision");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let fresh = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "timetables.get",
        json!({ "caller": staff(), "classAssigned": "10", "section": "A" }),
    );
    assert_eq!(fresh["exists"].as_bool(), Some(false));
    assert!(fresh["timetable"]["id"].is_null());
    assert_eq!(fresh["timetable"]["periods"].as_array().map(|p| p.len()), Some(9));
    let r0 = fresh["revision"].as_str().expect("revision").to_string();

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "timetables.save",
        json!({
            "caller": staff(),
            "classAssigned": "10",
            "section": "A",
            "schedule": { "Monday": { "p1": "Maths" } },
            "expectedRevision": r0
        }),
    );
    let r1 = first["revision"].as_str().expect("revision").to_string();
    assert_ne!(r0, r1);

    let stale = request(
        &mut stdin,
        &mut reader,
        "4",
        "timetables.save",
        json!({
            "caller": staff(),
            "classAssigned": "10",
            "section": "A",
            "schedule": { "Monday": { "p1": "Art" } },
            "expectedRevision": r0
        }),
    );
    assert_eq!(error_code(&stale), Some("revision_conflict"));
    assert_eq!(stale["error"]["details"]["currentRevision"].as_str(), Some(r1.as_str()));

    let kept = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "timetables.get",
        json!({ "caller": staff(), "classAssigned": "10th", "section": "a" }),
    );
    assert_eq!(kept["timetable"]["schedule"]["Monday"]["p1"]["subject"].as_str(), Some("Maths"));
    assert_eq!(kept["revision"].as_str(), Some(r1.as_str()));

    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "timetables.save",
        json!({
            "caller": staff(),
            "classAssigned": "10",
            "section": "A",
            "schedule": { "Monday": { "p1": "Art" } },
            "expectedRevision": r1
        }),
    );

    let unchecked = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "timetables.save",
        json!({
            "caller": staff(),
            "classAssigned": "10",
            "section": "A",
            "schedule": { "Monday": { "p1": "Music" } }
        }),
    );
    assert_eq!(
        unchecked["timetable"]["schedule"]["Monday"]["p1"]["subject"].as_str(),
        Some("Music")
    );

    let overview = request_ok(&mut stdin, &mut reader, "8", "timetables.overview", json!({ "caller": staff() }));
    assert_eq!(overview["timetables"].as_array().map(|t| t.len()), Some(1));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn students_read_only_their_own_class() {
    let workspace = temp_dir("rosterd-student-access");
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
        "accounts.upsert",
        json!({
            "caller": staff(),
            "account": { "id": "u-asha", "role": "student", "name": "Asha", "class": "10", "section": "a" }
        }),
    );
    let student = json!({ "userId": "u-asha", "role": "student", "institutionId": "inst-a" });

    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "timetables.get",
        json!({ "caller": student, "classAssigned": "10th", "section": "A" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "timetables.layout",
        json!({ "caller": student, "classAssigned": "10", "section": "A" }),
    );

    let other = request(
        &mut stdin,
        &mut reader,
        "5",
        "timetables.get",
        json!({ "caller": student, "classAssigned": "9", "section": "A" }),
    );
    assert_eq!(error_code(&other), Some("forbidden"));

    for (i, method) in ["timetables.overview", "groups.list", "accounts.list"].iter().enumerate() {
        let value = request(&mut stdin, &mut reader, &format!("r{}", i), method, json!({ "caller": student }));
        assert_eq!(error_code(&value), Some("forbidden"), "{} open to students", method);
    }

    let write = request(
        &mut stdin,
        &mut reader,
        "6",
        "timetables.save",
        json!({ "caller": student, "classAssigned": "10", "section": "A", "schedule": {} }),
    );
    assert_eq!(error_code(&write), Some("forbidden"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
