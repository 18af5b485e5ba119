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
    let exe = env!("CARGO_BIN_EXE_bulletind");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn bulletind");
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

fn str_field(result: &serde_json::Value, key: &str) -> String {
    result
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {key} in {result}"))
        .to_string()
}

struct Seeded {
    period_id: String,
    cs_id: String,
    student_ids: Vec<String>,
}

fn seed_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
    student_count: usize,
) -> Seeded {
    let _ = request_ok(
        stdin,
        reader,
        "seed-1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let year = request_ok(
        stdin,
        reader,
        "seed-2",
        "years.create",
        json!({ "label": "2025-2026" }),
    );
    let year_id = str_field(&year, "schoolYearId");
    let period = request_ok(
        stdin,
        reader,
        "seed-3",
        "periods.create",
        json!({ "schoolYearId": year_id, "name": "Trimestre 1", "kind": "term" }),
    );
    let period_id = str_field(&period, "periodId");
    let _ = request_ok(
        stdin,
        reader,
        "seed-4",
        "periods.setActive",
        json!({ "periodId": period_id, "active": true }),
    );
    let class = request_ok(
        stdin,
        reader,
        "seed-5",
        "classes.create",
        json!({ "schoolYearId": year_id, "name": "6A" }),
    );
    let class_id = str_field(&class, "classId");
    let subject = request_ok(
        stdin,
        reader,
        "seed-6",
        "subjects.create",
        json!({ "name": "Physique", "shortCode": "PHY" }),
    );
    let assigned = request_ok(
        stdin,
        reader,
        "seed-7",
        "curriculum.assign",
        json!({
            "classId": class_id,
            "subjectId": str_field(&subject, "subjectId"),
            "coefficient": 1.0
        }),
    );
    let cs_id = str_field(&assigned, "classSubjectId");

    let mut student_ids = Vec::with_capacity(student_count);
    for i in 0..student_count {
        let created = request_ok(
            stdin,
            reader,
            &format!("seed-s{i}"),
            "students.create",
            json!({
                "classId": class_id,
                "lastName": format!("Eleve{i:03}"),
                "firstName": "Test"
            }),
        );
        student_ids.push(str_field(&created, "studentId"));
    }
    Seeded {
        period_id,
        cs_id,
        student_ids,
    }
}

#[test]
fn oversized_batch_is_rejected_without_partial_writes() {
    let workspace = temp_dir("bulletin-bulk-limit");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed_class(&mut stdin, &mut reader, &workspace, 1);

    let entries: Vec<serde_json::Value> = (0..501)
        .map(|_| json!({ "studentId": seeded.student_ids[0], "value": 10.0 }))
        .collect();
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.bulkRecord",
        json!({
            "classSubjectId": seeded.cs_id,
            "periodId": seeded.period_id,
            "entries": entries
        }),
    );
    assert_eq!(result.get("recorded").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(result.get("rejected").and_then(|v| v.as_i64()), Some(501));
    assert_eq!(
        result.get("limitExceeded").and_then(|v| v.as_bool()),
        Some(true)
    );
    assert_eq!(
        result.pointer("/errors/0/index").and_then(|v| v.as_i64()),
        Some(-1)
    );
    assert_eq!(
        result.pointer("/errors/0/code").and_then(|v| v.as_str()),
        Some("too_many_entries")
    );

    // Nothing reached the table.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.forSubject",
        json!({ "classSubjectId": seeded.cs_id, "periodId": seeded.period_id }),
    );
    assert_eq!(
        listed
            .pointer("/students/0/entries")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn mixed_batch_records_valid_items_and_reports_the_rest() {
    let workspace = temp_dir("bulletin-bulk-mixed");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed_class(&mut stdin, &mut reader, &workspace, 2);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.bulkRecord",
        json!({
            "classSubjectId": seeded.cs_id,
            "periodId": seeded.period_id,
            "entries": [
                { "studentId": seeded.student_ids[0], "value": 12.0, "coefficient": 2 },
                { "studentId": seeded.student_ids[1], "value": 25.0 },
                { "studentId": "no-such-student", "value": 10.0 },
                { "value": 10.0 }
            ]
        }),
    );
    assert_eq!(result.get("recorded").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(result.get("rejected").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(
        result
            .get("gradeIds")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );
    assert!(result.get("limitExceeded").is_none());

    let errors = result
        .get("errors")
        .and_then(|v| v.as_array())
        .expect("errors array");
    assert_eq!(errors.len(), 3);
    assert_eq!(errors[0].get("index").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(
        errors[0].get("code").and_then(|v| v.as_str()),
        Some("out_of_range")
    );
    assert_eq!(
        errors[0]
            .pointer("/details/gradeMax")
            .and_then(|v| v.as_f64()),
        Some(20.0)
    );
    assert_eq!(errors[1].get("index").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(
        errors[1].get("code").and_then(|v| v.as_str()),
        Some("not_found")
    );
    assert_eq!(
        errors[1].get("message").and_then(|v| v.as_str()),
        Some("student not found in class")
    );
    assert_eq!(errors[2].get("index").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(
        errors[2].get("code").and_then(|v| v.as_str()),
        Some("bad_params")
    );
    assert_eq!(
        errors[2].get("message").and_then(|v| v.as_str()),
        Some("missing studentId")
    );

    // Exactly one entry landed, for the first student, with the batch value.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.forSubject",
        json!({ "classSubjectId": seeded.cs_id, "periodId": seeded.period_id }),
    );
    assert_eq!(
        listed
            .pointer("/students/0/entries/0/value")
            .and_then(|v| v.as_f64()),
        Some(12.0)
    );
    assert_eq!(
        listed
            .pointer("/students/1/entries")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
