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

#[test]
fn ranking_skips_after_ties_and_excludes_unranked_students() {
    let workspace = temp_dir("bulletin-ranking");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let year = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "years.create",
        json!({ "label": "2025-2026" }),
    );
    let year_id = str_field(&year, "schoolYearId");
    let period = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "periods.create",
        json!({ "schoolYearId": year_id, "name": "Trimestre 1", "kind": "term" }),
    );
    let period_id = str_field(&period, "periodId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "periods.setActive",
        json!({ "periodId": period_id, "active": true }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "classes.create",
        json!({ "schoolYearId": year_id, "name": "5B" }),
    );
    let class_id = str_field(&class, "classId");
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "subjects.create",
        json!({ "name": "Mathematiques", "shortCode": "MAT" }),
    );
    let assigned = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "curriculum.assign",
        json!({
            "classId": class_id,
            "subjectId": str_field(&subject, "subjectId"),
            "coefficient": 1.0
        }),
    );
    let cs_id = str_field(&assigned, "classSubjectId");

    // Aubert and Brun tie at 17, Caron has 14, Dias has no entry at all,
    // Evrard scores 19 but leaves the class mid-term.
    let mut ids = Vec::new();
    for (i, (last, first)) in [
        ("Aubert", "Paul"),
        ("Brun", "Emma"),
        ("Caron", "Lucas"),
        ("Dias", "Nina"),
        ("Evrard", "Tom"),
    ]
    .iter()
    .enumerate()
    {
        let created = request_ok(
            &mut stdin,
            &mut reader,
            &format!("s{i}"),
            "students.create",
            json!({ "classId": class_id, "lastName": last, "firstName": first }),
        );
        ids.push(str_field(&created, "studentId"));
    }
    for (i, (student, value)) in [
        (&ids[0], 17.0),
        (&ids[1], 17.0),
        (&ids[2], 14.0),
        (&ids[4], 19.0),
    ]
    .iter()
    .enumerate()
    {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("g{i}"),
            "grades.record",
            json!({
                "studentId": student,
                "classSubjectId": cs_id,
                "periodId": period_id,
                "value": value
            }),
        );
    }
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.update",
        json!({ "studentId": ids[4], "patch": { "active": false } }),
    );

    let results = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "reports.classResultsModel",
        json!({ "classId": class_id, "periodId": period_id }),
    );

    // Competition ranking: 17, 17, 14 gives ranks 1, 1, 3.
    assert_eq!(
        results
            .pointer("/students/0/classRank")
            .and_then(|v| v.as_i64()),
        Some(1)
    );
    assert_eq!(
        results
            .pointer("/students/1/classRank")
            .and_then(|v| v.as_i64()),
        Some(1)
    );
    assert_eq!(
        results
            .pointer("/students/2/classRank")
            .and_then(|v| v.as_i64()),
        Some(3)
    );

    // No entries: no average, no rank.
    assert!(results
        .pointer("/students/3/overallAverage")
        .expect("overallAverage present")
        .is_null());
    assert!(results
        .pointer("/students/3/classRank")
        .expect("classRank present")
        .is_null());

    // Inactive students keep their computed average but never rank and
    // never count toward the class statistics.
    assert_eq!(
        results
            .pointer("/students/4/active")
            .and_then(|v| v.as_bool()),
        Some(false)
    );
    assert_eq!(
        results
            .pointer("/students/4/overallAverage")
            .and_then(|v| v.as_f64()),
        Some(19.0)
    );
    assert!(results
        .pointer("/students/4/classRank")
        .expect("classRank present")
        .is_null());

    assert_eq!(
        results
            .pointer("/stats/rankedCount")
            .and_then(|v| v.as_i64()),
        Some(3)
    );
    assert_eq!(
        results.pointer("/stats/mean").and_then(|v| v.as_f64()),
        Some(16.0)
    );
    assert_eq!(
        results.pointer("/stats/min").and_then(|v| v.as_f64()),
        Some(14.0)
    );
    assert_eq!(
        results.pointer("/stats/max").and_then(|v| v.as_f64()),
        Some(17.0)
    );
    assert_eq!(
        results.pointer("/stats/median").and_then(|v| v.as_f64()),
        Some(17.0)
    );
    // 19 from the inactive student is not in any band bucket.
    assert_eq!(
        results
            .pointer("/stats/bands/0/count")
            .and_then(|v| v.as_i64()),
        Some(2)
    );
    assert_eq!(
        results
            .pointer("/stats/bands/1/count")
            .and_then(|v| v.as_i64()),
        Some(1)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
