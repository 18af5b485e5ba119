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
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
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

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("bulletin-router-smoke");
    let bundle_out = workspace.join("smoke-bundle.zip");
    let csv_out = workspace.join("smoke-results.csv");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    // A line that is not JSON gets an id-less bad_json error, then the
    // stream keeps serving requests.
    writeln!(stdin, "this is not json").expect("write garbage line");
    stdin.flush().expect("flush garbage line");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read error line");
    let garbage: serde_json::Value =
        serde_json::from_str(line.trim()).expect("parse error response");
    assert_eq!(garbage.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        garbage.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_json")
    );
    assert!(garbage.get("id").is_none());

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "3", "setup.gradingOpen", json!({}));

    let year = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "years.create",
        json!({ "label": "2025-2026", "startDate": "2025-09-01", "endDate": "2026-06-30" }),
    );
    let year_id = year
        .get("schoolYearId")
        .and_then(|v| v.as_str())
        .expect("schoolYearId")
        .to_string();
    let _ = request(&mut stdin, &mut reader, "5", "years.list", json!({}));

    let period = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "periods.create",
        json!({ "schoolYearId": year_id, "name": "Trimestre 1", "kind": "term" }),
    );
    let period_id = period
        .get("periodId")
        .and_then(|v| v.as_str())
        .expect("periodId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "periods.setActive",
        json!({ "periodId": period_id, "active": true }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "periods.list",
        json!({ "schoolYearId": year_id }),
    );

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "teachers.create",
        json!({ "lastName": "Moreau", "firstName": "Claire" }),
    );
    let teacher_id = teacher
        .get("teacherId")
        .and_then(|v| v.as_str())
        .expect("teacherId")
        .to_string();
    let _ = request(&mut stdin, &mut reader, "10", "teachers.list", json!({}));

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "classes.create",
        json!({
            "schoolYearId": year_id,
            "name": "6A",
            "level": "6e",
            "headTeacherId": teacher_id
        }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let _ = request(&mut stdin, &mut reader, "12", "classes.list", json!({}));

    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "subjects.create",
        json!({ "name": "Mathematiques", "shortCode": "MAT" }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();
    let _ = request(&mut stdin, &mut reader, "14", "subjects.list", json!({}));

    let assigned = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "curriculum.assign",
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "teacherId": teacher_id,
            "coefficient": 2.0
        }),
    );
    let class_subject_id = assigned
        .get("classSubjectId")
        .and_then(|v| v.as_str())
        .expect("classSubjectId")
        .to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "curriculum.list",
        json!({ "classId": class_id }),
    );

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "students.create",
        json!({
            "classId": class_id,
            "lastName": "Durand",
            "firstName": "Alice",
            "studentNo": "S-001"
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "18",
        "students.list",
        json!({ "classId": class_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "students.update",
        json!({ "studentId": student_id, "patch": { "firstName": "Alicia" } }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "grades.record",
        json!({
            "studentId": student_id,
            "classSubjectId": class_subject_id,
            "periodId": period_id,
            "value": 15.0,
            "coefficient": 2
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "21",
        "grades.forStudent",
        json!({ "studentId": student_id, "periodId": period_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "22",
        "grades.forSubject",
        json!({ "classSubjectId": class_subject_id, "periodId": period_id }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "23",
        "reports.classResultsModel",
        json!({ "classId": class_id, "periodId": period_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "24",
        "reports.studentResultModel",
        json!({ "classId": class_id, "periodId": period_id, "studentId": student_id }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "25",
        "bulletins.generate",
        json!({ "studentId": student_id, "periodId": period_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "26",
        "bulletins.get",
        json!({ "studentId": student_id, "periodId": period_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "27",
        "bulletins.list",
        json!({ "classId": class_id, "periodId": period_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "28",
        "bulletins.updateAppreciation",
        json!({ "studentId": student_id, "periodId": period_id, "appreciation": "Bon trimestre." }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "29",
        "bulletins.renderHtml",
        json!({ "studentId": student_id, "periodId": period_id }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "30",
        "exchange.exportResultsCsv",
        json!({
            "classId": class_id,
            "periodId": period_id,
            "outPath": csv_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "31",
        "exchange.exportWorkspace",
        json!({ "outPath": bundle_out.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "32",
        "exchange.importWorkspace",
        json!({ "inPath": bundle_out.to_string_lossy() }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "33",
        "bulletins.generateClass",
        json!({ "classId": class_id, "periodId": period_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "34",
        "periods.validate",
        json!({ "periodId": period_id }),
    );

    // Class metadata stays editable after validation; only grades freeze.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "35",
        "classes.update",
        json!({ "classId": class_id, "patch": { "name": "6A bis" } }),
    );
    let classes = request_ok(&mut stdin, &mut reader, "36", "classes.list", json!({}));
    assert_eq!(
        classes.pointer("/classes/0/name").and_then(|v| v.as_str()),
        Some("6A bis")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
