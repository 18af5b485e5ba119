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
fn rendered_card_escapes_names_and_handles_unranked_students() {
    let workspace = temp_dir("bulletin-render");
    let out_path = workspace.join("cards").join("caron.html");
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
        json!({ "schoolYearId": year_id, "name": "6A" }),
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

    let benoit = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.create",
        json!({ "classId": class_id, "lastName": "Benoit <script>", "firstName": "Anna" }),
    );
    let benoit_id = str_field(&benoit, "studentId");
    let caron = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "students.create",
        json!({ "classId": class_id, "lastName": "Caron", "firstName": "Jules" }),
    );
    let caron_id = str_field(&caron, "studentId");
    let dumont = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.create",
        json!({ "classId": class_id, "lastName": "Dumont", "firstName": "Lea" }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "grades.record",
        json!({
            "studentId": benoit_id,
            "classSubjectId": cs_id,
            "periodId": period_id,
            "value": 15.0
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "grades.record",
        json!({
            "studentId": caron_id,
            "classSubjectId": cs_id,
            "periodId": period_id,
            "value": 12.0
        }),
    );
    // Benoit leaves the class; the card still renders, just without a rank.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "students.update",
        json!({ "studentId": benoit_id, "patch": { "active": false } }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "bulletins.generate",
        json!({ "studentId": benoit_id, "periodId": period_id }),
    );
    let rendered = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "bulletins.renderHtml",
        json!({ "studentId": benoit_id, "periodId": period_id }),
    );
    let html = str_field(&rendered, "html");
    assert!(rendered
        .get("writtenTo")
        .expect("writtenTo present")
        .is_null());
    assert!(html.contains("<title>Report card - Benoit &lt;script&gt;, Anna</title>"));
    assert!(html.contains("Benoit &lt;script&gt;, Anna"));
    assert!(!html.contains("<script>"));
    assert!(html.contains("<strong>15.00</strong>"));
    assert!(html.contains("(very good)"));
    assert!(html.contains("<p>Rank: -</p>"));
    assert!(html.contains("Mathematiques"));
    assert!(html.contains("2025-2026"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "bulletins.generate",
        json!({ "studentId": caron_id, "periodId": period_id }),
    );
    let to_file = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "bulletins.renderHtml",
        json!({
            "studentId": caron_id,
            "periodId": period_id,
            "outPath": out_path.to_string_lossy()
        }),
    );
    assert_eq!(
        to_file.get("writtenTo").and_then(|v| v.as_str()),
        Some(out_path.to_string_lossy().as_ref())
    );
    let caron_html = str_field(&to_file, "html");
    assert!(caron_html.contains("<strong>12.00</strong>"));
    assert!(caron_html.contains("(good)"));
    assert!(caron_html.contains("<p>Rank: 1 / 1</p>"));
    let written = std::fs::read_to_string(&out_path).expect("read rendered file");
    assert_eq!(written, caron_html);

    let no_card = request(
        &mut stdin,
        &mut reader,
        "18",
        "bulletins.renderHtml",
        json!({ "studentId": str_field(&dumont, "studentId"), "periodId": period_id }),
    );
    assert_eq!(
        no_card.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_found")
    );
    assert_eq!(
        no_card.pointer("/error/message").and_then(|v| v.as_str()),
        Some("report card not generated")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
