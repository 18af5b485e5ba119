use crate::calc::{self, GradingScale};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, OptionalExtension};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

const BULK_RECORD_MAX_ENTRIES: usize = 500;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn new(code: &'static str, message: impl Into<String>) -> HandlerErr {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(
        code: &'static str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> HandlerErr {
        HandlerErr {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn db_conn<'a>(
    state: &'a AppState,
    req: &Request,
) -> Result<&'a rusqlite::Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn required_str<'a>(req: &'a Request, key: &str) -> Result<&'a str, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {key}"), None))
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn valid_kind(kind: &str) -> bool {
    matches!(kind, "normal" | "quiz" | "exam" | "homework")
}

struct SubjectTarget {
    class_id: String,
    class_year_id: String,
}

fn resolve_class_subject(
    conn: &rusqlite::Connection,
    class_subject_id: &str,
) -> Result<SubjectTarget, HandlerErr> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT cs.class_id, c.school_year_id
             FROM class_subjects cs
             JOIN classes c ON c.id = cs.class_id
             WHERE cs.id = ?1",
            [class_subject_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let (class_id, class_year_id) =
        row.ok_or_else(|| HandlerErr::new("not_found", "curriculum subject not found"))?;
    Ok(SubjectTarget {
        class_id,
        class_year_id,
    })
}

struct PeriodState {
    school_year_id: String,
    active: bool,
    validated: bool,
}

fn fetch_period(conn: &rusqlite::Connection, period_id: &str) -> Result<PeriodState, HandlerErr> {
    let row: Option<(String, i64, i64)> = conn
        .query_row(
            "SELECT school_year_id, active, validated FROM periods WHERE id = ?1",
            [period_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let (school_year_id, active, validated) =
        row.ok_or_else(|| HandlerErr::new("not_found", "period not found"))?;
    Ok(PeriodState {
        school_year_id,
        active: active != 0,
        validated: validated != 0,
    })
}

fn check_period_open(period: &PeriodState) -> Result<(), HandlerErr> {
    if period.validated {
        return Err(HandlerErr::new(
            "period_locked",
            "period is validated; grade entries are frozen",
        ));
    }
    if !period.active {
        return Err(HandlerErr::new(
            "period_not_open",
            "period is not open for grade entry",
        ));
    }
    Ok(())
}

fn check_value_range(value: f64, scale: &GradingScale) -> Result<(), HandlerErr> {
    if !value.is_finite() || value < scale.grade_min || value > scale.grade_max {
        return Err(HandlerErr::with_details(
            "out_of_range",
            format!(
                "value must be between {} and {}",
                scale.grade_min, scale.grade_max
            ),
            json!({ "value": value, "gradeMin": scale.grade_min, "gradeMax": scale.grade_max }),
        ));
    }
    Ok(())
}

// Shared by grades.record and each grades.bulkRecord item.
fn parse_entry_fields(
    params: &serde_json::Value,
    scale: &GradingScale,
) -> Result<(f64, i64, String, Option<String>), HandlerErr> {
    let value = params
        .get("value")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::new("bad_params", "value must be a number"))?;
    check_value_range(value, scale)?;

    let coefficient = match params.get("coefficient") {
        None | Some(serde_json::Value::Null) => 1,
        Some(v) => {
            let n = v
                .as_i64()
                .ok_or_else(|| HandlerErr::new("bad_params", "coefficient must be an integer"))?;
            if n < 0 {
                return Err(HandlerErr::new("bad_params", "coefficient must be >= 0"));
            }
            n
        }
    };

    let kind = match params.get("kind").and_then(|v| v.as_str()) {
        None => "normal".to_string(),
        Some(raw) => {
            if !valid_kind(raw) {
                return Err(HandlerErr::new(
                    "bad_params",
                    "kind must be one of: normal, quiz, exam, homework",
                ));
            }
            raw.to_string()
        }
    };

    let appreciation = params
        .get("appreciation")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok((value, coefficient, kind, appreciation))
}

// The lock triggers are the backstop for races between the period check and
// the write itself; their abort message is mapped back to the typed code.
fn map_write_err(e: rusqlite::Error, fallback: &'static str) -> HandlerErr {
    let message = e.to_string();
    if message.contains("period is validated") {
        return HandlerErr::new("period_locked", "period is validated; grade entries are frozen");
    }
    HandlerErr::new(fallback, message)
}

fn handle_grades_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_subject_id = match required_str(req, "classSubjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let period_id = match required_str(req, "periodId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let cfg = calc::GradingConfig::load(conn);
    let target = match resolve_class_subject(conn, class_subject_id) {
        Ok(t) => t,
        Err(he) => return he.response(&req.id),
    };
    let student_class: Option<String> = match conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?1",
            [student_id],
            |row| row.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(student_class) = student_class else {
        return err(&req.id, "not_found", "student not found", None);
    };
    if student_class != target.class_id {
        return err(
            &req.id,
            "bad_params",
            "student is not enrolled in the subject's class",
            None,
        );
    }
    let period = match fetch_period(conn, period_id) {
        Ok(p) => p,
        Err(he) => return he.response(&req.id),
    };
    if period.school_year_id != target.class_year_id {
        return err(
            &req.id,
            "bad_params",
            "period belongs to a different school year than the class",
            None,
        );
    }
    if let Err(he) = check_period_open(&period) {
        return he.response(&req.id);
    }
    let (value, coefficient, kind, appreciation) = match parse_entry_fields(&req.params, &cfg.scale)
    {
        Ok(fields) => fields,
        Err(he) => return he.response(&req.id),
    };

    let grade_id = Uuid::new_v4().to_string();
    let recorded_at = now_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO grade_entries(id, student_id, class_subject_id, period_id, value, coefficient, kind, appreciation, validated, recorded_at, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)",
        (
            &grade_id,
            student_id,
            class_subject_id,
            period_id,
            value,
            coefficient,
            &kind,
            &appreciation,
            &recorded_at,
        ),
    ) {
        return map_write_err(e, "db_insert_failed").response(&req.id);
    }
    ok(&req.id, json!({ "gradeId": grade_id, "recordedAt": recorded_at }))
}

fn handle_grades_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let entry_period: Option<String> = match conn
        .query_row(
            "SELECT period_id FROM grade_entries WHERE id = ?1",
            [grade_id],
            |row| row.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(entry_period) = entry_period else {
        return err(&req.id, "not_found", "grade entry not found", None);
    };
    let period = match fetch_period(conn, &entry_period) {
        Ok(p) => p,
        Err(he) => return he.response(&req.id),
    };
    if let Err(he) = check_period_open(&period) {
        return he.response(&req.id);
    }

    let cfg = calc::GradingConfig::load(conn);
    let mut set_parts: Vec<String> = Vec::new();
    let mut bind: Vec<Value> = Vec::new();
    for (k, v) in patch {
        match k.as_str() {
            "value" => {
                let Some(value) = v.as_f64() else {
                    return err(&req.id, "bad_params", "value must be a number", None);
                };
                if let Err(he) = check_value_range(value, &cfg.scale) {
                    return he.response(&req.id);
                }
                set_parts.push("value = ?".to_string());
                bind.push(Value::Real(value));
            }
            "coefficient" => {
                let Some(n) = v.as_i64() else {
                    return err(&req.id, "bad_params", "coefficient must be an integer", None);
                };
                if n < 0 {
                    return err(&req.id, "bad_params", "coefficient must be >= 0", None);
                }
                set_parts.push("coefficient = ?".to_string());
                bind.push(Value::Integer(n));
            }
            "kind" => {
                let Some(kind) = v.as_str() else {
                    return err(&req.id, "bad_params", "kind must be a string", None);
                };
                if !valid_kind(kind) {
                    return err(
                        &req.id,
                        "bad_params",
                        "kind must be one of: normal, quiz, exam, homework",
                        None,
                    );
                }
                set_parts.push("kind = ?".to_string());
                bind.push(Value::Text(kind.to_string()));
            }
            "appreciation" => {
                set_parts.push("appreciation = ?".to_string());
                bind.push(match v.as_str().map(str::trim).filter(|s| !s.is_empty()) {
                    Some(s) => Value::Text(s.to_string()),
                    None => Value::Null,
                });
            }
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("unknown grade field: {}", k),
                    None,
                )
            }
        }
    }
    if set_parts.is_empty() {
        return err(&req.id, "bad_params", "empty patch", None);
    }
    set_parts.push("updated_at = ?".to_string());
    bind.push(Value::Text(now_rfc3339()));

    let sql = format!(
        "UPDATE grade_entries SET {} WHERE id = ?",
        set_parts.join(", ")
    );
    bind.push(Value::Text(grade_id.to_string()));
    if let Err(e) = conn.execute(&sql, params_from_iter(bind)) {
        return map_write_err(e, "db_update_failed").response(&req.id);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_grades_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let entry_period: Option<String> = match conn
        .query_row(
            "SELECT period_id FROM grade_entries WHERE id = ?1",
            [grade_id],
            |row| row.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(entry_period) = entry_period else {
        return err(&req.id, "not_found", "grade entry not found", None);
    };
    let period = match fetch_period(conn, &entry_period) {
        Ok(p) => p,
        Err(he) => return he.response(&req.id),
    };
    if let Err(he) = check_period_open(&period) {
        return he.response(&req.id);
    }

    if let Err(e) = conn.execute("DELETE FROM grade_entries WHERE id = ?1", [grade_id]) {
        return map_write_err(e, "db_delete_failed").response(&req.id);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn entry_json(
    id: String,
    value: f64,
    coefficient: i64,
    kind: String,
    appreciation: Option<String>,
    recorded_at: Option<String>,
) -> serde_json::Value {
    json!({
        "id": id,
        "value": value,
        "coefficient": coefficient,
        "kind": kind,
        "appreciation": appreciation,
        "recordedAt": recorded_at,
    })
}

fn handle_grades_for_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let period_id = match required_str(req, "periodId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let student: Option<(String, String, String, i64)> = match conn
        .query_row(
            "SELECT class_id, last_name, first_name, active FROM students WHERE id = ?1",
            [student_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((class_id, last_name, first_name, active)) = student else {
        return err(&req.id, "not_found", "student not found", None);
    };
    let period = match fetch_period(conn, period_id) {
        Ok(p) => p,
        Err(he) => return he.response(&req.id),
    };

    let cfg = calc::GradingConfig::load(conn);
    let mut stmt = match conn.prepare(
        "SELECT cs.id, s.name, s.short_code, cs.coefficient
         FROM class_subjects cs
         JOIN subjects s ON s.id = cs.subject_id
         WHERE cs.class_id = ?1
         ORDER BY cs.sort_order, s.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let curriculum: Vec<(String, String, String, f64)> = match stmt
        .query_map([&class_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, class_subject_id, value, coefficient, kind, appreciation, recorded_at
         FROM grade_entries
         WHERE student_id = ?1 AND period_id = ?2
         ORDER BY recorded_at, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mut per_subject: HashMap<String, (Vec<serde_json::Value>, Vec<(f64, i64)>)> =
        HashMap::new();
    let rows = stmt.query_map((student_id, period_id), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<String>>(6)?,
        ))
    });
    match rows {
        Ok(mapped) => {
            for m in mapped {
                match m {
                    Ok((id, cs_id, value, coefficient, kind, appreciation, recorded_at)) => {
                        let slot = per_subject.entry(cs_id).or_default();
                        slot.1.push((value, coefficient));
                        slot.0
                            .push(entry_json(id, value, coefficient, kind, appreciation, recorded_at));
                    }
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                }
            }
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let mut subjects = Vec::with_capacity(curriculum.len());
    for (cs_id, name, short_code, coefficient) in curriculum {
        let (entries, pairs) = per_subject.remove(&cs_id).unwrap_or_default();
        let coefficient_total: i64 = pairs.iter().map(|(_, c)| *c).sum();
        let average = calc::weighted_subject_average(&pairs)
            .map(|v| calc::round_half_up(v, cfg.scale.precision));
        subjects.push(json!({
            "classSubjectId": cs_id,
            "name": name,
            "shortCode": short_code,
            "coefficient": coefficient,
            "entries": entries,
            "coefficientTotal": coefficient_total,
            "average": average,
        }));
    }

    ok(
        &req.id,
        json!({
            "student": {
                "id": student_id,
                "displayName": format!("{}, {}", last_name, first_name),
                "active": active != 0,
            },
            "period": {
                "id": period_id,
                "active": period.active,
                "validated": period.validated,
            },
            "subjects": subjects,
        }),
    )
}

fn handle_grades_for_subject(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_subject_id = match required_str(req, "classSubjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let period_id = match required_str(req, "periodId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let subject: Option<(String, String, String, f64)> = match conn
        .query_row(
            "SELECT cs.class_id, s.name, s.short_code, cs.coefficient
             FROM class_subjects cs
             JOIN subjects s ON s.id = cs.subject_id
             WHERE cs.id = ?1",
            [class_subject_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((class_id, subject_name, short_code, coefficient)) = subject else {
        return err(&req.id, "not_found", "curriculum subject not found", None);
    };
    let period = match fetch_period(conn, period_id) {
        Ok(p) => p,
        Err(he) => return he.response(&req.id),
    };

    let cfg = calc::GradingConfig::load(conn);
    let mut stmt = match conn.prepare(
        "SELECT id, last_name, first_name, active
         FROM students
         WHERE class_id = ?1
         ORDER BY last_name, first_name, sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let roster: Vec<(String, String, String, i64)> = match stmt
        .query_map([&class_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, student_id, value, coefficient, kind, appreciation, recorded_at
         FROM grade_entries
         WHERE class_subject_id = ?1 AND period_id = ?2
         ORDER BY recorded_at, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mut per_student: HashMap<String, (Vec<serde_json::Value>, Vec<(f64, i64)>)> =
        HashMap::new();
    let rows = stmt.query_map((class_subject_id, period_id), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<String>>(6)?,
        ))
    });
    match rows {
        Ok(mapped) => {
            for m in mapped {
                match m {
                    Ok((id, student_id, value, coefficient, kind, appreciation, recorded_at)) => {
                        let slot = per_student.entry(student_id).or_default();
                        slot.1.push((value, coefficient));
                        slot.0
                            .push(entry_json(id, value, coefficient, kind, appreciation, recorded_at));
                    }
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                }
            }
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let mut students = Vec::with_capacity(roster.len());
    for (student_id, last_name, first_name, active) in roster {
        let (entries, pairs) = per_student.remove(&student_id).unwrap_or_default();
        let average = calc::weighted_subject_average(&pairs)
            .map(|v| calc::round_half_up(v, cfg.scale.precision));
        students.push(json!({
            "studentId": student_id,
            "displayName": format!("{}, {}", last_name, first_name),
            "active": active != 0,
            "entries": entries,
            "average": average,
        }));
    }

    ok(
        &req.id,
        json!({
            "classSubject": {
                "classSubjectId": class_subject_id,
                "classId": class_id,
                "name": subject_name,
                "shortCode": short_code,
                "coefficient": coefficient,
            },
            "period": {
                "id": period_id,
                "active": period.active,
                "validated": period.validated,
            },
            "students": students,
        }),
    )
}

fn handle_grades_bulk_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let period_id = match required_str(req, "periodId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_subject_id = match required_str(req, "classSubjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(items) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing entries", None);
    };
    if items.len() > BULK_RECORD_MAX_ENTRIES {
        // Deterministic rejection instead of a half-applied oversized batch.
        return ok(
            &req.id,
            json!({
                "recorded": 0,
                "rejected": items.len(),
                "limitExceeded": true,
                "errors": [{
                    "index": -1,
                    "code": "too_many_entries",
                    "message": format!("bulk record supports at most {} entries", BULK_RECORD_MAX_ENTRIES),
                }],
            }),
        );
    }

    let cfg = calc::GradingConfig::load(conn);
    let target = match resolve_class_subject(conn, class_subject_id) {
        Ok(t) => t,
        Err(he) => return he.response(&req.id),
    };
    let period = match fetch_period(conn, period_id) {
        Ok(p) => p,
        Err(he) => return he.response(&req.id),
    };
    if period.school_year_id != target.class_year_id {
        return err(
            &req.id,
            "bad_params",
            "period belongs to a different school year than the class",
            None,
        );
    }
    if let Err(he) = check_period_open(&period) {
        return he.response(&req.id);
    }

    let mut stmt = match conn.prepare("SELECT id FROM students WHERE class_id = ?1") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let roster: HashSet<String> = match stmt
        .query_map([&target.class_id], |row| row.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<HashSet<_>, _>>())
    {
        Ok(set) => set,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let recorded_at = now_rfc3339();
    let mut grade_ids: Vec<String> = Vec::new();
    let mut errors: Vec<serde_json::Value> = Vec::new();
    for (index, item) in items.iter().enumerate() {
        let student_id = match item.get("studentId").and_then(|v| v.as_str()) {
            Some(s) => s,
            None => {
                errors.push(json!({
                    "index": index,
                    "code": "bad_params",
                    "message": "missing studentId",
                }));
                continue;
            }
        };
        if !roster.contains(student_id) {
            errors.push(json!({
                "index": index,
                "code": "not_found",
                "message": "student not found in class",
            }));
            continue;
        }
        let (value, coefficient, kind, appreciation) = match parse_entry_fields(item, &cfg.scale) {
            Ok(fields) => fields,
            Err(he) => {
                let mut entry = json!({
                    "index": index,
                    "code": he.code,
                    "message": he.message,
                });
                if let Some(d) = he.details {
                    entry["details"] = d;
                }
                errors.push(entry);
                continue;
            }
        };

        let grade_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO grade_entries(id, student_id, class_subject_id, period_id, value, coefficient, kind, appreciation, validated, recorded_at, updated_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)",
            (
                &grade_id,
                student_id,
                class_subject_id,
                period_id,
                value,
                coefficient,
                &kind,
                &appreciation,
                &recorded_at,
            ),
        ) {
            let _ = tx.rollback();
            return map_write_err(e, "db_insert_failed").response(&req.id);
        }
        grade_ids.push(grade_id);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "recorded": grade_ids.len(),
            "rejected": errors.len(),
            "gradeIds": grade_ids,
            "errors": errors,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.record" => Some(handle_grades_record(state, req)),
        "grades.update" => Some(handle_grades_update(state, req)),
        "grades.delete" => Some(handle_grades_delete(state, req)),
        "grades.forStudent" => Some(handle_grades_for_student(state, req)),
        "grades.forSubject" => Some(handle_grades_for_subject(state, req)),
        "grades.bulkRecord" => Some(handle_grades_bulk_record(state, req)),
        _ => None,
    }
}
