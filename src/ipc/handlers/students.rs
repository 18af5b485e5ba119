use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{params_from_iter, types::Value, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

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

fn valid_date(raw: &str) -> bool {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok()
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_no = req
        .params
        .get("studentNo")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let birth_date = match req.params.get("birthDate").and_then(|v| v.as_str()) {
        Some(raw) => {
            let raw = raw.trim();
            if raw.is_empty() {
                None
            } else if valid_date(raw) {
                Some(raw.to_string())
            } else {
                return err(
                    &req.id,
                    "bad_params",
                    "birthDate must be an ISO date (YYYY-MM-DD)",
                    None,
                );
            }
        }
        None => None,
    };
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let class_exists: Result<Option<i64>, _> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?1", [class_id], |row| {
            row.get(0)
        })
        .optional();
    match class_exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE class_id = ?1",
        [class_id],
        |row| row.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, student_no, birth_date, active, sort_order, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        (
            &student_id,
            class_id,
            last_name,
            first_name,
            &student_no,
            &birth_date,
            active as i64,
            sort_order,
            now_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    ok(
        &req.id,
        json!({ "studentId": student_id, "sortOrder": sort_order }),
    )
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT s.id, s.last_name, s.first_name, s.student_no, s.birth_date, s.active, s.sort_order,
                (SELECT COUNT(*) FROM grade_entries g WHERE g.student_id = s.id) AS entry_count
         FROM students s
         WHERE s.class_id = ?1
         ORDER BY s.sort_order, s.last_name, s.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([class_id], |row| {
            let id: String = row.get(0)?;
            let last_name: String = row.get(1)?;
            let first_name: String = row.get(2)?;
            let student_no: Option<String> = row.get(3)?;
            let birth_date: Option<String> = row.get(4)?;
            let active: i64 = row.get(5)?;
            let sort_order: i64 = row.get(6)?;
            let entry_count: i64 = row.get(7)?;
            Ok(json!({
                "id": id,
                "lastName": last_name,
                "firstName": first_name,
                "displayName": format!("{}, {}", last_name, first_name),
                "studentNo": student_no,
                "birthDate": birth_date,
                "active": active != 0,
                "sortOrder": sort_order,
                "entryCount": entry_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let exists: Result<Option<i64>, _> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?1", [student_id], |row| {
            row.get(0)
        })
        .optional();
    match exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind: Vec<Value> = Vec::new();
    for (k, v) in patch {
        match k.as_str() {
            "lastName" | "firstName" => {
                let Some(name) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    return err(
                        &req.id,
                        "bad_params",
                        format!("{k} must be a non-empty string"),
                        None,
                    );
                };
                let column = if k == "lastName" { "last_name" } else { "first_name" };
                set_parts.push(format!("{} = ?", column));
                bind.push(Value::Text(name.to_string()));
            }
            "studentNo" => {
                set_parts.push("student_no = ?".to_string());
                bind.push(match v.as_str().map(str::trim).filter(|s| !s.is_empty()) {
                    Some(s) => Value::Text(s.to_string()),
                    None => Value::Null,
                });
            }
            "birthDate" => {
                if v.is_null() {
                    set_parts.push("birth_date = ?".to_string());
                    bind.push(Value::Null);
                } else {
                    let Some(raw) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                        return err(&req.id, "bad_params", "birthDate must be a date or null", None);
                    };
                    if !valid_date(raw) {
                        return err(
                            &req.id,
                            "bad_params",
                            "birthDate must be an ISO date (YYYY-MM-DD)",
                            None,
                        );
                    }
                    set_parts.push("birth_date = ?".to_string());
                    bind.push(Value::Text(raw.to_string()));
                }
            }
            "active" => {
                let Some(flag) = v.as_bool() else {
                    return err(&req.id, "bad_params", "active must be boolean", None);
                };
                set_parts.push("active = ?".to_string());
                bind.push(Value::Integer(flag as i64));
            }
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("unknown student field: {}", k),
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

    let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));
    bind.push(Value::Text(student_id.to_string()));
    if let Err(e) = conn.execute(&sql, params_from_iter(bind)) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_reorder(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(raw_ids) = req.params.get("orderedIds").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing orderedIds", None);
    };
    let mut ordered: Vec<String> = Vec::with_capacity(raw_ids.len());
    for v in raw_ids {
        match v.as_str() {
            Some(s) => ordered.push(s.to_string()),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "orderedIds must be an array of strings",
                    None,
                )
            }
        }
    }

    let mut stmt = match conn.prepare("SELECT id FROM students WHERE class_id = ?1") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let existing: HashSet<String> = match stmt
        .query_map([class_id], |row| row.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<HashSet<_>, _>>())
    {
        Ok(set) => set,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if ordered.len() != existing.len() {
        return err(
            &req.id,
            "bad_params",
            "orderedIds must list every student of the class exactly once",
            Some(json!({ "expected": existing.len(), "got": ordered.len() })),
        );
    }
    let mut seen: HashSet<&str> = HashSet::with_capacity(ordered.len());
    for id in &ordered {
        if !existing.contains(id.as_str()) {
            return err(
                &req.id,
                "bad_params",
                "orderedIds contains a student outside the class",
                Some(json!({ "studentId": id })),
            );
        }
        if !seen.insert(id.as_str()) {
            return err(
                &req.id,
                "bad_params",
                "orderedIds contains a duplicate",
                Some(json!({ "studentId": id })),
            );
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let touched_at = now_rfc3339();
    for (position, id) in ordered.iter().enumerate() {
        if let Err(e) = tx.execute(
            "UPDATE students SET sort_order = ?1, updated_at = ?2 WHERE id = ?3",
            (position as i64, &touched_at, id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true, "count": ordered.len() }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Result<Option<i64>, _> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?1", [student_id], |row| {
            row.get(0)
        })
        .optional();
    match exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let entry_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM grade_entries WHERE student_id = ?1",
        [student_id],
        |row| row.get(0),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if entry_count > 0 {
        return err(
            &req.id,
            "student_has_grades",
            "remove grade entries first",
            Some(json!({ "entryCount": entry_count })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    // Report cards are derived data; they go with the student.
    if let Err(e) = tx.execute("DELETE FROM report_cards WHERE student_id = ?1", [student_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?1", [student_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(handle_students_create(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.reorder" => Some(handle_students_reorder(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
