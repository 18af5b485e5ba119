use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, OptionalExtension};
use serde_json::json;
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

fn row_exists(
    conn: &rusqlite::Connection,
    sql: &str,
    id: &str,
) -> Result<bool, rusqlite::Error> {
    let found: Option<i64> = conn.query_row(sql, [id], |row| row.get(0)).optional()?;
    Ok(found.is_some())
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let year_id = match required_str(req, "schoolYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let level = req
        .params
        .get("level")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let head_teacher_id = req
        .params
        .get("headTeacherId")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    match row_exists(conn, "SELECT 1 FROM school_years WHERE id = ?", year_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "school year not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if let Some(teacher_id) = &head_teacher_id {
        match row_exists(conn, "SELECT 1 FROM teachers WHERE id = ?", teacher_id) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", "teacher not found", None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, school_year_id, name, level, head_teacher_id)
         VALUES(?1, ?2, ?3, ?4, ?5)",
        (&class_id, year_id, name, &level, &head_teacher_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }
    ok(&req.id, json!({ "classId": class_id, "name": name }))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    // Counts are correlated subqueries to avoid double-counting from joins.
    let mut sql = String::from(
        "SELECT
           c.id,
           c.name,
           c.level,
           c.school_year_id,
           c.head_teacher_id,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
           (SELECT COUNT(*) FROM class_subjects cs WHERE cs.class_id = c.id) AS subject_count
         FROM classes c",
    );
    let mut bind: Vec<Value> = Vec::new();
    if let Some(year_id) = req.params.get("schoolYearId").and_then(|v| v.as_str()) {
        sql.push_str(" WHERE c.school_year_id = ?");
        bind.push(Value::Text(year_id.to_string()));
    }
    sql.push_str(" ORDER BY c.name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(bind), |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let level: Option<String> = row.get(2)?;
            let school_year_id: String = row.get(3)?;
            let head_teacher_id: Option<String> = row.get(4)?;
            let student_count: i64 = row.get(5)?;
            let subject_count: i64 = row.get(6)?;
            Ok(json!({
                "id": id,
                "name": name,
                "level": level,
                "schoolYearId": school_year_id,
                "headTeacherId": head_teacher_id,
                "studentCount": student_count,
                "subjectCount": subject_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    match row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", class_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind: Vec<Value> = Vec::new();
    for (k, v) in patch {
        match k.as_str() {
            "name" => {
                let Some(name) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    return err(&req.id, "bad_params", "name must be a non-empty string", None);
                };
                set_parts.push("name = ?".to_string());
                bind.push(Value::Text(name.to_string()));
            }
            "level" => {
                set_parts.push("level = ?".to_string());
                bind.push(match v.as_str().map(str::trim).filter(|s| !s.is_empty()) {
                    Some(s) => Value::Text(s.to_string()),
                    None => Value::Null,
                });
            }
            "headTeacherId" => {
                if v.is_null() {
                    set_parts.push("head_teacher_id = ?".to_string());
                    bind.push(Value::Null);
                } else {
                    let Some(teacher_id) = v.as_str() else {
                        return err(&req.id, "bad_params", "headTeacherId must be a string or null", None);
                    };
                    match row_exists(conn, "SELECT 1 FROM teachers WHERE id = ?", teacher_id) {
                        Ok(true) => {}
                        Ok(false) => return err(&req.id, "not_found", "teacher not found", None),
                        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                    }
                    set_parts.push("head_teacher_id = ?".to_string());
                    bind.push(Value::Text(teacher_id.to_string()));
                }
            }
            _ => return err(&req.id, "bad_params", format!("unknown class field: {}", k), None),
        }
    }
    if set_parts.is_empty() {
        return err(&req.id, "bad_params", "empty patch", None);
    }

    let sql = format!("UPDATE classes SET {} WHERE id = ?", set_parts.join(", "));
    bind.push(Value::Text(class_id.to_string()));
    if let Err(e) = conn.execute(&sql, params_from_iter(bind)) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", class_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let student_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM students WHERE class_id = ?1",
        [class_id],
        |row| row.get(0),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if student_count > 0 {
        return err(
            &req.id,
            "class_not_empty",
            "remove students first",
            Some(json!({ "studentCount": student_count })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicit deletes in dependency order (no ON DELETE CASCADE).
    if let Err(e) = tx.execute(
        "DELETE FROM grade_entries
         WHERE class_subject_id IN (SELECT id FROM class_subjects WHERE class_id = ?1)",
        [class_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM report_cards WHERE class_id = ?1", [class_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM class_subjects WHERE class_id = ?1", [class_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM classes WHERE id = ?1", [class_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_teachers_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
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
    let email = req
        .params
        .get("email")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let teacher_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO teachers(id, last_name, first_name, email) VALUES(?1, ?2, ?3, ?4)",
        (&teacher_id, last_name, first_name, &email),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "teacherId": teacher_id }))
}

fn handle_teachers_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT t.id, t.last_name, t.first_name, t.email,
                (SELECT COUNT(*) FROM class_subjects cs WHERE cs.teacher_id = t.id) AS assignment_count
         FROM teachers t
         ORDER BY t.last_name, t.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let last_name: String = row.get(1)?;
            let first_name: String = row.get(2)?;
            let email: Option<String> = row.get(3)?;
            let assignment_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "lastName": last_name,
                "firstName": first_name,
                "email": email,
                "assignmentCount": assignment_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(teachers) => ok(&req.id, json!({ "teachers": teachers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let short_code = match req
        .params
        .get("shortCode")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        Some(s) => s.to_uppercase(),
        None => name.chars().take(3).collect::<String>().to_uppercase(),
    };

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, name, short_code) VALUES(?1, ?2, ?3)",
        (&subject_id, name, &short_code),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }
    ok(&req.id, json!({ "subjectId": subject_id, "shortCode": short_code }))
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT s.id, s.name, s.short_code,
                (SELECT COUNT(*) FROM class_subjects cs WHERE cs.subject_id = s.id) AS class_count
         FROM subjects s
         ORDER BY s.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let short_code: String = row.get(2)?;
            let class_count: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "shortCode": short_code,
                "classCount": class_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_curriculum_assign(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(coefficient) = req.params.get("coefficient").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "missing coefficient", None);
    };
    if !coefficient.is_finite() || coefficient <= 0.0 {
        return err(&req.id, "bad_params", "coefficient must be a number > 0", None);
    }
    let teacher_id = req
        .params
        .get("teacherId")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    match row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", class_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    match row_exists(conn, "SELECT 1 FROM subjects WHERE id = ?", subject_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if let Some(teacher_id) = &teacher_id {
        match row_exists(conn, "SELECT 1 FROM teachers WHERE id = ?", teacher_id) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", "teacher not found", None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM class_subjects WHERE class_id = ?1",
        [class_id],
        |row| row.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Re-assigning an existing subject updates its coefficient and teacher
    // but keeps the original row id and position.
    let new_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO class_subjects(id, class_id, subject_id, teacher_id, coefficient, sort_order)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(class_id, subject_id) DO UPDATE SET
             coefficient = excluded.coefficient,
             teacher_id = excluded.teacher_id",
        (&new_id, class_id, subject_id, &teacher_id, coefficient, sort_order),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    let class_subject_id: String = match conn.query_row(
        "SELECT id FROM class_subjects WHERE class_id = ?1 AND subject_id = ?2",
        (class_id, subject_id),
        |row| row.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({ "classSubjectId": class_subject_id, "coefficient": coefficient }),
    )
}

fn handle_curriculum_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", class_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let mut stmt = match conn.prepare(
        "SELECT cs.id, cs.subject_id, s.name, s.short_code, cs.coefficient, cs.sort_order,
                cs.teacher_id, t.last_name, t.first_name,
                (SELECT COUNT(*) FROM grade_entries g WHERE g.class_subject_id = cs.id) AS entry_count
         FROM class_subjects cs
         JOIN subjects s ON s.id = cs.subject_id
         LEFT JOIN teachers t ON t.id = cs.teacher_id
         WHERE cs.class_id = ?1
         ORDER BY cs.sort_order, s.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([class_id], |row| {
            let id: String = row.get(0)?;
            let subject_id: String = row.get(1)?;
            let name: String = row.get(2)?;
            let short_code: String = row.get(3)?;
            let coefficient: f64 = row.get(4)?;
            let sort_order: i64 = row.get(5)?;
            let teacher_id: Option<String> = row.get(6)?;
            let teacher_last: Option<String> = row.get(7)?;
            let teacher_first: Option<String> = row.get(8)?;
            let entry_count: i64 = row.get(9)?;
            let teacher_name = match (teacher_last, teacher_first) {
                (Some(last), Some(first)) => Some(format!("{}, {}", last, first)),
                _ => None,
            };
            Ok(json!({
                "classSubjectId": id,
                "subjectId": subject_id,
                "name": name,
                "shortCode": short_code,
                "coefficient": coefficient,
                "sortOrder": sort_order,
                "teacherId": teacher_id,
                "teacherName": teacher_name,
                "entryCount": entry_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_curriculum_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_subject_id = match required_str(req, "classSubjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match row_exists(conn, "SELECT 1 FROM class_subjects WHERE id = ?", class_subject_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "curriculum subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let entry_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM grade_entries WHERE class_subject_id = ?1",
        [class_subject_id],
        |row| row.get(0),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if entry_count > 0 {
        return err(
            &req.id,
            "subject_in_use",
            "remove grade entries first",
            Some(json!({ "entryCount": entry_count })),
        );
    }

    if let Err(e) = conn.execute(
        "DELETE FROM class_subjects WHERE id = ?1",
        [class_subject_id],
    ) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.update" => Some(handle_classes_update(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        "teachers.create" => Some(handle_teachers_create(state, req)),
        "teachers.list" => Some(handle_teachers_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "curriculum.assign" => Some(handle_curriculum_assign(state, req)),
        "curriculum.list" => Some(handle_curriculum_list(state, req)),
        "curriculum.remove" => Some(handle_curriculum_remove(state, req)),
        _ => None,
    }
}
