use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
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

fn optional_date(req: &Request, key: &str) -> Result<Option<String>, serde_json::Value> {
    match req.params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => {
            let Some(raw) = v.as_str() else {
                return Err(err(
                    &req.id,
                    "bad_params",
                    format!("{key} must be a string"),
                    None,
                ));
            };
            let raw = raw.trim();
            if raw.is_empty() {
                return Ok(None);
            }
            if NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_err() {
                return Err(err(
                    &req.id,
                    "bad_params",
                    format!("{key} must be an ISO date (YYYY-MM-DD)"),
                    None,
                ));
            }
            Ok(Some(raw.to_string()))
        }
    }
}

fn handle_years_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let label = match required_str(req, "label") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start_date = match optional_date(req, "startDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end_date = match optional_date(req, "endDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let (Some(s), Some(e)) = (&start_date, &end_date) {
        // ISO dates compare lexically.
        if s > e {
            return err(&req.id, "bad_params", "startDate must not be after endDate", None);
        }
    }

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO school_years(id, label, start_date, end_date) VALUES(?1, ?2, ?3, ?4)",
        (&id, label, &start_date, &end_date),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "schoolYearId": id }))
}

fn handle_years_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT y.id, y.label, y.start_date, y.end_date,
                (SELECT COUNT(*) FROM periods p WHERE p.school_year_id = y.id),
                (SELECT COUNT(*) FROM classes c WHERE c.school_year_id = y.id)
         FROM school_years y
         ORDER BY y.label",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, i64>(5)?,
        ))
    });
    let mut out = Vec::new();
    match rows {
        Ok(mapped) => {
            for m in mapped {
                match m {
                    Ok((id, label, start, end, period_count, class_count)) => out.push(json!({
                        "id": id,
                        "label": label,
                        "startDate": start,
                        "endDate": end,
                        "periodCount": period_count,
                        "classCount": class_count,
                    })),
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                }
            }
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    ok(&req.id, json!({ "years": out }))
}

fn handle_periods_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let kind = match required_str(req, "kind") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if kind != "term" && kind != "semester" {
        return err(
            &req.id,
            "bad_params",
            "kind must be one of: term, semester",
            None,
        );
    }
    let start_date = match optional_date(req, "startDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end_date = match optional_date(req, "endDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let (Some(s), Some(e)) = (&start_date, &end_date) {
        if s > e {
            return err(&req.id, "bad_params", "startDate must not be after endDate", None);
        }
    }

    let year_exists: Result<Option<i64>, _> = conn
        .query_row(
            "SELECT 1 FROM school_years WHERE id = ?1",
            [year_id],
            |row| row.get(0),
        )
        .optional();
    match year_exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "school year not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM periods WHERE school_year_id = ?1",
        [year_id],
        |row| row.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO periods(id, school_year_id, name, kind, start_date, end_date, sort_order, active, validated)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0)",
        (&id, year_id, name, kind, &start_date, &end_date, sort_order),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "periodId": id, "sortOrder": sort_order }))
}

fn handle_periods_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let year_id = match required_str(req, "schoolYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT p.id, p.name, p.kind, p.start_date, p.end_date, p.sort_order, p.active, p.validated,
                (SELECT COUNT(*) FROM grade_entries g WHERE g.period_id = p.id)
         FROM periods p
         WHERE p.school_year_id = ?1
         ORDER BY p.sort_order, p.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt.query_map([year_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, i64>(5)?,
            row.get::<_, i64>(6)?,
            row.get::<_, i64>(7)?,
            row.get::<_, i64>(8)?,
        ))
    });
    let mut out = Vec::new();
    match rows {
        Ok(mapped) => {
            for m in mapped {
                match m {
                    Ok((id, name, kind, start, end, sort_order, active, validated, entry_count)) => {
                        out.push(json!({
                            "id": id,
                            "name": name,
                            "kind": kind,
                            "startDate": start,
                            "endDate": end,
                            "sortOrder": sort_order,
                            "active": active != 0,
                            "validated": validated != 0,
                            "entryCount": entry_count,
                        }))
                    }
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                }
            }
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    ok(&req.id, json!({ "periods": out }))
}

fn handle_periods_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let period_id = match required_str(req, "periodId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let existing: Result<Option<(i64, Option<String>, Option<String>)>, _> = conn
        .query_row(
            "SELECT validated, start_date, end_date FROM periods WHERE id = ?1",
            [period_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional();
    let (validated, current_start, current_end) = match existing {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "period not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if validated != 0 {
        return err(&req.id, "period_locked", "period is validated", None);
    }

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind: Vec<Value> = Vec::new();
    let mut next_start = current_start;
    let mut next_end = current_end;
    for (k, v) in patch {
        match k.as_str() {
            "name" => {
                let Some(name) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    return err(&req.id, "bad_params", "name must be a non-empty string", None);
                };
                set_parts.push("name = ?".to_string());
                bind.push(Value::Text(name.to_string()));
            }
            "startDate" | "endDate" => {
                let parsed = if v.is_null() {
                    None
                } else {
                    let Some(raw) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                        return err(&req.id, "bad_params", format!("{k} must be a date or null"), None);
                    };
                    if NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_err() {
                        return err(
                            &req.id,
                            "bad_params",
                            format!("{k} must be an ISO date (YYYY-MM-DD)"),
                            None,
                        );
                    }
                    Some(raw.to_string())
                };
                let column = if k == "startDate" { "start_date" } else { "end_date" };
                set_parts.push(format!("{} = ?", column));
                bind.push(match &parsed {
                    Some(s) => Value::Text(s.clone()),
                    None => Value::Null,
                });
                if k == "startDate" {
                    next_start = parsed;
                } else {
                    next_end = parsed;
                }
            }
            _ => return err(&req.id, "bad_params", format!("unknown period field: {}", k), None),
        }
    }
    if set_parts.is_empty() {
        return err(&req.id, "bad_params", "empty patch", None);
    }
    if let (Some(s), Some(e)) = (&next_start, &next_end) {
        if s > e {
            return err(&req.id, "bad_params", "startDate must not be after endDate", None);
        }
    }

    let sql = format!("UPDATE periods SET {} WHERE id = ?", set_parts.join(", "));
    bind.push(Value::Text(period_id.to_string()));
    if let Err(e) = conn.execute(&sql, params_from_iter(bind)) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_periods_set_active(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let period_id = match required_str(req, "periodId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(active) = req.params.get("active").and_then(|v| v.as_bool()) else {
        return err(&req.id, "bad_params", "missing active", None);
    };

    let existing: Result<Option<(String, i64)>, _> = conn
        .query_row(
            "SELECT school_year_id, validated FROM periods WHERE id = ?1",
            [period_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional();
    let (year_id, validated) = match existing {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "period not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if active && validated != 0 {
        return err(
            &req.id,
            "period_locked",
            "a validated period cannot be reopened",
            None,
        );
    }

    if !active {
        if let Err(e) = conn.execute("UPDATE periods SET active = 0 WHERE id = ?1", [period_id]) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        return ok(&req.id, json!({ "ok": true, "active": false }));
    }

    // One open grading window per school year.
    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "UPDATE periods SET active = 0 WHERE school_year_id = ?1 AND id != ?2",
        (&year_id, period_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("UPDATE periods SET active = 1 WHERE id = ?1", [period_id]) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true, "active": true }))
}

fn handle_periods_validate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let period_id = match required_str(req, "periodId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let existing: Result<Option<i64>, _> = conn
        .query_row(
            "SELECT validated FROM periods WHERE id = ?1",
            [period_id],
            |row| row.get(0),
        )
        .optional();
    let validated = match existing {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "period not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if validated != 0 {
        return ok(&req.id, json!({ "alreadyValidated": true, "entriesLocked": 0 }));
    }

    // Entries are stamped before the period flips so the lock triggers do
    // not fire on the stamping update itself.
    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let entries_locked = match tx.execute(
        "UPDATE grade_entries SET validated = 1 WHERE period_id = ?1",
        [period_id],
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "UPDATE periods SET validated = 1, active = 0 WHERE id = ?1",
        [period_id],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "validated": true, "entriesLocked": entries_locked }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "years.create" => Some(handle_years_create(state, req)),
        "years.list" => Some(handle_years_list(state, req)),
        "periods.create" => Some(handle_periods_create(state, req)),
        "periods.list" => Some(handle_periods_list(state, req)),
        "periods.update" => Some(handle_periods_update(state, req)),
        "periods.setActive" => Some(handle_periods_set_active(state, req)),
        "periods.validate" => Some(handle_periods_validate(state, req)),
        _ => None,
    }
}
