use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn calc_context<'a>(
    conn: &'a Connection,
    class_id: &'a str,
    period_id: &'a str,
) -> calc::CalcContext<'a> {
    calc::CalcContext {
        conn,
        class_id,
        period_id,
    }
}

fn calc_err(req: &Request, e: calc::CalcError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

fn handle_reports_class_results_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let period_id = match required_str(req, "periodId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let cfg = calc::GradingConfig::load(conn);
    match calc::compute_class_results(&calc_context(conn, &class_id, &period_id), &cfg) {
        Ok(results) => ok(&req.id, json!(results)),
        Err(e) => calc_err(req, e),
    }
}

fn handle_reports_student_result_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let period_id = match required_str(req, "periodId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let cfg = calc::GradingConfig::load(conn);
    match calc::compute_class_results(&calc_context(conn, &class_id, &period_id), &cfg) {
        Ok(results) => {
            let Some(student) = calc::find_student(&results, &student_id).cloned() else {
                return err(&req.id, "not_found", "student not found in class", None);
            };
            ok(
                &req.id,
                json!({
                    "class": results.class,
                    "period": results.period,
                    "scale": results.scale,
                    "weightPolicy": results.weight_policy,
                    "student": student,
                    "classSize": results.stats.ranked_count,
                    "stats": results.stats,
                }),
            )
        }
        Err(e) => calc_err(req, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.classResultsModel" => Some(handle_reports_class_results_model(state, req)),
        "reports.studentResultModel" => Some(handle_reports_student_result_model(state, req)),
        _ => None,
    }
}
