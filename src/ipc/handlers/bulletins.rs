use crate::bulletin::{self, BulletinDocument};
use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
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

fn calc_err(req: &Request, e: calc::CalcError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

fn compute_results(
    conn: &Connection,
    class_id: &str,
    period_id: &str,
    cfg: &calc::GradingConfig,
) -> Result<calc::ClassResults, calc::CalcError> {
    calc::compute_class_results(
        &calc::CalcContext {
            conn,
            class_id,
            period_id,
        },
        cfg,
    )
}

// Cards can be generated while the grading window is open (provisional) or
// after validation (final), never for a period that was closed without it.
fn check_period_generable(
    conn: &Connection,
    req: &Request,
    period_id: &str,
) -> Result<(), serde_json::Value> {
    let row: Option<(i64, i64)> = conn
        .query_row(
            "SELECT active, validated FROM periods WHERE id = ?1",
            [period_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let Some((active, validated)) = row else {
        return Err(err(&req.id, "not_found", "period not found", None));
    };
    if active == 0 && validated == 0 {
        return Err(err(
            &req.id,
            "period_not_open",
            "period is not open and not validated",
            None,
        ));
    }
    Ok(())
}

fn optional_appreciation(req: &Request) -> Option<String> {
    req.params
        .get("appreciation")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn handle_bulletins_generate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
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
    let appreciation = optional_appreciation(req);

    let class_id: Option<String> = match conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?1",
            [&student_id],
            |row| row.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(class_id) = class_id else {
        return err(&req.id, "not_found", "student not found", None);
    };
    if let Err(e) = check_period_generable(conn, req, &period_id) {
        return e;
    }

    let cfg = calc::GradingConfig::load(conn);
    let results = match compute_results(conn, &class_id, &period_id, &cfg) {
        Ok(r) => r,
        Err(e) => return calc_err(req, e),
    };
    let Some(student) = calc::find_student(&results, &student_id) else {
        return err(&req.id, "not_found", "student not found in class", None);
    };
    match bulletin::upsert_report_card(
        conn,
        student,
        &class_id,
        &period_id,
        results.stats.ranked_count,
        appreciation.as_deref(),
    ) {
        Ok(generated) => ok(
            &req.id,
            json!({ "card": generated.card, "created": generated.created }),
        ),
        Err(e) => calc_err(req, e),
    }
}

fn handle_bulletins_generate_class(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    if let Err(e) = check_period_generable(conn, req, &period_id) {
        return e;
    }

    let cfg = calc::GradingConfig::load(conn);
    let results = match compute_results(conn, &class_id, &period_id, &cfg) {
        Ok(r) => r,
        Err(e) => return calc_err(req, e),
    };

    let mut generated: Vec<serde_json::Value> = Vec::new();
    let mut skipped: Vec<serde_json::Value> = Vec::new();
    for student in results.students.iter().filter(|s| s.active) {
        match bulletin::upsert_report_card(
            conn,
            student,
            &class_id,
            &period_id,
            results.stats.ranked_count,
            None,
        ) {
            Ok(g) => generated.push(json!({
                "studentId": student.student_id,
                "cardId": g.card.id,
                "overallAverage": g.card.overall_average,
                "classRank": g.card.class_rank,
                "created": g.created,
            })),
            Err(e) if e.code == "insufficient_data" => skipped.push(json!({
                "studentId": student.student_id,
                "code": e.code,
                "message": e.message,
            })),
            Err(e) => return calc_err(req, e),
        }
    }

    ok(
        &req.id,
        json!({
            "generated": generated,
            "skipped": skipped,
            "classSize": results.stats.ranked_count,
        }),
    )
}

fn handle_bulletins_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
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

    match bulletin::load_report_card(conn, &student_id, &period_id) {
        Ok(Some(card)) => ok(&req.id, json!({ "card": card })),
        Ok(None) => err(&req.id, "not_found", "report card not generated", None),
        Err(e) => calc_err(req, e),
    }
}

fn handle_bulletins_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let class_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?1", [&class_id], |row| {
            row.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if class_exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let mut stmt = match conn.prepare(
        "SELECT rc.id, rc.student_id, s.last_name, s.first_name, rc.overall_average,
                rc.class_rank, rc.class_size, rc.general_appreciation, rc.generated_at
         FROM report_cards rc
         JOIN students s ON s.id = rc.student_id
         WHERE rc.class_id = ?1 AND rc.period_id = ?2
         ORDER BY rc.class_rank IS NULL, rc.class_rank, s.last_name, s.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let cards = match stmt
        .query_map((&class_id, &period_id), |row| {
            let card_id: String = row.get(0)?;
            let student_id: String = row.get(1)?;
            let last: String = row.get(2)?;
            let first: String = row.get(3)?;
            let overall: f64 = row.get(4)?;
            let rank: Option<i64> = row.get(5)?;
            let size: i64 = row.get(6)?;
            let appreciation: Option<String> = row.get(7)?;
            let generated_at: String = row.get(8)?;
            Ok(json!({
                "cardId": card_id,
                "studentId": student_id,
                "displayName": format!("{}, {}", last, first),
                "overallAverage": overall,
                "classRank": rank,
                "classSize": size,
                "generalAppreciation": appreciation,
                "generatedAt": generated_at,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "cards": cards }))
}

fn handle_bulletins_update_appreciation(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
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
    let appreciation = match req.params.get("appreciation") {
        None => return err(&req.id, "bad_params", "missing appreciation", None),
        Some(serde_json::Value::Null) => None,
        Some(v) => match v.as_str() {
            Some(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "appreciation must be a string or null",
                    None,
                )
            }
        },
    };

    let card_id: Option<String> = match conn
        .query_row(
            "SELECT id FROM report_cards WHERE student_id = ?1 AND period_id = ?2",
            (&student_id, &period_id),
            |row| row.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(card_id) = card_id else {
        return err(&req.id, "not_found", "report card not generated", None);
    };

    if let Err(e) = conn.execute(
        "UPDATE report_cards SET general_appreciation = ?1 WHERE id = ?2",
        (&appreciation, &card_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_bulletins_render_html(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
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
    let out_path = req
        .params
        .get("outPath")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let card = match bulletin::load_report_card(conn, &student_id, &period_id) {
        Ok(Some(card)) => card,
        Ok(None) => return err(&req.id, "not_found", "report card not generated", None),
        Err(e) => return calc_err(req, e),
    };
    // Subject lines come from a fresh computation; the headline figures stay
    // the persisted ones so the card matches what was generated.
    let cfg = calc::GradingConfig::load(conn);
    let results = match compute_results(conn, &card.class_id, &period_id, &cfg) {
        Ok(r) => r,
        Err(e) => return calc_err(req, e),
    };
    let Some(student) = calc::find_student(&results, &student_id) else {
        return err(&req.id, "not_found", "student not found in class", None);
    };

    let year_label: Option<String> = match conn
        .query_row(
            "SELECT y.label FROM school_years y
             JOIN classes c ON c.school_year_id = y.id
             WHERE c.id = ?1",
            [&card.class_id],
            |row| row.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let year_label = year_label.unwrap_or_default();

    let band = calc::band_label(&cfg.bands, card.overall_average);
    let html = bulletin::render_bulletin_html(&BulletinDocument {
        school_year_label: &year_label,
        results: &results,
        student,
        card: &card,
        band_label: band,
    });

    if let Some(path) = &out_path {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return err(&req.id, "io_failed", e.to_string(), None);
            }
        }
        if let Err(e) = std::fs::write(path, &html) {
            return err(&req.id, "io_failed", e.to_string(), None);
        }
    }
    ok(&req.id, json!({ "html": html, "writtenTo": out_path }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "bulletins.generate" => Some(handle_bulletins_generate(state, req)),
        "bulletins.generateClass" => Some(handle_bulletins_generate_class(state, req)),
        "bulletins.get" => Some(handle_bulletins_get(state, req)),
        "bulletins.list" => Some(handle_bulletins_list(state, req)),
        "bulletins.updateAppreciation" => Some(handle_bulletins_update_appreciation(state, req)),
        "bulletins.renderHtml" => Some(handle_bulletins_render_html(state, req)),
        _ => None,
    }
}
