use crate::calc::{self, GradingBand, GradingScale, WeightPolicy};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

fn parse_number(v: &Value, key: &str) -> Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    if !n.is_finite() {
        return Err(format!("{} must be a finite number", key));
    }
    Ok(n)
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn grading_json(cfg: &calc::GradingConfig) -> Value {
    json!({
        "scale": cfg.scale,
        "weightPolicy": cfg.weight_policy.as_str(),
        "bands": cfg.bands,
    })
}

fn merge_scale_patch(scale: &mut GradingScale, patch: &Map<String, Value>) -> Result<(), String> {
    for (k, v) in patch {
        match k.as_str() {
            "gradeMin" => scale.grade_min = parse_number(v, k)?,
            "gradeMax" => scale.grade_max = parse_number(v, k)?,
            "precision" => scale.precision = parse_i64_range(v, k, 0, 4)? as u32,
            _ => return Err(format!("unknown scale field: {}", k)),
        }
    }
    Ok(())
}

fn parse_bands(v: &Value) -> Result<Vec<GradingBand>, String> {
    let arr = v
        .as_array()
        .ok_or_else(|| "bands must be an array".to_string())?;
    if arr.is_empty() {
        return Err("bands must not be empty".to_string());
    }
    let mut bands = Vec::with_capacity(arr.len());
    for (i, item) in arr.iter().enumerate() {
        let obj = item
            .as_object()
            .ok_or_else(|| format!("bands[{}] must be an object", i))?;
        for k in obj.keys() {
            if k != "label" && k != "min" {
                return Err(format!("unknown band field: {}", k));
            }
        }
        let label_raw = obj
            .get("label")
            .ok_or_else(|| format!("bands[{}].label is required", i))?;
        let label = parse_string_max(label_raw, "bands[].label", 40)?;
        if label.is_empty() {
            return Err(format!("bands[{}].label must not be empty", i));
        }
        let min_raw = obj
            .get("min")
            .ok_or_else(|| format!("bands[{}].min is required", i))?;
        let min = parse_number(min_raw, "bands[].min")?;
        bands.push(GradingBand { label, min });
    }
    Ok(bands)
}

fn apply_grading_patch(
    cfg: &mut calc::GradingConfig,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    for (k, v) in patch {
        match k.as_str() {
            "scale" => {
                let obj = v
                    .as_object()
                    .ok_or_else(|| "scale must be an object".to_string())?;
                merge_scale_patch(&mut cfg.scale, obj)?;
            }
            "weightPolicy" => {
                let s = v
                    .as_str()
                    .ok_or_else(|| "weightPolicy must be a string".to_string())?;
                cfg.weight_policy = WeightPolicy::parse(s).ok_or_else(|| {
                    "weightPolicy must be one of: subjectCoefficient, entryCoefficients".to_string()
                })?;
            }
            "bands" => cfg.bands = parse_bands(v)?,
            _ => return Err(format!("unknown grading field: {}", k)),
        }
    }
    Ok(())
}

// The patched config is validated as a whole, so a scale change that leaves
// saved bands outside the new bounds is rejected unless the bands move in
// the same patch.
fn validate_config(cfg: &calc::GradingConfig) -> Result<(), String> {
    if cfg.scale.grade_min >= cfg.scale.grade_max {
        return Err("gradeMin must be less than gradeMax".to_string());
    }
    if cfg.bands.is_empty() {
        return Err("bands must not be empty".to_string());
    }
    for pair in cfg.bands.windows(2) {
        if pair[0].min <= pair[1].min {
            return Err("band bounds must be strictly descending".to_string());
        }
    }
    for band in &cfg.bands {
        if band.min < cfg.scale.grade_min || band.min > cfg.scale.grade_max {
            return Err("band bounds must lie inside the grade scale".to_string());
        }
    }
    Ok(())
}

fn handle_grading_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let cfg = calc::GradingConfig::load(conn);
    ok(&req.id, grading_json(&cfg))
}

fn handle_grading_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut cfg = calc::GradingConfig::load(conn);
    if let Err(msg) = apply_grading_patch(&mut cfg, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(msg) = validate_config(&cfg) {
        return err(&req.id, "bad_params", msg, None);
    }

    let doc = grading_json(&cfg);
    if let Err(e) = db::settings_set_json(conn, calc::SETTING_SCALE, &doc["scale"]) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = db::settings_set_json(conn, calc::SETTING_WEIGHT_POLICY, &doc["weightPolicy"]) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = db::settings_set_json(conn, calc::SETTING_BANDS, &doc["bands"]) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, doc)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.gradingOpen" => Some(handle_grading_open(state, req)),
        "setup.gradingUpdate" => Some(handle_grading_update(state, req)),
        _ => None,
    }
}
