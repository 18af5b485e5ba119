use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::db;

pub const SETTING_SCALE: &str = "grading.scale";
pub const SETTING_WEIGHT_POLICY: &str = "grading.weightPolicy";
pub const SETTING_BANDS: &str = "grading.bands";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GradingScale {
    pub grade_min: f64,
    pub grade_max: f64,
    pub precision: u32,
}

impl Default for GradingScale {
    fn default() -> Self {
        GradingScale {
            grade_min: 0.0,
            grade_max: 20.0,
            precision: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightPolicy {
    /// Each subject weighs its curriculum coefficient in the overall mean.
    SubjectCoefficient,
    /// Each subject weighs the sum of its entry coefficients instead.
    EntryCoefficients,
}

impl WeightPolicy {
    pub fn parse(raw: &str) -> Option<WeightPolicy> {
        match raw {
            "subjectCoefficient" => Some(WeightPolicy::SubjectCoefficient),
            "entryCoefficients" => Some(WeightPolicy::EntryCoefficients),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WeightPolicy::SubjectCoefficient => "subjectCoefficient",
            WeightPolicy::EntryCoefficients => "entryCoefficients",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingBand {
    pub label: String,
    pub min: f64,
}

#[derive(Debug, Clone)]
pub struct GradingConfig {
    pub scale: GradingScale,
    pub weight_policy: WeightPolicy,
    pub bands: Vec<GradingBand>,
}

impl Default for GradingConfig {
    fn default() -> Self {
        GradingConfig {
            scale: GradingScale::default(),
            weight_policy: WeightPolicy::SubjectCoefficient,
            bands: default_bands(),
        }
    }
}

pub fn default_bands() -> Vec<GradingBand> {
    let band = |label: &str, min: f64| GradingBand {
        label: label.to_string(),
        min,
    };
    vec![
        band("excellent", 16.0),
        band("very good", 14.0),
        band("good", 12.0),
        band("fair", 10.0),
        band("insufficient", 0.0),
    ]
}

impl GradingConfig {
    /// Loads the saved grading settings, falling back to the defaults for
    /// anything missing or unreadable. Saved values are validated on write,
    /// so a fallback here means an untouched or hand-edited workspace.
    pub fn load(conn: &Connection) -> GradingConfig {
        let mut cfg = GradingConfig::default();
        if let Ok(Some(raw)) = db::settings_get_json(conn, SETTING_SCALE) {
            if let Ok(scale) = serde_json::from_value::<GradingScale>(raw) {
                cfg.scale = scale;
            }
        }
        if let Ok(Some(raw)) = db::settings_get_json(conn, SETTING_WEIGHT_POLICY) {
            if let Some(policy) = raw.as_str().and_then(WeightPolicy::parse) {
                cfg.weight_policy = policy;
            }
        }
        if let Ok(Some(raw)) = db::settings_get_json(conn, SETTING_BANDS) {
            if let Ok(bands) = serde_json::from_value::<Vec<GradingBand>>(raw) {
                if !bands.is_empty() {
                    cfg.bands = bands;
                }
            }
        }
        cfg
    }
}

/// Half-up rounding at a fixed number of decimals: `floor(x * 10^p + 0.5) / 10^p`.
/// 13.125 at two decimals rounds to 13.13, never 13.12.
pub fn round_half_up(x: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    ((x * factor) + 0.5).floor() / factor
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> CalcError {
        CalcError {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: &str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> CalcError {
        CalcError {
            code: code.to_string(),
            message: message.into(),
            details: Some(details),
        }
    }
}

fn db_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

/// Weighted average of raw grade entries `(value, coefficient)`. Entries with
/// coefficient 0 carry no weight; `None` when nothing weighs in.
pub fn weighted_subject_average(entries: &[(f64, i64)]) -> Option<f64> {
    let mut weighted_sum = 0.0;
    let mut coefficient_total: i64 = 0;
    for &(value, coefficient) in entries {
        if coefficient <= 0 {
            continue;
        }
        weighted_sum += value * coefficient as f64;
        coefficient_total += coefficient;
    }
    if coefficient_total <= 0 {
        return None;
    }
    Some(weighted_sum / coefficient_total as f64)
}

/// Weighted mean over `(value, weight)` pairs, `None` when the total weight
/// is zero. A missing average is never treated as a zero.
pub fn weighted_mean(terms: &[(f64, f64)]) -> Option<f64> {
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for &(value, weight) in terms {
        if weight <= 0.0 {
            continue;
        }
        weighted_sum += value * weight;
        weight_total += weight;
    }
    if weight_total <= 0.0 {
        return None;
    }
    Some(weighted_sum / weight_total)
}

/// Competition ranking: rank = 1 + number of strictly greater values. Equal
/// values share a rank and the next rank is skipped, so 18, 16, 16, 14 ranks
/// as 1, 2, 2, 4.
pub fn competition_ranks(values: &[i64]) -> Vec<i64> {
    values
        .iter()
        .map(|v| 1 + values.iter().filter(|other| **other > *v).count() as i64)
        .collect()
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}

/// First band whose inclusive lower bound the average reaches; an average
/// below every bound falls into the last band.
pub fn band_index(bands: &[GradingBand], average: f64) -> Option<usize> {
    if bands.is_empty() {
        return None;
    }
    bands
        .iter()
        .position(|b| average >= b.min)
        .or(Some(bands.len() - 1))
}

pub fn band_label<'a>(bands: &'a [GradingBand], average: f64) -> Option<&'a str> {
    band_index(bands, average).map(|i| bands[i].label.as_str())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassHeader {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodHeader {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub active: bool,
    pub validated: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectLine {
    pub class_subject_id: String,
    pub subject_id: String,
    pub name: String,
    pub short_code: String,
    pub coefficient: f64,
    pub entry_count: i64,
    pub coefficient_total: i64,
    pub average: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRow {
    pub student_id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_no: Option<String>,
    pub active: bool,
    pub sort_order: i64,
    pub subjects: Vec<SubjectLine>,
    pub overall_average: Option<f64>,
    pub class_rank: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandCount {
    pub label: String,
    pub min: f64,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStats {
    pub ranked_count: i64,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub median: Option<f64>,
    pub bands: Vec<BandCount>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassResults {
    pub class: ClassHeader,
    pub period: PeriodHeader,
    pub scale: GradingScale,
    pub weight_policy: String,
    pub students: Vec<StudentRow>,
    pub stats: ClassStats,
}

pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub class_id: &'a str,
    pub period_id: &'a str,
}

pub fn find_student<'a>(results: &'a ClassResults, student_id: &str) -> Option<&'a StudentRow> {
    results
        .students
        .iter()
        .find(|s| s.student_id == student_id)
}

/// Computes the full results model for one class in one period: per-student
/// subject averages and overalls, competition ranks over active students
/// with data, and the class statistics. This is derived data only; nothing
/// is written back.
pub fn compute_class_results(
    ctx: &CalcContext<'_>,
    cfg: &GradingConfig,
) -> Result<ClassResults, CalcError> {
    let class_row: Option<(String, Option<String>, String)> = ctx
        .conn
        .query_row(
            "SELECT name, level, school_year_id FROM classes WHERE id = ?1",
            [ctx.class_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(db_err)?;
    let (class_name, class_level, class_year_id) = class_row.ok_or_else(|| {
        CalcError::with_details("not_found", "class not found", json!({ "classId": ctx.class_id }))
    })?;

    let period_row: Option<(String, String, i64, i64, String)> = ctx
        .conn
        .query_row(
            "SELECT name, kind, active, validated, school_year_id FROM periods WHERE id = ?1",
            [ctx.period_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )
        .optional()
        .map_err(db_err)?;
    let (period_name, period_kind, period_active, period_validated, period_year_id) = period_row
        .ok_or_else(|| {
            CalcError::with_details(
                "not_found",
                "period not found",
                json!({ "periodId": ctx.period_id }),
            )
        })?;
    if period_year_id != class_year_id {
        return Err(CalcError::new(
            "bad_params",
            "period belongs to a different school year than the class",
        ));
    }

    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT cs.id, cs.subject_id, s.name, s.short_code, cs.coefficient
             FROM class_subjects cs
             JOIN subjects s ON s.id = cs.subject_id
             WHERE cs.class_id = ?1
             ORDER BY cs.sort_order, s.name",
        )
        .map_err(db_err)?;
    let curriculum: Vec<(String, String, String, String, f64)> = stmt
        .query_map([ctx.class_id], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        })
        .map_err(db_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err)?;

    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT id, last_name, first_name, student_no, active, sort_order
             FROM students
             WHERE class_id = ?1
             ORDER BY last_name, first_name, sort_order",
        )
        .map_err(db_err)?;
    let roster: Vec<(String, String, String, Option<String>, i64, i64)> = stmt
        .query_map([ctx.class_id], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })
        .map_err(db_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err)?;

    // One pass over every entry of the period for this curriculum, folded
    // into (weighted sum, coefficient total, entry count) per student and
    // subject.
    let mut sums: HashMap<(String, String), (f64, i64, i64)> = HashMap::new();
    if !curriculum.is_empty() {
        let placeholders = vec!["?"; curriculum.len()].join(", ");
        let sql = format!(
            "SELECT student_id, class_subject_id, value, coefficient
             FROM grade_entries
             WHERE period_id = ? AND class_subject_id IN ({})",
            placeholders
        );
        let mut params: Vec<Value> = Vec::with_capacity(curriculum.len() + 1);
        params.push(Value::Text(ctx.period_id.to_string()));
        for (cs_id, ..) in &curriculum {
            params.push(Value::Text(cs_id.clone()));
        }
        let mut stmt = ctx.conn.prepare(&sql).map_err(db_err)?;
        let mut rows = stmt.query(params_from_iter(params)).map_err(db_err)?;
        while let Some(row) = rows.next().map_err(db_err)? {
            let student_id: String = row.get(0).map_err(db_err)?;
            let cs_id: String = row.get(1).map_err(db_err)?;
            let value: f64 = row.get(2).map_err(db_err)?;
            let coefficient: i64 = row.get(3).map_err(db_err)?;
            let slot = sums.entry((student_id, cs_id)).or_insert((0.0, 0, 0));
            slot.2 += 1;
            if coefficient > 0 {
                slot.0 += value * coefficient as f64;
                slot.1 += coefficient;
            }
        }
    }

    let precision = cfg.scale.precision;
    let mut students: Vec<StudentRow> = Vec::with_capacity(roster.len());
    for (student_id, last_name, first_name, student_no, active, sort_order) in &roster {
        let mut subjects = Vec::with_capacity(curriculum.len());
        let mut overall_terms: Vec<(f64, f64)> = Vec::new();
        for (cs_id, subject_id, subject_name, short_code, coefficient) in &curriculum {
            let (weighted_sum, coefficient_total, entry_count) = sums
                .get(&(student_id.clone(), cs_id.clone()))
                .copied()
                .unwrap_or((0.0, 0, 0));
            let average = if coefficient_total > 0 {
                Some(round_half_up(
                    weighted_sum / coefficient_total as f64,
                    precision,
                ))
            } else {
                None
            };
            if let Some(avg) = average {
                let weight = match cfg.weight_policy {
                    WeightPolicy::SubjectCoefficient => *coefficient,
                    WeightPolicy::EntryCoefficients => coefficient_total as f64,
                };
                if weight > 0.0 {
                    overall_terms.push((avg, weight));
                }
            }
            subjects.push(SubjectLine {
                class_subject_id: cs_id.clone(),
                subject_id: subject_id.clone(),
                name: subject_name.clone(),
                short_code: short_code.clone(),
                coefficient: *coefficient,
                entry_count,
                coefficient_total,
                average,
            });
        }
        let overall_average = weighted_mean(&overall_terms).map(|v| round_half_up(v, precision));
        students.push(StudentRow {
            student_id: student_id.clone(),
            display_name: format!("{}, {}", last_name, first_name),
            student_no: student_no.clone(),
            active: *active != 0,
            sort_order: *sort_order,
            subjects,
            overall_average,
            class_rank: None,
        });
    }

    // Ranks compare averages rounded to the configured precision, scaled to
    // integers so two students displayed with the same average always share
    // a rank. Inactive students and students without data stay unranked.
    let factor = 10f64.powi(precision as i32);
    let ranked: Vec<(usize, i64)> = students
        .iter()
        .enumerate()
        .filter(|(_, s)| s.active)
        .filter_map(|(i, s)| s.overall_average.map(|avg| (i, (avg * factor).round() as i64)))
        .collect();
    let scaled: Vec<i64> = ranked.iter().map(|(_, v)| *v).collect();
    for ((idx, _), rank) in ranked.iter().zip(competition_ranks(&scaled)) {
        students[*idx].class_rank = Some(rank);
    }

    let ranked_values: Vec<f64> = students
        .iter()
        .filter(|s| s.active)
        .filter_map(|s| s.overall_average)
        .collect();
    let mut bands: Vec<BandCount> = cfg
        .bands
        .iter()
        .map(|b| BandCount {
            label: b.label.clone(),
            min: b.min,
            count: 0,
        })
        .collect();
    for value in &ranked_values {
        if let Some(i) = band_index(&cfg.bands, *value) {
            bands[i].count += 1;
        }
    }
    let stats = if ranked_values.is_empty() {
        ClassStats {
            ranked_count: 0,
            mean: None,
            min: None,
            max: None,
            median: None,
            bands,
        }
    } else {
        let sum: f64 = ranked_values.iter().sum();
        ClassStats {
            ranked_count: ranked_values.len() as i64,
            mean: Some(round_half_up(sum / ranked_values.len() as f64, precision)),
            min: Some(ranked_values.iter().cloned().fold(f64::INFINITY, f64::min)),
            max: Some(
                ranked_values
                    .iter()
                    .cloned()
                    .fold(f64::NEG_INFINITY, f64::max),
            ),
            median: median(&ranked_values).map(|m| round_half_up(m, precision)),
            bands,
        }
    };

    Ok(ClassResults {
        class: ClassHeader {
            id: ctx.class_id.to_string(),
            name: class_name,
            level: class_level,
        },
        period: PeriodHeader {
            id: ctx.period_id.to_string(),
            name: period_name,
            kind: period_kind,
            active: period_active != 0,
            validated: period_validated != 0,
        },
        scale: cfg.scale.clone(),
        weight_policy: cfg.weight_policy.as_str().to_string(),
        students,
        stats,
    })
}
