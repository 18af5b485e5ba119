use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::calc::{CalcError, ClassResults, StudentRow};

/// A persisted report card. Once generated it keeps the figures it was
/// generated with; later grade edits only show up after a regenerate.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub id: String,
    pub student_id: String,
    pub period_id: String,
    pub class_id: String,
    pub overall_average: f64,
    pub class_rank: Option<i64>,
    pub class_size: i64,
    pub general_appreciation: Option<String>,
    pub generated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedCard {
    pub card: ReportCard,
    pub created: bool,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn load_report_card(
    conn: &Connection,
    student_id: &str,
    period_id: &str,
) -> Result<Option<ReportCard>, CalcError> {
    conn.query_row(
        "SELECT id, student_id, period_id, class_id, overall_average, class_rank,
                class_size, general_appreciation, generated_at
         FROM report_cards
         WHERE student_id = ?1 AND period_id = ?2",
        (student_id, period_id),
        |row| {
            Ok(ReportCard {
                id: row.get(0)?,
                student_id: row.get(1)?,
                period_id: row.get(2)?,
                class_id: row.get(3)?,
                overall_average: row.get(4)?,
                class_rank: row.get(5)?,
                class_size: row.get(6)?,
                general_appreciation: row.get(7)?,
                generated_at: row.get(8)?,
            })
        },
    )
    .optional()
    .map_err(|e| CalcError::new("db_query_failed", e.to_string()))
}

/// Creates or refreshes the card for one computed student row. On refresh
/// the stored appreciation is preserved unless a replacement is passed in.
pub fn upsert_report_card(
    conn: &Connection,
    student: &StudentRow,
    class_id: &str,
    period_id: &str,
    class_size: i64,
    appreciation: Option<&str>,
) -> Result<GeneratedCard, CalcError> {
    let overall = student.overall_average.ok_or_else(|| {
        CalcError::with_details(
            "insufficient_data",
            "student has no subject average in this period",
            json!({ "studentId": student.student_id }),
        )
    })?;

    let existing: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT id, general_appreciation FROM report_cards
             WHERE student_id = ?1 AND period_id = ?2",
            (student.student_id.as_str(), period_id),
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let generated_at = now_rfc3339();
    match existing {
        Some((card_id, stored_appreciation)) => {
            let kept = match appreciation {
                Some(text) => Some(text.to_string()),
                None => stored_appreciation,
            };
            conn.execute(
                "UPDATE report_cards
                 SET overall_average = ?1, class_rank = ?2, class_size = ?3,
                     general_appreciation = ?4, generated_at = ?5
                 WHERE id = ?6",
                (
                    overall,
                    student.class_rank,
                    class_size,
                    &kept,
                    &generated_at,
                    &card_id,
                ),
            )
            .map_err(|e| CalcError::new("db_update_failed", e.to_string()))?;
            Ok(GeneratedCard {
                card: ReportCard {
                    id: card_id,
                    student_id: student.student_id.clone(),
                    period_id: period_id.to_string(),
                    class_id: class_id.to_string(),
                    overall_average: overall,
                    class_rank: student.class_rank,
                    class_size,
                    general_appreciation: kept,
                    generated_at,
                },
                created: false,
            })
        }
        None => {
            let card_id = Uuid::new_v4().to_string();
            let stored = appreciation.map(|s| s.to_string());
            conn.execute(
                "INSERT INTO report_cards(
                    id, student_id, period_id, class_id, overall_average,
                    class_rank, class_size, general_appreciation, generated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                (
                    &card_id,
                    student.student_id.as_str(),
                    period_id,
                    class_id,
                    overall,
                    student.class_rank,
                    class_size,
                    &stored,
                    &generated_at,
                ),
            )
            .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;
            Ok(GeneratedCard {
                card: ReportCard {
                    id: card_id,
                    student_id: student.student_id.clone(),
                    period_id: period_id.to_string(),
                    class_id: class_id.to_string(),
                    overall_average: overall,
                    class_rank: student.class_rank,
                    class_size,
                    general_appreciation: stored,
                    generated_at,
                },
                created: true,
            })
        }
    }
}

pub struct BulletinDocument<'a> {
    pub school_year_label: &'a str,
    pub results: &'a ClassResults,
    pub student: &'a StudentRow,
    pub card: &'a ReportCard,
    pub band_label: Option<&'a str>,
}

/// Renders the printable card. This is substitution into a fixed template
/// only; every figure comes from the persisted card and the computed
/// breakdown handed in by the caller.
pub fn render_bulletin_html(doc: &BulletinDocument<'_>) -> String {
    let precision = doc.results.scale.precision as usize;
    let mut html = String::with_capacity(4096);
    html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    html.push_str("<title>Report card - ");
    html.push_str(&html_escape(&doc.student.display_name));
    html.push_str("</title>\n<style>\n");
    html.push_str(
        "body { font-family: sans-serif; margin: 2rem; color: #111; }\n\
         h1 { font-size: 1.3rem; margin-bottom: 0; }\n\
         p.meta { color: #444; margin: 0.2rem 0; }\n\
         table { border-collapse: collapse; width: 100%; margin-top: 1rem; }\n\
         th, td { border: 1px solid #999; padding: 0.3rem 0.5rem; text-align: left; }\n\
         th { background: #eee; }\n\
         td.num, th.num { text-align: right; }\n\
         div.summary { margin-top: 1rem; }\n\
         p.appreciation { margin-top: 1rem; font-style: italic; }\n\
         p.footer { margin-top: 2rem; font-size: 0.8rem; color: #666; }\n",
    );
    html.push_str("</style>\n</head>\n<body>\n<h1>Report card</h1>\n");

    html.push_str("<p class=\"meta\">");
    html.push_str(&html_escape(doc.school_year_label));
    html.push_str(" &middot; ");
    html.push_str(&html_escape(&doc.results.class.name));
    html.push_str(" &middot; ");
    html.push_str(&html_escape(&doc.results.period.name));
    html.push_str("</p>\n");

    html.push_str("<p class=\"meta\">");
    html.push_str(&html_escape(&doc.student.display_name));
    if let Some(no) = &doc.student.student_no {
        html.push_str(" (no. ");
        html.push_str(&html_escape(no));
        html.push(')');
    }
    html.push_str("</p>\n");

    html.push_str(
        "<table>\n<thead><tr><th>Subject</th><th class=\"num\">Coefficient</th>\
         <th class=\"num\">Entries</th><th class=\"num\">Average</th></tr></thead>\n<tbody>\n",
    );
    for line in &doc.student.subjects {
        html.push_str("<tr><td>");
        html.push_str(&html_escape(&line.name));
        html.push_str("</td><td class=\"num\">");
        html.push_str(&fmt_coefficient(line.coefficient));
        html.push_str("</td><td class=\"num\">");
        html.push_str(&line.entry_count.to_string());
        html.push_str("</td><td class=\"num\">");
        html.push_str(&fmt_optional(line.average, precision));
        html.push_str("</td></tr>\n");
    }
    html.push_str("</tbody>\n</table>\n");

    html.push_str("<div class=\"summary\">\n<p>Overall average: <strong>");
    html.push_str(&fmt_number(doc.card.overall_average, precision));
    html.push_str("</strong>");
    if let Some(label) = doc.band_label {
        html.push_str(" (");
        html.push_str(&html_escape(label));
        html.push(')');
    }
    html.push_str("</p>\n<p>Rank: ");
    match doc.card.class_rank {
        Some(rank) => {
            html.push_str(&rank.to_string());
            html.push_str(" / ");
            html.push_str(&doc.card.class_size.to_string());
        }
        None => html.push('-'),
    }
    html.push_str("</p>\n<p>Class average: ");
    html.push_str(&fmt_optional(doc.results.stats.mean, precision));
    html.push_str(" (min ");
    html.push_str(&fmt_optional(doc.results.stats.min, precision));
    html.push_str(", max ");
    html.push_str(&fmt_optional(doc.results.stats.max, precision));
    html.push_str(")</p>\n</div>\n");

    if let Some(text) = &doc.card.general_appreciation {
        html.push_str("<p class=\"appreciation\">");
        html.push_str(&html_escape(text));
        html.push_str("</p>\n");
    }

    html.push_str("<p class=\"footer\">Generated at ");
    html.push_str(&html_escape(&doc.card.generated_at));
    html.push_str("</p>\n</body>\n</html>\n");
    html
}

fn html_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn fmt_number(value: f64, precision: usize) -> String {
    format!("{:.*}", precision, value)
}

fn fmt_optional(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) => fmt_number(v, precision),
        None => "-".to_string(),
    }
}

// Whole coefficients print without decimals; 1.5 stays 1.5.
fn fmt_coefficient(value: f64) -> String {
    if (value - value.round()).abs() < 1e-9 {
        format!("{}", value.round() as i64)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::{
        BandCount, ClassHeader, ClassStats, GradingScale, PeriodHeader, SubjectLine,
    };

    fn sample_results() -> ClassResults {
        ClassResults {
            class: ClassHeader {
                id: "c1".to_string(),
                name: "6A".to_string(),
                level: Some("6e".to_string()),
            },
            period: PeriodHeader {
                id: "p1".to_string(),
                name: "Term 1".to_string(),
                kind: "term".to_string(),
                active: true,
                validated: false,
            },
            scale: GradingScale::default(),
            weight_policy: "subjectCoefficient".to_string(),
            students: Vec::new(),
            stats: ClassStats {
                ranked_count: 2,
                mean: Some(13.5),
                min: Some(12.0),
                max: Some(15.0),
                median: Some(13.5),
                bands: vec![BandCount {
                    label: "good".to_string(),
                    min: 12.0,
                    count: 2,
                }],
            },
        }
    }

    fn sample_student() -> StudentRow {
        StudentRow {
            student_id: "s1".to_string(),
            display_name: "O'Brien <Test>, Anna".to_string(),
            student_no: Some("17".to_string()),
            active: true,
            sort_order: 0,
            subjects: vec![SubjectLine {
                class_subject_id: "cs1".to_string(),
                subject_id: "sub1".to_string(),
                name: "Mathematics".to_string(),
                short_code: "MAT".to_string(),
                coefficient: 2.0,
                entry_count: 3,
                coefficient_total: 4,
                average: Some(14.0),
            }],
            overall_average: Some(15.0),
            class_rank: Some(2),
        }
    }

    fn sample_card(rank: Option<i64>) -> ReportCard {
        ReportCard {
            id: "card1".to_string(),
            student_id: "s1".to_string(),
            period_id: "p1".to_string(),
            class_id: "c1".to_string(),
            overall_average: 15.0,
            class_rank: rank,
            class_size: 24,
            general_appreciation: Some("Steady term & good focus".to_string()),
            generated_at: "2025-06-30T10:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn escape_covers_markup_characters() {
        assert_eq!(
            html_escape("<b>\"a\" & 'b'</b>"),
            "&lt;b&gt;&quot;a&quot; &amp; &#39;b&#39;&lt;/b&gt;"
        );
        assert_eq!(html_escape("plain"), "plain");
    }

    #[test]
    fn render_substitutes_and_escapes() {
        let results = sample_results();
        let student = sample_student();
        let card = sample_card(Some(2));
        let html = render_bulletin_html(&BulletinDocument {
            school_year_label: "2024-2025",
            results: &results,
            student: &student,
            card: &card,
            band_label: Some("very good"),
        });
        assert!(html.contains("O&#39;Brien &lt;Test&gt;, Anna"));
        assert!(!html.contains("<Test>"));
        assert!(html.contains("<strong>15.00</strong>"));
        assert!(html.contains("2 / 24"));
        assert!(html.contains("Mathematics"));
        assert!(html.contains("Steady term &amp; good focus"));
        assert!(html.contains("(very good)"));
    }

    #[test]
    fn render_unranked_shows_placeholder() {
        let results = sample_results();
        let student = sample_student();
        let card = sample_card(None);
        let html = render_bulletin_html(&BulletinDocument {
            school_year_label: "2024-2025",
            results: &results,
            student: &student,
            card: &card,
            band_label: None,
        });
        assert!(html.contains("Rank: -"));
    }

    #[test]
    fn coefficient_formatting_trims_whole_numbers() {
        assert_eq!(fmt_coefficient(2.0), "2");
        assert_eq!(fmt_coefficient(1.5), "1.5");
        assert_eq!(fmt_optional(None, 2), "-");
        assert_eq!(fmt_optional(Some(14.0), 1), "14.0");
    }
}
