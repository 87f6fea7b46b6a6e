use crate::grading::{grade_for, GradeBand, GradingDomain};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RankingMode {
    /// Distinct sequential positions: 1, 2, 3, 4.
    #[default]
    Ordinal,
    /// Tied totals share a rank and leave a gap: 1, 2, 2, 4.
    Competition,
    /// Tied totals share a rank without a gap: 1, 2, 2, 3.
    Dense,
}

impl RankingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ordinal" => Some(Self::Ordinal),
            "competition" => Some(Self::Competition),
            "dense" => Some(Self::Dense),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ordinal => "ordinal",
            Self::Competition => "competition",
            Self::Dense => "dense",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankEntry {
    pub student_id: String,
    pub display_name: String,
    pub roll_number: i64,
    pub total_score: f64,
    pub subject_count: i64,
    pub rank: usize,
    pub percentage: Option<f64>,
    pub grade: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankList {
    pub exam_id: String,
    pub exam_name: String,
    pub max_marks: f64,
    pub grading_domain: &'static str,
    pub mode: &'static str,
    pub entries: Vec<RankEntry>,
}

#[derive(Debug, Error)]
pub enum RankError {
    #[error("exam not found: {0}")]
    ExamNotFound(String),

    #[error(transparent)]
    Store(#[from] rusqlite::Error),
}

impl RankError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ExamNotFound(_) => "not_found",
            Self::Store(_) => "db_query_failed",
        }
    }
}

/// Half-away-from-zero rounding to two decimals.
pub fn round_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub fn percentage_of(total: f64, max_marks: f64, subject_count: i64) -> Option<f64> {
    if max_marks <= 0.0 || subject_count <= 0 {
        return None;
    }
    Some(round_2_decimals(
        total / (max_marks * subject_count as f64) * 100.0,
    ))
}

fn compare_entries(a: &RankEntry, b: &RankEntry) -> Ordering {
    b.total_score
        .partial_cmp(&a.total_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.roll_number.cmp(&b.roll_number))
}

/// Sorts by total descending with roll number ascending as the tie-break, then
/// numbers the entries according to `mode`.
pub fn order_and_rank(entries: &mut [RankEntry], mode: RankingMode) {
    entries.sort_by(compare_entries);

    let mut prev_total: Option<f64> = None;
    let mut current_rank = 0usize;
    let mut dense_rank = 0usize;
    for (i, entry) in entries.iter_mut().enumerate() {
        let tied = prev_total == Some(entry.total_score);
        if !tied {
            current_rank = i + 1;
            dense_rank += 1;
        }
        entry.rank = match mode {
            RankingMode::Ordinal => i + 1,
            RankingMode::Competition => current_rank,
            RankingMode::Dense => dense_rank,
        };
        prev_total = Some(entry.total_score);
    }
}

struct ExamHeader {
    name: String,
    max_marks: f64,
    domain: GradingDomain,
}

fn load_exam_header(conn: &Connection, exam_id: &str) -> Result<Option<ExamHeader>, RankError> {
    let row: Option<(String, f64, String)> = conn
        .query_row(
            "SELECT name, max_marks, grading_domain FROM exams WHERE id = ?",
            [exam_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    Ok(row.map(|(name, max_marks, kind)| ExamHeader {
        name,
        max_marks,
        domain: GradingDomain::parse(&kind, max_marks)
            .unwrap_or(GradingDomain::RawMarks { max_marks }),
    }))
}

pub fn load_grade_bands(conn: &Connection, exam_id: &str) -> rusqlite::Result<Vec<GradeBand>> {
    let mut stmt = conn.prepare(
        "SELECT label, min_score, max_score
         FROM grade_bands
         WHERE exam_id = ?
         ORDER BY sort_order",
    )?;
    let bands = stmt
        .query_map([exam_id], |r| {
            Ok(GradeBand {
                label: r.get(0)?,
                min: r.get(1)?,
                max: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(bands)
}

pub fn compute_rank_list(
    conn: &Connection,
    exam_id: &str,
    mode: RankingMode,
) -> Result<RankList, RankError> {
    let Some(exam) = load_exam_header(conn, exam_id)? else {
        return Err(RankError::ExamNotFound(exam_id.to_string()));
    };
    let bands = load_grade_bands(conn, exam_id)?;

    let mut stmt = conn.prepare(
        "SELECT s.id, s.display_name, s.roll_no, SUM(m.score), COUNT(m.subject_id)
         FROM marks m
         JOIN students s ON s.id = m.student_id
         WHERE m.exam_id = ?
         GROUP BY s.id, s.display_name, s.roll_no",
    )?;
    let mut entries = stmt
        .query_map([exam_id], |r| {
            let total: f64 = r.get(3)?;
            let subject_count: i64 = r.get(4)?;
            Ok(RankEntry {
                student_id: r.get(0)?,
                display_name: r.get(1)?,
                roll_number: r.get(2)?,
                // Scores carry at most two decimals; rounding the sum keeps
                // equal totals comparing equal.
                total_score: round_2_decimals(total),
                subject_count,
                rank: 0,
                percentage: None,
                grade: None,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for entry in entries.iter_mut() {
        entry.percentage = percentage_of(entry.total_score, exam.max_marks, entry.subject_count);
        if bands.is_empty() {
            continue;
        }
        let graded_on = match exam.domain {
            GradingDomain::Percentage => entry.percentage,
            GradingDomain::RawMarks { .. } if entry.subject_count > 0 => {
                Some(entry.total_score / entry.subject_count as f64)
            }
            GradingDomain::RawMarks { .. } => None,
        };
        entry.grade = graded_on
            .and_then(|score| grade_for(&bands, score))
            .map(str::to_string);
    }

    order_and_rank(&mut entries, mode);

    Ok(RankList {
        exam_id: exam_id.to_string(),
        exam_name: exam.name,
        max_marks: exam.max_marks,
        grading_domain: exam.domain.as_str(),
        mode: mode.as_str(),
        entries,
    })
}
