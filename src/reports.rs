//! Fixed read-only aggregations over persisted attendance and marks.

use crate::batch::{AttendanceRow, MarkRow};
use crate::rank::round_2_decimals;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

const OPEN_RANGE_START: &str = "0000-01-01";
const OPEN_RANGE_END: &str = "9999-12-31";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    #[error(transparent)]
    Store(#[from] rusqlite::Error),
}

impl ReportError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(..) => "not_found",
            Self::Store(_) => "db_query_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AttendanceTotals {
    pub total: i64,
    pub present: i64,
    pub absent: i64,
    pub percentage: f64,
}

impl AttendanceTotals {
    fn new(present: i64, absent: i64) -> Self {
        let total = present + absent;
        let percentage = if total > 0 {
            round_2_decimals(present as f64 / total as f64 * 100.0)
        } else {
            0.0
        };
        Self {
            total,
            present,
            absent,
            percentage,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAttendanceStats {
    pub student_id: String,
    pub display_name: String,
    pub roll_no: i64,
    #[serde(flatten)]
    pub totals: AttendanceTotals,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAttendance {
    pub student_id: String,
    pub class_id: String,
    pub statistics: AttendanceTotals,
    pub records: Vec<AttendanceRow>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectPerformance {
    pub subject_id: String,
    pub subject_name: String,
    pub max_marks: f64,
    pub average: f64,
    pub highest: f64,
    pub lowest: f64,
    pub student_count: i64,
}

fn exists(conn: &Connection, sql: &str, id: &str) -> rusqlite::Result<bool> {
    conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
}

fn require_class(conn: &Connection, class_id: &str) -> Result<(), ReportError> {
    if !exists(conn, "SELECT 1 FROM classes WHERE id = ?", class_id)? {
        return Err(ReportError::NotFound("class", class_id.to_string()));
    }
    Ok(())
}

fn require_exam(conn: &Connection, exam_id: &str) -> Result<f64, ReportError> {
    conn.query_row("SELECT max_marks FROM exams WHERE id = ?", [exam_id], |r| {
        r.get::<_, f64>(0)
    })
    .optional()?
    .ok_or_else(|| ReportError::NotFound("exam", exam_id.to_string()))
}

pub fn attendance_for_class_day(
    conn: &Connection,
    class_id: &str,
    date: NaiveDate,
) -> Result<Vec<AttendanceRow>, ReportError> {
    require_class(conn, class_id)?;
    let mut stmt = conn.prepare(
        "SELECT a.id, a.student_id, s.display_name, s.roll_no, a.class_id, a.date,
                a.status, a.revision, a.updated_at
         FROM attendance a
         JOIN students s ON s.id = a.student_id
         WHERE a.class_id = ? AND a.date = ?
         ORDER BY s.roll_no",
    )?;
    let rows = stmt
        .query_map((class_id, date.format("%Y-%m-%d").to_string()), |r| {
            Ok(AttendanceRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                display_name: r.get(2)?,
                roll_no: r.get(3)?,
                class_id: r.get(4)?,
                date: r.get(5)?,
                status: r.get(6)?,
                revision: r.get(7)?,
                updated_at: r.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Per-student totals for a class. Students without any record in the range
/// are listed with zero days.
pub fn class_attendance_stats(
    conn: &Connection,
    class_id: &str,
    range: Option<(NaiveDate, NaiveDate)>,
) -> Result<Vec<StudentAttendanceStats>, ReportError> {
    require_class(conn, class_id)?;
    let (from, to) = match range {
        Some((from, to)) => (
            from.format("%Y-%m-%d").to_string(),
            to.format("%Y-%m-%d").to_string(),
        ),
        None => (OPEN_RANGE_START.to_string(), OPEN_RANGE_END.to_string()),
    };

    let mut stmt = conn.prepare(
        "SELECT s.id, s.display_name, s.roll_no,
                COALESCE(SUM(CASE WHEN a.status = 'Present' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN a.status = 'Absent' THEN 1 ELSE 0 END), 0)
         FROM students s
         LEFT JOIN attendance a
           ON a.student_id = s.id AND a.date BETWEEN ? AND ?
         WHERE s.class_id = ?
         GROUP BY s.id, s.display_name, s.roll_no
         ORDER BY s.roll_no",
    )?;
    let rows = stmt
        .query_map((&from, &to, class_id), |r| {
            Ok(StudentAttendanceStats {
                student_id: r.get(0)?,
                display_name: r.get(1)?,
                roll_no: r.get(2)?,
                totals: AttendanceTotals::new(r.get(3)?, r.get(4)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn student_attendance(
    conn: &Connection,
    student_id: &str,
) -> Result<StudentAttendance, ReportError> {
    let student: Option<(String, String, i64)> = conn
        .query_row(
            "SELECT class_id, display_name, roll_no FROM students WHERE id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((class_id, display_name, roll_no)) = student else {
        return Err(ReportError::NotFound("student", student_id.to_string()));
    };

    let mut stmt = conn.prepare(
        "SELECT id, class_id, date, status, revision, updated_at
         FROM attendance
         WHERE student_id = ?
         ORDER BY date DESC",
    )?;
    let records = stmt
        .query_map([student_id], |r| {
            Ok(AttendanceRow {
                id: r.get(0)?,
                student_id: student_id.to_string(),
                display_name: display_name.clone(),
                roll_no,
                class_id: r.get(1)?,
                date: r.get(2)?,
                status: r.get(3)?,
                revision: r.get(4)?,
                updated_at: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let present = records.iter().filter(|r| r.status == "Present").count() as i64;
    let absent = records.len() as i64 - present;

    Ok(StudentAttendance {
        student_id: student_id.to_string(),
        class_id,
        statistics: AttendanceTotals::new(present, absent),
        records,
    })
}

pub fn marks_by_exam(conn: &Connection, exam_id: &str) -> Result<Vec<MarkRow>, ReportError> {
    require_exam(conn, exam_id)?;
    let mut stmt = conn.prepare(
        "SELECT m.id, m.student_id, s.roll_no, m.subject_id, sub.name, m.score,
                m.revision, m.updated_at
         FROM marks m
         JOIN students s ON s.id = m.student_id
         JOIN subjects sub ON sub.id = m.subject_id
         WHERE m.exam_id = ?
         ORDER BY s.roll_no, sub.name",
    )?;
    let rows = stmt
        .query_map([exam_id], |r| {
            Ok(MarkRow {
                id: r.get(0)?,
                exam_id: exam_id.to_string(),
                student_id: r.get(1)?,
                roll_no: r.get(2)?,
                subject_id: r.get(3)?,
                subject_name: r.get(4)?,
                score: r.get(5)?,
                revision: r.get(6)?,
                updated_at: r.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn class_performance(
    conn: &Connection,
    exam_id: &str,
) -> Result<Vec<SubjectPerformance>, ReportError> {
    let max_marks = require_exam(conn, exam_id)?;
    let mut stmt = conn.prepare(
        "SELECT sub.id, sub.name, AVG(m.score), MAX(m.score), MIN(m.score), COUNT(m.id)
         FROM marks m
         JOIN subjects sub ON sub.id = m.subject_id
         WHERE m.exam_id = ?
         GROUP BY sub.id, sub.name
         ORDER BY sub.name",
    )?;
    let rows = stmt
        .query_map([exam_id], |r| {
            Ok(SubjectPerformance {
                subject_id: r.get(0)?,
                subject_name: r.get(1)?,
                max_marks,
                average: round_2_decimals(r.get(2)?),
                highest: r.get(3)?,
                lowest: r.get(4)?,
                student_count: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn seeded() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        conn.execute_batch(
            "INSERT INTO classes(id, name) VALUES('c1', '6C');
             INSERT INTO students(id, class_id, display_name, roll_no) VALUES('a', 'c1', 'Ana', 1);
             INSERT INTO students(id, class_id, display_name, roll_no) VALUES('b', 'c1', 'Ben', 2);
             INSERT INTO attendance(id, student_id, class_id, date, status) VALUES('1', 'a', 'c1', '2025-01-10', 'Present');
             INSERT INTO attendance(id, student_id, class_id, date, status) VALUES('2', 'a', 'c1', '2025-01-11', 'Absent');
             INSERT INTO attendance(id, student_id, class_id, date, status) VALUES('3', 'a', 'c1', '2025-01-12', 'Present');
             INSERT INTO subjects(id, class_id, name, sort_order) VALUES('m', 'c1', 'Math', 0);
             INSERT INTO exams(id, class_id, name, max_marks) VALUES('x', 'c1', 'Unit test', 50);
             INSERT INTO marks(id, exam_id, student_id, subject_id, score) VALUES('m1', 'x', 'a', 'm', 40);
             INSERT INTO marks(id, exam_id, student_id, subject_id, score) VALUES('m2', 'x', 'b', 'm', 25);",
        )
        .expect("seed");
        conn
    }

    #[test]
    fn class_stats_include_students_without_records() {
        let conn = seeded();
        let stats = class_attendance_stats(&conn, "c1", None).expect("stats");
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].totals.total, 3);
        assert_eq!(stats[0].totals.present, 2);
        assert_eq!(stats[0].totals.percentage, 66.67);
        assert_eq!(stats[1].totals.total, 0);
        assert_eq!(stats[1].totals.percentage, 0.0);
    }

    #[test]
    fn class_stats_respect_date_range() {
        let conn = seeded();
        let from = NaiveDate::from_ymd_opt(2025, 1, 11).expect("date");
        let to = NaiveDate::from_ymd_opt(2025, 1, 12).expect("date");
        let stats = class_attendance_stats(&conn, "c1", Some((from, to))).expect("stats");
        assert_eq!(stats[0].totals.total, 2);
        assert_eq!(stats[0].totals.absent, 1);
    }

    #[test]
    fn student_records_are_newest_first() {
        let conn = seeded();
        let s = student_attendance(&conn, "a").expect("student");
        assert_eq!(s.records.first().map(|r| r.date.as_str()), Some("2025-01-12"));
        assert_eq!(s.statistics.present, 2);
    }

    #[test]
    fn performance_summarises_each_subject() {
        let conn = seeded();
        let perf = class_performance(&conn, "x").expect("performance");
        assert_eq!(perf.len(), 1);
        assert_eq!(perf[0].average, 32.5);
        assert_eq!(perf[0].highest, 40.0);
        assert_eq!(perf[0].lowest, 25.0);
        assert_eq!(perf[0].student_count, 2);
    }

    #[test]
    fn missing_referents_are_not_found() {
        let conn = seeded();
        assert_eq!(
            class_attendance_stats(&conn, "zz", None).unwrap_err().code(),
            "not_found"
        );
        assert_eq!(marks_by_exam(&conn, "zz").unwrap_err().code(), "not_found");
    }
}
