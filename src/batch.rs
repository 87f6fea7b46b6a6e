//! Bulk upsert of attendance and marks.
//!
//! A batch carries one logical key (class + date for attendance, exam for marks)
//! and a list of per-student records. Every batch is applied inside a single
//! `BEGIN IMMEDIATE` transaction: the write lock is taken before the first read,
//! each record is written with one `INSERT .. ON CONFLICT DO UPDATE` statement,
//! and any failure rolls the whole batch back.

use crate::db;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const BATCH_MAX_RECORDS: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "Present",
            Self::Absent => "Absent",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttendanceEntry {
    pub student_id: String,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone)]
pub struct AttendanceBatch {
    pub class_id: String,
    pub date: NaiveDate,
    pub records: Vec<AttendanceEntry>,
}

#[derive(Debug, Clone)]
pub struct MarkEntry {
    pub student_id: String,
    pub subject_id: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct MarksBatch {
    pub exam_id: String,
    pub records: Vec<MarkEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStage {
    Begin,
    Query,
    Write,
    Commit,
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("{message}")]
    Malformed {
        message: String,
        index: Option<usize>,
    },

    #[error("batch has {count} records, the limit is {max}")]
    TooManyRecords { count: usize, max: usize },

    #[error("record {index} repeats key {key}")]
    DuplicateKey { index: usize, key: String },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("score {score} for student {student_id} is outside 0..={max_marks}")]
    ScoreOutOfRange {
        student_id: String,
        subject_id: String,
        score: f64,
        max_marks: f64,
    },

    #[error("store failure during batch: {source}")]
    Store {
        stage: StoreStage,
        #[source]
        source: rusqlite::Error,
    },
}

impl BatchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => "bad_params",
            Self::TooManyRecords { .. } => "too_many_records",
            Self::DuplicateKey { .. } => "duplicate_key",
            Self::NotFound { .. } => "not_found",
            Self::ScoreOutOfRange { .. } => "score_out_of_range",
            Self::Store { stage, .. } => match stage {
                StoreStage::Begin => "db_tx_failed",
                StoreStage::Query => "db_query_failed",
                StoreStage::Write => "db_update_failed",
                StoreStage::Commit => "db_commit_failed",
            },
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Malformed { index: Some(i), .. } => Some(json!({ "index": i })),
            Self::Malformed { index: None, .. } => None,
            Self::TooManyRecords { count, max } => Some(json!({ "count": count, "max": max })),
            Self::DuplicateKey { index, key } => Some(json!({ "index": index, "key": key })),
            Self::NotFound { what, id } => Some(json!({ "kind": what, "id": id })),
            Self::ScoreOutOfRange {
                student_id,
                subject_id,
                score,
                max_marks,
            } => Some(json!({
                "studentId": student_id,
                "subjectId": subject_id,
                "score": score,
                "maxMarks": max_marks
            })),
            Self::Store { .. } => None,
        }
    }

    fn malformed(message: impl Into<String>, index: Option<usize>) -> Self {
        Self::Malformed {
            message: message.into(),
            index,
        }
    }

    fn store(stage: StoreStage) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Store { stage, source }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl BatchCounts {
    fn record(&mut self, revision: Option<i64>) {
        match revision {
            Some(1) => self.created += 1,
            Some(_) => self.updated += 1,
            None => self.unchanged += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRow {
    pub id: String,
    pub student_id: String,
    pub display_name: String,
    pub roll_no: i64,
    pub class_id: String,
    pub date: String,
    pub status: String,
    pub revision: i64,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRow {
    pub id: String,
    pub exam_id: String,
    pub student_id: String,
    pub roll_no: i64,
    pub subject_id: String,
    pub subject_name: String,
    pub score: f64,
    pub revision: i64,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome<R> {
    pub counts: BatchCounts,
    pub records: Vec<R>,
}

fn required_str<'a>(
    obj: &'a serde_json::Map<String, serde_json::Value>,
    key: &str,
    index: Option<usize>,
) -> Result<&'a str, BatchError> {
    let s = obj
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or("");
    if s.is_empty() {
        let message = match index {
            Some(i) => format!("record {} missing {}", i, key),
            None => format!("missing {}", key),
        };
        return Err(BatchError::malformed(message, index));
    }
    Ok(s)
}

fn records_array(
    params: &serde_json::Value,
    max_records: usize,
) -> Result<&Vec<serde_json::Value>, BatchError> {
    let Some(records) = params.get("records").and_then(|v| v.as_array()) else {
        return Err(BatchError::malformed("records must be an array", None));
    };
    if records.is_empty() {
        return Err(BatchError::malformed("records must not be empty", None));
    }
    if records.len() > max_records {
        return Err(BatchError::TooManyRecords {
            count: records.len(),
            max: max_records,
        });
    }
    Ok(records)
}

pub fn parse_attendance_batch(
    params: &serde_json::Value,
    max_records: usize,
) -> Result<AttendanceBatch, BatchError> {
    let Some(obj) = params.as_object() else {
        return Err(BatchError::malformed("params must be an object", None));
    };
    let class_id = required_str(obj, "classId", None)?.to_string();
    let date_raw = required_str(obj, "date", None)?;
    let date = NaiveDate::parse_from_str(date_raw, "%Y-%m-%d")
        .map_err(|_| BatchError::malformed("date must be YYYY-MM-DD", None))?;

    let mut seen: HashSet<String> = HashSet::new();
    let mut records = Vec::new();
    for (i, raw) in records_array(params, max_records)?.iter().enumerate() {
        let Some(rec) = raw.as_object() else {
            return Err(BatchError::malformed(
                format!("record {} must be an object", i),
                Some(i),
            ));
        };
        let student_id = required_str(rec, "studentId", Some(i))?.to_string();
        let status_raw = required_str(rec, "status", Some(i))?;
        let Some(status) = AttendanceStatus::parse(status_raw) else {
            return Err(BatchError::malformed(
                format!("record {} status must be Present or Absent", i),
                Some(i),
            ));
        };
        if !seen.insert(student_id.clone()) {
            return Err(BatchError::DuplicateKey {
                index: i,
                key: student_id,
            });
        }
        records.push(AttendanceEntry { student_id, status });
    }

    Ok(AttendanceBatch {
        class_id,
        date,
        records,
    })
}

pub fn parse_marks_batch(
    params: &serde_json::Value,
    max_records: usize,
) -> Result<MarksBatch, BatchError> {
    let Some(obj) = params.as_object() else {
        return Err(BatchError::malformed("params must be an object", None));
    };
    let exam_id = required_str(obj, "examId", None)?.to_string();

    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut records = Vec::new();
    for (i, raw) in records_array(params, max_records)?.iter().enumerate() {
        let Some(rec) = raw.as_object() else {
            return Err(BatchError::malformed(
                format!("record {} must be an object", i),
                Some(i),
            ));
        };
        let student_id = required_str(rec, "studentId", Some(i))?.to_string();
        let subject_id = required_str(rec, "subjectId", Some(i))?.to_string();
        let score = rec
            .get("score")
            .or_else(|| rec.get("scoreScored"))
            .and_then(|v| v.as_f64())
            .ok_or_else(|| {
                BatchError::malformed(format!("record {} missing numeric score", i), Some(i))
            })?;
        if !score.is_finite() || score < 0.0 {
            return Err(BatchError::malformed(
                format!("record {} score must be a non-negative number", i),
                Some(i),
            ));
        }
        if !seen.insert((student_id.clone(), subject_id.clone())) {
            return Err(BatchError::DuplicateKey {
                index: i,
                key: format!("{}/{}", student_id, subject_id),
            });
        }
        records.push(MarkEntry {
            student_id,
            subject_id,
            score,
        });
    }

    Ok(MarksBatch { exam_id, records })
}

struct ClassStudent {
    display_name: String,
    roll_no: i64,
}

fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, BatchError> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(BatchError::store(StoreStage::Query))
}

fn load_class_students(
    conn: &Connection,
    class_id: &str,
) -> Result<HashMap<String, ClassStudent>, BatchError> {
    let mut stmt = conn
        .prepare("SELECT id, display_name, roll_no FROM students WHERE class_id = ?")
        .map_err(BatchError::store(StoreStage::Query))?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                ClassStudent {
                    display_name: r.get(1)?,
                    roll_no: r.get(2)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(BatchError::store(StoreStage::Query))?;
    Ok(rows.into_iter().collect())
}

fn begin_immediate(conn: &Connection) -> Result<Transaction<'_>, BatchError> {
    Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(BatchError::store(StoreStage::Begin))
}

fn finish<T>(tx: Transaction<'_>, result: Result<T, BatchError>, key: &str) -> Result<T, BatchError> {
    match result {
        Ok(v) => {
            tx.commit().map_err(BatchError::store(StoreStage::Commit))?;
            Ok(v)
        }
        Err(e) => {
            warn!(key, code = e.code(), error = %e, "batch rolled back");
            if let Err(rb) = tx.rollback() {
                warn!(key, error = %rb, "rollback failed");
            }
            Err(e)
        }
    }
}

pub fn submit_attendance_batch(
    conn: &Connection,
    batch: &AttendanceBatch,
) -> Result<BatchOutcome<AttendanceRow>, BatchError> {
    if !class_exists(conn, &batch.class_id)? {
        return Err(BatchError::NotFound {
            what: "class",
            id: batch.class_id.clone(),
        });
    }

    let key = format!("attendance:{}:{}", batch.class_id, batch.date);
    let tx = begin_immediate(conn)?;
    let result = apply_attendance(&tx, batch);
    let outcome = finish(tx, result, &key)?;
    info!(
        class_id = %batch.class_id,
        date = %batch.date,
        created = outcome.counts.created,
        updated = outcome.counts.updated,
        unchanged = outcome.counts.unchanged,
        "attendance batch committed"
    );
    Ok(outcome)
}

fn apply_attendance(
    tx: &Transaction<'_>,
    batch: &AttendanceBatch,
) -> Result<BatchOutcome<AttendanceRow>, BatchError> {
    let students = load_class_students(tx, &batch.class_id)?;
    let date = batch.date.format("%Y-%m-%d").to_string();
    let now = db::now_timestamp();

    let mut counts = BatchCounts::default();
    {
        let mut upsert = tx
            .prepare(
                "INSERT INTO attendance(id, student_id, class_id, date, status, revision, updated_at)
                 VALUES(?, ?, ?, ?, ?, 1, ?)
                 ON CONFLICT(student_id, date) DO UPDATE SET
                   status = excluded.status,
                   class_id = excluded.class_id,
                   revision = attendance.revision + 1,
                   updated_at = excluded.updated_at
                 WHERE attendance.status IS NOT excluded.status
                    OR attendance.class_id IS NOT excluded.class_id
                 RETURNING revision",
            )
            .map_err(BatchError::store(StoreStage::Write))?;

        for rec in &batch.records {
            if !students.contains_key(&rec.student_id) {
                return Err(BatchError::NotFound {
                    what: "student",
                    id: rec.student_id.clone(),
                });
            }
            let revision: Option<i64> = upsert
                .query_row(
                    (
                        Uuid::new_v4().to_string(),
                        &rec.student_id,
                        &batch.class_id,
                        &date,
                        rec.status.as_str(),
                        &now,
                    ),
                    |r| r.get(0),
                )
                .optional()
                .map_err(BatchError::store(StoreStage::Write))?;
            counts.record(revision);
        }
    }

    let mut select = tx
        .prepare(
            "SELECT id, class_id, status, revision, updated_at
             FROM attendance
             WHERE student_id = ? AND date = ?",
        )
        .map_err(BatchError::store(StoreStage::Query))?;
    let mut records = Vec::with_capacity(batch.records.len());
    for rec in &batch.records {
        let (id, class_id, status, revision, updated_at) = select
            .query_row((&rec.student_id, &date), |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, Option<String>>(4)?,
                ))
            })
            .map_err(BatchError::store(StoreStage::Query))?;
        // Membership was checked above.
        let (display_name, roll_no) = students
            .get(&rec.student_id)
            .map(|s| (s.display_name.clone(), s.roll_no))
            .unwrap_or_default();
        records.push(AttendanceRow {
            id,
            student_id: rec.student_id.clone(),
            display_name,
            roll_no,
            class_id,
            date: date.clone(),
            status,
            revision,
            updated_at,
        });
    }
    records.sort_by_key(|r| r.roll_no);

    Ok(BatchOutcome { counts, records })
}

struct ExamRef {
    class_id: String,
    max_marks: f64,
}

fn load_exam(conn: &Connection, exam_id: &str) -> Result<Option<ExamRef>, BatchError> {
    conn.query_row(
        "SELECT class_id, max_marks FROM exams WHERE id = ?",
        [exam_id],
        |r| {
            Ok(ExamRef {
                class_id: r.get(0)?,
                max_marks: r.get(1)?,
            })
        },
    )
    .optional()
    .map_err(BatchError::store(StoreStage::Query))
}

/// Subjects a mark may be recorded against: the exam's scheduled subjects when
/// it has any, otherwise every subject of the class.
fn load_exam_subjects(
    conn: &Connection,
    exam_id: &str,
    class_id: &str,
) -> Result<HashMap<String, String>, BatchError> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name
             FROM exam_subjects es
             JOIN subjects s ON s.id = es.subject_id
             WHERE es.exam_id = ?",
        )
        .map_err(BatchError::store(StoreStage::Query))?;
    let scheduled = stmt
        .query_map([exam_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(BatchError::store(StoreStage::Query))?;
    if !scheduled.is_empty() {
        return Ok(scheduled.into_iter().collect());
    }

    let mut stmt = conn
        .prepare("SELECT id, name FROM subjects WHERE class_id = ?")
        .map_err(BatchError::store(StoreStage::Query))?;
    let all = stmt
        .query_map([class_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(BatchError::store(StoreStage::Query))?;
    Ok(all.into_iter().collect())
}

pub fn submit_marks_batch(
    conn: &Connection,
    batch: &MarksBatch,
) -> Result<BatchOutcome<MarkRow>, BatchError> {
    let Some(exam) = load_exam(conn, &batch.exam_id)? else {
        return Err(BatchError::NotFound {
            what: "exam",
            id: batch.exam_id.clone(),
        });
    };

    let key = format!("marks:{}", batch.exam_id);
    let tx = begin_immediate(conn)?;
    let result = apply_marks(&tx, batch, &exam);
    let outcome = finish(tx, result, &key)?;
    info!(
        exam_id = %batch.exam_id,
        created = outcome.counts.created,
        updated = outcome.counts.updated,
        unchanged = outcome.counts.unchanged,
        "marks batch committed"
    );
    Ok(outcome)
}

fn apply_marks(
    tx: &Transaction<'_>,
    batch: &MarksBatch,
    exam: &ExamRef,
) -> Result<BatchOutcome<MarkRow>, BatchError> {
    let students = load_class_students(tx, &exam.class_id)?;
    let subjects = load_exam_subjects(tx, &batch.exam_id, &exam.class_id)?;
    let now = db::now_timestamp();

    let mut counts = BatchCounts::default();
    {
        let mut upsert = tx
            .prepare(
                "INSERT INTO marks(id, exam_id, student_id, subject_id, score, revision, updated_at)
                 VALUES(?, ?, ?, ?, ?, 1, ?)
                 ON CONFLICT(exam_id, student_id, subject_id) DO UPDATE SET
                   score = excluded.score,
                   revision = marks.revision + 1,
                   updated_at = excluded.updated_at
                 WHERE marks.score IS NOT excluded.score
                 RETURNING revision",
            )
            .map_err(BatchError::store(StoreStage::Write))?;

        for rec in &batch.records {
            if !students.contains_key(&rec.student_id) {
                return Err(BatchError::NotFound {
                    what: "student",
                    id: rec.student_id.clone(),
                });
            }
            if !subjects.contains_key(&rec.subject_id) {
                return Err(BatchError::NotFound {
                    what: "subject",
                    id: rec.subject_id.clone(),
                });
            }
            if rec.score > exam.max_marks {
                return Err(BatchError::ScoreOutOfRange {
                    student_id: rec.student_id.clone(),
                    subject_id: rec.subject_id.clone(),
                    score: rec.score,
                    max_marks: exam.max_marks,
                });
            }
            let revision: Option<i64> = upsert
                .query_row(
                    (
                        Uuid::new_v4().to_string(),
                        &batch.exam_id,
                        &rec.student_id,
                        &rec.subject_id,
                        rec.score,
                        &now,
                    ),
                    |r| r.get(0),
                )
                .optional()
                .map_err(BatchError::store(StoreStage::Write))?;
            counts.record(revision);
        }
    }

    let mut select = tx
        .prepare(
            "SELECT id, score, revision, updated_at
             FROM marks
             WHERE exam_id = ? AND student_id = ? AND subject_id = ?",
        )
        .map_err(BatchError::store(StoreStage::Query))?;
    let mut records = Vec::with_capacity(batch.records.len());
    for rec in &batch.records {
        let (id, score, revision, updated_at) = select
            .query_row((&batch.exam_id, &rec.student_id, &rec.subject_id), |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, f64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, Option<String>>(3)?,
                ))
            })
            .map_err(BatchError::store(StoreStage::Query))?;
        records.push(MarkRow {
            id,
            exam_id: batch.exam_id.clone(),
            student_id: rec.student_id.clone(),
            roll_no: students.get(&rec.student_id).map(|s| s.roll_no).unwrap_or(0),
            subject_id: rec.subject_id.clone(),
            subject_name: subjects.get(&rec.subject_id).cloned().unwrap_or_default(),
            score,
            revision,
            updated_at,
        });
    }
    records.sort_by(|a, b| {
        a.roll_no
            .cmp(&b.roll_no)
            .then_with(|| a.subject_name.cmp(&b.subject_name))
    });

    Ok(BatchOutcome { counts, records })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(students: usize) -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        conn.execute("INSERT INTO classes(id, name) VALUES('c5', '5A')", [])
            .expect("class");
        for roll in 1..=students {
            conn.execute(
                "INSERT INTO students(id, class_id, display_name, roll_no) VALUES(?, 'c5', ?, ?)",
                (format!("s{}", roll), format!("Student {}", roll), roll as i64),
            )
            .expect("student");
        }
        conn.execute(
            "INSERT INTO subjects(id, class_id, name, sort_order) VALUES('math', 'c5', 'Math', 0)",
            [],
        )
        .expect("subject");
        conn.execute(
            "INSERT INTO subjects(id, class_id, name, sort_order) VALUES('sci', 'c5', 'Science', 1)",
            [],
        )
        .expect("subject");
        conn.execute(
            "INSERT INTO exams(id, class_id, name, max_marks, grading_domain)
             VALUES('e1', 'c5', 'Midterm', 100, 'percentage')",
            [],
        )
        .expect("exam");
        conn
    }

    fn attendance_params(statuses: &[(&str, &str)]) -> serde_json::Value {
        let records: Vec<serde_json::Value> = statuses
            .iter()
            .map(|(s, st)| json!({ "studentId": s, "status": st }))
            .collect();
        json!({ "classId": "c5", "date": "2025-01-10", "records": records })
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .expect("count")
    }

    #[test]
    fn resubmitting_with_one_flip_updates_exactly_one_row() {
        let conn = seeded(30);
        let ids: Vec<String> = (1..=30).map(|i| format!("s{}", i)).collect();
        let first: Vec<(&str, &str)> = ids.iter().map(|s| (s.as_str(), "Present")).collect();

        let batch = parse_attendance_batch(&attendance_params(&first), BATCH_MAX_RECORDS)
            .expect("parse");
        let out = submit_attendance_batch(&conn, &batch).expect("first submit");
        assert_eq!(out.counts.created, 30);
        assert_eq!(out.records.len(), 30);

        let mut second = first.clone();
        second[6].1 = "Absent";
        let batch = parse_attendance_batch(&attendance_params(&second), BATCH_MAX_RECORDS)
            .expect("parse");
        let out = submit_attendance_batch(&conn, &batch).expect("second submit");
        assert_eq!(
            out.counts,
            BatchCounts {
                created: 0,
                updated: 1,
                unchanged: 29
            }
        );
        assert_eq!(count(&conn, "attendance"), 30);
        let flipped = out.records.iter().find(|r| r.student_id == "s7").expect("s7");
        assert_eq!(flipped.status, "Absent");
        assert_eq!(flipped.revision, 2);
    }

    #[test]
    fn identical_resubmission_is_a_no_op() {
        let conn = seeded(3);
        let params = attendance_params(&[("s1", "Present"), ("s2", "Absent"), ("s3", "Present")]);
        let batch = parse_attendance_batch(&params, BATCH_MAX_RECORDS).expect("parse");
        submit_attendance_batch(&conn, &batch).expect("first");
        let out = submit_attendance_batch(&conn, &batch).expect("second");
        assert_eq!(out.counts.unchanged, 3);
        assert!(out.records.iter().all(|r| r.revision == 1));
        assert_eq!(count(&conn, "attendance"), 3);
    }

    #[test]
    fn unknown_student_rolls_back_whole_batch() {
        let conn = seeded(3);
        let params = attendance_params(&[("s1", "Present"), ("s2", "Present"), ("ghost", "Present")]);
        let batch = parse_attendance_batch(&params, BATCH_MAX_RECORDS).expect("parse");
        let e = submit_attendance_batch(&conn, &batch).unwrap_err();
        assert_eq!(e.code(), "not_found");
        assert_eq!(count(&conn, "attendance"), 0);
    }

    #[test]
    fn unknown_class_is_not_found() {
        let conn = seeded(1);
        let mut params = attendance_params(&[("s1", "Present")]);
        params["classId"] = json!("nope");
        let batch = parse_attendance_batch(&params, BATCH_MAX_RECORDS).expect("parse");
        assert!(matches!(
            submit_attendance_batch(&conn, &batch),
            Err(BatchError::NotFound { what: "class", .. })
        ));
    }

    #[test]
    fn malformed_payloads_are_rejected_before_store_access() {
        let e = parse_attendance_batch(&json!({ "classId": "c5", "date": "2025-01-10" }), 10)
            .unwrap_err();
        assert_eq!(e.code(), "bad_params");

        let e = parse_attendance_batch(
            &json!({ "classId": "c5", "date": "10/01/2025", "records": [] }),
            10,
        )
        .unwrap_err();
        assert_eq!(e.to_string(), "date must be YYYY-MM-DD");

        let e = parse_attendance_batch(
            &json!({ "classId": "c5", "date": "2025-01-10", "records": [{ "studentId": "s1", "status": "Late" }] }),
            10,
        )
        .unwrap_err();
        assert!(matches!(e, BatchError::Malformed { index: Some(0), .. }));

        let e = parse_attendance_batch(
            &json!({ "classId": "c5", "date": "2025-01-10", "records": "s1" }),
            10,
        )
        .unwrap_err();
        assert_eq!(e.to_string(), "records must be an array");
    }

    #[test]
    fn duplicate_sub_keys_are_rejected() {
        let e = parse_attendance_batch(
            &attendance_params(&[("s1", "Present"), ("s1", "Absent")]),
            10,
        )
        .unwrap_err();
        assert!(matches!(e, BatchError::DuplicateKey { index: 1, .. }));

        let e = parse_marks_batch(
            &json!({ "examId": "e1", "records": [
                { "studentId": "s1", "subjectId": "math", "score": 4 },
                { "studentId": "s1", "subjectId": "math", "score": 5 }
            ]}),
            10,
        )
        .unwrap_err();
        assert_eq!(e.code(), "duplicate_key");
    }

    #[test]
    fn record_limit_is_enforced() {
        let params = attendance_params(&[("s1", "Present"), ("s2", "Present"), ("s3", "Present")]);
        let e = parse_attendance_batch(&params, 2).unwrap_err();
        assert!(matches!(e, BatchError::TooManyRecords { count: 3, max: 2 }));
    }

    #[test]
    fn marks_upsert_overwrites_in_place() {
        let conn = seeded(2);
        let params = json!({ "examId": "e1", "records": [
            { "studentId": "s1", "subjectId": "math", "score": 80 },
            { "studentId": "s1", "subjectId": "sci", "score": 70 },
            { "studentId": "s2", "subjectId": "math", "score": 60 }
        ]});
        let batch = parse_marks_batch(&params, BATCH_MAX_RECORDS).expect("parse");
        let out = submit_marks_batch(&conn, &batch).expect("submit");
        assert_eq!(out.counts.created, 3);

        let params = json!({ "examId": "e1", "records": [
            { "studentId": "s1", "subjectId": "math", "scoreScored": 85 }
        ]});
        let batch = parse_marks_batch(&params, BATCH_MAX_RECORDS).expect("parse");
        let out = submit_marks_batch(&conn, &batch).expect("resubmit");
        assert_eq!(out.counts.updated, 1);
        assert_eq!(out.records[0].score, 85.0);
        assert_eq!(count(&conn, "marks"), 3);
    }

    #[test]
    fn score_above_maximum_rolls_back() {
        let conn = seeded(2);
        let params = json!({ "examId": "e1", "records": [
            { "studentId": "s1", "subjectId": "math", "score": 80 },
            { "studentId": "s2", "subjectId": "math", "score": 101 }
        ]});
        let batch = parse_marks_batch(&params, BATCH_MAX_RECORDS).expect("parse");
        let e = submit_marks_batch(&conn, &batch).unwrap_err();
        assert_eq!(e.code(), "score_out_of_range");
        assert_eq!(count(&conn, "marks"), 0);
    }

    #[test]
    fn scheduled_subjects_restrict_marks() {
        let conn = seeded(1);
        conn.execute(
            "INSERT INTO exam_subjects(exam_id, subject_id, scheduled_date) VALUES('e1', 'math', '2025-03-01')",
            [],
        )
        .expect("schedule");
        let params = json!({ "examId": "e1", "records": [
            { "studentId": "s1", "subjectId": "sci", "score": 50 }
        ]});
        let batch = parse_marks_batch(&params, BATCH_MAX_RECORDS).expect("parse");
        assert!(matches!(
            submit_marks_batch(&conn, &batch),
            Err(BatchError::NotFound { what: "subject", .. })
        ));
    }
}
