use crate::db;
use crate::grading::{validate_grade_scale, GradeBand, GradingDomain};
use crate::ipc::handlers::classes::require_class;
use crate::ipc::helpers::{get_optional_date, get_required_str, no_workspace, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::rank::load_grade_bands;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct ExamSubject {
    subject_id: String,
    date: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
struct ExamRow {
    class_id: String,
    name: String,
    max_marks: f64,
    grading_domain: String,
}

fn parse_bound(v: Option<&Value>, index: usize, key: &str) -> Result<f64, HandlerErr> {
    let n = match v {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.ok_or_else(|| {
        HandlerErr::bad_params(format!("gradeScale[{}].{} must be a number", index, key))
            .with_details(json!({ "index": index }))
    })
}

/// Reads `[{ label | name, min, max }]`. Shape errors are `bad_params`; the
/// semantic checks belong to the validator.
fn parse_grade_scale(v: &Value) -> Result<Vec<GradeBand>, HandlerErr> {
    let Some(items) = v.as_array() else {
        return Err(HandlerErr::bad_params("gradeScale must be an array"));
    };
    let mut bands = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            return Err(HandlerErr::bad_params(format!("gradeScale[{}] must be an object", i)));
        };
        let label = obj
            .get("label")
            .or_else(|| obj.get("name"))
            .and_then(|l| l.as_str())
            .ok_or_else(|| HandlerErr::bad_params(format!("gradeScale[{}] missing label", i)))?;
        bands.push(GradeBand {
            label: label.trim().to_string(),
            min: parse_bound(obj.get("min"), i, "min")?,
            max: parse_bound(obj.get("max"), i, "max")?,
        });
    }
    Ok(bands)
}

fn parse_max_marks(v: &Value) -> Result<f64, HandlerErr> {
    match v.as_f64() {
        Some(n) if n.is_finite() && n > 0.0 => Ok(n),
        _ => Err(HandlerErr::bad_params("maxMarks must be a positive number")),
    }
}

fn parse_domain(v: Option<&Value>, max_marks: f64) -> Result<Option<GradingDomain>, HandlerErr> {
    let Some(v) = v else {
        return Ok(None);
    };
    v.as_str()
        .and_then(|s| GradingDomain::parse(s, max_marks))
        .map(Some)
        .ok_or_else(|| HandlerErr::bad_params("gradingDomain must be percentage or raw_marks"))
}

fn parse_exam_subjects(v: &Value) -> Result<Vec<ExamSubject>, HandlerErr> {
    let Some(items) = v.as_array() else {
        return Err(HandlerErr::bad_params("subjects must be an array"));
    };
    let mut out: Vec<ExamSubject> = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let subject_id = get_required_str(item, "subjectId")
            .map_err(|e| e.with_details(json!({ "index": i })))?
            .to_string();
        if out.iter().any(|s| s.subject_id == subject_id) {
            return Err(HandlerErr::new(
                "duplicate_key",
                format!("subject {} is scheduled twice", subject_id),
            )
            .with_details(json!({ "index": i, "key": subject_id })));
        }
        out.push(ExamSubject {
            subject_id,
            date: get_optional_date(item, "date")?,
        });
    }
    Ok(out)
}

/// Every exam definition, new or edited, passes through here before it is
/// written.
fn check_scale(bands: Option<&[GradeBand]>, domain: GradingDomain) -> Result<(), HandlerErr> {
    match bands {
        Some(bands) => validate_grade_scale(bands, domain).map_err(HandlerErr::from),
        None => Ok(()),
    }
}

fn begin_immediate(conn: &Connection) -> Result<Transaction<'_>, HandlerErr> {
    Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))
}

fn write_failed(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_update_failed", e.to_string())
}

fn replace_grade_bands(tx: &Transaction<'_>, exam_id: &str, bands: &[GradeBand]) -> Result<(), HandlerErr> {
    tx.execute("DELETE FROM grade_bands WHERE exam_id = ?", [exam_id])
        .map_err(write_failed)?;
    for (i, band) in bands.iter().enumerate() {
        tx.execute(
            "INSERT INTO grade_bands(exam_id, sort_order, label, min_score, max_score)
             VALUES(?, ?, ?, ?, ?)",
            (exam_id, i as i64, &band.label, band.min, band.max),
        )
        .map_err(write_failed)?;
    }
    Ok(())
}

fn replace_exam_subjects(
    tx: &Transaction<'_>,
    exam_id: &str,
    class_id: &str,
    subjects: &[ExamSubject],
) -> Result<(), HandlerErr> {
    tx.execute("DELETE FROM exam_subjects WHERE exam_id = ?", [exam_id])
        .map_err(write_failed)?;
    for s in subjects {
        let in_class: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM subjects WHERE id = ? AND class_id = ?",
                (&s.subject_id, class_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::query)?;
        if in_class.is_none() {
            return Err(HandlerErr::new("not_found", "subject not found in the exam's class")
                .with_details(json!({ "subjectId": s.subject_id })));
        }
        tx.execute(
            "INSERT INTO exam_subjects(exam_id, subject_id, scheduled_date) VALUES(?, ?, ?)",
            (
                exam_id,
                &s.subject_id,
                s.date.map(|d| d.format("%Y-%m-%d").to_string()),
            ),
        )
        .map_err(write_failed)?;
    }
    Ok(())
}

fn commit(tx: Transaction<'_>) -> Result<(), HandlerErr> {
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))
}

fn load_exam(conn: &Connection, exam_id: &str) -> Result<ExamRow, HandlerErr> {
    conn.query_row(
        "SELECT class_id, name, max_marks, grading_domain FROM exams WHERE id = ?",
        [exam_id],
        |r| {
            Ok(ExamRow {
                class_id: r.get(0)?,
                name: r.get(1)?,
                max_marks: r.get(2)?,
                grading_domain: r.get(3)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| {
        HandlerErr::new("not_found", "exam not found").with_details(json!({ "examId": exam_id }))
    })
}

fn marks_count(conn: &Connection, exam_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM marks WHERE exam_id = ?",
        [exam_id],
        |r| r.get(0),
    )
    .map_err(HandlerErr::query)
}

fn exam_json(conn: &Connection, exam_id: &str) -> Result<Value, HandlerErr> {
    let exam = load_exam(conn, exam_id)?;
    let bands = load_grade_bands(conn, exam_id).map_err(HandlerErr::query)?;
    let mut stmt = conn
        .prepare(
            "SELECT es.subject_id, s.name, es.scheduled_date
             FROM exam_subjects es
             JOIN subjects s ON s.id = es.subject_id
             WHERE es.exam_id = ?
             ORDER BY s.sort_order, s.name",
        )
        .map_err(HandlerErr::query)?;
    let subjects = stmt
        .query_map([exam_id], |r| {
            let subject_id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let date: Option<String> = r.get(2)?;
            Ok(json!({ "subjectId": subject_id, "name": name, "date": date }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    let marks = marks_count(conn, exam_id)?;

    Ok(json!({
        "id": exam_id,
        "classId": exam.class_id,
        "name": exam.name,
        "maxMarks": exam.max_marks,
        "gradingDomain": exam.grading_domain,
        "gradeScale": bands,
        "subjects": subjects,
        "marksCount": marks,
        "frozen": marks > 0
    }))
}

fn create_exam(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let name = get_required_str(params, "name")?.to_string();
    let max_marks = parse_max_marks(params.get("maxMarks").unwrap_or(&Value::Null))?;
    let domain = parse_domain(params.get("gradingDomain"), max_marks)?
        .unwrap_or(GradingDomain::RawMarks { max_marks });
    let bands = params.get("gradeScale").map(parse_grade_scale).transpose()?;
    let subjects = params.get("subjects").map(parse_exam_subjects).transpose()?;

    check_scale(bands.as_deref(), domain)?;
    require_class(conn, class_id)?;

    let exam_id = Uuid::new_v4().to_string();
    let now = db::now_timestamp();
    let tx = begin_immediate(conn)?;
    tx.execute(
        "INSERT INTO exams(id, class_id, name, max_marks, grading_domain, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (&exam_id, class_id, &name, max_marks, domain.as_str(), &now, &now),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "exams" }))
    })?;
    if let Some(bands) = &bands {
        replace_grade_bands(&tx, &exam_id, bands)?;
    }
    if let Some(subjects) = &subjects {
        replace_exam_subjects(&tx, &exam_id, class_id, subjects)?;
    }
    commit(tx)?;

    info!(exam_id = %exam_id, class_id = %class_id, bands = bands.as_ref().map_or(0, Vec::len), "exam created");
    exam_json(conn, &exam_id)
}

fn update_exam(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let patch_name = match params.get("name") {
        Some(_) => Some(get_required_str(params, "name")?.to_string()),
        None => None,
    };
    let patch_max = params.get("maxMarks").map(parse_max_marks).transpose()?;
    let patch_bands = params.get("gradeScale").map(parse_grade_scale).transpose()?;
    let patch_subjects = params.get("subjects").map(parse_exam_subjects).transpose()?;

    let tx = begin_immediate(conn)?;
    let current = load_exam(&tx, exam_id)?;
    let max_marks = patch_max.unwrap_or(current.max_marks);
    let domain = match parse_domain(params.get("gradingDomain"), max_marks)? {
        Some(d) => d,
        None => GradingDomain::parse(&current.grading_domain, max_marks)
            .unwrap_or(GradingDomain::RawMarks { max_marks }),
    };

    let grading_changed = patch_bands.is_some()
        || patch_subjects.is_some()
        || patch_max.is_some_and(|m| m != current.max_marks)
        || domain.as_str() != current.grading_domain;
    if grading_changed {
        let marks = marks_count(&tx, exam_id)?;
        if marks > 0 {
            return Err(HandlerErr::new(
                "grade_scale_frozen",
                "exam already has marks; its grading can no longer change",
            )
            .with_details(json!({ "examId": exam_id, "marksCount": marks })));
        }
    }

    // A new maxMarks or domain re-checks the stored scale as well as a new one.
    let stored;
    let effective = match &patch_bands {
        Some(b) => Some(b.as_slice()),
        None => {
            stored = load_grade_bands(&tx, exam_id).map_err(HandlerErr::query)?;
            (!stored.is_empty()).then_some(stored.as_slice())
        }
    };
    check_scale(effective, domain)?;

    tx.execute(
        "UPDATE exams SET name = ?, max_marks = ?, grading_domain = ?, updated_at = ?
         WHERE id = ?",
        (
            patch_name.as_deref().unwrap_or(&current.name),
            max_marks,
            domain.as_str(),
            db::now_timestamp(),
            exam_id,
        ),
    )
    .map_err(write_failed)?;
    if let Some(bands) = &patch_bands {
        replace_grade_bands(&tx, exam_id, bands)?;
    }
    if let Some(subjects) = &patch_subjects {
        replace_exam_subjects(&tx, exam_id, &current.class_id, subjects)?;
    }
    commit(tx)?;

    info!(exam_id = %exam_id, grading_changed, "exam updated");
    exam_json(conn, exam_id)
}

fn get_exam(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    Ok(json!({ "exam": exam_json(conn, exam_id)? }))
}

fn list_exams(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    require_class(conn, class_id)?;
    let mut stmt = conn
        .prepare(
            "SELECT e.id, e.name, e.max_marks, e.grading_domain,
                    (SELECT COUNT(*) FROM marks m WHERE m.exam_id = e.id) AS marks_count
             FROM exams e
             WHERE e.class_id = ?
             ORDER BY e.created_at, e.name",
        )
        .map_err(HandlerErr::query)?;
    let exams = stmt
        .query_map([class_id], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let max_marks: f64 = r.get(2)?;
            let domain: String = r.get(3)?;
            let marks: i64 = r.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "maxMarks": max_marks,
                "gradingDomain": domain,
                "marksCount": marks,
                "frozen": marks > 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "exams": exams }))
}

/// Dry run for editors: the verdict is the result, not an error envelope.
fn handle_grade_scale_validate(req: &Request) -> Value {
    let result = (|| -> Result<Value, HandlerErr> {
        let bands = parse_grade_scale(req.params.get("gradeScale").unwrap_or(&Value::Null))?;
        let max_marks = match req.params.get("maxMarks") {
            Some(v) => parse_max_marks(v)?,
            None => 100.0,
        };
        let domain = parse_domain(req.params.get("gradingDomain"), max_marks)?
            .unwrap_or(GradingDomain::Percentage);
        Ok(match validate_grade_scale(&bands, domain) {
            Ok(()) => json!({ "valid": true, "gradingDomain": domain.as_str() }),
            Err(e) => json!({
                "valid": false,
                "gradingDomain": domain.as_str(),
                "error": { "code": e.code(), "message": e.to_string(), "details": e.details() }
            }),
        })
    })();
    respond(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let run: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "exams.create" => create_exam,
        "exams.update" => update_exam,
        "exams.get" => get_exam,
        "exams.list" => list_exams,
        "gradeScale.validate" => return Some(handle_grade_scale_validate(req)),
        _ => return None,
    };
    let Some(conn) = state.db.as_ref() else {
        return Some(no_workspace(&req.id));
    };
    Some(respond(&req.id, run(conn, &req.params)))
}
