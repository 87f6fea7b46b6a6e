use crate::batch::{parse_attendance_batch, submit_attendance_batch};
use crate::ipc::handlers::setup::max_batch_records;
use crate::ipc::helpers::{
    get_optional_date, get_required_date, get_required_str, no_workspace, respond, to_json,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::reports;
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::warn;

fn submit_batch(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let batch = parse_attendance_batch(params, max_batch_records(conn)).map_err(|e| {
        warn!(code = e.code(), error = %e, "attendance batch rejected");
        HandlerErr::from(e)
    })?;
    let outcome = submit_attendance_batch(conn, &batch)?;
    Ok(json!({
        "classId": batch.class_id,
        "date": batch.date.format("%Y-%m-%d").to_string(),
        "counts": to_json(&outcome.counts)?,
        "records": to_json(&outcome.records)?
    }))
}

fn class_day(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = get_required_date(params, "date")?;
    let records = reports::attendance_for_class_day(conn, class_id, date)?;
    Ok(json!({
        "classId": class_id,
        "date": date.format("%Y-%m-%d").to_string(),
        "records": to_json(&records)?
    }))
}

fn class_stats(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let range = match (get_optional_date(params, "from")?, get_optional_date(params, "to")?) {
        (None, None) => None,
        (Some(from), Some(to)) if from <= to => Some((from, to)),
        (Some(_), Some(_)) => return Err(HandlerErr::bad_params("from must not be after to")),
        _ => return Err(HandlerErr::bad_params("from and to must be given together")),
    };
    let students = reports::class_attendance_stats(conn, class_id, range)?;
    Ok(json!({
        "classId": class_id,
        "from": range.map(|(f, _)| f.format("%Y-%m-%d").to_string()),
        "to": range.map(|(_, t)| t.format("%Y-%m-%d").to_string()),
        "students": to_json(&students)?
    }))
}

fn student_stats(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let report = reports::student_attendance(conn, student_id)?;
    to_json(&report)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let run: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "attendance.submitBatch" => submit_batch,
        "attendance.classDay" => class_day,
        "attendance.classStats" => class_stats,
        "attendance.studentStats" => student_stats,
        _ => return None,
    };
    let Some(conn) = state.db.as_ref() else {
        return Some(no_workspace(&req.id));
    };
    Some(respond(&req.id, run(conn, &req.params)))
}
