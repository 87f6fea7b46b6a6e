use crate::batch::{parse_marks_batch, submit_marks_batch};
use crate::ipc::handlers::setup::{default_ranking_mode, max_batch_records};
use crate::ipc::helpers::{get_required_str, no_workspace, respond, to_json, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::rank::{compute_rank_list, RankingMode};
use crate::reports;
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::warn;

fn submit_batch(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let batch = parse_marks_batch(params, max_batch_records(conn)).map_err(|e| {
        warn!(code = e.code(), error = %e, "marks batch rejected");
        HandlerErr::from(e)
    })?;
    let outcome = submit_marks_batch(conn, &batch)?;
    Ok(json!({
        "examId": batch.exam_id,
        "counts": to_json(&outcome.counts)?,
        "records": to_json(&outcome.records)?
    }))
}

fn rank_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let mode = match params.get("mode") {
        None | Some(Value::Null) => default_ranking_mode(conn),
        Some(v) => v.as_str().and_then(RankingMode::parse).ok_or_else(|| {
            HandlerErr::bad_params("mode must be one of: ordinal, competition, dense")
        })?,
    };
    let list = compute_rank_list(conn, exam_id, mode)?;
    to_json(&list)
}

fn by_exam(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let marks = reports::marks_by_exam(conn, exam_id)?;
    Ok(json!({ "examId": exam_id, "marks": to_json(&marks)? }))
}

fn class_performance(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let subjects = reports::class_performance(conn, exam_id)?;
    Ok(json!({ "examId": exam_id, "subjects": to_json(&subjects)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let run: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "marks.submitBatch" => submit_batch,
        "marks.rankList" => rank_list,
        "marks.byExam" => by_exam,
        "marks.classPerformance" => class_performance,
        _ => return None,
    };
    let Some(conn) = state.db.as_ref() else {
        return Some(no_workspace(&req.id));
    };
    Some(respond(&req.id, run(conn, &req.params)))
}
