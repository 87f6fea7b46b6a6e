use crate::db;
use crate::ipc::handlers::classes::require_class;
use crate::ipc::helpers::{get_required_str, no_workspace, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Roll numbers arrive as JSON numbers or as digit strings from form inputs.
fn parse_roll_no(v: Option<&serde_json::Value>) -> Result<i64, HandlerErr> {
    let Some(v) = v else {
        return Err(HandlerErr::bad_params("missing rollNo"));
    };
    let parsed = match v {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match parsed {
        Some(n) if n > 0 => Ok(n),
        _ => Err(HandlerErr::new("bad_roll_no", "roll number must be a positive integer")
            .with_details(json!({ "rollNo": v }))),
    }
}

fn create_student(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let display_name = get_required_str(params, "displayName")?.to_string();
    let roll_no = parse_roll_no(params.get("rollNo"))?;
    require_class(conn, class_id)?;

    let holder: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE class_id = ? AND roll_no = ?",
            (class_id, roll_no),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    if let Some(existing) = holder {
        return Err(HandlerErr::new(
            "duplicate_roll_no",
            format!("roll number {} is already taken in this class", roll_no),
        )
        .with_details(json!({ "rollNo": roll_no, "studentId": existing })));
    }

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, display_name, roll_no, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&student_id, class_id, &display_name, roll_no, db::now_timestamp()),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "students" }))
    })?;

    Ok(json!({
        "studentId": student_id,
        "classId": class_id,
        "displayName": display_name,
        "rollNo": roll_no
    }))
}

fn list_students(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    require_class(conn, class_id)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, display_name, roll_no FROM students
             WHERE class_id = ?
             ORDER BY roll_no",
        )
        .map_err(HandlerErr::query)?;
    let students = stmt
        .query_map([class_id], |row| {
            let id: String = row.get(0)?;
            let display_name: String = row.get(1)?;
            let roll_no: i64 = row.get(2)?;
            Ok(json!({ "id": id, "displayName": display_name, "rollNo": roll_no }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr> =
        match req.method.as_str() {
            "students.create" => create_student,
            "students.list" => list_students,
            _ => return None,
        };
    let Some(conn) = state.db.as_ref() else {
        return Some(no_workspace(&req.id));
    };
    Some(respond(&req.id, run(conn, &req.params)))
}
