use crate::db;
use crate::ipc::error::ok;
use crate::ipc::helpers::{get_required_str, no_workspace, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };
    respond(&req.id, list_classes(conn))
}

fn list_classes(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.section,
               (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
               (SELECT COUNT(*) FROM subjects sub WHERE sub.class_id = c.id) AS subject_count,
               (SELECT COUNT(*) FROM exams e WHERE e.class_id = c.id) AS exam_count
             FROM classes c
             ORDER BY c.name, c.section",
        )
        .map_err(HandlerErr::query)?;
    let classes = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let section: String = row.get(2)?;
            let student_count: i64 = row.get(3)?;
            let subject_count: i64 = row.get(4)?;
            let exam_count: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "name": name,
                "section": section,
                "studentCount": student_count,
                "subjectCount": subject_count,
                "examCount": exam_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "classes": classes }))
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    respond(&req.id, create_class(conn, &req.params))
}

fn create_class(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?.to_string();
    let section = params
        .get("section")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, name, section, created_at) VALUES(?, ?, ?, ?)",
        (&class_id, &name, &section, db::now_timestamp()),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "classes" }))
    })?;

    Ok(json!({ "classId": class_id, "name": name, "section": section }))
}

pub(crate) fn require_class(conn: &Connection, class_id: &str) -> Result<(), HandlerErr> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| r.get(0))
        .optional()
        .map_err(HandlerErr::query)?;
    match found {
        Some(_) => Ok(()),
        None => Err(HandlerErr::new("not_found", "class not found")
            .with_details(json!({ "classId": class_id }))),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    respond(&req.id, create_subject(conn, &req.params))
}

fn create_subject(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let name = get_required_str(params, "name")?.to_string();
    require_class(conn, class_id)?;

    let taken: Option<String> = conn
        .query_row(
            "SELECT id FROM subjects WHERE class_id = ? AND name = ? COLLATE NOCASE",
            (class_id, &name),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    if let Some(existing) = taken {
        return Err(HandlerErr::new(
            "duplicate_name",
            format!("subject '{}' already exists in this class", name),
        )
        .with_details(json!({ "subjectId": existing })));
    }

    let sort_order = match params.get("sortOrder") {
        Some(v) => v
            .as_i64()
            .filter(|n| *n >= 0)
            .ok_or_else(|| HandlerErr::bad_params("sortOrder must be a non-negative integer"))?,
        None => conn
            .query_row(
                "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM subjects WHERE class_id = ?",
                [class_id],
                |r| r.get(0),
            )
            .map_err(HandlerErr::query)?,
    };

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, class_id, name, sort_order) VALUES(?, ?, ?, ?)",
        (&subject_id, class_id, &name, sort_order),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "subjects" }))
    })?;

    Ok(json!({
        "subjectId": subject_id,
        "classId": class_id,
        "name": name,
        "sortOrder": sort_order
    }))
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    respond(&req.id, list_subjects(conn, &req.params))
}

fn list_subjects(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    require_class(conn, class_id)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, name, sort_order FROM subjects
             WHERE class_id = ?
             ORDER BY sort_order, name",
        )
        .map_err(HandlerErr::query)?;
    let subjects = stmt
        .query_map([class_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let sort_order: i64 = row.get(2)?;
            Ok(json!({ "id": id, "name": name, "sortOrder": sort_order }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "subjects": subjects }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        _ => None,
    }
}
