use serde_json::json;

/// HTTP-equivalent status for an error code, so callers can tell malformed
/// input from missing referents from store failures without parsing messages.
pub fn status_for_code(code: &str) -> u16 {
    match code {
        "bad_json" | "bad_params" | "no_workspace" | "not_implemented" => 400,
        "invalid_grade_scale" | "bad_roll_no" | "duplicate_roll_no" | "duplicate_key"
        | "too_many_records" | "score_out_of_range" => 400,
        "not_found" => 404,
        "grade_scale_frozen" | "duplicate_name" => 409,
        _ => 500,
    }
}

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
        "status": status_for_code(code),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}
