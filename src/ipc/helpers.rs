use crate::batch::BatchError;
use crate::grading::GradeScaleError;
use crate::ipc::error::err;
use crate::rank::RankError;
use crate::reports::ReportError;
use chrono::NaiveDate;
use serde_json::json;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn query(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<BatchError> for HandlerErr {
    fn from(e: BatchError) -> Self {
        Self {
            code: e.code(),
            details: e.details(),
            message: e.to_string(),
        }
    }
}

impl From<GradeScaleError> for HandlerErr {
    fn from(e: GradeScaleError) -> Self {
        Self {
            code: e.code(),
            details: Some(e.details()),
            message: e.to_string(),
        }
    }
}

impl From<RankError> for HandlerErr {
    fn from(e: RankError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<ReportError> for HandlerErr {
    fn from(e: ReportError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

pub fn get_required_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, HandlerErr> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s)
}

pub fn get_optional_date(params: &serde_json::Value, key: &str) -> Result<Option<NaiveDate>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => {
            let raw = v
                .as_str()
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a string", key)))?;
            NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .map(Some)
                .map_err(|_| {
                    HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key))
                        .with_details(json!({ "value": raw }))
                })
        }
    }
}

pub fn get_required_date(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    get_optional_date(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn no_workspace(id: &str) -> serde_json::Value {
    err(id, "no_workspace", "select a workspace first", None)
}

/// Folds a handler result into the response envelope.
pub fn respond(id: &str, result: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(v) => crate::ipc::error::ok(id, v),
        Err(e) => e.response(id),
    }
}

pub fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, HandlerErr> {
    serde_json::to_value(value).map_err(|e| HandlerErr::new("internal_error", e.to_string()))
}
