use crate::batch::BATCH_MAX_RECORDS;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::rank::RankingMode;
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

#[derive(Clone, Copy)]
enum SetupSection {
    Ranking,
    Submissions,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "ranking" => Some(Self::Ranking),
            "submissions" => Some(Self::Submissions),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Ranking => "setup.ranking",
            Self::Submissions => "setup.submissions",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Ranking => "ranking",
            Self::Submissions => "submissions",
        }
    }
}

const SECTIONS: [SetupSection; 2] = [SetupSection::Ranking, SetupSection::Submissions];

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Ranking => json!({
            "defaultMode": RankingMode::default().as_str()
        }),
        SetupSection::Submissions => json!({
            "maxBatchRecords": BATCH_MAX_RECORDS
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Ranking => match k.as_str() {
                "defaultMode" => {
                    let mode = v
                        .as_str()
                        .and_then(RankingMode::parse)
                        .ok_or_else(|| {
                            "defaultMode must be one of: ordinal, competition, dense".to_string()
                        })?;
                    obj.insert(k.clone(), Value::String(mode.as_str().to_string()));
                }
                _ => return Err(format!("unknown ranking field: {}", k)),
            },
            SetupSection::Submissions => match k.as_str() {
                "maxBatchRecords" => {
                    let n = parse_i64_range(v, k, 1, BATCH_MAX_RECORDS as i64)?;
                    obj.insert(k.clone(), Value::from(n));
                }
                _ => return Err(format!("unknown submissions field: {}", k)),
            },
        }
    }
    Ok(())
}

/// Stored values are merged over the defaults so fields added later still
/// read back.
fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(stored) = db::settings_get_json(conn, section.key())? {
        if let (Some(obj), Some(stored)) = (current.as_object_mut(), stored.as_object()) {
            for (k, v) in stored {
                obj.insert(k.clone(), v.clone());
            }
        }
    }
    Ok(current)
}

pub fn default_ranking_mode(conn: &Connection) -> RankingMode {
    match load_section(conn, SetupSection::Ranking) {
        Ok(v) => v
            .get("defaultMode")
            .and_then(|m| m.as_str())
            .and_then(RankingMode::parse)
            .unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "ranking settings unreadable; using ordinal");
            RankingMode::default()
        }
    }
}

pub fn max_batch_records(conn: &Connection) -> usize {
    match load_section(conn, SetupSection::Submissions) {
        Ok(v) => v
            .get("maxBatchRecords")
            .and_then(|n| n.as_u64())
            .map(|n| (n as usize).clamp(1, BATCH_MAX_RECORDS))
            .unwrap_or(BATCH_MAX_RECORDS),
        Err(e) => {
            warn!(error = %e, "submission settings unreadable; using the hard limit");
            BATCH_MAX_RECORDS
        }
    }
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut out = Map::new();
    for section in SECTIONS {
        match load_section(conn, section) {
            Ok(v) => {
                out.insert(section.name().to_string(), v);
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    ok(&req.id, Value::Object(out))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_name) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_name) else {
        return err(
            &req.id,
            "bad_params",
            format!("unknown section: {}", section_name),
            Some(json!({ "allowed": SECTIONS.map(|s| s.name()) })),
        );
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(message) = merge_section_patch(section, &mut current, patch) {
        return err(
            &req.id,
            "bad_params",
            message,
            Some(json!({ "section": section.name() })),
        );
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    info!(section = section.name(), "settings updated");
    ok(&req.id, json!({ "section": section.name(), "value": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
