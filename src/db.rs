use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

pub const DB_FILE_NAME: &str = "classbook.sqlite3";

pub fn open_db(workspace: &Path, busy_timeout: Duration) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)?;
    // Concurrent writers from another process wait on the lock instead of failing fast.
    conn.busy_timeout(busy_timeout)?;
    init_schema(&conn)?;
    info!(path = %db_path.display(), "workspace database ready");
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            section TEXT NOT NULL DEFAULT '',
            created_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            roll_no INTEGER NOT NULL CHECK(roll_no > 0),
            created_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(class_id, roll_no)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(class_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_class ON subjects(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            max_marks REAL NOT NULL,
            grading_domain TEXT NOT NULL DEFAULT 'raw_marks'
                CHECK(grading_domain IN ('percentage', 'raw_marks')),
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    ensure_exams_grading_domain(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exams_class ON exams(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_bands(
            exam_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            label TEXT NOT NULL,
            min_score REAL NOT NULL,
            max_score REAL NOT NULL,
            PRIMARY KEY(exam_id, sort_order),
            FOREIGN KEY(exam_id) REFERENCES exams(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_subjects(
            exam_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            scheduled_date TEXT,
            PRIMARY KEY(exam_id, subject_id),
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('Present', 'Absent')),
            revision INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    ensure_revision_columns(conn, "attendance")?;
    ensure_unique_key(conn, "attendance", "ux_attendance_key", &["student_id", "date"])?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_class_date ON attendance(class_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            score REAL NOT NULL,
            revision INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT,
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    ensure_revision_columns(conn, "marks")?;
    ensure_unique_key(
        conn,
        "marks",
        "ux_marks_key",
        &["exam_id", "student_id", "subject_id"],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_exam ON marks(exam_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn ensure_exams_grading_domain(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "exams", "grading_domain")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE exams ADD COLUMN grading_domain TEXT NOT NULL DEFAULT 'raw_marks'",
        [],
    )?;
    Ok(())
}

fn ensure_revision_columns(conn: &Connection, table: &str) -> anyhow::Result<()> {
    if !table_has_column(conn, table, "revision")? {
        conn.execute(
            &format!(
                "ALTER TABLE {} ADD COLUMN revision INTEGER NOT NULL DEFAULT 1",
                table
            ),
            [],
        )?;
    }
    if !table_has_column(conn, table, "updated_at")? {
        conn.execute(
            &format!("ALTER TABLE {} ADD COLUMN updated_at TEXT", table),
            [],
        )?;
    }
    Ok(())
}

/// Workspaces written by the old read-then-write submit path may hold several
/// rows per logical key. Keep the most recently inserted row for each key, then
/// put the unique index in place so upserts can target it.
fn ensure_unique_key(
    conn: &Connection,
    table: &str,
    index_name: &str,
    columns: &[&str],
) -> anyhow::Result<()> {
    let exists: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND name = ?",
            [index_name],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Ok(());
    }

    let cols = columns.join(", ");
    let removed = conn.execute(
        &format!(
            "DELETE FROM {table}
             WHERE rowid NOT IN (SELECT MAX(rowid) FROM {table} GROUP BY {cols})"
        ),
        [],
    )?;
    if removed > 0 {
        debug!(table, removed, "collapsed duplicate rows before adding unique key");
    }
    conn.execute(
        &format!("CREATE UNIQUE INDEX IF NOT EXISTS {index_name} ON {table}({cols})"),
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
