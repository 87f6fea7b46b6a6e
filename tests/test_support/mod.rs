#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tempfile::TempDir;

pub fn temp_dir(prefix: &str) -> TempDir {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .expect("create temp dir")
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    spawn_sidecar_with_args(&[])
}

pub fn spawn_sidecar_with_args(args: &[&str]) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_classbookd");
    let mut child = Command::new(exe)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn classbookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn send_line(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    line: &str,
) -> serde_json::Value {
    writeln!(stdin, "{}", line).expect("write request");
    stdin.flush().expect("flush request");

    let mut out = String::new();
    reader.read_line(&mut out).expect("read response line");
    assert!(!out.trim().is_empty(), "empty response for {}", line);
    serde_json::from_str(out.trim()).expect("parse response json")
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    let value = send_line(stdin, reader, &payload.to_string());
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Returns the `error` object of a response that must have failed with `code`.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
    code: &str,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    let error = value.get("error").cloned().expect("error object");
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some(code),
        "{} error: {}",
        method,
        error
    );
    error
}

pub fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

/// A sidecar with an open workspace and a class to hang records on.
pub struct Fixture {
    pub _workspace: TempDir,
    pub child: Child,
    pub stdin: ChildStdin,
    pub reader: BufReader<ChildStdout>,
    pub class_id: String,
    next_id: u64,
}

impl Fixture {
    pub fn new(prefix: &str) -> Self {
        let workspace = temp_dir(prefix);
        let (child, mut stdin, mut reader) = spawn_sidecar();
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            "select",
            "workspace.select",
            json!({ "path": workspace.path().to_string_lossy() }),
        );
        let class = request_ok(
            &mut stdin,
            &mut reader,
            "class",
            "classes.create",
            json!({ "name": "Grade 5", "section": "A" }),
        );
        let class_id = str_field(&class, "classId");
        Self {
            _workspace: workspace,
            child,
            stdin,
            reader,
            class_id,
            next_id: 0,
        }
    }

    fn id(&mut self) -> String {
        self.next_id += 1;
        format!("r{}", self.next_id)
    }

    pub fn ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = self.id();
        request_ok(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    pub fn err(&mut self, method: &str, params: serde_json::Value, code: &str) -> serde_json::Value {
        let id = self.id();
        request_err(&mut self.stdin, &mut self.reader, &id, method, params, code)
    }

    pub fn add_student(&mut self, name: &str, roll_no: i64) -> String {
        let class_id = self.class_id.clone();
        let r = self.ok(
            "students.create",
            json!({ "classId": class_id, "displayName": name, "rollNo": roll_no }),
        );
        str_field(&r, "studentId")
    }

    pub fn add_subject(&mut self, name: &str) -> String {
        let class_id = self.class_id.clone();
        let r = self.ok("subjects.create", json!({ "classId": class_id, "name": name }));
        str_field(&r, "subjectId")
    }

    pub fn add_exam(&mut self, params: serde_json::Value) -> String {
        let mut params = params;
        params["classId"] = json!(self.class_id.clone());
        let r = self.ok("exams.create", params);
        str_field(&r, "id")
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
