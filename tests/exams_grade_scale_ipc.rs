mod test_support;

use serde_json::json;
use test_support::Fixture;

#[test]
fn exam_create_validates_the_grade_scale() {
    let mut fx = Fixture::new("classbook-exam-create");
    let class_id = fx.class_id.clone();

    let exam_id = fx.add_exam(json!({
        "name": "Midterm",
        "maxMarks": 100,
        "gradingDomain": "percentage",
        "gradeScale": [
            { "label": "A", "min": 90, "max": 100 },
            { "label": "B", "min": 80, "max": 89 }
        ]
    }));
    let got = fx.ok("exams.get", json!({ "examId": exam_id }));
    assert_eq!(got["exam"]["gradingDomain"], "percentage");
    assert_eq!(got["exam"]["gradeScale"][1]["label"], "B");
    assert_eq!(got["exam"]["frozen"], false);

    let e = fx.err(
        "exams.create",
        json!({
            "classId": class_id,
            "name": "Broken",
            "maxMarks": 100,
            "gradingDomain": "percentage",
            "gradeScale": [
                { "label": "A", "min": 80, "max": 100 },
                { "label": "B", "min": 85, "max": 95 }
            ]
        }),
        "invalid_grade_scale",
    );
    assert_eq!(e["status"], 400);
    assert_eq!(e["details"]["rule"], "overlap");

    let e = fx.err(
        "exams.create",
        json!({
            "classId": class_id,
            "name": "Raw",
            "maxMarks": 50,
            "gradingDomain": "raw_marks",
            "gradeScale": [{ "label": "A", "min": 40, "max": 60 }]
        }),
        "invalid_grade_scale",
    );
    assert_eq!(e["details"]["rule"], "out_of_domain");

    let _ = fx.err(
        "exams.create",
        json!({ "classId": class_id, "name": "Empty", "maxMarks": 50, "gradeScale": [] }),
        "invalid_grade_scale",
    );
    let _ = fx.err(
        "exams.create",
        json!({ "classId": class_id, "name": "Zero", "maxMarks": 0 }),
        "bad_params",
    );
    let _ = fx.err(
        "exams.create",
        json!({ "classId": "missing", "name": "Orphan", "maxMarks": 10 }),
        "not_found",
    );

    // Rejected exams leave nothing behind.
    let list = fx.ok("exams.list", json!({ "classId": class_id }));
    assert_eq!(list["exams"].as_array().map(Vec::len), Some(1));
}

#[test]
fn grade_scale_validate_is_a_dry_run() {
    let mut fx = Fixture::new("classbook-scale-validate");

    let ok = fx.ok(
        "gradeScale.validate",
        json!({
            "gradingDomain": "percentage",
            "gradeScale": [
                { "label": "A", "min": 90, "max": 100 },
                { "label": "B", "min": 80, "max": 89 }
            ]
        }),
    );
    assert_eq!(ok["valid"], true);

    let bad = fx.ok(
        "gradeScale.validate",
        json!({
            "gradingDomain": "percentage",
            "gradeScale": [
                { "label": "A", "min": 80, "max": 100 },
                { "label": "B", "min": 85, "max": 95 }
            ]
        }),
    );
    assert_eq!(bad["valid"], false);
    assert_eq!(bad["error"]["code"], "invalid_grade_scale");
    assert_eq!(bad["error"]["details"]["bands"], json!(["A", "B"]));

    let _ = fx.err(
        "gradeScale.validate",
        json!({ "gradeScale": "A=90" }),
        "bad_params",
    );
}

#[test]
fn grading_freezes_once_marks_exist() {
    let mut fx = Fixture::new("classbook-scale-freeze");
    let student = fx.add_student("Asha", 1);
    let math = fx.add_subject("Math");
    let exam_id = fx.add_exam(json!({
        "name": "Unit test",
        "maxMarks": 20,
        "gradeScale": [
            { "label": "Pass", "min": 10, "max": 20 },
            { "label": "Fail", "min": 0, "max": 9.99 }
        ]
    }));

    // Before any marks, the scale and max can still change, and a new max
    // re-checks the stored scale.
    let _ = fx.err(
        "exams.update",
        json!({ "examId": exam_id, "maxMarks": 15 }),
        "invalid_grade_scale",
    );
    let updated = fx.ok(
        "exams.update",
        json!({
            "examId": exam_id,
            "maxMarks": 25,
            "gradeScale": [
                { "label": "Pass", "min": 12.5, "max": 25 },
                { "label": "Fail", "min": 0, "max": 12.49 }
            ]
        }),
    );
    assert_eq!(updated["maxMarks"], 25.0);

    let _ = fx.ok(
        "marks.submitBatch",
        json!({
            "examId": exam_id,
            "records": [{ "studentId": student, "subjectId": math, "score": 18 }]
        }),
    );

    let e = fx.err(
        "exams.update",
        json!({
            "examId": exam_id,
            "gradeScale": [{ "label": "All", "min": 0, "max": 25 }]
        }),
        "grade_scale_frozen",
    );
    assert_eq!(e["status"], 409);
    let _ = fx.err(
        "exams.update",
        json!({ "examId": exam_id, "maxMarks": 30 }),
        "grade_scale_frozen",
    );

    let renamed = fx.ok(
        "exams.update",
        json!({ "examId": exam_id, "name": "Unit test 1" }),
    );
    assert_eq!(renamed["name"], "Unit test 1");
    assert_eq!(renamed["frozen"], true);
    assert_eq!(renamed["gradeScale"][0]["min"], 12.5);
}

#[test]
fn roll_numbers_are_positive_and_unique_per_class() {
    let mut fx = Fixture::new("classbook-roll-numbers");
    let class_id = fx.class_id.clone();
    let _ = fx.add_student("Asha", 1);

    let e = fx.err(
        "students.create",
        json!({ "classId": class_id, "displayName": "Bilal", "rollNo": 1 }),
        "duplicate_roll_no",
    );
    assert_eq!(e["status"], 400);
    let _ = fx.err(
        "students.create",
        json!({ "classId": class_id, "displayName": "Chen", "rollNo": 0 }),
        "bad_roll_no",
    );
    let _ = fx.add_student("Dara", 2);

    let list = fx.ok("students.list", json!({ "classId": class_id }));
    let names: Vec<&str> = list["students"]
        .as_array()
        .expect("students")
        .iter()
        .filter_map(|s| s["displayName"].as_str())
        .collect();
    assert_eq!(names, vec!["Asha", "Dara"]);

    let _ = fx.add_subject("Math");
    let _ = fx.err(
        "subjects.create",
        json!({ "classId": class_id, "name": "math" }),
        "duplicate_name",
    );
}
