use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_nilaid");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn nilaid");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
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
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(resp: &serde_json::Value) -> Option<&str> {
    resp.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    nama: &str,
    nis: &str,
    kelas: &str,
) -> String {
    let result = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({ "nama": nama, "nis": nis, "kelas": kelas, "jenisKelamin": "Laki-laki" }),
    );
    result
        .get("student")
        .and_then(|s| s.get("id"))
        .and_then(|v| v.as_str())
        .expect("student id")
        .to_string()
}

fn create_objective(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    tujuan: &str,
) -> String {
    let result = request_ok(
        stdin,
        reader,
        id,
        "objectives.create",
        json!({ "tujuanPembelajaran": tujuan }),
    );
    result
        .get("objective")
        .and_then(|o| o.get("id"))
        .and_then(|v| v.as_str())
        .expect("objective id")
        .to_string()
}

struct Fixture {
    ani: String,
    budi: String,
    subject_id: String,
    o1: String,
    o2: String,
}

/// Two students in 5A, one subject, two configured objectives.
/// Request ids 1 through 8 are taken; start at "9" after this.
fn seed_class(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) -> Fixture {
    let _ = request_ok(
        stdin,
        reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let ani = create_student(stdin, reader, "2", "Ani Lestari", "111", "5A");
    let budi = create_student(stdin, reader, "3", "Budi Santoso", "222", "5A");

    let subject_id = request_ok(
        stdin,
        reader,
        "4",
        "subjects.create",
        json!({ "namaMataPelajaran": "Matematika" }),
    )
    .get("subject")
    .and_then(|s| s.get("id"))
    .and_then(|v| v.as_str())
    .expect("subject id")
    .to_string();

    let o1 = create_objective(stdin, reader, "5", "Memahami pecahan");
    let o2 = create_objective(stdin, reader, "6", "Mengenal desimal");

    let _ = request_ok(
        stdin,
        reader,
        "7",
        "configs.create",
        json!({
            "subjectId": subject_id.clone(),
            "kelas": "5A",
            "learningObjectiveIds": [o1.clone(), o2.clone()],
        }),
    );

    Fixture { ani, budi, subject_id, o1, o2 }
}

#[test]
fn upsert_creates_then_updates_the_same_row() {
    let workspace = temp_dir("nilaid-upsert");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed_class(&mut stdin, &mut reader, &workspace);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grades.upsert",
        json!({
            "studentId": fx.ani.clone(),
            "subjectId": fx.subject_id.clone(),
            "kelas": " 5a ",
            "learningObjectiveId": fx.o1.clone(),
            "nilai": 85,
        }),
    );
    let grade = first.get("grade").expect("grade in result");
    let grade_id = grade.get("id").and_then(|v| v.as_str()).expect("grade id").to_string();
    let created_at = grade
        .get("createdAt")
        .and_then(|v| v.as_str())
        .expect("createdAt")
        .to_string();
    let first_updated_at = grade
        .get("updatedAt")
        .and_then(|v| v.as_str())
        .expect("updatedAt")
        .to_string();
    assert_eq!(grade.get("nilai").and_then(|v| v.as_f64()), Some(85.0));
    assert_eq!(grade.get("kelas").and_then(|v| v.as_str()), Some("5A"));

    let matrix = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "grades.matrix",
        json!({
            "subjectId": fx.subject_id.clone(),
            "kelas": "5A",
            "learningObjectiveId": fx.o1.clone(),
        }),
    );
    let rows = matrix.get("rows").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(
        rows[0]["student"].get("nama").and_then(|v| v.as_str()),
        Some("Ani Lestari")
    );
    assert_eq!(rows[0]["grade"].get("nilai").and_then(|v| v.as_f64()), Some(85.0));
    assert!(rows[1]["grade"].is_null(), "Budi has no grade yet");

    // Same key again: the row keeps its identity, only nilai moves.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "grades.upsert",
        json!({
            "studentId": fx.ani.clone(),
            "subjectId": fx.subject_id.clone(),
            "kelas": "5A",
            "learningObjectiveId": fx.o1.clone(),
            "nilai": 90,
        }),
    );
    let grade = second.get("grade").expect("grade in result");
    assert_eq!(grade.get("id").and_then(|v| v.as_str()), Some(grade_id.as_str()));
    assert_eq!(
        grade.get("createdAt").and_then(|v| v.as_str()),
        Some(created_at.as_str())
    );
    assert_eq!(grade.get("nilai").and_then(|v| v.as_f64()), Some(90.0));
    // Timestamps are UTC ISO-8601, so string order is time order.
    let second_updated_at = grade
        .get("updatedAt")
        .and_then(|v| v.as_str())
        .expect("updatedAt");
    assert!(
        second_updated_at >= first_updated_at.as_str(),
        "updatedAt went backwards: {} then {}",
        first_updated_at,
        second_updated_at
    );

    let matrix = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "grades.matrix",
        json!({
            "subjectId": fx.subject_id,
            "kelas": "5A",
            "learningObjectiveId": fx.o1,
        }),
    );
    let rows = matrix.get("rows").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["grade"].get("nilai").and_then(|v| v.as_f64()), Some(90.0));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn upsert_rejects_out_of_range_and_misplaced_grades() {
    let workspace = temp_dir("nilaid-upsert-guards");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed_class(&mut stdin, &mut reader, &workspace);

    let citra = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "students.create",
        json!({ "nama": "Citra Dewi", "nis": "333", "kelas": "5B", "jenisKelamin": "Perempuan" }),
    )
    .get("student")
    .and_then(|s| s.get("id"))
    .and_then(|v| v.as_str())
    .expect("student id")
    .to_string();

    for (id, nilai) in [("10", json!(101)), ("11", json!(-1))] {
        let resp = request(
            &mut stdin,
            &mut reader,
            id,
            "grades.upsert",
            json!({
                "studentId": fx.ani.clone(),
                "subjectId": fx.subject_id.clone(),
                "kelas": "5A",
                "learningObjectiveId": fx.o1.clone(),
                "nilai": nilai,
            }),
        );
        assert_eq!(error_code(&resp), Some("out_of_range"));
    }

    let no_nilai = request(
        &mut stdin,
        &mut reader,
        "12",
        "grades.upsert",
        json!({
            "studentId": fx.ani.clone(),
            "subjectId": fx.subject_id.clone(),
            "kelas": "5A",
            "learningObjectiveId": fx.o1.clone(),
        }),
    );
    assert_eq!(error_code(&no_nilai), Some("bad_params"));

    // An objective outside the 5A config cannot take grades.
    let loose = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "objectives.create",
        json!({ "tujuanPembelajaran": "Belum dikonfigurasi" }),
    );
    let loose_id = loose
        .get("objective")
        .and_then(|o| o.get("id"))
        .and_then(|v| v.as_str())
        .expect("objective id")
        .to_string();
    let unconfigured = request(
        &mut stdin,
        &mut reader,
        "14",
        "grades.upsert",
        json!({
            "studentId": fx.ani.clone(),
            "subjectId": fx.subject_id.clone(),
            "kelas": "5A",
            "learningObjectiveId": loose_id,
            "nilai": 70,
        }),
    );
    assert_eq!(error_code(&unconfigured), Some("not_configured"));

    let unknown_student = request(
        &mut stdin,
        &mut reader,
        "15",
        "grades.upsert",
        json!({
            "studentId": "no-such-student",
            "subjectId": fx.subject_id.clone(),
            "kelas": "5A",
            "learningObjectiveId": fx.o1.clone(),
            "nilai": 70,
        }),
    );
    assert_eq!(error_code(&unknown_student), Some("not_found"));

    let wrong_class = request(
        &mut stdin,
        &mut reader,
        "16",
        "grades.upsert",
        json!({
            "studentId": citra,
            "subjectId": fx.subject_id,
            "kelas": "5A",
            "learningObjectiveId": fx.o1,
            "nilai": 70,
        }),
    );
    assert_eq!(error_code(&wrong_class), Some("not_found"));
    assert_eq!(
        wrong_class
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str()),
        Some("Siswa tidak terdaftar di kelas 5A")
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn objectives_listing_follows_config_order() {
    let workspace = temp_dir("nilaid-grades-objectives");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed_class(&mut stdin, &mut reader, &workspace);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grades.objectives",
        json!({ "subjectId": fx.subject_id.clone(), "kelas": "5A" }),
    );
    let ids: Vec<&str> = listed
        .get("objectives")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|o| o.get("id").and_then(|v| v.as_str()))
                .collect()
        })
        .unwrap_or_default();
    assert_eq!(ids, vec![fx.o1.as_str(), fx.o2.as_str()]);

    // No config for 5B, so nothing to grade there.
    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "grades.objectives",
        json!({ "subjectId": fx.subject_id.clone(), "kelas": "5B" }),
    );
    assert_eq!(
        empty.get("objectives").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    let matrix = request(
        &mut stdin,
        &mut reader,
        "11",
        "grades.matrix",
        json!({
            "subjectId": fx.subject_id,
            "kelas": "5B",
            "learningObjectiveId": fx.o1,
        }),
    );
    assert_eq!(error_code(&matrix), Some("not_configured"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn deleting_a_student_clears_their_matrix_row() {
    let workspace = temp_dir("nilaid-student-cascade");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed_class(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grades.upsert",
        json!({
            "studentId": fx.ani.clone(),
            "subjectId": fx.subject_id.clone(),
            "kelas": "5A",
            "learningObjectiveId": fx.o1.clone(),
            "nilai": 85,
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.delete",
        json!({ "studentId": fx.ani }),
    );

    let matrix = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "grades.matrix",
        json!({
            "subjectId": fx.subject_id,
            "kelas": "5A",
            "learningObjectiveId": fx.o1,
        }),
    );
    let rows = matrix.get("rows").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0]["student"].get("id").and_then(|v| v.as_str()),
        Some(fx.budi.as_str())
    );
    assert!(rows[0]["grade"].is_null());

    let _ = std::fs::remove_dir_all(workspace);
}
