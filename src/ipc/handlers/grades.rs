use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{normalize_upper, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn objective_configured(
    conn: &Connection,
    subject_id: &str,
    kelas: &str,
    objective_id: &str,
) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1
         FROM subject_class_configs c
         JOIN config_objectives co ON co.config_id = c.id
         WHERE c.subject_id = ? AND c.kelas = ? AND co.learning_objective_id = ?",
        (subject_id, kelas, objective_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn grade_row_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let student_id: String = row.get(1)?;
    let subject_id: String = row.get(2)?;
    let kelas: String = row.get(3)?;
    let objective_id: String = row.get(4)?;
    let nilai: f64 = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(json!({
        "id": id,
        "studentId": student_id,
        "subjectId": subject_id,
        "kelas": kelas,
        "learningObjectiveId": objective_id,
        "nilai": nilai,
        "createdAt": created_at,
        "updatedAt": updated_at
    }))
}

fn handle_grades_objectives(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let kelas = match required_str(req, "kelas") {
        Ok(v) => normalize_upper(&v),
        Err(resp) => return resp,
    };

    let config_id: Option<String> = match conn
        .query_row(
            "SELECT id FROM subject_class_configs WHERE subject_id = ? AND kelas = ?",
            (&subject_id, &kelas),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    // No configuration yet just means there is nothing to grade.
    let Some(config_id) = config_id else {
        return ok(&req.id, json!({ "objectives": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT o.id, o.tujuan_pembelajaran
         FROM config_objectives co
         JOIN learning_objectives o ON o.id = co.learning_objective_id
         WHERE co.config_id = ?
         ORDER BY co.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&config_id], |row| {
            let id: String = row.get(0)?;
            let tujuan: String = row.get(1)?;
            Ok(json!({ "id": id, "tujuanPembelajaran": tujuan }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(objectives) => ok(&req.id, json!({ "objectives": objectives })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_grades_matrix(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let kelas = match required_str(req, "kelas") {
        Ok(v) => normalize_upper(&v),
        Err(resp) => return resp,
    };
    let objective_id = match required_str(req, "learningObjectiveId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match objective_configured(conn, &subject_id, &kelas, &objective_id) {
        Ok(true) => {}
        Ok(false) => {
            return err(
                &req.id,
                "not_configured",
                "Tujuan pembelajaran belum dikonfigurasi untuk mata pelajaran dan kelas ini",
                Some(json!({
                    "subjectId": subject_id,
                    "kelas": kelas,
                    "learningObjectiveId": objective_id
                })),
            )
        }
        Err(e) => return e.response(&req.id),
    }

    let mut stmt = match conn.prepare(
        "SELECT s.id, s.nama, s.nis, s.status, g.id, g.nilai, g.updated_at
         FROM students s
         LEFT JOIN grades g
           ON g.student_id = s.id
          AND g.subject_id = ?
          AND g.kelas = ?
          AND g.learning_objective_id = ?
         WHERE s.kelas = ?
         ORDER BY s.nama, s.nis",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&subject_id, &kelas, &objective_id, &kelas), |row| {
            let student_id: String = row.get(0)?;
            let nama: String = row.get(1)?;
            let nis: String = row.get(2)?;
            let status: String = row.get(3)?;
            let grade_id: Option<String> = row.get(4)?;
            let nilai: Option<f64> = row.get(5)?;
            let updated_at: Option<String> = row.get(6)?;
            let grade = match grade_id {
                Some(id) => json!({ "id": id, "nilai": nilai, "updatedAt": updated_at }),
                None => serde_json::Value::Null,
            };
            Ok(json!({
                "student": { "id": student_id, "nama": nama, "nis": nis, "status": status },
                "grade": grade
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(rows) => ok(&req.id, json!({ "rows": rows })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_grades_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let kelas = match required_str(req, "kelas") {
        Ok(v) => normalize_upper(&v),
        Err(resp) => return resp,
    };
    let objective_id = match required_str(req, "learningObjectiveId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(nilai) = req.params.get("nilai").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "missing/invalid nilai", None);
    };
    if !(0.0..=100.0).contains(&nilai) {
        return err(
            &req.id,
            "out_of_range",
            "Nilai harus antara 0 dan 100",
            Some(json!({ "nilai": nilai })),
        );
    }

    match objective_configured(conn, &subject_id, &kelas, &objective_id) {
        Ok(true) => {}
        Ok(false) => {
            return err(
                &req.id,
                "not_configured",
                "Tujuan pembelajaran belum dikonfigurasi untuk mata pelajaran dan kelas ini",
                Some(json!({
                    "subjectId": subject_id,
                    "kelas": kelas,
                    "learningObjectiveId": objective_id
                })),
            )
        }
        Err(e) => return e.response(&req.id),
    }

    let student_kelas: Option<String> = match conn
        .query_row(
            "SELECT kelas FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(student_kelas) = student_kelas else {
        return err(&req.id, "not_found", "Siswa tidak ditemukan", None);
    };
    if student_kelas != kelas {
        return err(
            &req.id,
            "not_found",
            format!("Siswa tidak terdaftar di kelas {kelas}"),
            Some(json!({
                "studentId": student_id,
                "kelas": kelas,
                "studentKelas": student_kelas
            })),
        );
    }

    // The fresh id and created_at only land on first insert. A conflicting
    // row keeps both and takes the new nilai.
    let grade_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO grades(
           id,
           student_id,
           subject_id,
           kelas,
           learning_objective_id,
           nilai,
           created_at,
           updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'), strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
         ON CONFLICT(student_id, subject_id, kelas, learning_objective_id)
         DO UPDATE SET nilai = excluded.nilai, updated_at = excluded.updated_at",
        (
            &grade_id,
            &student_id,
            &subject_id,
            &kelas,
            &objective_id,
            nilai,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }

    let grade = match conn.query_row(
        "SELECT id, student_id, subject_id, kelas, learning_objective_id, nilai, created_at, updated_at
         FROM grades
         WHERE student_id = ? AND subject_id = ? AND kelas = ? AND learning_objective_id = ?",
        (&student_id, &subject_id, &kelas, &objective_id),
        grade_row_json,
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "grade": grade }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.objectives" => Some(handle_grades_objectives(state, req)),
        "grades.matrix" => Some(handle_grades_matrix(state, req)),
        "grades.upsert" => Some(handle_grades_upsert(state, req)),
        _ => None,
    }
}
