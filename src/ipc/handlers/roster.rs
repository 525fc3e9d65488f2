use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    canonical_jenis_kelamin, canonical_status, normalize_upper, optional_str, required_str,
    title_case, valid_nis,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
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

fn student_row_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let nama: String = row.get(1)?;
    let nis: String = row.get(2)?;
    let kelas: String = row.get(3)?;
    let jenis_kelamin: String = row.get(4)?;
    let status: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(json!({
        "id": id,
        "nama": nama,
        "nis": nis,
        "kelas": kelas,
        "jenisKelamin": jenis_kelamin,
        "status": status,
        "createdAt": created_at,
        "updatedAt": updated_at
    }))
}

fn fetch_student(
    conn: &Connection,
    student_id: &str,
) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        "SELECT id, nama, nis, kelas, jenis_kelamin, status, created_at, updated_at
         FROM students WHERE id = ?",
        [student_id],
        student_row_json,
    )
    .optional()
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn nis_taken(conn: &Connection, nis: &str, exclude_id: Option<&str>) -> Result<bool, HandlerErr> {
    let found = match exclude_id {
        Some(id) => conn
            .query_row(
                "SELECT 1 FROM students WHERE nis = ? AND id != ?",
                (nis, id),
                |r| r.get::<_, i64>(0),
            )
            .optional(),
        None => conn
            .query_row("SELECT 1 FROM students WHERE nis = ?", [nis], |r| {
                r.get::<_, i64>(0)
            })
            .optional(),
    };
    found.map(|v| v.is_some()).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut sql = String::from(
        "SELECT id, nama, nis, kelas, jenis_kelamin, status, created_at, updated_at FROM students",
    );
    let mut where_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(search) = optional_str(req, "search") {
        let pattern = format!("%{}%", search.trim().to_lowercase());
        where_parts.push("(LOWER(nama) LIKE ? OR LOWER(nis) LIKE ?)".into());
        bind_values.push(Value::Text(pattern.clone()));
        bind_values.push(Value::Text(pattern));
    }
    if let Some(kelas) = optional_str(req, "kelas") {
        where_parts.push("kelas = ?".into());
        bind_values.push(Value::Text(normalize_upper(&kelas)));
    }
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }
    sql.push_str(" ORDER BY nama, nis");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(bind_values), student_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let nama = match required_str(req, "nama") {
        Ok(v) => title_case(&v),
        Err(resp) => return resp,
    };
    let nis = match required_str(req, "nis") {
        Ok(v) => normalize_upper(&v),
        Err(resp) => return resp,
    };
    let kelas = match required_str(req, "kelas") {
        Ok(v) => normalize_upper(&v),
        Err(resp) => return resp,
    };
    let jenis_kelamin_raw = match required_str(req, "jenisKelamin") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let status_raw = optional_str(req, "status").unwrap_or_else(|| "Aktif".to_string());

    if nama.is_empty() {
        return err(&req.id, "bad_params", "Nama tidak boleh kosong", None);
    }
    if !valid_nis(&nis) {
        return err(&req.id, "bad_params", "NIS tidak valid", None);
    }
    if kelas.is_empty() {
        return err(&req.id, "bad_params", "Kelas tidak boleh kosong", None);
    }
    let Some(jenis_kelamin) = canonical_jenis_kelamin(&jenis_kelamin_raw) else {
        return err(
            &req.id,
            "bad_params",
            "Jenis kelamin harus Laki-laki atau Perempuan",
            None,
        );
    };
    let Some(status) = canonical_status(&status_raw) else {
        return err(
            &req.id,
            "bad_params",
            "Status harus Aktif atau Tidak Aktif",
            None,
        );
    };

    match nis_taken(conn, &nis, None) {
        Ok(false) => {}
        Ok(true) => {
            return err(
                &req.id,
                "duplicate_key",
                format!("Siswa dengan NIS {nis} sudah ada"),
                Some(json!({ "nis": nis })),
            )
        }
        Err(e) => return e.response(&req.id),
    }

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, nama, nis, kelas, jenis_kelamin, status, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'), strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))",
        (&student_id, &nama, &nis, &kelas, jenis_kelamin, status),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    match fetch_student(conn, &student_id) {
        Ok(Some(student)) => ok(&req.id, json!({ "student": student })),
        Ok(None) => err(&req.id, "not_found", "Siswa tidak ditemukan", None),
        Err(e) => e.response(&req.id),
    }
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(v) = patch.get("nama") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.nama must be a string", None);
        };
        let nama = title_case(s);
        if nama.is_empty() {
            return err(&req.id, "bad_params", "Nama tidak boleh kosong", None);
        }
        set_parts.push("nama = ?".into());
        bind_values.push(Value::Text(nama));
    }
    if let Some(v) = patch.get("nis") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.nis must be a string", None);
        };
        let nis = normalize_upper(s);
        if !valid_nis(&nis) {
            return err(&req.id, "bad_params", "NIS tidak valid", None);
        }
        match nis_taken(conn, &nis, Some(&student_id)) {
            Ok(false) => {}
            Ok(true) => {
                return err(
                    &req.id,
                    "duplicate_key",
                    format!("Siswa dengan NIS {nis} sudah ada"),
                    Some(json!({ "nis": nis })),
                )
            }
            Err(e) => return e.response(&req.id),
        }
        set_parts.push("nis = ?".into());
        bind_values.push(Value::Text(nis));
    }
    if let Some(v) = patch.get("kelas") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.kelas must be a string", None);
        };
        let kelas = normalize_upper(s);
        if kelas.is_empty() {
            return err(&req.id, "bad_params", "Kelas tidak boleh kosong", None);
        }
        set_parts.push("kelas = ?".into());
        bind_values.push(Value::Text(kelas));
    }
    if let Some(v) = patch.get("jenisKelamin") {
        let Some(s) = v.as_str() else {
            return err(
                &req.id,
                "bad_params",
                "patch.jenisKelamin must be a string",
                None,
            );
        };
        let Some(jenis_kelamin) = canonical_jenis_kelamin(s) else {
            return err(
                &req.id,
                "bad_params",
                "Jenis kelamin harus Laki-laki atau Perempuan",
                None,
            );
        };
        set_parts.push("jenis_kelamin = ?".into());
        bind_values.push(Value::Text(jenis_kelamin.to_string()));
    }
    if let Some(v) = patch.get("status") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.status must be a string", None);
        };
        let Some(status) = canonical_status(s) else {
            return err(
                &req.id,
                "bad_params",
                "Status harus Aktif atau Tidak Aktif",
                None,
            );
        };
        set_parts.push("status = ?".into());
        bind_values.push(Value::Text(status.to_string()));
    }

    if set_parts.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "patch must include at least one field",
            None,
        );
    }
    set_parts.push("updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')".into());

    let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(student_id.clone()));

    let changed = match conn.execute(&sql, params_from_iter(bind_values)) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "Siswa tidak ditemukan", None);
    }

    match fetch_student(conn, &student_id) {
        Ok(Some(student)) => ok(&req.id, json!({ "student": student })),
        Ok(None) => err(&req.id, "not_found", "Siswa tidak ditemukan", None),
        Err(e) => e.response(&req.id),
    }
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute("DELETE FROM grades WHERE student_id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }

    let changed = match tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            );
        }
    };
    if changed == 0 {
        let _ = tx.rollback();
        return err(&req.id, "not_found", "Siswa tidak ditemukan", None);
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "ok": true, "message": "Siswa berhasil dihapus" }),
    )
}

fn handle_students_delete_all(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute("DELETE FROM grades", []) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }

    let deleted = match tx.execute("DELETE FROM students", []) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            );
        }
    };

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "ok": true,
            "deletedCount": deleted,
            "message": "Semua data siswa berhasil dihapus"
        }),
    )
}

fn handle_students_classes(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare("SELECT DISTINCT kelas FROM students ORDER BY kelas") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        "students.deleteAll" => Some(handle_students_delete_all(state, req)),
        "students.classes" => Some(handle_students_classes(state, req)),
        _ => None,
    }
}
