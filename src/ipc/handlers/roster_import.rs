use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    canonical_jenis_kelamin, canonical_status, normalize_upper, required_str, title_case, valid_nis,
};
use crate::ipc::types::{AppState, Request};
use crate::xlsx::{self, Cell};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::PathBuf;
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

fn nis_exists(conn: &Connection, nis: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE nis = ?", [nis], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn handle_write_import_template(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match required_str(req, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(resp) => return resp,
    };

    let header = vec![
        Cell::text("nama"),
        Cell::text("nis"),
        Cell::text("kelas"),
        Cell::text("jenis_kelamin"),
        Cell::text("status"),
    ];
    if let Err(e) = xlsx::write_workbook(&out_path, "Data Siswa", &[header]) {
        return err(
            &req.id,
            "io_failed",
            format!("{e:#}"),
            Some(json!({ "outPath": out_path.to_string_lossy() })),
        );
    }

    ok(
        &req.id,
        json!({
            "path": out_path.to_string_lossy(),
            "fileName": "template_data_siswa.xlsx"
        }),
    )
}

fn handle_import_roster(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let in_path = match required_str(req, "inPath") {
        Ok(v) => PathBuf::from(v),
        Err(resp) => return resp,
    };

    let rows = match xlsx::read_workbook_strings(&in_path) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                format!("{e:#}"),
                Some(json!({ "inPath": in_path.to_string_lossy() })),
            )
        }
    };

    // Column positions come from the header row, matched by name so a
    // reordered template still imports.
    let header: &[String] = rows.first().map(|r| r.as_slice()).unwrap_or(&[]);
    let col_index =
        |name: &str| -> Option<usize> { header.iter().position(|h| h.trim().eq_ignore_ascii_case(name)) };
    let status_col = col_index("status");
    let (nama_col, nis_col, kelas_col, jk_col) = match (
        col_index("nama"),
        col_index("nis"),
        col_index("kelas"),
        col_index("jenis_kelamin"),
    ) {
        (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
        (nama, nis, kelas, jk) => {
            let mut missing: Vec<&str> = Vec::new();
            if nama.is_none() {
                missing.push("nama");
            }
            if nis.is_none() {
                missing.push("nis");
            }
            if kelas.is_none() {
                missing.push("kelas");
            }
            if jk.is_none() {
                missing.push("jenis_kelamin");
            }
            return err(
                &req.id,
                "bad_params",
                format!("File tidak memiliki kolom wajib: {}", missing.join(", ")),
                None,
            );
        }
    };

    let mut imported = 0usize;
    let mut duplicates = 0usize;
    let mut errors: Vec<String> = Vec::new();

    for (i, row) in rows.iter().enumerate().skip(1) {
        // Sheet row number as the user sees it in a spreadsheet.
        let baris = i + 1;
        if row.iter().all(|c| c.trim().is_empty()) {
            continue;
        }

        let cell = |col: usize| -> &str { row.get(col).map(|s| s.as_str()).unwrap_or("") };
        let nama = title_case(cell(nama_col));
        if nama.is_empty() {
            errors.push(format!("Baris {baris}: Nama tidak boleh kosong"));
            continue;
        }
        let nis = normalize_upper(cell(nis_col));
        if nis.is_empty() {
            errors.push(format!("Baris {baris}: NIS tidak boleh kosong"));
            continue;
        }
        if !valid_nis(&nis) {
            errors.push(format!("Baris {baris}: NIS tidak valid"));
            continue;
        }
        let kelas = normalize_upper(cell(kelas_col));
        if kelas.is_empty() {
            errors.push(format!("Baris {baris}: Kelas tidak boleh kosong"));
            continue;
        }
        let Some(jenis_kelamin) = canonical_jenis_kelamin(cell(jk_col)) else {
            errors.push(format!(
                "Baris {baris}: Jenis kelamin harus Laki-laki atau Perempuan"
            ));
            continue;
        };
        let status_raw = match status_col {
            Some(c) => cell(c),
            None => "",
        };
        let status = if status_raw.trim().is_empty() {
            "Aktif"
        } else {
            match canonical_status(status_raw) {
                Some(s) => s,
                None => {
                    errors.push(format!("Baris {baris}: Status harus Aktif atau Tidak Aktif"));
                    continue;
                }
            }
        };

        // Rows are inserted one at a time on this connection, so a single
        // lookup also catches a NIS repeated earlier in the same file.
        match nis_exists(conn, &nis) {
            Ok(false) => {}
            Ok(true) => {
                duplicates += 1;
                continue;
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
        imported += 1;
    }

    tracing::info!(
        imported,
        duplicates,
        errors = errors.len(),
        "roster import finished"
    );

    ok(
        &req.id,
        json!({
            "importedCount": imported,
            "duplicateCount": duplicates,
            "errorCount": errors.len(),
            "errors": errors
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.importRoster" => Some(handle_import_roster(state, req)),
        "students.writeImportTemplate" => Some(handle_write_import_template(state, req)),
        _ => None,
    }
}
