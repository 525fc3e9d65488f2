use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{required_str, title_case};
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

fn subject_row_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let nama: String = row.get(1)?;
    let created_at: String = row.get(2)?;
    let updated_at: String = row.get(3)?;
    Ok(json!({
        "id": id,
        "namaMataPelajaran": nama,
        "createdAt": created_at,
        "updatedAt": updated_at
    }))
}

fn objective_row_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let tujuan: String = row.get(1)?;
    let created_at: String = row.get(2)?;
    let updated_at: String = row.get(3)?;
    Ok(json!({
        "id": id,
        "tujuanPembelajaran": tujuan,
        "createdAt": created_at,
        "updatedAt": updated_at
    }))
}

fn fetch_subject(
    conn: &Connection,
    subject_id: &str,
) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        "SELECT id, nama_mata_pelajaran, created_at, updated_at FROM subjects WHERE id = ?",
        [subject_id],
        subject_row_json,
    )
    .optional()
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn fetch_objective(
    conn: &Connection,
    objective_id: &str,
) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        "SELECT id, tujuan_pembelajaran, created_at, updated_at
         FROM learning_objectives WHERE id = ?",
        [objective_id],
        objective_row_json,
    )
    .optional()
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn subject_name_taken(
    conn: &Connection,
    nama: &str,
    exclude_id: Option<&str>,
) -> Result<bool, HandlerErr> {
    let found = match exclude_id {
        Some(id) => conn
            .query_row(
                "SELECT 1 FROM subjects WHERE nama_mata_pelajaran = ? AND id != ?",
                (nama, id),
                |r| r.get::<_, i64>(0),
            )
            .optional(),
        None => conn
            .query_row(
                "SELECT 1 FROM subjects WHERE nama_mata_pelajaran = ?",
                [nama],
                |r| r.get::<_, i64>(0),
            )
            .optional(),
    };
    found.map(|v| v.is_some()).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, nama_mata_pelajaran, created_at, updated_at
         FROM subjects ORDER BY nama_mata_pelajaran",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], subject_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let nama = match required_str(req, "namaMataPelajaran") {
        Ok(v) => title_case(&v),
        Err(resp) => return resp,
    };
    if nama.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "Nama mata pelajaran tidak boleh kosong",
            None,
        );
    }

    match subject_name_taken(conn, &nama, None) {
        Ok(false) => {}
        Ok(true) => {
            return err(
                &req.id,
                "duplicate_key",
                format!("Mata pelajaran {nama} sudah ada"),
                Some(json!({ "namaMataPelajaran": nama })),
            )
        }
        Err(e) => return e.response(&req.id),
    }

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, nama_mata_pelajaran, created_at, updated_at)
         VALUES(?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'), strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))",
        (&subject_id, &nama),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    match fetch_subject(conn, &subject_id) {
        Ok(Some(subject)) => ok(&req.id, json!({ "subject": subject })),
        Ok(None) => err(&req.id, "not_found", "Mata pelajaran tidak ditemukan", None),
        Err(e) => e.response(&req.id),
    }
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let nama = match required_str(req, "namaMataPelajaran") {
        Ok(v) => title_case(&v),
        Err(resp) => return resp,
    };
    if nama.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "Nama mata pelajaran tidak boleh kosong",
            None,
        );
    }

    match subject_name_taken(conn, &nama, Some(&subject_id)) {
        Ok(false) => {}
        Ok(true) => {
            return err(
                &req.id,
                "duplicate_key",
                format!("Mata pelajaran {nama} sudah ada"),
                Some(json!({ "namaMataPelajaran": nama })),
            )
        }
        Err(e) => return e.response(&req.id),
    }

    let changed = match conn.execute(
        "UPDATE subjects
         SET nama_mata_pelajaran = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
         WHERE id = ?",
        (&nama, &subject_id),
    ) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "subjects" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "Mata pelajaran tidak ditemukan", None);
    }

    match fetch_subject(conn, &subject_id) {
        Ok(Some(subject)) => ok(&req.id, json!({ "subject": subject })),
        Ok(None) => err(&req.id, "not_found", "Mata pelajaran tidak ditemukan", None),
        Err(e) => e.response(&req.id),
    }
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute("DELETE FROM grades WHERE subject_id = ?", [&subject_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM config_objectives
         WHERE config_id IN (SELECT id FROM subject_class_configs WHERE subject_id = ?)",
        [&subject_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "config_objectives" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM subject_class_configs WHERE subject_id = ?",
        [&subject_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "subject_class_configs" })),
        );
    }

    let changed = match tx.execute("DELETE FROM subjects WHERE id = ?", [&subject_id]) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "subjects" })),
            );
        }
    };
    if changed == 0 {
        let _ = tx.rollback();
        return err(&req.id, "not_found", "Mata pelajaran tidak ditemukan", None);
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "ok": true, "message": "Mata pelajaran berhasil dihapus" }),
    )
}

fn handle_objectives_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, tujuan_pembelajaran, created_at, updated_at
         FROM learning_objectives ORDER BY tujuan_pembelajaran",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], objective_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(objectives) => ok(&req.id, json!({ "objectives": objectives })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_objectives_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let tujuan = match required_str(req, "tujuanPembelajaran") {
        Ok(v) => v.trim().to_string(),
        Err(resp) => return resp,
    };
    if tujuan.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "Tujuan pembelajaran tidak boleh kosong",
            None,
        );
    }

    let objective_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO learning_objectives(id, tujuan_pembelajaran, created_at, updated_at)
         VALUES(?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'), strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))",
        (&objective_id, &tujuan),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "learning_objectives" })),
        );
    }

    match fetch_objective(conn, &objective_id) {
        Ok(Some(objective)) => ok(&req.id, json!({ "objective": objective })),
        Ok(None) => err(
            &req.id,
            "not_found",
            "Tujuan pembelajaran tidak ditemukan",
            None,
        ),
        Err(e) => e.response(&req.id),
    }
}

fn handle_objectives_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let objective_id = match required_str(req, "objectiveId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let tujuan = match required_str(req, "tujuanPembelajaran") {
        Ok(v) => v.trim().to_string(),
        Err(resp) => return resp,
    };
    if tujuan.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "Tujuan pembelajaran tidak boleh kosong",
            None,
        );
    }

    let changed = match conn.execute(
        "UPDATE learning_objectives
         SET tujuan_pembelajaran = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
         WHERE id = ?",
        (&tujuan, &objective_id),
    ) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "learning_objectives" })),
            )
        }
    };
    if changed == 0 {
        return err(
            &req.id,
            "not_found",
            "Tujuan pembelajaran tidak ditemukan",
            None,
        );
    }

    match fetch_objective(conn, &objective_id) {
        Ok(Some(objective)) => ok(&req.id, json!({ "objective": objective })),
        Ok(None) => err(
            &req.id,
            "not_found",
            "Tujuan pembelajaran tidak ditemukan",
            None,
        ),
        Err(e) => e.response(&req.id),
    }
}

fn handle_objectives_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let objective_id = match required_str(req, "objectiveId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let placements: Vec<(String, i64)> = {
        let mut stmt = match tx.prepare(
            "SELECT config_id, sort_order FROM config_objectives WHERE learning_objective_id = ?",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        match stmt
            .query_map([&objective_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };

    if let Err(e) = tx.execute(
        "DELETE FROM grades WHERE learning_objective_id = ?",
        [&objective_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM config_objectives WHERE learning_objective_id = ?",
        [&objective_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "config_objectives" })),
        );
    }

    // Keep sort_order contiguous in every config that listed this objective.
    for (config_id, sort_order) in &placements {
        if let Err(e) = tx.execute(
            "UPDATE config_objectives
             SET sort_order = sort_order - 1
             WHERE config_id = ? AND sort_order > ?",
            (config_id, sort_order),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "config_objectives" })),
            );
        }
    }

    // A config with no objectives left serves no purpose.
    if let Err(e) = tx.execute(
        "DELETE FROM subject_class_configs
         WHERE id NOT IN (SELECT DISTINCT config_id FROM config_objectives)",
        [],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "subject_class_configs" })),
        );
    }

    let changed = match tx.execute(
        "DELETE FROM learning_objectives WHERE id = ?",
        [&objective_id],
    ) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "learning_objectives" })),
            );
        }
    };
    if changed == 0 {
        let _ = tx.rollback();
        return err(
            &req.id,
            "not_found",
            "Tujuan pembelajaran tidak ditemukan",
            None,
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "ok": true, "message": "Tujuan pembelajaran berhasil dihapus" }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        "objectives.list" => Some(handle_objectives_list(state, req)),
        "objectives.create" => Some(handle_objectives_create(state, req)),
        "objectives.update" => Some(handle_objectives_update(state, req)),
        "objectives.delete" => Some(handle_objectives_delete(state, req)),
        _ => None,
    }
}
