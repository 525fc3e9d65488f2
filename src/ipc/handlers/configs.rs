use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{normalize_upper, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
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

fn subject_exists(conn: &Connection, subject_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
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

/// First id in `objective_ids` that does not exist, if any.
fn missing_objective_id(
    conn: &Connection,
    objective_ids: &[String],
) -> Result<Option<String>, HandlerErr> {
    let placeholders = vec!["?"; objective_ids.len()].join(", ");
    let sql = format!("SELECT id FROM learning_objectives WHERE id IN ({placeholders})");
    let binds: Vec<Value> = objective_ids
        .iter()
        .map(|s| Value::Text(s.clone()))
        .collect();

    let mut stmt = conn.prepare(&sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let found: Vec<String> = stmt
        .query_map(params_from_iter(binds), |row| row.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let found_set: HashSet<&str> = found.iter().map(|s| s.as_str()).collect();
    Ok(objective_ids
        .iter()
        .find(|id| !found_set.contains(id.as_str()))
        .cloned())
}

fn config_exists(conn: &Connection, config_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM subject_class_configs WHERE id = ?",
        [config_id],
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

fn pair_taken(
    conn: &Connection,
    subject_id: &str,
    kelas: &str,
    exclude_id: Option<&str>,
) -> Result<bool, HandlerErr> {
    let found = match exclude_id {
        Some(id) => conn
            .query_row(
                "SELECT 1 FROM subject_class_configs WHERE subject_id = ? AND kelas = ? AND id != ?",
                (subject_id, kelas, id),
                |r| r.get::<_, i64>(0),
            )
            .optional(),
        None => conn
            .query_row(
                "SELECT 1 FROM subject_class_configs WHERE subject_id = ? AND kelas = ?",
                (subject_id, kelas),
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

fn config_objectives_json(
    conn: &Connection,
    config_id: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT o.id, o.tujuan_pembelajaran
             FROM config_objectives co
             JOIN learning_objectives o ON o.id = co.learning_objective_id
             WHERE co.config_id = ?
             ORDER BY co.sort_order",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    stmt.query_map([config_id], |row| {
        let id: String = row.get(0)?;
        let tujuan: String = row.get(1)?;
        Ok(json!({ "id": id, "tujuanPembelajaran": tujuan }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn fetch_config(
    conn: &Connection,
    config_id: &str,
) -> Result<Option<serde_json::Value>, HandlerErr> {
    let head = conn
        .query_row(
            "SELECT c.id, c.kelas, c.created_at, c.updated_at, s.id, s.nama_mata_pelajaran
             FROM subject_class_configs c
             JOIN subjects s ON s.id = c.subject_id
             WHERE c.id = ?",
            [config_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some((id, kelas, created_at, updated_at, subject_id, subject_name)) = head else {
        return Ok(None);
    };

    let objectives = config_objectives_json(conn, &id)?;
    Ok(Some(json!({
        "id": id,
        "subject": { "id": subject_id, "namaMataPelajaran": subject_name },
        "kelas": kelas,
        "learningObjectives": objectives,
        "createdAt": created_at,
        "updatedAt": updated_at
    })))
}

/// Pulls subjectId, kelas, and learningObjectiveIds out of the params and
/// validates the lot. Returns an error response on the first violation.
fn config_inputs(
    conn: &Connection,
    req: &Request,
) -> Result<(String, String, Vec<String>), serde_json::Value> {
    let subject_id = required_str(req, "subjectId")?;
    let kelas = normalize_upper(&required_str(req, "kelas")?);
    if kelas.is_empty() {
        return Err(err(&req.id, "bad_params", "Kelas tidak boleh kosong", None));
    }

    let Some(arr) = req
        .params
        .get("learningObjectiveIds")
        .and_then(|v| v.as_array())
    else {
        return Err(err(
            &req.id,
            "bad_params",
            "missing/invalid learningObjectiveIds",
            None,
        ));
    };
    let mut objective_ids: Vec<String> = Vec::with_capacity(arr.len());
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(err(
                &req.id,
                "bad_params",
                "learningObjectiveIds must be strings",
                None,
            ));
        };
        objective_ids.push(s.to_string());
    }
    if objective_ids.is_empty() {
        return Err(err(
            &req.id,
            "bad_params",
            "Pilih minimal satu tujuan pembelajaran",
            None,
        ));
    }
    let mut seen: HashSet<String> = HashSet::new();
    for oid in &objective_ids {
        if !seen.insert(oid.clone()) {
            return Err(err(
                &req.id,
                "bad_params",
                "learningObjectiveIds contains duplicates",
                Some(json!({ "learningObjectiveId": oid })),
            ));
        }
    }

    match subject_exists(conn, &subject_id) {
        Ok(true) => {}
        Ok(false) => {
            return Err(err(
                &req.id,
                "not_found",
                "Mata pelajaran tidak ditemukan",
                None,
            ))
        }
        Err(e) => return Err(e.response(&req.id)),
    }
    match missing_objective_id(conn, &objective_ids) {
        Ok(None) => {}
        Ok(Some(missing)) => {
            return Err(err(
                &req.id,
                "not_found",
                "Tujuan pembelajaran tidak ditemukan",
                Some(json!({ "learningObjectiveId": missing })),
            ))
        }
        Err(e) => return Err(e.response(&req.id)),
    }

    Ok((subject_id, kelas, objective_ids))
}

fn handle_configs_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT c.id, c.kelas, c.created_at, c.updated_at, s.id, s.nama_mata_pelajaran
         FROM subject_class_configs c
         JOIN subjects s ON s.id = c.subject_id
         ORDER BY c.rowid",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let heads: Vec<(String, String, String, String, String, String)> = match stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut configs: Vec<serde_json::Value> = Vec::with_capacity(heads.len());
    for (id, kelas, created_at, updated_at, subject_id, subject_name) in heads {
        let objectives = match config_objectives_json(conn, &id) {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        };
        configs.push(json!({
            "id": id,
            "subject": { "id": subject_id, "namaMataPelajaran": subject_name },
            "kelas": kelas,
            "learningObjectives": objectives,
            "createdAt": created_at,
            "updatedAt": updated_at
        }));
    }

    ok(&req.id, json!({ "configs": configs }))
}

fn handle_configs_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let (subject_id, kelas, objective_ids) = match config_inputs(conn, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match pair_taken(conn, &subject_id, &kelas, None) {
        Ok(false) => {}
        Ok(true) => {
            return err(
                &req.id,
                "duplicate_key",
                "Konfigurasi mata pelajaran untuk kelas ini sudah ada",
                Some(json!({ "subjectId": subject_id, "kelas": kelas })),
            )
        }
        Err(e) => return e.response(&req.id),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let config_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO subject_class_configs(id, subject_id, kelas, created_at, updated_at)
         VALUES(?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'), strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))",
        (&config_id, &subject_id, &kelas),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subject_class_configs" })),
        );
    }
    for (i, oid) in objective_ids.iter().enumerate() {
        if let Err(e) = tx.execute(
            "INSERT INTO config_objectives(config_id, learning_objective_id, sort_order)
             VALUES(?, ?, ?)",
            (&config_id, oid, i as i64),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "config_objectives" })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    match fetch_config(conn, &config_id) {
        Ok(Some(config)) => ok(&req.id, json!({ "config": config })),
        Ok(None) => err(&req.id, "not_found", "Konfigurasi tidak ditemukan", None),
        Err(e) => e.response(&req.id),
    }
}

fn handle_configs_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let config_id = match required_str(req, "configId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let (subject_id, kelas, objective_ids) = match config_inputs(conn, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // A missing id is reported before any pair collision with other configs.
    match config_exists(conn, &config_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "Konfigurasi tidak ditemukan", None),
        Err(e) => return e.response(&req.id),
    }

    match pair_taken(conn, &subject_id, &kelas, Some(&config_id)) {
        Ok(false) => {}
        Ok(true) => {
            return err(
                &req.id,
                "duplicate_key",
                "Konfigurasi mata pelajaran untuk kelas ini sudah ada",
                Some(json!({ "subjectId": subject_id, "kelas": kelas })),
            )
        }
        Err(e) => return e.response(&req.id),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let changed = match tx.execute(
        "UPDATE subject_class_configs
         SET subject_id = ?, kelas = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
         WHERE id = ?",
        (&subject_id, &kelas, &config_id),
    ) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "subject_class_configs" })),
            );
        }
    };
    if changed == 0 {
        let _ = tx.rollback();
        return err(&req.id, "not_found", "Konfigurasi tidak ditemukan", None);
    }

    if let Err(e) = tx.execute(
        "DELETE FROM config_objectives WHERE config_id = ?",
        [&config_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "config_objectives" })),
        );
    }
    for (i, oid) in objective_ids.iter().enumerate() {
        if let Err(e) = tx.execute(
            "INSERT INTO config_objectives(config_id, learning_objective_id, sort_order)
             VALUES(?, ?, ?)",
            (&config_id, oid, i as i64),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "config_objectives" })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    match fetch_config(conn, &config_id) {
        Ok(Some(config)) => ok(&req.id, json!({ "config": config })),
        Ok(None) => err(&req.id, "not_found", "Konfigurasi tidak ditemukan", None),
        Err(e) => e.response(&req.id),
    }
}

fn handle_configs_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let config_id = match required_str(req, "configId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "DELETE FROM config_objectives WHERE config_id = ?",
        [&config_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "config_objectives" })),
        );
    }

    // Grades stay put. They are recorded facts and reappear in the matrix
    // if the same subject and class pairing is configured again.
    let changed = match tx.execute(
        "DELETE FROM subject_class_configs WHERE id = ?",
        [&config_id],
    ) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "subject_class_configs" })),
            );
        }
    };
    if changed == 0 {
        let _ = tx.rollback();
        return err(&req.id, "not_found", "Konfigurasi tidak ditemukan", None);
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "ok": true, "message": "Konfigurasi berhasil dihapus" }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "configs.list" => Some(handle_configs_list(state, req)),
        "configs.create" => Some(handle_configs_create(state, req)),
        "configs.update" => Some(handle_configs_update(state, req)),
        "configs.delete" => Some(handle_configs_delete(state, req)),
        _ => None,
    }
}
