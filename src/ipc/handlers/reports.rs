use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, normalize_upper, required_str};
use crate::ipc::types::{AppState, Request};
use crate::xlsx::{self, Cell};
use serde_json::json;
use std::path::PathBuf;

fn calc_err(req: &Request, e: calc::CalcError) -> serde_json::Value {
    err(
        &req.id,
        &e.code,
        e.message,
        e.details.map(|d| json!(d)).or(None),
    )
}

fn handle_reports_class_grades(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let kelas = match required_str(req, "kelas") {
        Ok(v) => normalize_upper(&v),
        Err(e) => return e,
    };

    match calc::compute_class_report(&calc::CalcContext { conn, kelas: &kelas }) {
        Ok(report) => ok(&req.id, json!({ "report": report })),
        Err(e) => calc_err(req, e),
    }
}

fn handle_reports_export_class_grades_xlsx(
    state: &mut AppState,
    req: &Request,
) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let kelas = match required_str(req, "kelas") {
        Ok(v) => normalize_upper(&v),
        Err(e) => return e,
    };
    let out_path = match required_str(req, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e,
    };

    let report = match calc::compute_class_report(&calc::CalcContext { conn, kelas: &kelas }) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    let mut rows: Vec<Vec<Cell>> = Vec::with_capacity(report.rows.len() + 1);
    let mut header: Vec<Cell> = vec![
        Cell::text("No"),
        Cell::text("Nama Siswa"),
        Cell::text("NIS"),
    ];
    for column in &report.columns {
        header.push(Cell::text(column.label.clone()));
    }
    header.push(Cell::text("Rata-rata"));
    header.push(Cell::text("Status"));
    rows.push(header);

    for (i, row) in report.rows.iter().enumerate() {
        let mut cells: Vec<Cell> = Vec::with_capacity(report.columns.len() + 5);
        cells.push(Cell::Number((i + 1) as f64));
        cells.push(Cell::text(row.student.nama.clone()));
        cells.push(Cell::text(row.student.nis.clone()));
        for grade in &row.grades {
            match grade.nilai {
                Some(v) => cells.push(Cell::Number(v)),
                None => cells.push(Cell::Empty),
            }
        }
        // An ungraded student gets a blank average, not a zero.
        if row.graded_count > 0 {
            cells.push(Cell::Number(row.average));
        } else {
            cells.push(Cell::Empty);
        }
        cells.push(Cell::text(calc::status_label(row.average, row.graded_count)));
        rows.push(cells);
    }

    if let Err(e) = xlsx::write_workbook(&out_path, &format!("Nilai {kelas}"), &rows) {
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
            "fileName": format!("nilai_kelas_{}.xlsx", kelas),
            "rowsExported": report.rows.len()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.classGrades" => Some(handle_reports_class_grades(state, req)),
        "reports.exportClassGradesXlsx" => {
            Some(handle_reports_export_class_grades_xlsx(state, req))
        }
        _ => None,
    }
}
