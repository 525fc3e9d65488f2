use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;

/// Presentation rounding used everywhere a mean is reported:
/// half-up to 2 decimals.
pub fn round2(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Predikat for a numeric average. Boundaries are inclusive on the
/// upper bucket, so exactly 85 is "Sangat Baik".
pub fn grade_bucket(average: f64) -> &'static str {
    if average >= 85.0 {
        "Sangat Baik"
    } else if average >= 70.0 {
        "Baik"
    } else if average >= 60.0 {
        "Cukup"
    } else {
        "Perlu Perbaikan"
    }
}

/// Status shown for a report row. A student without any recorded grade
/// is never bucketed; a real average of 0 is.
pub fn status_label(average: f64, graded_count: i64) -> &'static str {
    if graded_count == 0 {
        "Belum Ada Nilai"
    } else {
        grade_bucket(average)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub kelas: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRef {
    pub id: String,
    pub nama: String,
    pub nis: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportColumn {
    pub subject_id: String,
    pub subject: String,
    pub learning_objective_id: String,
    pub objective: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCell {
    pub subject_id: String,
    pub subject: String,
    pub learning_objective_id: String,
    pub objective: String,
    pub nilai: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRow {
    pub student: StudentRef,
    pub grades: Vec<ReportCell>,
    pub average: f64,
    pub graded_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStatistics {
    pub class_average: f64,
    pub highest: f64,
    pub lowest: f64,
    pub total_students: usize,
    pub students_with_grades: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassReport {
    pub kelas: String,
    pub columns: Vec<ReportColumn>,
    pub rows: Vec<ReportRow>,
    pub statistics: Option<ClassStatistics>,
}

/// Wide per-class report: one row per student, one column per
/// configured (subject, objective) pair. Recomputed from the
/// normalized tables on every call.
pub fn compute_class_report(ctx: &CalcContext<'_>) -> Result<ClassReport, CalcError> {
    let conn = ctx.conn;
    let kelas = ctx.kelas;

    // Configurations in creation order; one per subject for this kelas.
    let mut config_stmt = conn
        .prepare(
            "SELECT c.id, c.subject_id, s.nama_mata_pelajaran
             FROM subject_class_configs c
             JOIN subjects s ON s.id = c.subject_id
             WHERE c.kelas = ?
             ORDER BY c.rowid",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let configs: Vec<(String, String, String)> = config_stmt
        .query_map([kelas], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let mut columns: Vec<ReportColumn> = Vec::new();
    let mut objectives_stmt = conn
        .prepare(
            "SELECT o.id, o.tujuan_pembelajaran
             FROM config_objectives co
             JOIN learning_objectives o ON o.id = co.learning_objective_id
             WHERE co.config_id = ?
             ORDER BY co.sort_order",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    for (config_id, subject_id, subject) in &configs {
        let objectives: Vec<(String, String)> = objectives_stmt
            .query_map([config_id], |r| Ok((r.get(0)?, r.get(1)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
        for (objective_id, objective) in objectives {
            columns.push(ReportColumn {
                subject_id: subject_id.clone(),
                subject: subject.clone(),
                learning_objective_id: objective_id,
                label: format!("{} - {}", subject, objective),
                objective,
            });
        }
    }

    // Every student of the kelas appears, whatever their status.
    let mut students_stmt = conn
        .prepare(
            "SELECT id, nama, nis, status
             FROM students
             WHERE kelas = ?
             ORDER BY nama, nis",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let students: Vec<StudentRef> = students_stmt
        .query_map([kelas], |r| {
            Ok(StudentRef {
                id: r.get(0)?,
                nama: r.get(1)?,
                nis: r.get(2)?,
                status: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let mut grade_by_key: HashMap<(String, String, String), f64> = HashMap::new();
    let mut grades_stmt = conn
        .prepare(
            "SELECT student_id, subject_id, learning_objective_id, nilai
             FROM grades
             WHERE kelas = ?",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let grade_rows = grades_stmt
        .query_map([kelas], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, f64>(3)?,
            ))
        })
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    for row in grade_rows {
        let (student_id, subject_id, objective_id, nilai) =
            row.map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
        grade_by_key.insert((student_id, subject_id, objective_id), nilai);
    }

    let mut rows: Vec<ReportRow> = Vec::with_capacity(students.len());
    for student in students {
        let mut cells: Vec<ReportCell> = Vec::with_capacity(columns.len());
        let mut sum = 0.0_f64;
        let mut graded_count = 0_i64;
        for col in &columns {
            let nilai = grade_by_key
                .get(&(
                    student.id.clone(),
                    col.subject_id.clone(),
                    col.learning_objective_id.clone(),
                ))
                .copied();
            if let Some(v) = nilai {
                sum += v;
                graded_count += 1;
            }
            cells.push(ReportCell {
                subject_id: col.subject_id.clone(),
                subject: col.subject.clone(),
                learning_objective_id: col.learning_objective_id.clone(),
                objective: col.objective.clone(),
                nilai,
            });
        }
        // Average over present grades only; 0 is presentation for an
        // ungraded row, with graded_count keeping the distinction.
        let average = if graded_count > 0 {
            round2(sum / (graded_count as f64))
        } else {
            0.0
        };
        rows.push(ReportRow {
            student,
            grades: cells,
            average,
            graded_count,
        });
    }

    let statistics = compute_class_statistics(&rows);

    Ok(ClassReport {
        kelas: kelas.to_string(),
        columns,
        rows,
        statistics,
    })
}

/// Class statistics over students that have at least one recorded
/// grade. A student whose recorded scores are all zero still counts;
/// a student with no grades at all does not.
pub fn compute_class_statistics(rows: &[ReportRow]) -> Option<ClassStatistics> {
    let averages: Vec<f64> = rows
        .iter()
        .filter(|r| r.graded_count > 0)
        .map(|r| r.average)
        .collect();
    if averages.is_empty() {
        return None;
    }

    let mut highest = averages[0];
    let mut lowest = averages[0];
    let mut sum = 0.0_f64;
    for v in &averages {
        if *v > highest {
            highest = *v;
        }
        if *v < lowest {
            lowest = *v;
        }
        sum += *v;
    }

    Some(ClassStatistics {
        class_average: round2(sum / (averages.len() as f64)),
        highest,
        lowest,
        total_students: rows.len(),
        students_with_grades: averages.len(),
    })
}
