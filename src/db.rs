use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("nilai.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            nama TEXT NOT NULL,
            nis TEXT NOT NULL UNIQUE,
            kelas TEXT NOT NULL,
            jenis_kelamin TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'Aktif',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_kelas ON students(kelas)",
        [],
    )?;

    // Workspaces created before the status field exist without the column.
    ensure_students_status(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            nama_mata_pelajaran TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS learning_objectives(
            id TEXT PRIMARY KEY,
            tujuan_pembelajaran TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_class_configs(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            kelas TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(subject_id, kelas)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_class_configs_kelas ON subject_class_configs(kelas)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS config_objectives(
            config_id TEXT NOT NULL,
            learning_objective_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(config_id, learning_objective_id),
            FOREIGN KEY(config_id) REFERENCES subject_class_configs(id),
            FOREIGN KEY(learning_objective_id) REFERENCES learning_objectives(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_config_objectives_objective ON config_objectives(learning_objective_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            kelas TEXT NOT NULL,
            learning_objective_id TEXT NOT NULL,
            nilai REAL NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(learning_objective_id) REFERENCES learning_objectives(id),
            UNIQUE(student_id, subject_id, kelas, learning_objective_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_subject_kelas ON grades(subject_id, kelas)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_objective ON grades(learning_objective_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_students_status(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "status")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE students ADD COLUMN status TEXT NOT NULL DEFAULT 'Aktif'",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
