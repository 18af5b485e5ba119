use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "bulletin.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS school_years(
            id TEXT PRIMARY KEY,
            label TEXT NOT NULL UNIQUE,
            start_date TEXT,
            end_date TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS periods(
            id TEXT PRIMARY KEY,
            school_year_id TEXT NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('term', 'semester')),
            start_date TEXT,
            end_date TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 0,
            validated INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(school_year_id) REFERENCES school_years(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_periods_year ON periods(school_year_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            email TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            school_year_id TEXT NOT NULL,
            name TEXT NOT NULL,
            level TEXT,
            head_teacher_id TEXT,
            FOREIGN KEY(school_year_id) REFERENCES school_years(id),
            FOREIGN KEY(head_teacher_id) REFERENCES teachers(id),
            UNIQUE(school_year_id, name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            short_code TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_subjects(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            teacher_id TEXT,
            coefficient REAL NOT NULL CHECK(coefficient > 0),
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            UNIQUE(class_id, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_subjects_class ON class_subjects(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            student_no TEXT,
            birth_date TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_entries(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_subject_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            value REAL NOT NULL,
            coefficient INTEGER NOT NULL CHECK(coefficient >= 0),
            kind TEXT NOT NULL CHECK(kind IN ('normal', 'quiz', 'exam', 'homework')),
            appreciation TEXT,
            validated INTEGER NOT NULL DEFAULT 0,
            recorded_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_subject_id) REFERENCES class_subjects(id),
            FOREIGN KEY(period_id) REFERENCES periods(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_entries_student ON grade_entries(student_id, period_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_entries_subject ON grade_entries(class_subject_id, period_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS report_cards(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            overall_average REAL NOT NULL,
            class_rank INTEGER,
            class_size INTEGER NOT NULL DEFAULT 0,
            general_appreciation TEXT,
            generated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(period_id) REFERENCES periods(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(student_id, period_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_report_cards_class ON report_cards(class_id, period_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    create_period_lock_triggers(&conn)?;

    // Existing workspaces may predate these columns. Add them if needed.
    ensure_students_updated_at(&conn)?;
    ensure_grade_entries_appreciation(&conn)?;

    Ok(conn)
}

// Entries in a validated period are frozen by the storage layer itself, not
// only by handler checks. The UPDATE trigger looks at both sides so an entry
// cannot be moved into or out of a validated period either.
fn create_period_lock_triggers(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "CREATE TRIGGER IF NOT EXISTS trg_grade_entries_insert_locked
         BEFORE INSERT ON grade_entries
         WHEN (SELECT validated FROM periods WHERE id = NEW.period_id) = 1
         BEGIN
             SELECT RAISE(ABORT, 'period is validated');
         END;

         CREATE TRIGGER IF NOT EXISTS trg_grade_entries_update_locked
         BEFORE UPDATE ON grade_entries
         WHEN (SELECT validated FROM periods WHERE id = OLD.period_id) = 1
            OR (SELECT validated FROM periods WHERE id = NEW.period_id) = 1
         BEGIN
             SELECT RAISE(ABORT, 'period is validated');
         END;

         CREATE TRIGGER IF NOT EXISTS trg_grade_entries_delete_locked
         BEFORE DELETE ON grade_entries
         WHEN (SELECT validated FROM periods WHERE id = OLD.period_id) = 1
         BEGIN
             SELECT RAISE(ABORT, 'period is validated');
         END;",
    )?;
    Ok(())
}

fn ensure_students_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "students", "updated_at")? {
        conn.execute("ALTER TABLE students ADD COLUMN updated_at TEXT", [])?;
    }
    Ok(())
}

fn ensure_grade_entries_appreciation(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "grade_entries", "appreciation")? {
        conn.execute("ALTER TABLE grade_entries ADD COLUMN appreciation TEXT", [])?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name.eq_ignore_ascii_case(column) {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, text),
    )?;
    Ok(())
}
