//! Schema migrations, tracked with `PRAGMA user_version`.

use crate::OpenError;
use rusqlite::Connection;

/// Applied in order; the schema version is the number of entries applied.
const MIGRATIONS: &[&str] = &[
    // v1: identities, reference embeddings, attendance
    r#"
    CREATE TABLE identities (
        id             TEXT PRIMARY KEY NOT NULL,
        name           TEXT NOT NULL,
        enrollment_seq INTEGER NOT NULL UNIQUE,
        created_at     TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE TABLE reference_embeddings (
        id            TEXT PRIMARY KEY NOT NULL,
        identity_id   TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
        position      INTEGER NOT NULL,
        image_path    TEXT,
        embedding     BLOB,
        model_version TEXT
    );
    CREATE INDEX idx_reference_embeddings_identity
        ON reference_embeddings(identity_id, position);

    CREATE TABLE attendance (
        identity_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
        date        TEXT NOT NULL,
        status      TEXT NOT NULL CHECK (status IN ('Present', 'Late', 'Absent')),
        check_in    TEXT,
        check_out   TEXT,
        note        TEXT,
        UNIQUE (identity_id, date),
        CHECK (status <> 'Absent' OR (check_in IS NULL AND check_out IS NULL))
    );
    CREATE INDEX idx_attendance_date ON attendance(date);
    "#,
];

pub(crate) fn latest_version() -> u32 {
    MIGRATIONS.len() as u32
}

pub(crate) fn run(conn: &mut Connection) -> Result<(), OpenError> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let supported = latest_version();
    if current > supported {
        return Err(OpenError::SchemaTooNew {
            found: current,
            supported,
        });
    }

    for (index, sql) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let version = index as u32 + 1;
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        tracing::info!(version, "applied schema migration");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(conn: &Connection) -> u32 {
        conn.pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_fresh_database_reaches_latest() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        assert_eq!(version(&conn), latest_version());

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('identities', 'reference_embeddings', 'attendance')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }

    #[test]
    fn test_rerun_is_noop() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap();
        assert_eq!(version(&conn), latest_version());
    }

    #[test]
    fn test_newer_schema_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 99u32).unwrap();
        assert!(matches!(
            run(&mut conn),
            Err(OpenError::SchemaTooNew { found: 99, .. })
        ));
    }

    #[test]
    fn test_absent_row_cannot_carry_times() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO identities (id, name, enrollment_seq) VALUES ('A', 'Alice', 1)",
            [],
        )
        .unwrap();
        let err = conn.execute(
            "INSERT INTO attendance (identity_id, date, status, check_in)
             VALUES ('A', '2024-01-10', 'Absent', '09:00:00')",
            [],
        );
        assert!(err.is_err());
    }
}
