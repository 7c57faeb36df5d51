//! Versioned schema for the state store.
//!
//! Each SQL file is embedded with `include_str!` and applied once, inside a
//! transaction. The applied version lives in SQLite's `user_version` header
//! field, so no bookkeeping table is needed.

use rusqlite::Connection;

const MIGRATIONS: &[(i32, &str)] = &[(1, include_str!("migrations/001_baseline.sql"))];

fn schema_version(conn: &Connection) -> Result<i32, String> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| format!("Failed to read schema version: {}", e))
}

/// Bring the schema up to date. Returns how many migrations ran.
///
/// A database written by a newer build is refused.
pub fn run_migrations(conn: &Connection) -> Result<usize, String> {
    let current = schema_version(conn)?;
    let latest = MIGRATIONS.last().map_or(0, |(version, _)| *version);
    if current > latest {
        return Err(format!(
            "Database schema version ({}) is newer than this build of response-tracker supports ({}). \
             Please upgrade response-tracker.",
            current, latest
        ));
    }

    let mut applied = 0;
    for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| format!("Migration v{} could not start: {}", version, e))?;
        tx.execute_batch(sql)
            .map_err(|e| format!("Migration v{} failed: {}", version, e))?;
        tx.pragma_update(None, "user_version", version)
            .map_err(|e| format!("Failed to record migration v{}: {}", version, e))?;
        tx.commit()
            .map_err(|e| format!("Migration v{} could not commit: {}", version, e))?;
        log::info!("migrations: applied v{}", version);
        applied += 1;
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_db() -> Connection {
        Connection::open_in_memory().expect("in-memory db")
    }

    #[test]
    fn test_fresh_db_applies_baseline() {
        let conn = mem_db();
        assert_eq!(run_migrations(&conn).expect("migrations should succeed"), 1);
        assert_eq!(schema_version(&conn).unwrap(), 1);

        conn.execute("INSERT INTO kv_store (key, value) VALUES ('k', '{}')", [])
            .expect("kv_store should exist with a defaulted updated_at");
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let conn = mem_db();
        assert_eq!(run_migrations(&conn).unwrap(), 1);
        assert_eq!(run_migrations(&conn).unwrap(), 0);
        assert_eq!(schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let conn = mem_db();
        conn.pragma_update(None, "user_version", 999).unwrap();

        let err = run_migrations(&conn).unwrap_err();
        assert!(err.contains("newer than this build"), "unexpected: {}", err);
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'kv_store'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 0);
    }
}
