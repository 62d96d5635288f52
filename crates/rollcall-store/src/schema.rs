use rusqlite::Connection;
use std::collections::HashSet;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS faces (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    gender TEXT DEFAULT '',
    position TEXT DEFAULT '',
    department TEXT DEFAULT '',
    person_type TEXT DEFAULT '',
    entry_date TEXT DEFAULT '',
    feature_vector BLOB NOT NULL,
    face_image BLOB,
    create_time TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#;

/// Columns added after the first release, with their declarations.
pub const OPTIONAL_COLUMNS: &[(&str, &str)] = &[
    ("gender", "TEXT DEFAULT ''"),
    ("position", "TEXT DEFAULT ''"),
    ("department", "TEXT DEFAULT ''"),
    ("person_type", "TEXT DEFAULT ''"),
    ("entry_date", "TEXT DEFAULT ''"),
    ("face_image", "BLOB"),
];

/// Create the table if needed and add any missing optional column.
///
/// Additive only: existing rows and columns are never touched.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)?;

    let mut stmt = conn.prepare("PRAGMA table_info(faces)")?;
    let present: HashSet<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<_>>()?;

    for (column, decl) in OPTIONAL_COLUMNS {
        if present.contains(*column) {
            continue;
        }
        conn.execute(&format!("ALTER TABLE faces ADD COLUMN {column} {decl}"), [])?;
        tracing::info!(column, "added column to faces table");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(conn: &Connection) -> Vec<String> {
        let mut stmt = conn.prepare("PRAGMA table_info(faces)").unwrap();
        let cols = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap();
        cols
    }

    #[test]
    fn test_fresh_table_has_all_columns() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let cols = columns(&conn);
        for (name, _) in OPTIONAL_COLUMNS {
            assert!(cols.iter().any(|c| c == name), "missing {name}");
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(columns(&conn).len(), 10);
    }

    #[test]
    fn test_legacy_table_gains_columns_and_keeps_rows() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE faces (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                feature_vector BLOB NOT NULL,
                create_time TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );
            INSERT INTO faces (id, name, feature_vector) VALUES (3, 'Carol', x'0000803F');",
        )
        .unwrap();

        migrate(&conn).unwrap();

        assert_eq!(columns(&conn).len(), 10);
        let (name, gender): (String, String) = conn
            .query_row("SELECT name, gender FROM faces WHERE id = 3", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(name, "Carol");
        assert_eq!(gender, "");
    }
}
