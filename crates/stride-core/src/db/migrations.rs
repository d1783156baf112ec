//! Database migrations

use crate::error::Result;
use crate::models::EntityKind;
use rusqlite::{Connection, OptionalExtension};

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Current time in Unix ms, as a SQL expression
const NOW_MS_SQL: &str = "CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)";

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);

    Ok(version)
}

/// Change-log triggers for one syncable table.
///
/// Each row records the author active in `sync_session` when the write happened,
/// which lets capture skip writes the merge engine made on behalf of a peer.
fn change_log_triggers(kind: EntityKind) -> Vec<String> {
    let table = kind.table();
    [("ai", "INSERT", "NEW", "insert"), ("au", "UPDATE", "NEW", "update"), ("ad", "DELETE", "OLD", "delete")]
        .into_iter()
        .map(|(suffix, event, row, change_type)| {
            format!(
                "CREATE TRIGGER IF NOT EXISTS {table}_{suffix}_log AFTER {event} ON {table} BEGIN
                    INSERT INTO change_log (entity, record_id, change_type, author, committed_at)
                    VALUES ('{entity}', {row}.id, '{change_type}',
                        (SELECT author FROM sync_session WHERE id = 1), {NOW_MS_SQL});
                END;",
                entity = kind.as_str(),
            )
        })
        .collect()
}

/// Sync bookkeeping columns shared by every syncable table
const META_COLUMNS_SQL: &str = "version INTEGER NOT NULL DEFAULT 0,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            last_synced_at INTEGER";

/// Migration to version 1: Initial schema
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );
        CREATE TABLE IF NOT EXISTS workouts (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            started_at INTEGER,
            ended_at INTEGER,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            distance_m REAL NOT NULL DEFAULT 0,
            is_completed INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL DEFAULT 0,
            {META_COLUMNS_SQL}
        );
        CREATE INDEX IF NOT EXISTS idx_workouts_sync_status ON workouts(sync_status);
        CREATE TABLE IF NOT EXISTS exercises (
            id TEXT PRIMARY KEY,
            workout_id TEXT,
            name TEXT NOT NULL DEFAULT '',
            order_index INTEGER NOT NULL DEFAULT 0,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            distance_m REAL NOT NULL DEFAULT 0,
            repetitions INTEGER NOT NULL DEFAULT 0,
            target_seconds INTEGER,
            is_completed INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL DEFAULT 0,
            {META_COLUMNS_SQL}
        );
        CREATE INDEX IF NOT EXISTS idx_exercises_workout ON exercises(workout_id, order_index);
        CREATE TABLE IF NOT EXISTS workout_templates (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            notes TEXT,
            created_at INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL DEFAULT 0,
            {META_COLUMNS_SQL}
        );
        CREATE INDEX IF NOT EXISTS idx_workout_templates_sync_status ON workout_templates(sync_status);
        CREATE TABLE IF NOT EXISTS exercise_templates (
            id TEXT PRIMARY KEY,
            workout_template_id TEXT,
            name TEXT NOT NULL DEFAULT '',
            order_index INTEGER NOT NULL DEFAULT 0,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            distance_m REAL NOT NULL DEFAULT 0,
            repetitions INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL DEFAULT 0,
            {META_COLUMNS_SQL}
        );
        CREATE INDEX IF NOT EXISTS idx_exercise_templates_parent
            ON exercise_templates(workout_template_id, order_index);
        CREATE TABLE IF NOT EXISTS sync_session (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            author TEXT NOT NULL
        );
        INSERT OR IGNORE INTO sync_session (id, author) VALUES (1, 'local');
        CREATE TABLE IF NOT EXISTS change_log (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            entity TEXT NOT NULL,
            record_id TEXT NOT NULL,
            change_type TEXT NOT NULL,
            author TEXT NOT NULL,
            committed_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS sync_checkpoints (
            consumer TEXT PRIMARY KEY,
            seq INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS goals (
            exercise_name TEXT PRIMARY KEY,
            target_seconds INTEGER NOT NULL
        );"
    ))?;

    for kind in EntityKind::ALL {
        for trigger in change_log_triggers(kind) {
            tx.execute_batch(&trigger)?;
        }
    }

    tx.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    tx.commit()?;

    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: deferred links and session telemetry
fn migrate_v2(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS orphan_links (
            entity TEXT NOT NULL,
            record_id TEXT NOT NULL,
            parent_id TEXT NOT NULL,
            recorded_at INTEGER NOT NULL,
            PRIMARY KEY (entity, record_id)
        );
        CREATE TABLE IF NOT EXISTS telemetry_points (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            workout_id TEXT NOT NULL,
            recorded_at INTEGER NOT NULL,
            elapsed_ms INTEGER NOT NULL,
            heart_rate REAL,
            distance_m REAL
        );
        CREATE INDEX IF NOT EXISTS idx_telemetry_workout ON telemetry_points(workout_id, recorded_at);
        INSERT INTO schema_version (version) VALUES (2);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
            [name],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_migrations() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migration_v2_creates_orphan_links_table() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();

        assert!(table_exists(&conn, "orphan_links"));
        assert!(table_exists(&conn, "telemetry_points"));
    }

    #[test]
    fn test_triggers_log_with_session_author() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();

        conn.execute("INSERT INTO workouts (id, name) VALUES ('w1', 'Run')", [])
            .unwrap();
        conn.execute("UPDATE sync_session SET author = 'peer' WHERE id = 1", [])
            .unwrap();
        conn.execute("DELETE FROM workouts WHERE id = 'w1'", []).unwrap();

        let rows: Vec<(String, String, String)> = conn
            .prepare("SELECT entity, change_type, author FROM change_log ORDER BY seq")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();

        assert_eq!(
            rows,
            vec![
                ("Workout".into(), "insert".into(), "local".into()),
                ("Workout".into(), "delete".into(), "peer".into()),
            ]
        );
    }
}
