//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS source_channels (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id INTEGER NOT NULL UNIQUE,
                name TEXT NOT NULL,
                username TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS forwarding_groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS destinations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                destination_type TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_destinations_type ON destinations(destination_type);

            CREATE TABLE IF NOT EXISTS destination_discord (
                destination_id INTEGER PRIMARY KEY REFERENCES destinations(id) ON DELETE CASCADE,
                webhook_url TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS destination_telegram (
                destination_id INTEGER PRIMARY KEY REFERENCES destinations(id) ON DELETE CASCADE,
                chat_id INTEGER NOT NULL,
                topic_id INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_destination_telegram_chat ON destination_telegram(chat_id);

            CREATE TABLE IF NOT EXISTS route_mappings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_channel_id INTEGER NOT NULL REFERENCES source_channels(id) ON DELETE CASCADE,
                destination_id INTEGER NOT NULL REFERENCES destinations(id) ON DELETE CASCADE,
                group_id INTEGER REFERENCES forwarding_groups(id) ON DELETE SET NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_route_mappings_destination ON route_mappings(destination_id);

            CREATE TABLE IF NOT EXISTS transform_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id INTEGER REFERENCES forwarding_groups(id) ON DELETE CASCADE,
                route_id INTEGER REFERENCES route_mappings(id) ON DELETE CASCADE,
                transform_type TEXT NOT NULL,
                pattern TEXT NOT NULL DEFAULT '',
                replacement TEXT,
                is_regex INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                priority INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_transform_rules_group ON transform_rules(group_id);
            CREATE INDEX IF NOT EXISTS idx_transform_rules_route ON transform_rules(route_id);

            CREATE TABLE IF NOT EXISTS forward_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                route_id INTEGER,
                message_id INTEGER NOT NULL,
                destination_type TEXT NOT NULL,
                destination_name TEXT NOT NULL,
                original_text TEXT,
                transformed_text TEXT,
                has_media INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                error_message TEXT,
                forwarded_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        name: "forward_log_indexes",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_forward_logs_forwarded_at ON forward_logs(forwarded_at);
            CREATE INDEX IF NOT EXISTS idx_forward_logs_route ON forward_logs(route_id);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("Failed to parse migration version: {e}"))),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
