//! libSQL backend — async `RelayStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::delivery::redact::truncate_chars;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    ForwardLogEntry, ForwardLogRecord, ForwardStatus, GroupRow, NewTransformRule, RelayStore,
    RouteRow, RoutingTable, RuleRow,
};

/// Stored text snapshots are capped at this many characters.
pub const LOG_TEXT_LIMIT: usize = 1000;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run an `INSERT ... RETURNING id` and return the id.
    async fn insert_returning_id(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
            .ok_or_else(|| DatabaseError::Query(format!("{op}: no id returned")))?;
        row.get::<i64>(0)
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))
    }

    /// Run an `UPDATE` that must touch exactly one row.
    async fn update_one(
        &self,
        op: &str,
        entity: &str,
        id: i64,
        sql: &str,
        active: bool,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(sql, params![bool_int(active), id])
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: entity.into(),
                id: id.to_string(),
            });
        }
        debug!(entity, id, active, "Active flag updated");
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn bool_int(b: bool) -> i64 {
    i64::from(b)
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<i64>` to libsql Value.
fn opt_int(n: Option<i64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

const ROUTE_QUERY: &str = "SELECT r.id, r.is_active, r.group_id,
        c.channel_id, c.name, c.username, c.is_active,
        d.id, d.name, d.destination_type, d.is_active,
        dd.webhook_url, dt.chat_id, dt.topic_id
    FROM route_mappings r
    JOIN source_channels c ON c.id = r.source_channel_id
    JOIN destinations d ON d.id = r.destination_id
    LEFT JOIN destination_discord dd ON dd.destination_id = d.id
    LEFT JOIN destination_telegram dt ON dt.destination_id = d.id
    ORDER BY r.id";

fn row_to_route(row: &libsql::Row) -> Result<RouteRow, libsql::Error> {
    Ok(RouteRow {
        route_id: row.get(0)?,
        route_active: row.get::<i64>(1)? != 0,
        group_id: row.get(2).ok(),
        source_channel_id: row.get(3)?,
        source_channel_name: row.get(4)?,
        source_channel_username: row.get(5).ok(),
        channel_active: row.get::<i64>(6)? != 0,
        destination_id: row.get(7)?,
        destination_name: row.get(8)?,
        destination_type: row.get(9)?,
        destination_active: row.get::<i64>(10)? != 0,
        webhook_url: row.get(11).ok(),
        chat_id: row.get(12).ok(),
        topic_id: row.get(13).ok(),
    })
}

const RULE_COLUMNS: &str =
    "id, group_id, route_id, transform_type, pattern, replacement, is_regex, is_active, priority";

fn row_to_rule(row: &libsql::Row) -> Result<RuleRow, libsql::Error> {
    Ok(RuleRow {
        id: row.get(0)?,
        group_id: row.get(1).ok(),
        route_id: row.get(2).ok(),
        transform_type: row.get(3)?,
        pattern: row.get::<String>(4).unwrap_or_default(),
        replacement: row.get(5).ok(),
        is_regex: row.get::<i64>(6)? != 0,
        is_active: row.get::<i64>(7)? != 0,
        priority: row.get::<i64>(8).unwrap_or(0),
    })
}

const LOG_COLUMNS: &str = "id, route_id, message_id, destination_type, destination_name,
    original_text, transformed_text, has_media, status, error_message, forwarded_at";

fn row_to_log(row: &libsql::Row) -> Result<ForwardLogRecord, libsql::Error> {
    let status: String = row.get(8)?;
    let forwarded_at: String = row.get(10)?;
    Ok(ForwardLogRecord {
        id: row.get(0)?,
        route_id: row.get(1).ok(),
        message_id: row.get(2)?,
        destination_type: row.get(3)?,
        destination_name: row.get(4)?,
        original_text: row.get::<String>(5).unwrap_or_default(),
        transformed_text: row.get::<String>(6).unwrap_or_default(),
        has_media: row.get::<i64>(7)? != 0,
        status: ForwardStatus::parse(&status),
        error_message: row.get(9).ok(),
        forwarded_at: parse_datetime(&forwarded_at),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl RelayStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Routing ─────────────────────────────────────────────────────

    async fn routing_table(&self) -> Result<RoutingTable, DatabaseError> {
        let conn = self.conn();
        let mut table = RoutingTable::default();

        let mut rows = conn
            .query(ROUTE_QUERY, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("routing_table routes: {e}")))?;
        while let Ok(Some(row)) = rows.next().await {
            match row_to_route(&row) {
                Ok(route) => table.routes.push(route),
                Err(e) => warn!("Skipping route row: {e}"),
            }
        }

        let mut rows = conn
            .query("SELECT id, name, is_active FROM forwarding_groups ORDER BY id", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("routing_table groups: {e}")))?;
        while let Ok(Some(row)) = rows.next().await {
            let group = (|| -> Result<GroupRow, libsql::Error> {
                Ok(GroupRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    is_active: row.get::<i64>(2)? != 0,
                })
            })();
            match group {
                Ok(group) => table.groups.push(group),
                Err(e) => warn!("Skipping group row: {e}"),
            }
        }

        let mut rows = conn
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM transform_rules ORDER BY id"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("routing_table rules: {e}")))?;
        while let Ok(Some(row)) = rows.next().await {
            match row_to_rule(&row) {
                Ok(rule) => table.rules.push(rule),
                Err(e) => warn!("Skipping rule row: {e}"),
            }
        }

        debug!(
            routes = table.routes.len(),
            groups = table.groups.len(),
            rules = table.rules.len(),
            "Routing table loaded"
        );
        Ok(table)
    }

    async fn add_source_channel(
        &self,
        channel_id: i64,
        name: &str,
        username: Option<&str>,
    ) -> Result<i64, DatabaseError> {
        self.insert_returning_id(
            "add_source_channel",
            "INSERT INTO source_channels (channel_id, name, username) VALUES (?1, ?2, ?3)
             ON CONFLICT(channel_id) DO UPDATE SET name = excluded.name, username = excluded.username
             RETURNING id",
            params![channel_id, name, opt_text(username)],
        )
        .await
    }

    async fn add_group(&self, name: &str) -> Result<i64, DatabaseError> {
        self.insert_returning_id(
            "add_group",
            "INSERT INTO forwarding_groups (name) VALUES (?1) RETURNING id",
            params![name],
        )
        .await
    }

    async fn add_webhook_destination(&self, name: &str, webhook_url: &str) -> Result<i64, DatabaseError> {
        let id = self
            .insert_returning_id(
                "add_webhook_destination",
                "INSERT INTO destinations (name, destination_type) VALUES (?1, 'discord_webhook') RETURNING id",
                params![name],
            )
            .await?;
        self.conn()
            .execute(
                "INSERT INTO destination_discord (destination_id, webhook_url) VALUES (?1, ?2)",
                params![id, webhook_url],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_webhook_destination: {e}")))?;
        Ok(id)
    }

    async fn add_chat_destination(
        &self,
        name: &str,
        chat_id: i64,
        topic_id: Option<i64>,
    ) -> Result<i64, DatabaseError> {
        let id = self
            .insert_returning_id(
                "add_chat_destination",
                "INSERT INTO destinations (name, destination_type) VALUES (?1, 'telegram_chat') RETURNING id",
                params![name],
            )
            .await?;
        self.conn()
            .execute(
                "INSERT INTO destination_telegram (destination_id, chat_id, topic_id) VALUES (?1, ?2, ?3)",
                params![id, chat_id, opt_int(topic_id)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_chat_destination: {e}")))?;
        Ok(id)
    }

    async fn add_route(
        &self,
        channel_id: i64,
        destination_id: i64,
        group_id: Option<i64>,
    ) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM source_channels WHERE channel_id = ?1",
                params![channel_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_route: {e}")))?;
        let source_row_id: i64 = match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("add_route: {e}")))?,
            Ok(None) => {
                return Err(DatabaseError::NotFound {
                    entity: "source_channel".into(),
                    id: channel_id.to_string(),
                });
            }
            Err(e) => return Err(DatabaseError::Query(format!("add_route: {e}"))),
        };

        self.insert_returning_id(
            "add_route",
            "INSERT INTO route_mappings (source_channel_id, destination_id, group_id)
             VALUES (?1, ?2, ?3) RETURNING id",
            params![source_row_id, destination_id, opt_int(group_id)],
        )
        .await
    }

    async fn add_transform_rule(&self, rule: &NewTransformRule) -> Result<i64, DatabaseError> {
        self.insert_returning_id(
            "add_transform_rule",
            "INSERT INTO transform_rules
                (group_id, route_id, transform_type, pattern, replacement, is_regex, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) RETURNING id",
            params![
                opt_int(rule.group_id),
                opt_int(rule.route_id),
                rule.transform_type.as_str(),
                rule.pattern.as_str(),
                opt_text(rule.replacement.as_deref()),
                bool_int(rule.is_regex),
                rule.priority,
            ],
        )
        .await
    }

    async fn set_channel_active(&self, channel_id: i64, active: bool) -> Result<(), DatabaseError> {
        self.update_one(
            "set_channel_active",
            "source_channel",
            channel_id,
            "UPDATE source_channels SET is_active = ?1 WHERE channel_id = ?2",
            active,
        )
        .await
    }

    async fn set_group_active(&self, group_id: i64, active: bool) -> Result<(), DatabaseError> {
        self.update_one(
            "set_group_active",
            "forwarding_group",
            group_id,
            "UPDATE forwarding_groups SET is_active = ?1 WHERE id = ?2",
            active,
        )
        .await
    }

    async fn set_destination_active(&self, destination_id: i64, active: bool) -> Result<(), DatabaseError> {
        self.update_one(
            "set_destination_active",
            "destination",
            destination_id,
            "UPDATE destinations SET is_active = ?1 WHERE id = ?2",
            active,
        )
        .await
    }

    async fn set_route_active(&self, route_id: i64, active: bool) -> Result<(), DatabaseError> {
        self.update_one(
            "set_route_active",
            "route_mapping",
            route_id,
            "UPDATE route_mappings SET is_active = ?1 WHERE id = ?2",
            active,
        )
        .await
    }

    async fn set_rule_active(&self, rule_id: i64, active: bool) -> Result<(), DatabaseError> {
        self.update_one(
            "set_rule_active",
            "transform_rule",
            rule_id,
            "UPDATE transform_rules SET is_active = ?1 WHERE id = ?2",
            active,
        )
        .await
    }

    // ── Delivery logs ───────────────────────────────────────────────

    async fn append_forward_log(&self, entry: &ForwardLogEntry) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO forward_logs (route_id, message_id, destination_type, destination_name,
                    original_text, transformed_text, has_media, status, error_message, forwarded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    opt_int(entry.route_id),
                    entry.message_id,
                    entry.destination_type.as_str(),
                    entry.destination_name.as_str(),
                    truncate_chars(&entry.original_text, LOG_TEXT_LIMIT),
                    truncate_chars(&entry.transformed_text, LOG_TEXT_LIMIT),
                    bool_int(entry.has_media),
                    entry.status.as_str(),
                    opt_text(entry.error_message.as_deref()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_forward_log: {e}")))?;
        Ok(())
    }

    async fn recent_forward_logs(&self, limit: usize) -> Result<Vec<ForwardLogRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LOG_COLUMNS} FROM forward_logs ORDER BY id DESC LIMIT ?1"),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_forward_logs: {e}")))?;

        let mut logs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_log(&row) {
                Ok(log) => logs.push(log),
                Err(e) => warn!("Skipping forward log row: {e}"),
            }
        }
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn log_entry(message_id: i64, status: ForwardStatus) -> ForwardLogEntry {
        ForwardLogEntry {
            route_id: Some(1),
            message_id,
            destination_type: "discord_webhook".into(),
            destination_name: "news".into(),
            original_text: "hello".into(),
            transformed_text: "hello".into(),
            has_media: false,
            status,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn schema_init_runs_on_spawned_task() {
        let db = Arc::new(test_db().await);
        let handle = {
            let db = Arc::clone(&db);
            tokio::spawn(async move { db.init_schema().await })
        };
        handle.await.unwrap().unwrap();
        assert!(db.routing_table().await.unwrap().routes.is_empty());
    }

    #[tokio::test]
    async fn routing_table_joins_destinations() {
        let db = test_db().await;
        db.add_source_channel(-1001, "Alpha", Some("alpha")).await.unwrap();
        let group = db.add_group("main").await.unwrap();
        let hook = db
            .add_webhook_destination("hook", "https://discord.com/api/webhooks/1/t")
            .await
            .unwrap();
        let chat = db.add_chat_destination("mirror", -2002, Some(9)).await.unwrap();
        let r1 = db.add_route(-1001, hook, Some(group)).await.unwrap();
        let r2 = db.add_route(-1001, chat, None).await.unwrap();

        let table = db.routing_table().await.unwrap();
        assert_eq!(table.routes.len(), 2);
        assert_eq!(table.groups.len(), 1);

        let webhook_row = table.routes.iter().find(|r| r.route_id == r1).unwrap();
        assert_eq!(webhook_row.source_channel_id, -1001);
        assert_eq!(webhook_row.source_channel_username.as_deref(), Some("alpha"));
        assert_eq!(webhook_row.destination_type, "discord_webhook");
        assert_eq!(
            webhook_row.webhook_url.as_deref(),
            Some("https://discord.com/api/webhooks/1/t")
        );
        assert_eq!(webhook_row.group_id, Some(group));
        assert_eq!(webhook_row.chat_id, None);

        let chat_row = table.routes.iter().find(|r| r.route_id == r2).unwrap();
        assert_eq!(chat_row.chat_id, Some(-2002));
        assert_eq!(chat_row.topic_id, Some(9));
        assert_eq!(chat_row.group_id, None);
        assert!(chat_row.route_active && chat_row.channel_active && chat_row.destination_active);
    }

    #[tokio::test]
    async fn source_channel_upsert_keeps_id() {
        let db = test_db().await;
        let first = db.add_source_channel(-1, "Old", None).await.unwrap();
        let second = db.add_source_channel(-1, "New", Some("new")).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn add_route_requires_known_channel() {
        let db = test_db().await;
        let hook = db
            .add_webhook_destination("hook", "https://discord.com/api/webhooks/1/t")
            .await
            .unwrap();
        let err = db.add_route(-404, hook, None).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn rules_and_flags_round_trip() {
        let db = test_db().await;
        db.add_source_channel(-1, "A", None).await.unwrap();
        let group = db.add_group("g").await.unwrap();
        let chat = db.add_chat_destination("c", -5, None).await.unwrap();
        let route = db.add_route(-1, chat, Some(group)).await.unwrap();

        let rule = db
            .add_transform_rule(&NewTransformRule {
                group_id: None,
                route_id: Some(route),
                transform_type: "text_replace".into(),
                pattern: "foo".into(),
                replacement: Some("bar".into()),
                is_regex: false,
                priority: 5,
            })
            .await
            .unwrap();

        db.set_rule_active(rule, false).await.unwrap();
        db.set_group_active(group, false).await.unwrap();
        db.set_channel_active(-1, false).await.unwrap();
        db.set_destination_active(chat, false).await.unwrap();
        db.set_route_active(route, false).await.unwrap();

        let table = db.routing_table().await.unwrap();
        let r = &table.rules[0];
        assert_eq!(r.route_id, Some(route));
        assert_eq!(r.replacement.as_deref(), Some("bar"));
        assert_eq!(r.priority, 5);
        assert!(!r.is_active);
        assert!(!table.groups[0].is_active);
        let row = &table.routes[0];
        assert!(!row.route_active && !row.channel_active && !row.destination_active);

        let err = db.set_route_active(999, true).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn forward_logs_newest_first_and_truncated() {
        let db = test_db().await;
        db.append_forward_log(&log_entry(1, ForwardStatus::Success)).await.unwrap();

        let mut failed = log_entry(2, ForwardStatus::Error);
        failed.original_text = "x".repeat(1500);
        failed.has_media = true;
        failed.error_message = Some("Discord returned status 404: gone".into());
        db.append_forward_log(&failed).await.unwrap();

        let logs = db.recent_forward_logs(10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message_id, 2);
        assert_eq!(logs[0].status, ForwardStatus::Error);
        assert_eq!(logs[0].original_text.chars().count(), LOG_TEXT_LIMIT);
        assert!(logs[0].has_media);
        assert_eq!(
            logs[0].error_message.as_deref(),
            Some("Discord returned status 404: gone")
        );
        assert_eq!(logs[1].status, ForwardStatus::Success);
        assert_eq!(logs[1].error_message, None);

        assert_eq!(db.recent_forward_logs(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn local_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("relay.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.add_group("kept").await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let table = db.routing_table().await.unwrap();
        assert_eq!(table.groups[0].name, "kept");
    }
}
