//! `RelayStore` trait — async interface for routing configuration and delivery logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DatabaseError;

/// One route joined with its source channel and destination.
///
/// Rows are returned for inactive entities too; validity is decided by the
/// route resolver.
#[derive(Debug, Clone)]
pub struct RouteRow {
    pub route_id: i64,
    pub route_active: bool,
    pub group_id: Option<i64>,
    /// Telegram chat id of the source channel.
    pub source_channel_id: i64,
    pub source_channel_name: String,
    pub source_channel_username: Option<String>,
    pub channel_active: bool,
    pub destination_id: i64,
    pub destination_name: String,
    pub destination_type: String,
    pub destination_active: bool,
    pub webhook_url: Option<String>,
    pub chat_id: Option<i64>,
    pub topic_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct GroupRow {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
}

/// A stored transform rule, attached to a group or to a single route.
#[derive(Debug, Clone)]
pub struct RuleRow {
    pub id: i64,
    pub group_id: Option<i64>,
    pub route_id: Option<i64>,
    pub transform_type: String,
    pub pattern: String,
    pub replacement: Option<String>,
    pub is_regex: bool,
    pub is_active: bool,
    pub priority: i64,
}

/// Full routing configuration snapshot.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    pub routes: Vec<RouteRow>,
    pub groups: Vec<GroupRow>,
    pub rules: Vec<RuleRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardStatus {
    Success,
    Error,
}

impl ForwardStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub(crate) fn parse(s: &str) -> Self {
        if s == "success" {
            Self::Success
        } else {
            Self::Error
        }
    }
}

/// Delivery log record to append. Text snapshots are truncated on write.
#[derive(Debug, Clone)]
pub struct ForwardLogEntry {
    pub route_id: Option<i64>,
    pub message_id: i64,
    pub destination_type: String,
    pub destination_name: String,
    pub original_text: String,
    pub transformed_text: String,
    pub has_media: bool,
    pub status: ForwardStatus,
    pub error_message: Option<String>,
}

/// A persisted delivery log record.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardLogRecord {
    pub id: i64,
    pub route_id: Option<i64>,
    pub message_id: i64,
    pub destination_type: String,
    pub destination_name: String,
    pub original_text: String,
    pub transformed_text: String,
    pub has_media: bool,
    pub status: ForwardStatus,
    pub error_message: Option<String>,
    pub forwarded_at: DateTime<Utc>,
}

/// New transform rule; exactly one of `group_id` / `route_id` should be set.
#[derive(Debug, Clone)]
pub struct NewTransformRule {
    pub group_id: Option<i64>,
    pub route_id: Option<i64>,
    pub transform_type: String,
    pub pattern: String,
    pub replacement: Option<String>,
    pub is_regex: bool,
    pub priority: i64,
}

/// Backend-agnostic persistence for the relay.
#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Routing ─────────────────────────────────────────────────────

    /// Load every route, group, and rule with their active flags.
    async fn routing_table(&self) -> Result<RoutingTable, DatabaseError>;

    /// Register a source channel (upsert on the Telegram chat id). Returns the row id.
    async fn add_source_channel(
        &self,
        channel_id: i64,
        name: &str,
        username: Option<&str>,
    ) -> Result<i64, DatabaseError>;

    async fn add_group(&self, name: &str) -> Result<i64, DatabaseError>;

    async fn add_webhook_destination(&self, name: &str, webhook_url: &str) -> Result<i64, DatabaseError>;

    async fn add_chat_destination(
        &self,
        name: &str,
        chat_id: i64,
        topic_id: Option<i64>,
    ) -> Result<i64, DatabaseError>;

    /// Connect a source channel (by Telegram chat id) to a destination.
    async fn add_route(
        &self,
        channel_id: i64,
        destination_id: i64,
        group_id: Option<i64>,
    ) -> Result<i64, DatabaseError>;

    async fn add_transform_rule(&self, rule: &NewTransformRule) -> Result<i64, DatabaseError>;

    /// Toggle a source channel by Telegram chat id.
    async fn set_channel_active(&self, channel_id: i64, active: bool) -> Result<(), DatabaseError>;

    async fn set_group_active(&self, group_id: i64, active: bool) -> Result<(), DatabaseError>;

    async fn set_destination_active(&self, destination_id: i64, active: bool) -> Result<(), DatabaseError>;

    async fn set_route_active(&self, route_id: i64, active: bool) -> Result<(), DatabaseError>;

    async fn set_rule_active(&self, rule_id: i64, active: bool) -> Result<(), DatabaseError>;

    // ── Delivery logs ───────────────────────────────────────────────

    async fn append_forward_log(&self, entry: &ForwardLogEntry) -> Result<(), DatabaseError>;

    /// Newest first.
    async fn recent_forward_logs(&self, limit: usize) -> Result<Vec<ForwardLogRecord>, DatabaseError>;
}
