//! Route resolution — routing table in, per-channel destinations and rule sets out.
//!
//! Resolution is pure and idempotent. The forwarder swaps the resulting
//! snapshot atomically, so re-resolving never disturbs deliveries that are
//! already queued.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::delivery::job::{Destination, DestinationKind, DestinationTarget};
use crate::pipeline::transform::{MessageTransformer, RuleKind, TransformRule};
use crate::store::{RouteRow, RoutingTable, RuleRow};

/// One valid channel → destination association.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub route_id: i64,
    pub group_id: Option<i64>,
    pub destination: Destination,
    pub channel_name: String,
    pub channel_username: Option<String>,
    /// Rules attached directly to this route.
    pub route_rules: Vec<TransformRule>,
}

/// Everything needed to relay one source channel.
#[derive(Debug, Clone)]
pub struct ChannelRoutes {
    pub routes: Vec<ResolvedRoute>,
    /// Group rules of every referenced active group, then route rules.
    pub transformer: Arc<MessageTransformer>,
}

/// Resolved routing snapshot keyed by source channel id.
#[derive(Debug, Clone, Default)]
pub struct ResolvedRoutes {
    channels: HashMap<i64, ChannelRoutes>,
}

impl ResolvedRoutes {
    pub fn get(&self, channel_id: i64) -> Option<&ChannelRoutes> {
        self.channels.get(&channel_id)
    }

    /// Source channels with at least one valid route, ascending.
    pub fn channel_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.channels.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Look up a route by id across all channels.
    pub fn route(&self, route_id: i64) -> Option<(i64, &ResolvedRoute)> {
        self.channels.iter().find_map(|(channel_id, entry)| {
            entry
                .routes
                .iter()
                .find(|r| r.route_id == route_id)
                .map(|r| (*channel_id, r))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn route_count(&self) -> usize {
        self.channels.values().map(|c| c.routes.len()).sum()
    }
}

/// Resolve the routing table.
///
/// A route is valid when the route, its source channel, its destination,
/// and (if grouped) its group are all active, and the destination carries
/// a usable target. Rules attached to a group and to a route are both
/// applied; a rule present in both places runs twice.
pub fn resolve(table: &RoutingTable) -> ResolvedRoutes {
    let active_groups: BTreeSet<i64> = table
        .groups
        .iter()
        .filter(|g| g.is_active)
        .map(|g| g.id)
        .collect();

    let mut by_channel: HashMap<i64, Vec<ResolvedRoute>> = HashMap::new();

    for row in &table.routes {
        if !(row.route_active && row.channel_active && row.destination_active) {
            continue;
        }
        if let Some(group_id) = row.group_id {
            if !active_groups.contains(&group_id) {
                debug!(route_id = row.route_id, group_id, "Skipping route in inactive group");
                continue;
            }
        }

        let Some(destination) = destination_from_row(row) else {
            continue;
        };

        by_channel
            .entry(row.source_channel_id)
            .or_default()
            .push(ResolvedRoute {
                route_id: row.route_id,
                group_id: row.group_id,
                destination,
                channel_name: row.source_channel_name.clone(),
                channel_username: row.source_channel_username.clone(),
                route_rules: rules_where(&table.rules, |r| r.route_id == Some(row.route_id)),
            });
    }

    let channels = by_channel
        .into_iter()
        .map(|(channel_id, mut routes)| {
            routes.sort_by_key(|r| r.route_id);

            let group_ids: BTreeSet<i64> = routes.iter().filter_map(|r| r.group_id).collect();
            let mut rules = Vec::new();
            for group_id in &group_ids {
                rules.extend(rules_where(&table.rules, |r| r.group_id == Some(*group_id)));
            }
            for route in &routes {
                rules.extend(route.route_rules.iter().cloned());
            }

            debug!(
                channel_id,
                routes = routes.len(),
                rules = rules.len(),
                "Resolved channel routes"
            );

            (
                channel_id,
                ChannelRoutes {
                    routes,
                    transformer: Arc::new(MessageTransformer::new(rules)),
                },
            )
        })
        .collect();

    ResolvedRoutes { channels }
}

fn destination_from_row(row: &RouteRow) -> Option<Destination> {
    let target = match DestinationKind::parse(&row.destination_type) {
        Some(DestinationKind::DiscordWebhook) => match row.webhook_url.as_deref() {
            Some(url) if !url.trim().is_empty() => DestinationTarget::Webhook {
                url: url.trim().to_string(),
            },
            _ => {
                warn!(
                    route_id = row.route_id,
                    destination = %row.destination_name,
                    "Webhook destination has no URL; route skipped"
                );
                return None;
            }
        },
        Some(DestinationKind::TelegramChat) => match row.chat_id {
            Some(chat_id) => DestinationTarget::Chat {
                chat_id,
                topic_id: row.topic_id,
            },
            None => {
                warn!(
                    route_id = row.route_id,
                    destination = %row.destination_name,
                    "Chat destination has no chat id; route skipped"
                );
                return None;
            }
        },
        None => {
            warn!(
                route_id = row.route_id,
                destination_type = %row.destination_type,
                "Unknown destination type; route skipped"
            );
            return None;
        }
    };

    Some(Destination {
        id: row.destination_id,
        name: row.destination_name.clone(),
        target,
    })
}

/// Convert matching stored rules, highest priority first.
fn rules_where(rules: &[RuleRow], pred: impl Fn(&RuleRow) -> bool) -> Vec<TransformRule> {
    let mut selected: Vec<&RuleRow> = rules.iter().filter(|r| pred(r)).collect();
    selected.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
    selected.into_iter().filter_map(convert_rule).collect()
}

fn convert_rule(row: &RuleRow) -> Option<TransformRule> {
    let Some(kind) = RuleKind::from_store(&row.transform_type) else {
        warn!(
            rule_id = row.id,
            transform_type = %row.transform_type,
            "Unknown rule type; rule ignored"
        );
        return None;
    };
    Some(TransformRule {
        kind,
        pattern: row.pattern.clone(),
        replacement: row.replacement.clone().unwrap_or_default(),
        is_regex: row.is_regex,
        enabled: row.is_active,
    })
}
