//! Persistence layer — routing configuration and delivery logs on libSQL.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    ForwardLogEntry, ForwardLogRecord, ForwardStatus, GroupRow, NewTransformRule, RelayStore,
    RouteRow, RoutingTable, RuleRow,
};
