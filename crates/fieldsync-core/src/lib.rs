//! Core model for offline-first storage over paired table families.
//!
//! Every syncable entity `X` lives in two physical tables: `X`, which mirrors
//! the last-known server state, and `X_local`, which holds drafts written while
//! offline. This crate describes those tables statically, derives the local
//! family, resolves physical tables, and renders read queries that span both
//! families with a provenance tag on every row.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub mod config;
pub mod json;
pub mod localize;
pub mod query;
pub mod resolver;
pub mod schema;
pub mod sql_text;
pub mod value;
pub mod version;

pub use config::SyncConfig;
pub use json::JsonColumnDecoder;
pub use localize::{localize_catalog, localize_table, render_local_ddl};
pub use query::{CompareOp, Expr, JoinKind, JsonAggregate, MergeQuery, Select, SortOrder};
pub use resolver::{ResolveOptions, TableHandle, TableResolver};
pub use schema::{field_catalog, Catalog, ColumnDef, ColumnType, ForeignKey, TableDef};
pub use sql_text::{merge_sql, referenced_tables};
pub use value::{quote_ident, quote_literal, SqlValue};
pub use version::{strip_version_fields, Direction, VersionStamp};

/// One result or input row keyed by column name, in column order.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Name of the provenance column added to every merged row.
pub const SOURCE_COLUMN: &str = "source";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("table {0} has no registered local counterpart")]
    MissingLocalCounterpart(String),
    #[error("aliased table reference is not supported in merge queries: {0}")]
    AliasedTable(String),
    #[error("unknown column {column} on table {table}")]
    UnknownColumn { table: String, column: String },
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("statement expects {expected} parameters but {provided} were provided")]
    ParameterCount { expected: usize, provided: usize },
    #[error("validation error: {0}")]
    Validation(String),
}

/// Which table family a row lives in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Synced,
    Local,
}

impl DataSource {
    pub const ALL: [Self; 2] = [Self::Synced, Self::Local];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Local => "local",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "synced" => Some(Self::Synced),
            "local" => Some(Self::Local),
            _ => None,
        }
    }

    /// Provenance literal written into merged rows for this family.
    #[must_use]
    pub fn tag(self, config: &SyncConfig) -> &str {
        match self {
            Self::Synced => &config.synced_tag,
            Self::Local => &config.local_tag,
        }
    }
}

impl Display for DataSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
