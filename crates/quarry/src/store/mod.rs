use serde::Serialize;
use thiserror::Error;

use crate::models::{PermissionScope, ResultSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableColumn {
    pub ordinal: i64,
    pub name: String,
    pub declared_type: Option<String>,
    pub nullable: bool,
    pub primary_key_position: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKey {
    pub from_columns: Vec<String>,
    pub referred_table: String,
    pub referred_columns: Vec<String>,
}

/// Any failure the data store reports for a statement. The resolver does not
/// distinguish syntax errors from missing relations or type mismatches, but
/// a read the store refused because of table scope is marked separately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
    pub denied_table: Option<String>,
}

impl ExecutionError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            denied_table: None,
        }
    }

    #[must_use]
    pub fn out_of_scope(table: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            message: format!("read of table `{table}` is not authorized"),
            denied_table: Some(table),
        }
    }
}

/// Which tables a statement may read while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableAccess<'a> {
    Unrestricted,
    Scoped(&'a PermissionScope),
}

/// Read-only access to the live database: metadata for introspection and
/// single-statement execution.
pub trait DataStore {
    fn dialect(&self) -> &'static str;

    fn list_tables(&self) -> anyhow::Result<Vec<String>>;

    fn table_columns(&self, table: &str) -> anyhow::Result<Vec<TableColumn>>;

    fn foreign_keys(&self, table: &str) -> anyhow::Result<Vec<ForeignKey>>;

    fn distinct_values(
        &self,
        table: &str,
        column: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<String>>;

    fn execute(
        &self,
        sql: &str,
        access: TableAccess<'_>,
        row_cap: usize,
    ) -> Result<ResultSet, ExecutionError>;
}
