use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::models::PermissionScope;
use crate::store::{DataStore, ForeignKey, TableColumn};

pub const SAMPLE_VALUE_LIMIT: usize = 10;
pub const MAX_SAMPLED_COLUMNS_PER_TABLE: usize = 3;
const ENUMERATED_NAME_MARKERS: &[&str] = &["status", "type", "region"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDescription {
    pub name: String,
    pub columns: Vec<TableColumn>,
    pub foreign_keys: Vec<ForeignKey>,
    pub sample_values: BTreeMap<String, Vec<String>>,
}

/// Per-request view of the live schema, restricted to the tables a scope
/// allows. Never cached: each request re-reads metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaDescription {
    pub dialect: String,
    pub context_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_table: Option<String>,

    pub tables: Vec<TableDescription>,
}

impl SchemaDescription {
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableDescription> {
        self.tables
            .iter()
            .find(|table| table.name.eq_ignore_ascii_case(name))
    }

    /// Prompt text handed to the synthesizer.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "DATABASE: {}", self.dialect);
        match &self.primary_table {
            Some(primary) => {
                let _ = writeln!(out, "CONTEXT: {} (primary table: {primary})", self.context_name);
            }
            None => {
                let _ = writeln!(out, "CONTEXT: {}", self.context_name);
            }
        }
        out.push_str("AVAILABLE TABLES AND COLUMNS:\n");

        for table in &self.tables {
            let _ = write!(out, "\nTable: {}\nColumns:\n", table.name);
            for column in &table.columns {
                let nullability = if column.nullable { "NULL" } else { "NOT NULL" };
                let _ = writeln!(
                    out,
                    "  - {} ({}) {nullability}",
                    column.name,
                    column.declared_type.as_deref().unwrap_or("ANY")
                );
            }

            if !table.foreign_keys.is_empty() {
                out.push_str("Foreign Keys:\n");
                for key in &table.foreign_keys {
                    let _ = writeln!(
                        out,
                        "  - {} -> {}.{}",
                        key.from_columns.join(", "),
                        key.referred_table,
                        key.referred_columns.join(", ")
                    );
                }
            }

            if !table.sample_values.is_empty() {
                out.push_str("Sample Values:\n");
                for (column, values) in &table.sample_values {
                    let _ = writeln!(out, "  - {column}: {}", values.join(", "));
                }
            }
        }

        out
    }
}

/// Builds the schema description for `scope`. Allowed tables missing from the
/// database are skipped; sample-value lookups are best effort and never fail
/// the whole description.
pub fn describe(store: &dyn DataStore, scope: &PermissionScope) -> Result<SchemaDescription> {
    if scope.allowed_tables.is_empty() {
        bail!(
            "context `{}` does not allow any tables",
            scope.context_id
        );
    }

    let live_tables = store
        .list_tables()
        .context("failed to list database tables")?;

    let mut tables = Vec::new();
    for allowed in &scope.allowed_tables {
        let Some(live_name) = live_tables
            .iter()
            .find(|live| live.eq_ignore_ascii_case(allowed))
        else {
            tracing::debug!(table = %allowed, "allowed table not present in database; skipping");
            continue;
        };

        let columns = store.table_columns(live_name)?;
        let foreign_keys = store.foreign_keys(live_name)?;
        let sample_values = collect_sample_values(store, live_name, &columns);
        tables.push(TableDescription {
            name: live_name.clone(),
            columns,
            foreign_keys,
            sample_values,
        });
    }

    Ok(SchemaDescription {
        dialect: store.dialect().to_string(),
        context_name: scope.display_name().to_string(),
        primary_table: scope.primary_table.clone(),
        tables,
    })
}

#[must_use]
pub fn looks_enumerated(column_name: &str) -> bool {
    let lowered = column_name.to_ascii_lowercase();
    ENUMERATED_NAME_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

fn collect_sample_values(
    store: &dyn DataStore,
    table: &str,
    columns: &[TableColumn],
) -> BTreeMap<String, Vec<String>> {
    let mut samples = BTreeMap::new();
    for column in columns
        .iter()
        .filter(|column| looks_enumerated(&column.name))
        .take(MAX_SAMPLED_COLUMNS_PER_TABLE)
    {
        match store.distinct_values(table, &column.name, SAMPLE_VALUE_LIMIT) {
            Ok(values) if !values.is_empty() => {
                samples.insert(column.name.clone(), values);
            }
            Ok(_) => {}
            Err(error) => {
                tracing::debug!(
                    table,
                    column = %column.name,
                    error = %format!("{error:#}"),
                    "sample value lookup failed; omitting samples"
                );
            }
        }
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::looks_enumerated;

    #[test]
    fn enumerated_columns_match_markers_case_insensitively() {
        assert!(looks_enumerated("status"));
        assert!(looks_enumerated("Order_Status"));
        assert!(looks_enumerated("item_type"));
        assert!(looks_enumerated("REGION"));
        assert!(!looks_enumerated("quantity_on_hand"));
        assert!(!looks_enumerated("name"));
    }
}
