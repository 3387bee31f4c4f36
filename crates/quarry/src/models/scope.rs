use std::collections::{BTreeMap, BTreeSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// What one analytical context may read: tables, columns per table, and the
/// predefined metric names it may route to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PermissionScope {
    pub context_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_table: Option<String>,

    pub allowed_tables: BTreeSet<String>,

    #[serde(default)]
    pub allowed_columns: BTreeMap<String, BTreeSet<String>>,

    #[serde(default)]
    pub allowed_metrics: BTreeSet<String>,
}

impl PermissionScope {
    #[must_use]
    pub fn new<I, S>(context_id: impl Into<String>, allowed_tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            context_id: context_id.into(),
            name: String::new(),
            primary_table: None,
            allowed_tables: allowed_tables.into_iter().map(Into::into).collect(),
            allowed_columns: BTreeMap::new(),
            allowed_metrics: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_columns<I, S>(mut self, table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_columns
            .insert(table.into(), columns.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_metric(mut self, metric: impl Into<String>) -> Self {
        self.allowed_metrics.insert(metric.into());
        self
    }

    /// Case-insensitive, since SQLite identifiers are.
    #[must_use]
    pub fn allows_table(&self, table: &str) -> bool {
        self.allowed_tables
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(table))
    }

    #[must_use]
    pub fn allows_metric(&self, metric: &str) -> bool {
        self.allowed_metrics.contains(metric)
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.context_id
        } else {
            &self.name
        }
    }
}

/// One entry of the fixed metric catalog: alias phrases routed to a known
/// statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MetricDefinition {
    pub name: String,
    pub aliases: Vec<String>,
    pub sql: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl MetricDefinition {
    #[must_use]
    pub fn matches_question(&self, question: &str) -> bool {
        let question = question.to_lowercase();
        self.aliases
            .iter()
            .map(|alias| alias.trim().to_lowercase())
            .any(|alias| !alias.is_empty() && question.contains(&alias))
    }
}
