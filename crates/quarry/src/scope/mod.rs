use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::models::{MetricDefinition, PermissionScope};

/// Supplies the permission scope for a context identifier. Callers must
/// treat `None` as a refusal.
pub trait ScopeProvider {
    fn scope_for(&self, context_id: &str) -> Option<PermissionScope>;

    /// Metrics in catalog order; routing picks the first alias match.
    fn metrics(&self) -> Vec<MetricDefinition>;
}

/// Contexts and the fixed metric catalog, as stored in `contexts.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextCatalog {
    pub contexts: Vec<PermissionScope>,

    #[serde(default)]
    pub metrics: Vec<MetricDefinition>,
}

impl ContextCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read context catalog: {}", path.display()))?;
        Self::from_json(&raw)
            .with_context(|| format!("invalid context catalog: {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let catalog: Self =
            serde_json::from_str(raw).context("failed to parse context catalog JSON")?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<()> {
        if self.contexts.is_empty() {
            bail!("context catalog must declare at least one context");
        }

        let mut context_ids = BTreeSet::new();
        for scope in &self.contexts {
            if scope.context_id.trim().is_empty() {
                bail!("catalog contains a context with an empty context_id");
            }
            if !context_ids.insert(scope.context_id.as_str()) {
                bail!("catalog contains duplicate context_id `{}`", scope.context_id);
            }
            if scope.allowed_tables.is_empty() {
                bail!(
                    "context `{}` must allow at least one table",
                    scope.context_id
                );
            }
            if let Some(table) = scope
                .allowed_columns
                .keys()
                .find(|table| !scope.allows_table(table))
            {
                bail!(
                    "context `{}` lists columns for table `{table}` which is not in allowed_tables",
                    scope.context_id
                );
            }
        }

        let mut metric_names = BTreeSet::new();
        for metric in &self.metrics {
            if !metric_names.insert(metric.name.as_str()) {
                bail!("catalog contains duplicate metric `{}`", metric.name);
            }
            if metric.aliases.iter().all(|alias| alias.trim().is_empty()) {
                bail!("metric `{}` must declare at least one alias", metric.name);
            }
            if metric.sql.trim().is_empty() {
                bail!("metric `{}` must declare its SQL", metric.name);
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn context_ids(&self) -> Vec<&str> {
        self.contexts
            .iter()
            .map(|scope| scope.context_id.as_str())
            .collect()
    }
}

impl ScopeProvider for ContextCatalog {
    fn scope_for(&self, context_id: &str) -> Option<PermissionScope> {
        self.contexts
            .iter()
            .find(|scope| scope.context_id == context_id)
            .cloned()
    }

    fn metrics(&self) -> Vec<MetricDefinition> {
        self.metrics.clone()
    }
}
