use anyhow::Result;
use clap::Args;
use serde_json::{Value, json};

use super::load_catalog;
use crate::config::RuntimePaths;
use crate::models::QueryEnvelope;

const COMMAND: &str = "contexts";

#[derive(Debug, Clone, Args)]
pub struct ContextsArgs {
    #[arg(long, default_value_t = false)]
    pub verbose: bool,
}

pub fn run(args: &ContextsArgs, runtime_paths: &RuntimePaths) -> Result<()> {
    let catalog = load_catalog(COMMAND, &runtime_paths.catalog_path)?;

    let contexts = catalog
        .contexts
        .iter()
        .map(|scope| {
            let mut entry = json!({
                "context_id": scope.context_id,
                "name": scope.display_name(),
                "primary_table": scope.primary_table,
                "allowed_tables": scope.allowed_tables,
                "allowed_metrics": scope.allowed_metrics,
            });
            if args.verbose {
                entry["allowed_columns"] = json!(scope.allowed_columns);
            }
            entry
        })
        .collect::<Vec<Value>>();
    let metrics = catalog
        .metrics
        .iter()
        .map(|metric| {
            let mut entry = json!({
                "name": metric.name,
                "aliases": metric.aliases,
                "description": metric.description,
            });
            if args.verbose {
                entry["sql"] = json!(metric.sql);
            }
            entry
        })
        .collect::<Vec<Value>>();

    QueryEnvelope::ok(
        COMMAND,
        json!({
            "contexts": contexts,
            "metrics": metrics,
        }),
    )
    .with_count("context_count", json!(catalog.contexts.len()))
    .with_count("metric_count", json!(catalog.metrics.len()))
    .with_count(
        "catalog_path",
        json!(runtime_paths.catalog_path.display().to_string()),
    )
    .print()
}
