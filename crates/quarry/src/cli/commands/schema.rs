use anyhow::{Context, Error, Result};
use clap::{Args, ValueEnum};
use serde_json::json;

use super::{load_catalog, open_store, require_scope};
use crate::config::RuntimePaths;
use crate::introspect;
use crate::models::{QueryEnvelope, QueryEnvelopeCommandFailure};

const COMMAND: &str = "schema";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SchemaFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Args)]
pub struct SchemaArgs {
    #[arg(long, value_name = "ID")]
    pub context: String,

    #[arg(long, value_enum, default_value_t = SchemaFormat::Text)]
    pub format: SchemaFormat,
}

pub fn run(args: &SchemaArgs, runtime_paths: &RuntimePaths) -> Result<()> {
    let catalog = load_catalog(COMMAND, &runtime_paths.catalog_path)?;
    let scope = require_scope(COMMAND, &catalog, &args.context)?;
    let store = open_store(COMMAND, &runtime_paths.database_path)?;

    let description = introspect::describe(&store, &scope).map_err(|error| {
        Error::new(QueryEnvelopeCommandFailure::runtime(
            QueryEnvelope::error(COMMAND, "introspection_failed", "schema introspection failed")
                .with_error_details(json!({
                    "context_id": args.context,
                    "cause": format!("{error:#}")
                })),
        ))
    })?;

    match args.format {
        SchemaFormat::Text => {
            print!("{}", description.render());
            Ok(())
        }
        SchemaFormat::Json => {
            let data =
                serde_json::to_value(&description).context("failed to encode schema description")?;
            QueryEnvelope::ok(COMMAND, data)
                .with_count("context_id", json!(args.context))
                .with_count("table_count", json!(description.tables.len()))
                .print()
        }
    }
}
