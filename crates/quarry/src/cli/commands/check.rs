use anyhow::{Error, Result};
use clap::Args;
use serde_json::json;

use super::{load_catalog, require_scope};
use crate::config::RuntimePaths;
use crate::models::{QueryEnvelope, QueryEnvelopeCommandFailure};
use crate::validate::{ReadOnlyValidator, SafetyValidator, check_read_only, referenced_tables};

const COMMAND: &str = "check";

#[derive(Debug, Clone, Args)]
pub struct CheckArgs {
    #[arg(value_name = "SQL")]
    pub sql: String,

    /// Also check table references against this context's scope.
    #[arg(long, value_name = "ID")]
    pub context: Option<String>,
}

pub fn run(args: &CheckArgs, runtime_paths: &RuntimePaths) -> Result<()> {
    let verdict = match &args.context {
        Some(context_id) => {
            let catalog = load_catalog(COMMAND, &runtime_paths.catalog_path)?;
            let scope = require_scope(COMMAND, &catalog, context_id)?;
            ReadOnlyValidator::default().check(&args.sql, &scope)
        }
        None => check_read_only(&args.sql),
    };

    let tables = referenced_tables(&args.sql);
    match verdict {
        Ok(()) => QueryEnvelope::ok(
            COMMAND,
            json!({
                "safe": true,
                "referenced_tables": tables,
            }),
        )
        .with_count("table_scope_checked", json!(args.context.is_some()))
        .print(),
        Err(violation) => {
            let envelope = QueryEnvelope::error(COMMAND, violation.kind.as_str(), &violation.message)
                .with_data(json!({
                    "safe": false,
                    "referenced_tables": tables,
                }))
                .with_count("table_scope_checked", json!(args.context.is_some()))
                .with_error_details(violation.details());
            Err(Error::new(QueryEnvelopeCommandFailure::rejection(envelope)))
        }
    }
}
