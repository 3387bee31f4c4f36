pub mod ask;
pub mod check;
pub mod contexts;
pub mod schema;

use std::path::Path;

use anyhow::{Error, Result};
use serde_json::json;

use crate::models::{PermissionScope, QueryEnvelope, QueryEnvelopeCommandFailure};
use crate::scope::{ContextCatalog, ScopeProvider};
use crate::sqlite::SqliteStore;

fn load_catalog(command: &str, catalog_path: &Path) -> Result<ContextCatalog> {
    ContextCatalog::load(catalog_path).map_err(|error| {
        Error::new(QueryEnvelopeCommandFailure::runtime(
            QueryEnvelope::error(command, "catalog_unavailable", "unable to load context catalog")
                .with_error_details(json!({
                    "catalog_path": catalog_path.display().to_string(),
                    "cause": format!("{error:#}")
                })),
        ))
    })
}

fn open_store(command: &str, database_path: &Path) -> Result<SqliteStore> {
    SqliteStore::open_read_only(database_path).map_err(|error| {
        Error::new(QueryEnvelopeCommandFailure::runtime(
            QueryEnvelope::error(command, "database_unavailable", "unable to open database")
                .with_error_details(json!({
                    "database_path": database_path.display().to_string(),
                    "cause": format!("{error:#}")
                })),
        ))
    })
}

fn require_scope(
    command: &str,
    catalog: &ContextCatalog,
    context_id: &str,
) -> Result<PermissionScope> {
    catalog.scope_for(context_id).ok_or_else(|| {
        Error::new(QueryEnvelopeCommandFailure::rejection(
            QueryEnvelope::error(
                command,
                "scope_unavailable",
                format!("no permission scope is registered for context `{context_id}`"),
            )
            .with_error_details(json!({
                "context_id": context_id,
                "known_contexts": catalog.context_ids(),
            })),
        ))
    })
}
