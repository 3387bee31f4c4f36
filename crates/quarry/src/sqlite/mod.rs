use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags};
use serde_json::{Map, Value, json};

use crate::models::{PermissionScope, ResultSet};
use crate::store::{DataStore, ExecutionError, ForeignKey, TableAccess, TableColumn};

pub const SQLITE_DIALECT: &str = "SQLite";

/// Read-only SQLite data store. The connection is opened without write
/// access and `query_only` is switched on, so the database refuses writes
/// even if a statement slips past validation. Scoped execution also installs
/// an authorizer that denies reads of tables outside the scope.
pub struct SqliteStore {
    connection: Connection,
}

impl SqliteStore {
    pub fn open_read_only(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!("sqlite database does not exist: {}", path.display());
        }

        let connection = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open sqlite database: {}", path.display()))?;
        Self::from_connection(connection)
    }

    /// Wraps an existing connection (for example a seeded in-memory database)
    /// and locks it into read-only mode.
    pub fn from_connection(connection: Connection) -> Result<Self> {
        connection
            .execute_batch("PRAGMA query_only = ON;")
            .context("failed to enable sqlite query_only mode")?;
        Ok(Self { connection })
    }
}

impl DataStore for SqliteStore {
    fn dialect(&self) -> &'static str {
        SQLITE_DIALECT
    }

    fn list_tables(&self) -> Result<Vec<String>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT name
                 FROM sqlite_schema
                 WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
                 ORDER BY name ASC",
            )
            .context("failed to prepare sqlite_schema introspection query")?;

        let rows = statement
            .query_map([], |row| row.get::<usize, String>(0))
            .context("failed to execute sqlite_schema introspection query")?;

        rows.map(|row| row.context("failed to decode sqlite_schema row"))
            .collect()
    }

    fn table_columns(&self, table: &str) -> Result<Vec<TableColumn>> {
        let pragma_sql = format!("PRAGMA table_info({})", sqlite_single_quoted(table));
        let mut statement = self
            .connection
            .prepare(&pragma_sql)
            .with_context(|| format!("failed to prepare column introspection for `{table}`"))?;

        let column_rows = statement
            .query_map([], |row| {
                Ok(TableColumn {
                    ordinal: row.get::<usize, i64>(0)?,
                    name: row.get::<usize, String>(1)?,
                    declared_type: row
                        .get::<usize, Option<String>>(2)?
                        .filter(|declared| !declared.trim().is_empty()),
                    nullable: row.get::<usize, i64>(3)? == 0,
                    primary_key_position: row.get::<usize, i64>(5)?,
                })
            })
            .with_context(|| format!("failed to execute column introspection for `{table}`"))?;

        column_rows
            .map(|row| row.context("failed to decode table column row"))
            .collect()
    }

    fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKey>> {
        let pragma_sql = format!("PRAGMA foreign_key_list({})", sqlite_single_quoted(table));
        let mut statement = self
            .connection
            .prepare(&pragma_sql)
            .with_context(|| format!("failed to prepare foreign key introspection for `{table}`"))?;

        let key_rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<usize, i64>(0)?,
                    row.get::<usize, String>(2)?,
                    row.get::<usize, String>(3)?,
                    row.get::<usize, Option<String>>(4)?,
                ))
            })
            .with_context(|| format!("failed to execute foreign key introspection for `{table}`"))?;

        // One constraint spans several rows (one per column), keyed by id.
        let mut grouped = BTreeMap::<i64, ForeignKey>::new();
        for row in key_rows {
            let (id, referred_table, from_column, to_column) =
                row.context("failed to decode foreign key row")?;
            let key = grouped.entry(id).or_insert_with(|| ForeignKey {
                from_columns: Vec::new(),
                referred_table,
                referred_columns: Vec::new(),
            });
            key.from_columns.push(from_column);
            if let Some(to_column) = to_column {
                key.referred_columns.push(to_column);
            }
        }

        Ok(grouped.into_values().collect())
    }

    fn distinct_values(&self, table: &str, column: &str, limit: usize) -> Result<Vec<String>> {
        let column = sqlite_identifier(column);
        let sql = format!(
            "SELECT DISTINCT {column} FROM {} WHERE {column} IS NOT NULL ORDER BY {column} LIMIT {limit}",
            sqlite_identifier(table)
        );
        let mut statement = self
            .connection
            .prepare(&sql)
            .with_context(|| format!("failed to prepare sample query for `{table}`"))?;
        let values = statement
            .query_map([], |row| row.get::<usize, SqlValue>(0))
            .with_context(|| format!("failed to execute sample query for `{table}`"))?;

        values
            .map(|value| {
                value
                    .map(sample_text_from_sql)
                    .context("failed to decode sample value")
            })
            .collect()
    }

    fn execute(
        &self,
        sql: &str,
        access: TableAccess<'_>,
        row_cap: usize,
    ) -> Result<ResultSet, ExecutionError> {
        let TableAccess::Scoped(scope) = access else {
            return execute_read_only_query(&self.connection, sql, row_cap)
                .map_err(|error| ExecutionError::new(error.to_string()));
        };

        let denied = install_scope_authorizer(&self.connection, scope);
        let executed = execute_read_only_query(&self.connection, sql, row_cap);
        self.connection
            .authorizer(None::<fn(AuthContext<'_>) -> Authorization>);

        executed.map_err(|error| {
            let denied_table = denied.lock().ok().and_then(|mut slot| slot.take());
            match denied_table {
                Some(table) => {
                    tracing::warn!(
                        context_id = %scope.context_id,
                        table = %table,
                        "sqlite denied out-of-scope read"
                    );
                    ExecutionError::out_of_scope(table)
                }
                None => ExecutionError::new(error.to_string()),
            }
        })
    }
}

/// Denies `SQLITE_READ` on any table the scope does not list. Reads made on
/// behalf of a view are judged by the view's name. The first denied table is
/// recorded in the returned slot.
fn install_scope_authorizer(
    connection: &Connection,
    scope: &PermissionScope,
) -> Arc<Mutex<Option<String>>> {
    let allowed = scope
        .allowed_tables
        .iter()
        .map(|table| table.to_ascii_lowercase())
        .collect::<BTreeSet<_>>();
    let denied = Arc::new(Mutex::new(None::<String>));
    let slot = Arc::clone(&denied);

    connection.authorizer(Some(move |context: AuthContext<'_>| {
        let AuthAction::Read { table_name, .. } = context.action else {
            return Authorization::Allow;
        };
        let owner = context.accessor.unwrap_or(table_name);
        if allowed.contains(&owner.to_ascii_lowercase()) {
            return Authorization::Allow;
        }
        if let Ok(mut slot) = slot.lock() {
            slot.get_or_insert_with(|| owner.to_string());
        }
        Authorization::Deny
    }));

    denied
}

fn execute_read_only_query(
    connection: &Connection,
    sql: &str,
    row_cap: usize,
) -> rusqlite::Result<ResultSet> {
    let row_cap = row_cap.max(1);
    let mut statement = connection.prepare(sql)?;
    let column_names = unique_column_names(&statement.column_names());

    let mut rows = statement.query([])?;
    let mut result_rows = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next()? {
        if result_rows.len() >= row_cap {
            truncated = true;
            break;
        }

        let mut record = Map::new();
        for (index, column_name) in column_names.iter().enumerate() {
            let value = row.get::<usize, SqlValue>(index)?;
            record.insert(column_name.clone(), json_value_from_sql(value));
        }
        result_rows.push(record);
    }

    Ok(ResultSet::new(column_names, result_rows).with_truncated(truncated))
}

/// Rows are keyed by column name, so repeated select-list names (`a.id, b.id`)
/// get a numeric suffix: `id`, `id_2`.
fn unique_column_names(raw_names: &[&str]) -> Vec<String> {
    let mut taken = BTreeSet::new();
    let mut names = Vec::with_capacity(raw_names.len());
    for raw in raw_names {
        let mut name = (*raw).to_string();
        let mut suffix = 2;
        while !taken.insert(name.to_ascii_lowercase()) {
            name = format!("{raw}_{suffix}");
            suffix += 1;
        }
        names.push(name);
    }
    names
}

fn json_value_from_sql(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(value) => json!(value),
        SqlValue::Real(value) => json!(value),
        SqlValue::Text(value) => json!(value),
        SqlValue::Blob(value) => json!(encode_blob_hex(&value)),
    }
}

fn sample_text_from_sql(value: SqlValue) -> String {
    match value {
        SqlValue::Null => String::new(),
        SqlValue::Integer(value) => value.to_string(),
        SqlValue::Real(value) => value.to_string(),
        SqlValue::Text(value) => value,
        SqlValue::Blob(value) => encode_blob_hex(&value),
    }
}

fn encode_blob_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push(HEX[(byte >> 4) as usize] as char);
        output.push(HEX[(byte & 0x0f) as usize] as char);
    }
    output
}

fn sqlite_single_quoted(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn sqlite_identifier(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}
