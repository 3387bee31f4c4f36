use quarry::introspect::{SAMPLE_VALUE_LIMIT, describe};
use quarry::models::{PermissionScope, ResultSet};
use quarry::sqlite::SqliteStore;
use quarry::store::{DataStore, ExecutionError, ForeignKey, TableAccess, TableColumn};
use rusqlite::Connection;

fn seeded_store() -> SqliteStore {
    let connection = Connection::open_in_memory().expect("in-memory sqlite should open");
    connection
        .execute_batch(
            "CREATE TABLE warehouse (id INTEGER PRIMARY KEY, name TEXT NOT NULL, region TEXT);
             CREATE TABLE inventory_balance (
                 item_id TEXT NOT NULL,
                 warehouse_id INTEGER NOT NULL REFERENCES warehouse(id),
                 quantity_on_hand REAL,
                 stock_status TEXT
             );
             CREATE TABLE payroll (employee TEXT, salary REAL);
             INSERT INTO warehouse VALUES (1, 'Mumbai', 'South'), (2, 'Delhi', 'North'), (3, 'Pune', 'South');
             INSERT INTO inventory_balance VALUES
                 ('RM-001', 1, 150.0, 'low'),
                 ('RM-002', 2, 1300.0, 'in_stock'),
                 ('RM-003', 3, NULL, NULL);",
        )
        .expect("seed should apply");
    SqliteStore::from_connection(connection).expect("store should wrap connection")
}

fn inventory_scope() -> PermissionScope {
    let mut scope = PermissionScope::new(
        "inventory",
        ["inventory_balance", "warehouse", "missing_table"],
    );
    scope.name = "Inventory".to_string();
    scope.primary_table = Some("inventory_balance".to_string());
    scope
}

#[test]
fn renders_allowed_tables_with_keys_and_samples() {
    let store = seeded_store();
    let description = describe(&store, &inventory_scope()).expect("schema should describe");

    insta::assert_snapshot!(description.render(), @r"
    DATABASE: SQLite
    CONTEXT: Inventory (primary table: inventory_balance)
    AVAILABLE TABLES AND COLUMNS:

    Table: inventory_balance
    Columns:
      - item_id (TEXT) NOT NULL
      - warehouse_id (INTEGER) NOT NULL
      - quantity_on_hand (REAL) NULL
      - stock_status (TEXT) NULL
    Foreign Keys:
      - warehouse_id -> warehouse.id
    Sample Values:
      - stock_status: in_stock, low

    Table: warehouse
    Columns:
      - id (INTEGER) NULL
      - name (TEXT) NOT NULL
      - region (TEXT) NULL
    Sample Values:
      - region: North, South
    ");
}

#[test]
fn skips_tables_missing_from_the_database_and_hides_unscoped_ones() {
    let store = seeded_store();
    let description = describe(&store, &inventory_scope()).expect("schema should describe");

    let names = description
        .tables
        .iter()
        .map(|table| table.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["inventory_balance", "warehouse"]);
    assert!(description.table("payroll").is_none());
    assert!(!description.render().contains("salary"));
}

#[test]
fn empty_scope_cannot_be_described() {
    let store = seeded_store();
    let scope = PermissionScope::new("empty", Vec::<String>::new());
    assert!(describe(&store, &scope).is_err());
}

/// Delegates metadata to SQLite but fails every sample lookup.
struct SampleFailingStore(SqliteStore);

impl DataStore for SampleFailingStore {
    fn dialect(&self) -> &'static str {
        self.0.dialect()
    }

    fn list_tables(&self) -> anyhow::Result<Vec<String>> {
        self.0.list_tables()
    }

    fn table_columns(&self, table: &str) -> anyhow::Result<Vec<TableColumn>> {
        self.0.table_columns(table)
    }

    fn foreign_keys(&self, table: &str) -> anyhow::Result<Vec<ForeignKey>> {
        self.0.foreign_keys(table)
    }

    fn distinct_values(
        &self,
        table: &str,
        _column: &str,
        _limit: usize,
    ) -> anyhow::Result<Vec<String>> {
        anyhow::bail!("permission denied reading {table}")
    }

    fn execute(
        &self,
        sql: &str,
        access: TableAccess<'_>,
        row_cap: usize,
    ) -> Result<ResultSet, ExecutionError> {
        self.0.execute(sql, access, row_cap)
    }
}

#[test]
fn sample_failures_do_not_fail_the_description() {
    let store = SampleFailingStore(seeded_store());
    let description = describe(&store, &inventory_scope()).expect("schema should describe");

    assert_eq!(description.tables.len(), 2);
    assert!(
        description
            .tables
            .iter()
            .all(|table| table.sample_values.is_empty())
    );
}

#[test]
fn sample_values_are_capped() {
    let connection = Connection::open_in_memory().expect("in-memory sqlite should open");
    connection
        .execute_batch("CREATE TABLE shipment (id INTEGER PRIMARY KEY, status TEXT);")
        .expect("schema should apply");
    for index in 0..25 {
        connection
            .execute(
                "INSERT INTO shipment (status) VALUES (?1)",
                [format!("status-{index:02}")],
            )
            .expect("row should insert");
    }
    let store = SqliteStore::from_connection(connection).expect("store should wrap connection");

    let description = describe(&store, &PermissionScope::new("logistics", ["shipment"]))
        .expect("schema should describe");
    let samples = &description.tables[0].sample_values["status"];
    assert_eq!(samples.len(), SAMPLE_VALUE_LIMIT);
    assert_eq!(samples[0], "status-00");
}
