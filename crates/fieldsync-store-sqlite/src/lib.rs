use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use fieldsync_core::schema::{CREATED_AT_COLUMN, ID_COLUMN, LAST_UPDATED_COLUMN, REV_COLUMN};
use fieldsync_core::{
    field_catalog, quote_ident, quote_literal, strip_version_fields, Catalog, CoreError,
    DataSource, Expr, JsonColumnDecoder, MergeQuery, Row, Select, SortOrder, SqlValue, SyncConfig,
    TableDef, TableResolver, VersionStamp, SOURCE_COLUMN,
};
use rusqlite::{params, params_from_iter, Connection, DatabaseName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::info;
use ulid::Ulid;

mod convert;
mod versioned;

use convert::{fetch_rows, to_sqlite};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

/// Conditions callers are expected to detect with `anyhow::Error::downcast_ref`.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("version {version_num} of chain {chain_id} in {table} already exists")]
    VersionConflict { table: String, chain_id: String, version_num: i64 },
    #[error("table {0} is not versioned")]
    NotVersioned(String),
    #[error("version chain {chain_id} not found in {table}")]
    MissingChain { table: String, chain_id: String },
}

pub struct SqliteStore {
    conn: Connection,
    resolver: TableResolver,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishRequest {
    pub table: String,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishSummary {
    pub table: String,
    /// Distinct ids in the request; repeats are published once.
    pub requested: usize,
    /// Local rows copied into the synced table.
    pub published: usize,
    /// Local rows removed while a synced row with the same id was kept.
    pub already_synced: usize,
    /// Requested ids with no local row.
    pub missing: usize,
}

impl SqliteStore {
    /// Open a store over `catalog` and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the catalog or config is invalid, the database
    /// cannot be opened, or pragmas cannot be applied.
    pub fn open(path: &Path, catalog: Catalog, config: SyncConfig) -> Result<Self> {
        let resolver = TableResolver::new(catalog, &config).context("invalid store configuration")?;
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            config.busy_timeout_ms
        ))
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, resolver })
    }

    /// Open with the built-in field catalog and default naming.
    ///
    /// # Errors
    /// Same as [`Self::open`].
    pub fn open_default(path: &Path) -> Result<Self> {
        Self::open(path, field_catalog(), SyncConfig::default())
    }

    #[must_use]
    pub fn resolver(&self) -> &TableResolver {
        &self.resolver
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        self.resolver.config()
    }

    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        self.resolver.synced_catalog()
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations: v1 creates both table families, v2 the union views.
    ///
    /// # Errors
    /// Returns an error when any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration(1, &family_tables_sql(&self.resolver))?;
            version = 1;
        }

        if version < 2 {
            self.apply_migration(2, &union_views_sql(&self.resolver))?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        record_schema_version(&tx, version)?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        info!(version, "applied schema migration");
        Ok(())
    }

    /// Insert `row` into the chosen family and return the stored row.
    ///
    /// Missing `id`, `created_at` and `last_updated` are filled in. Rows of a
    /// versioned table without version fields start a new chain.
    ///
    /// # Errors
    /// Returns an error for unknown tables or columns and on constraint failures.
    pub fn insert(&mut self, table: &str, source: DataSource, row: Row) -> Result<Row> {
        let handle = self.resolver.resolve_source(table, source)?;
        let mut row = prepare_new_row(handle.def, row)?;
        if handle.def.versioned && VersionStamp::from_row(&row).is_err() {
            let id = row_id(&row)?;
            VersionStamp::first(&id).apply(&mut row);
        }
        let id = row_id(&row)?;
        insert_row(&self.conn, handle.physical, handle.def, &row)
            .with_context(|| format!("failed to insert into {}", handle.physical))?;
        self.find_by_id(table, source, &id)?
            .ok_or_else(|| anyhow!("inserted row {id} vanished from {}", handle.physical))
    }

    /// Apply `changes` to one row. Versioned rows get their `rev` bumped.
    ///
    /// Version fields and the id in `changes` are ignored.
    ///
    /// # Errors
    /// Returns an error for unknown tables or columns and on write failures.
    pub fn update(
        &mut self,
        table: &str,
        source: DataSource,
        id: &str,
        mut changes: Row,
    ) -> Result<Option<Row>> {
        let handle = self.resolver.resolve_source(table, source)?;
        strip_version_fields(&mut changes);
        changes.remove(ID_COLUMN);
        changes.remove(SOURCE_COLUMN);
        ensure_known_columns(handle.def, &changes)?;
        changes.insert(LAST_UPDATED_COLUMN.to_string(), Value::String(now_rfc3339()?));

        let mut assignments = changes
            .keys()
            .enumerate()
            .map(|(index, column)| format!("{} = ?{}", quote_ident(column), index + 1))
            .collect::<Vec<_>>();
        if handle.def.versioned {
            assignments.push(format!("{0} = {0} + 1", quote_ident(REV_COLUMN)));
        }
        let mut values = changes
            .iter()
            .map(|(column, value)| to_sqlite(value, handle.def.column(column).map(|c| c.column_type)))
            .collect::<Vec<_>>();
        values.push(rusqlite::types::Value::Text(id.to_string()));

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            quote_ident(handle.physical),
            assignments.join(", "),
            quote_ident(ID_COLUMN),
            values.len()
        );
        let changed = self
            .conn
            .execute(&sql, params_from_iter(values))
            .with_context(|| format!("failed to update {id} in {}", handle.physical))?;
        if changed == 0 {
            return Ok(None);
        }
        self.find_by_id(table, source, id)
    }

    /// # Errors
    /// Returns an error for unknown tables or when the read fails.
    pub fn find_by_id(&self, table: &str, source: DataSource, id: &str) -> Result<Option<Row>> {
        let select = Select::from(table).filter(Expr::col(ID_COLUMN).equals(id));
        let sql = select.render(&self.resolver, source)?;
        Ok(self.read_table(table, &sql)?.into_iter().next())
    }

    /// All rows of one family, oldest first.
    ///
    /// # Errors
    /// Returns an error for unknown tables or when the read fails.
    pub fn list(&self, table: &str, source: DataSource) -> Result<Vec<Row>> {
        let select = Select::from(table)
            .order_by(CREATED_AT_COLUMN, SortOrder::Asc)
            .order_by(ID_COLUMN, SortOrder::Asc);
        let sql = select.render(&self.resolver, source)?;
        self.read_table(table, &sql)
    }

    /// # Errors
    /// Returns an error for unknown tables or when the delete fails.
    pub fn delete(&mut self, table: &str, source: DataSource, id: &str) -> Result<bool> {
        let handle = self.resolver.resolve_source(table, source)?;
        let deleted = self
            .conn
            .execute(
                &format!(
                    "DELETE FROM {} WHERE {} = ?1",
                    quote_ident(handle.physical),
                    quote_ident(ID_COLUMN)
                ),
                params![id],
            )
            .with_context(|| format!("failed to delete {id} from {}", handle.physical))?;
        Ok(deleted > 0)
    }

    /// Run a structured query over both families; every row carries `source`.
    ///
    /// # Errors
    /// Returns an error when the query does not resolve or execution fails.
    pub fn merge_select(&self, select: &Select) -> Result<Vec<Row>> {
        let sql = MergeQuery::new(select.clone()).render(&self.resolver)?;
        let decoder = JsonColumnDecoder::for_select(self.catalog(), select);
        let mut rows = fetch_rows(&self.conn, &sql)?;
        decoder.decode_rows(&mut rows);
        Ok(rows)
    }

    /// Run SQL text over both families; every row carries `source`.
    ///
    /// Usage errors such as aliased tables are reported before anything runs.
    ///
    /// # Errors
    /// Returns the [`CoreError`] from rewriting, or an error when execution fails.
    pub fn merge_sql(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let merged = fieldsync_core::merge_sql(sql, params, self.catalog(), self.config())?;
        let decoder = JsonColumnDecoder::for_sql(self.catalog(), &merged, self.config())?;
        let mut rows = fetch_rows(&self.conn, &merged)?;
        decoder.decode_rows(&mut rows);
        Ok(rows)
    }

    /// Rows of the persisted union view: synced rows plus unsynced local drafts.
    ///
    /// # Errors
    /// Returns an error for unknown tables or before the v2 migration.
    pub fn list_union(&self, table: &str) -> Result<Vec<Row>> {
        let view = self.resolver.union_view(table)?;
        let sql = format!(
            "SELECT * FROM {} ORDER BY {}",
            quote_ident(&view),
            quote_ident(ID_COLUMN)
        );
        self.read_table(table, &sql)
    }

    /// Move local rows of one table into the synced family.
    ///
    /// # Errors
    /// Same as [`Self::publish_batch`].
    pub fn publish(&mut self, table: &str, ids: &[String]) -> Result<PublishSummary> {
        let request = PublishRequest { table: table.to_string(), ids: ids.to_vec() };
        self.publish_batch(&[request])?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("publish produced no summary for {table}"))
    }

    /// Move local rows into the synced family in one transaction.
    ///
    /// Rows are copied with `INSERT OR IGNORE`, so an id that already exists in
    /// the synced table keeps the synced row; the local draft is removed either
    /// way. Foreign keys are checked at commit, so parents and children can be
    /// published together.
    ///
    /// # Errors
    /// Returns an error for unknown tables, or when the move would leave a
    /// foreign key dangling.
    pub fn publish_batch(&mut self, requests: &[PublishRequest]) -> Result<Vec<PublishSummary>> {
        let tx = self.conn.transaction().context("failed to start publish transaction")?;
        tx.execute_batch("PRAGMA defer_foreign_keys = ON;")
            .context("failed to defer foreign keys for publish")?;

        let mut summaries = Vec::with_capacity(requests.len());
        for request in requests {
            let synced = self.resolver.resolve_source(&request.table, DataSource::Synced)?;
            let local = self.resolver.resolve_source(&request.table, DataSource::Local)?;
            let columns = synced
                .def
                .column_names()
                .into_iter()
                .map(quote_ident)
                .collect::<Vec<_>>()
                .join(", ");
            let copy_sql = format!(
                "INSERT OR IGNORE INTO {} ({columns}) SELECT {columns} FROM {} WHERE {} = ?1",
                quote_ident(synced.physical),
                quote_ident(local.physical),
                quote_ident(ID_COLUMN)
            );
            let delete_sql = format!(
                "DELETE FROM {} WHERE {} = ?1",
                quote_ident(local.physical),
                quote_ident(ID_COLUMN)
            );

            let mut seen = BTreeSet::new();
            let ids = request.ids.iter().filter(|id| seen.insert(id.as_str())).collect::<Vec<_>>();
            let mut published = 0;
            let mut removed = 0;
            for id in &ids {
                published += tx
                    .execute(&copy_sql, params![id])
                    .with_context(|| format!("failed to publish {id} into {}", synced.physical))?;
                removed += tx
                    .execute(&delete_sql, params![id])
                    .with_context(|| format!("failed to remove {id} from {}", local.physical))?;
            }
            info!(table = %request.table, published, removed, "published local rows");
            summaries.push(PublishSummary {
                table: request.table.clone(),
                requested: ids.len(),
                published,
                already_synced: removed - published,
                missing: ids.len().saturating_sub(removed),
            });
        }

        tx.commit().context("failed to commit publish; a foreign key would be left dangling")?;
        Ok(summaries)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    /// Execute `sql` and decode the JSON columns of `table`.
    fn read_table(&self, table: &str, sql: &str) -> Result<Vec<Row>> {
        let mut rows = fetch_rows(&self.conn, sql)?;
        JsonColumnDecoder::for_tables(self.catalog(), [table]).decode_rows(&mut rows);
        Ok(rows)
    }
}

/// DDL of migration v1: both table families plus foreign key indexes.
fn family_tables_sql(resolver: &TableResolver) -> String {
    let mut sql = String::new();
    for catalog in [resolver.synced_catalog(), resolver.local_catalog()] {
        for table in &catalog.tables {
            sql.push_str(&table.create_sql());
            sql.push('\n');
            for (column, _) in table.foreign_keys() {
                sql.push_str(&format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {}({});\n",
                    quote_ident(&format!("idx_{}_{column}", table.name)),
                    quote_ident(&table.name),
                    quote_ident(column)
                ));
            }
        }
    }
    sql
}

/// DDL of migration v2: one view per table pair, synced rows winning on id.
fn union_views_sql(resolver: &TableResolver) -> String {
    let config = resolver.config();
    let mut sql = String::new();
    for table in resolver.paired_tables() {
        let (Ok(synced), Ok(local), Ok(view)) = (
            resolver.resolve_source(table, DataSource::Synced),
            resolver.resolve_source(table, DataSource::Local),
            resolver.union_view(table),
        ) else {
            continue;
        };
        let columns = synced
            .def
            .column_names()
            .into_iter()
            .map(quote_ident)
            .collect::<Vec<_>>()
            .join(", ");
        let id = quote_ident(ID_COLUMN);
        sql.push_str(&format!(
            "CREATE VIEW IF NOT EXISTS {view} AS \
             SELECT {synced_tag} AS {source}, {columns} FROM {synced_table} \
             UNION ALL \
             SELECT {local_tag} AS {source}, {columns} FROM {local_table} \
             WHERE {id} NOT IN (SELECT {id} FROM {synced_table});\n",
            view = quote_ident(&view),
            synced_tag = quote_literal(DataSource::Synced.tag(config)),
            local_tag = quote_literal(DataSource::Local.tag(config)),
            source = quote_ident(SOURCE_COLUMN),
            synced_table = quote_ident(synced.physical),
            local_table = quote_ident(local.physical),
        ));
    }
    sql
}

fn ensure_known_columns(def: &TableDef, row: &Row) -> Result<()> {
    for column in row.keys() {
        if !def.has_column(column) {
            return Err(CoreError::UnknownColumn {
                table: def.name.clone(),
                column: column.clone(),
            }
            .into());
        }
    }
    Ok(())
}

/// Fill the id and timestamps of a row about to be inserted.
fn prepare_new_row(def: &TableDef, mut row: Row) -> Result<Row> {
    row.remove(SOURCE_COLUMN);
    ensure_known_columns(def, &row)?;
    if !row.get(ID_COLUMN).is_some_and(Value::is_string) {
        row.insert(ID_COLUMN.to_string(), Value::String(Ulid::new().to_string()));
    }
    let now = now_rfc3339()?;
    for column in [CREATED_AT_COLUMN, LAST_UPDATED_COLUMN] {
        if def.has_column(column) && !row.contains_key(column) {
            row.insert(column.to_string(), Value::String(now.clone()));
        }
    }
    Ok(row)
}

fn row_id(row: &Row) -> Result<String> {
    row.get(ID_COLUMN)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("row has no text id"))
}

fn insert_row(conn: &Connection, physical: &str, def: &TableDef, row: &Row) -> rusqlite::Result<usize> {
    let columns = row.keys().map(|column| quote_ident(column)).collect::<Vec<_>>();
    let placeholders = (1..=columns.len()).map(|index| format!("?{index}")).collect::<Vec<_>>();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(physical),
        columns.join(", "),
        placeholders.join(", ")
    );
    let values = row
        .iter()
        .map(|(column, value)| to_sqlite(value, def.column(column).map(|c| c.column_type)));
    conn.execute(&sql, params_from_iter(values))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
