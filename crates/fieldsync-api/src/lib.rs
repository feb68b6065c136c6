//! Async context object over one field database.
//!
//! [`FieldSync`] is built once per database and handed to whoever needs
//! data access. Every call is executed by a [`StoreExecutor`], so all reads
//! and writes against the file are serialized through one thread.

use std::path::{Path, PathBuf};

use anyhow::Result;
use fieldsync_core::{Catalog, DataSource, Direction, Row, Select, SqlValue, SyncConfig};
use fieldsync_store_sqlite::{
    IntegrityReport, PublishRequest, PublishSummary, SchemaStatus, SqliteStore,
};
use serde::{Deserialize, Serialize};
use tracing::info;

mod executor;

pub use executor::{ExecutorError, StoreExecutor};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

pub struct FieldSync {
    db_path: PathBuf,
    catalog: Catalog,
    config: SyncConfig,
    executor: StoreExecutor,
}

impl FieldSync {
    /// Open the database at `path` and start its executor.
    ///
    /// # Errors
    /// Returns an error when the catalog or config is invalid or the database cannot be opened.
    pub fn open(path: &Path, catalog: Catalog, config: SyncConfig) -> Result<Self> {
        let store = SqliteStore::open(path, catalog.clone(), config.clone())?;
        let executor = StoreExecutor::new(store)?;
        info!(path = %path.display(), "opened field database");
        Ok(Self { db_path: path.to_path_buf(), catalog, config, executor })
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub async fn schema_status(&self) -> Result<SchemaStatus> {
        self.executor.run(|store| store.schema_status()).await
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub async fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        self.executor
            .run(move |store| {
                let before = store.schema_status()?;
                if dry_run {
                    return Ok(MigrateResult {
                        dry_run: true,
                        current_version: before.current_version,
                        target_version: before.target_version,
                        would_apply_versions: before.pending_versions,
                        after_version: None,
                        up_to_date: None,
                    });
                }

                store.migrate()?;
                let after = store.schema_status()?;
                Ok(MigrateResult {
                    dry_run: false,
                    current_version: before.current_version,
                    target_version: before.target_version,
                    would_apply_versions: before.pending_versions,
                    after_version: Some(after.current_version),
                    up_to_date: Some(after.pending_versions.is_empty()),
                })
            })
            .await
    }

    /// # Errors
    /// Returns an error when an integrity check fails.
    pub async fn integrity_check(&self) -> Result<IntegrityReport> {
        self.executor.run(|store| store.integrity_check()).await
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub async fn backup(&self, out_file: PathBuf) -> Result<()> {
        self.executor.run(move |store| store.backup_database(&out_file)).await
    }

    /// Structured query over both families.
    ///
    /// # Errors
    /// Returns an error when the query does not resolve or execution fails.
    pub async fn merge_select(&self, select: Select) -> Result<Vec<Row>> {
        self.executor.run(move |store| store.merge_select(&select)).await
    }

    /// SQL text over both families.
    ///
    /// # Errors
    /// Returns an error when the text cannot be rewritten or execution fails.
    pub async fn merge_sql(&self, sql: String, params: Vec<SqlValue>) -> Result<Vec<Row>> {
        self.executor.run(move |store| store.merge_sql(&sql, &params)).await
    }

    /// # Errors
    /// Returns an error for unknown tables or columns and on constraint failures.
    pub async fn insert(&self, table: &str, source: DataSource, row: Row) -> Result<Row> {
        let table = table.to_string();
        self.executor.run(move |store| store.insert(&table, source, row)).await
    }

    /// # Errors
    /// Returns an error for unknown tables or columns and on write failures.
    pub async fn update(
        &self,
        table: &str,
        source: DataSource,
        id: &str,
        changes: Row,
    ) -> Result<Option<Row>> {
        let (table, id) = (table.to_string(), id.to_string());
        self.executor.run(move |store| store.update(&table, source, &id, changes)).await
    }

    /// # Errors
    /// Returns an error for unknown tables or when the read fails.
    pub async fn find_by_id(&self, table: &str, source: DataSource, id: &str) -> Result<Option<Row>> {
        let (table, id) = (table.to_string(), id.to_string());
        self.executor.run(move |store| store.find_by_id(&table, source, &id)).await
    }

    /// # Errors
    /// Returns an error for unknown tables or when the move would orphan a row.
    pub async fn publish(&self, table: &str, ids: Vec<String>) -> Result<PublishSummary> {
        let table = table.to_string();
        self.executor.run(move |store| store.publish(&table, &ids)).await
    }

    /// # Errors
    /// Returns an error for unknown tables or when the move would orphan a row.
    pub async fn publish_batch(&self, requests: Vec<PublishRequest>) -> Result<Vec<PublishSummary>> {
        self.executor.run(move |store| store.publish_batch(&requests)).await
    }

    /// # Errors
    /// Returns an error for unknown or unversioned tables and on insert failures.
    pub async fn create_new(&self, table: &str, source: DataSource, data: Row) -> Result<Row> {
        let table = table.to_string();
        self.executor.run(move |store| store.create_new(&table, source, data)).await
    }

    /// # Errors
    /// Returns `StoreError::VersionConflict` when another writer already extended `base`.
    pub async fn add_version(
        &self,
        table: &str,
        source: DataSource,
        base: Row,
        updates: Row,
    ) -> Result<Row> {
        let table = table.to_string();
        self.executor.run(move |store| store.add_version(&table, source, &base, updates)).await
    }

    /// # Errors
    /// Returns `StoreError::MissingChain` for unknown chains, or
    /// `StoreError::VersionConflict` when every retry lost.
    pub async fn append_version(
        &self,
        table: &str,
        source: DataSource,
        chain_id: &str,
        updates: Row,
    ) -> Result<Row> {
        let (table, chain_id) = (table.to_string(), chain_id.to_string());
        self.executor
            .run(move |store| store.append_version(&table, source, &chain_id, updates))
            .await
    }

    /// # Errors
    /// Returns an error for unknown or unversioned tables.
    pub async fn latest_version(
        &self,
        table: &str,
        source: DataSource,
        chain_id: &str,
    ) -> Result<Option<Row>> {
        let (table, chain_id) = (table.to_string(), chain_id.to_string());
        self.executor.run(move |store| store.get_latest_version(&table, source, &chain_id)).await
    }

    /// # Errors
    /// Returns an error for unknown or unversioned tables.
    pub async fn versions(&self, table: &str, source: DataSource, chain_id: &str) -> Result<Vec<Row>> {
        let (table, chain_id) = (table.to_string(), chain_id.to_string());
        self.executor.run(move |store| store.get_versions(&table, source, &chain_id)).await
    }

    /// # Errors
    /// Returns an error for unknown or unversioned tables.
    pub async fn latest_of_all(&self, table: &str, source: DataSource) -> Result<Vec<Row>> {
        let table = table.to_string();
        self.executor.run(move |store| store.get_latest_of_all(&table, source)).await
    }

    /// # Errors
    /// Returns an error when `record` carries no version fields.
    pub async fn adjacent_version(
        &self,
        table: &str,
        source: DataSource,
        record: Row,
        direction: Direction,
    ) -> Result<Option<Row>> {
        let table = table.to_string();
        self.executor
            .run(move |store| store.get_adjacent_version(&table, source, &record, direction))
            .await
    }

    /// Drain queued work and close the database.
    ///
    /// # Errors
    /// Returns an error when the store thread panicked.
    pub fn shutdown(self) -> Result<()> {
        self.executor.shutdown()?;
        info!(path = %self.db_path.display(), "closed field database");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use fieldsync_core::{field_catalog, Expr, SortOrder};
    use fieldsync_store_sqlite::StoreError;
    use serde_json::{json, Value};
    use ulid::Ulid;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("fieldsync-api-{}.sqlite3", Ulid::new()))
    }

    fn obj(value: Value) -> Row {
        let Value::Object(map) = value else {
            panic!("fixture must be a JSON object");
        };
        map
    }

    fn cleanup(path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
        }
    }

    #[tokio::test]
    async fn migrate_dry_run_then_apply() -> Result<()> {
        let path = unique_temp_db_path();
        let api = FieldSync::open(&path, field_catalog(), SyncConfig::default())?;

        let planned = api.migrate(true).await?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1, 2]);
        assert_eq!(api.schema_status().await?.current_version, 0);

        let applied = api.migrate(false).await?;
        assert_eq!(applied.after_version, Some(2));
        assert_eq!(applied.up_to_date, Some(true));

        api.shutdown()?;
        cleanup(&path);
        Ok(())
    }

    #[tokio::test]
    async fn drafts_merge_and_publish_through_the_context() -> Result<()> {
        let path = unique_temp_db_path();
        let api = FieldSync::open(&path, field_catalog(), SyncConfig::default())?;
        api.migrate(false).await?;

        api.insert("project", DataSource::Synced, obj(json!({"id": "p1", "name": "Live"}))).await?;
        api.insert("project", DataSource::Local, obj(json!({"id": "p2", "name": "Draft"}))).await?;

        let rows = api
            .merge_select(
                Select::from("project")
                    .columns(["id", "name"])
                    .filter(Expr::col("visible").equals(true))
                    .order_by("name", SortOrder::Asc),
            )
            .await?;
        let sources = rows.iter().map(|row| row["source"].clone()).collect::<Vec<_>>();
        assert_eq!(sources, vec![json!("local"), json!("synced")]);

        let textual = api
            .merge_sql(
                r#"SELECT "project"."id" FROM "project" WHERE "project"."id" = ?"#.to_string(),
                vec![SqlValue::from("p2")],
            )
            .await?;
        assert_eq!(textual.len(), 1);
        assert_eq!(textual[0]["source"], json!("local"));

        let summary = api.publish("project", vec!["p2".to_string()]).await?;
        assert_eq!(summary.published, 1);
        assert!(api.find_by_id("project", DataSource::Synced, "p2").await?.is_some());
        assert!(api.find_by_id("project", DataSource::Local, "p2").await?.is_none());

        api.shutdown()?;
        cleanup(&path);
        Ok(())
    }

    #[tokio::test]
    async fn version_chain_operations_round_trip() -> Result<()> {
        let path = unique_temp_db_path();
        let api = FieldSync::open(&path, field_catalog(), SyncConfig::default())?;
        api.migrate(false).await?;

        let first = api
            .create_new("language", DataSource::Local, obj(json!({"english_name": "Tigrinya"})))
            .await?;
        let Some(chain_id) = first["version_chain_id"].as_str().map(str::to_string) else {
            panic!("created row must carry its chain id");
        };
        let second = api
            .add_version("language", DataSource::Local, first.clone(), obj(json!({"locale": "ti"})))
            .await?;
        let third = api.append_version("language", DataSource::Local, &chain_id, Row::new()).await?;
        assert_eq!(third["version_num"], json!(3));
        assert_eq!(third["locale"], json!("ti"));

        let Err(err) = api.add_version("language", DataSource::Local, first, Row::new()).await else {
            panic!("stale base must conflict");
        };
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::VersionConflict { version_num: 2, .. })
        ));

        let latest = api.latest_version("language", DataSource::Local, &chain_id).await?;
        assert_eq!(latest.map(|row| row["id"].clone()), Some(third["id"].clone()));
        assert_eq!(api.versions("language", DataSource::Local, &chain_id).await?.len(), 3);
        assert_eq!(api.latest_of_all("language", DataSource::Local).await?.len(), 1);
        let previous = api
            .adjacent_version("language", DataSource::Local, third, Direction::Previous)
            .await?;
        assert_eq!(previous.map(|row| row["id"].clone()), Some(second["id"].clone()));

        api.shutdown()?;
        cleanup(&path);
        Ok(())
    }
}
