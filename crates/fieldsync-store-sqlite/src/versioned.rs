//! Versioned entities: a new version is a new row in the same chain.

use anyhow::{Context, Result};
use fieldsync_core::schema::{
    CREATED_AT_COLUMN, ID_COLUMN, LAST_UPDATED_COLUMN, VERSION_CHAIN_COLUMN, VERSION_NUM_COLUMN,
};
use fieldsync_core::{
    quote_ident, strip_version_fields, DataSource, Direction, Expr, JsonColumnDecoder, Row, Select,
    SortOrder, TableHandle, VersionStamp, SOURCE_COLUMN,
};
use rusqlite::{Connection, TransactionBehavior};
use serde_json::Value;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::convert::fetch_rows;
use crate::{insert_row, prepare_new_row, row_id, SqliteStore, StoreError};

impl SqliteStore {
    fn versioned_handle(&self, table: &str, source: DataSource) -> Result<TableHandle<'_>> {
        let handle = self.resolver.resolve_source(table, source)?;
        if !handle.def.versioned {
            return Err(StoreError::NotVersioned(table.to_string()).into());
        }
        Ok(handle)
    }

    /// Insert the first row of a new chain. The chain id is the new row's id.
    ///
    /// # Errors
    /// Returns [`StoreError::NotVersioned`] for plain tables, or an error when the insert fails.
    pub fn create_new(&mut self, table: &str, source: DataSource, mut data: Row) -> Result<Row> {
        let handle = self.versioned_handle(table, source)?;
        strip_version_fields(&mut data);
        let mut row = prepare_new_row(handle.def, data)?;
        let id = row_id(&row)?;
        VersionStamp::first(&id).apply(&mut row);
        insert_row(&self.conn, handle.physical, handle.def, &row)
            .with_context(|| format!("failed to create chain {id} in {}", handle.physical))?;
        debug!(table, chain_id = %id, "created version chain");
        self.find_by_id(table, source, &id)?
            .ok_or_else(|| anyhow::anyhow!("created row {id} vanished from {}", handle.physical))
    }

    /// Insert the version following `base`, carrying its data forward with `updates` applied.
    ///
    /// `base` is checked against the stored row under the write lock and the
    /// stored data is what carries forward. Two writers extending the same base
    /// collide on the chain's unique index; the loser gets
    /// [`StoreError::VersionConflict`].
    ///
    /// # Errors
    /// Returns [`StoreError::VersionConflict`] when the version already exists
    /// or `base` does not match the stored row, [`StoreError::MissingChain`]
    /// when `base` is not stored, or an error when `base` carries no valid
    /// version fields.
    pub fn add_version(
        &mut self,
        table: &str,
        source: DataSource,
        base: &Row,
        updates: Row,
    ) -> Result<Row> {
        let handle = self.resolver.resolve_source(table, source)?;
        if !handle.def.versioned {
            return Err(StoreError::NotVersioned(table.to_string()).into());
        }
        let claimed = VersionStamp::from_row(base)?;
        let base_id = row_id(base)?;
        let stored_sql = Select::from(table)
            .filter(Expr::col(ID_COLUMN).equals(base_id.as_str()))
            .render(&self.resolver, source)?;
        let decoder = JsonColumnDecoder::for_tables(self.resolver.synced_catalog(), [table]);

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start version transaction")?;
        let Some(mut stored) = fetch_rows(&tx, &stored_sql)?.into_iter().next() else {
            return Err(StoreError::MissingChain {
                table: table.to_string(),
                chain_id: claimed.version_chain_id,
            }
            .into());
        };
        decoder.decode_row(&mut stored);
        let current = VersionStamp::from_row(&stored)?;
        if current.version_chain_id != claimed.version_chain_id || current.version_num != claimed.version_num {
            warn!(table, id = %base_id, "base row does not match the stored version");
            return Err(StoreError::VersionConflict {
                table: table.to_string(),
                chain_id: claimed.version_chain_id,
                version_num: claimed.version_num.saturating_add(1),
            }
            .into());
        }

        let stamp = VersionStamp::successor_of(&current)?;
        let row = successor_row(handle, &stored, updates, &stamp)?;
        let id = row_id(&row)?;
        insert_version(&tx, handle, &row, &stamp)?;
        tx.commit().context("failed to commit added version")?;
        self.find_by_id(table, source, &id)?
            .ok_or_else(|| anyhow::anyhow!("version row {id} vanished from {}", handle.physical))
    }

    /// Append to the chain's current head, whatever it is when the write lock is taken.
    ///
    /// Each attempt reads the head and inserts its successor inside one
    /// `IMMEDIATE` transaction; lost races are retried up to the configured limit.
    ///
    /// # Errors
    /// Returns [`StoreError::MissingChain`] for unknown chains and
    /// [`StoreError::VersionConflict`] when every attempt lost.
    pub fn append_version(
        &mut self,
        table: &str,
        source: DataSource,
        chain_id: &str,
        updates: Row,
    ) -> Result<Row> {
        let attempts = self.config().append_retry_limit;
        let head_sql = latest_version_select(table, chain_id).render(&self.resolver, source)?;
        let decoder = JsonColumnDecoder::for_tables(self.resolver.synced_catalog(), [table]);
        let handle = self.resolver.resolve_source(table, source)?;
        if !handle.def.versioned {
            return Err(StoreError::NotVersioned(table.to_string()).into());
        }

        let mut last_conflict = None;
        for attempt in 1..=attempts {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start append transaction")?;
            let Some(mut head) = fetch_rows(&tx, &head_sql)?.into_iter().next() else {
                return Err(StoreError::MissingChain {
                    table: table.to_string(),
                    chain_id: chain_id.to_string(),
                }
                .into());
            };
            decoder.decode_row(&mut head);
            let stamp = VersionStamp::successor_of(&VersionStamp::from_row(&head)?)?;
            let row = successor_row(handle, &head, updates.clone(), &stamp)?;
            match insert_version(&tx, handle, &row, &stamp) {
                Ok(()) => {
                    tx.commit().context("failed to commit appended version")?;
                    let id = row_id(&row)?;
                    debug!(table, chain_id, version_num = stamp.version_num, attempt, "appended version");
                    return self.find_by_id(table, source, &id)?.ok_or_else(|| {
                        anyhow::anyhow!("appended row {id} vanished from {}", handle.physical)
                    });
                }
                Err(err) => match err.downcast::<StoreError>() {
                    Ok(conflict @ StoreError::VersionConflict { .. }) => {
                        warn!(table, chain_id, attempt, "lost version chain race; retrying");
                        last_conflict = Some(conflict);
                    }
                    Ok(other) => return Err(other.into()),
                    Err(other) => return Err(other),
                },
            }
        }
        Err(last_conflict
            .unwrap_or(StoreError::MissingChain {
                table: table.to_string(),
                chain_id: chain_id.to_string(),
            })
            .into())
    }

    /// Head of the chain, or `None` when the chain does not exist.
    ///
    /// # Errors
    /// Returns an error for unknown or unversioned tables, or when the read fails.
    pub fn get_latest_version(
        &self,
        table: &str,
        source: DataSource,
        chain_id: &str,
    ) -> Result<Option<Row>> {
        self.versioned_handle(table, source)?;
        let sql = latest_version_select(table, chain_id).render(&self.resolver, source)?;
        Ok(self.read_table(table, &sql)?.into_iter().next())
    }

    /// Every version of the chain, newest first.
    ///
    /// # Errors
    /// Returns an error for unknown or unversioned tables, or when the read fails.
    pub fn get_versions(&self, table: &str, source: DataSource, chain_id: &str) -> Result<Vec<Row>> {
        self.versioned_handle(table, source)?;
        let sql = Select::from(table)
            .filter(Expr::col(VERSION_CHAIN_COLUMN).equals(chain_id))
            .order_by(VERSION_NUM_COLUMN, SortOrder::Desc)
            .render(&self.resolver, source)?;
        self.read_table(table, &sql)
    }

    /// The head row of every chain in the table, exactly one per chain.
    ///
    /// # Errors
    /// Returns an error for unknown or unversioned tables, or when the read fails.
    pub fn get_latest_of_all(&self, table: &str, source: DataSource) -> Result<Vec<Row>> {
        let handle = self.versioned_handle(table, source)?;
        let physical = quote_ident(handle.physical);
        let chain = quote_ident(VERSION_CHAIN_COLUMN);
        let num = quote_ident(VERSION_NUM_COLUMN);
        let sql = format!(
            "SELECT {physical}.* FROM {physical} \
             JOIN (SELECT {chain}, MAX({num}) AS \"max_version\" FROM {physical} GROUP BY {chain}) AS \"latest\" \
             ON {physical}.{chain} = \"latest\".{chain} AND {physical}.{num} = \"latest\".\"max_version\" \
             ORDER BY {physical}.{chain}"
        );
        self.read_table(table, &sql)
    }

    /// The version next to `record` in its chain, `None` past either end.
    ///
    /// # Errors
    /// Returns an error when `record` has no valid version fields or the read fails.
    pub fn get_adjacent_version(
        &self,
        table: &str,
        source: DataSource,
        record: &Row,
        direction: Direction,
    ) -> Result<Option<Row>> {
        self.versioned_handle(table, source)?;
        let stamp = VersionStamp::from_row(record)?;
        let Some(target) = direction.target(stamp.version_num) else {
            return Ok(None);
        };
        let sql = Select::from(table)
            .filter(Expr::col(VERSION_CHAIN_COLUMN).equals(stamp.version_chain_id.as_str()))
            .filter(Expr::col(VERSION_NUM_COLUMN).equals(target))
            .render(&self.resolver, source)?;
        Ok(self.read_table(table, &sql)?.into_iter().next())
    }
}

fn latest_version_select(table: &str, chain_id: &str) -> Select {
    Select::from(table)
        .filter(Expr::col(VERSION_CHAIN_COLUMN).equals(chain_id))
        .order_by(VERSION_NUM_COLUMN, SortOrder::Desc)
        .limit(1)
}

/// `base` with row identity dropped, `updates` applied and `stamp` set.
fn successor_row(handle: TableHandle<'_>, base: &Row, mut updates: Row, stamp: &VersionStamp) -> Result<Row> {
    let mut row = base.clone();
    for column in [ID_COLUMN, CREATED_AT_COLUMN, LAST_UPDATED_COLUMN, SOURCE_COLUMN] {
        row.remove(column);
    }
    strip_version_fields(&mut row);
    strip_version_fields(&mut updates);
    updates.remove(ID_COLUMN);
    row.extend(updates);
    row.insert(ID_COLUMN.to_string(), Value::String(Ulid::new().to_string()));
    let mut row = prepare_new_row(handle.def, row)?;
    stamp.apply(&mut row);
    Ok(row)
}

fn insert_version(conn: &Connection, handle: TableHandle<'_>, row: &Row, stamp: &VersionStamp) -> Result<()> {
    match insert_row(conn, handle.physical, handle.def, row) {
        Ok(_) => Ok(()),
        Err(err) if is_unique_violation(&err) => Err(StoreError::VersionConflict {
            table: handle.logical.to_string(),
            chain_id: stamp.version_chain_id.clone(),
            version_num: stamp.version_num,
        }
        .into()),
        Err(err) => {
            Err(anyhow::Error::new(err).context(format!("failed to insert version into {}", handle.physical)))
        }
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}
