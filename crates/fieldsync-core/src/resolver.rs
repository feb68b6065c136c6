use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::localize::localize_catalog;
use crate::schema::{Catalog, TableDef};
use crate::{CoreError, DataSource, SyncConfig};

/// Explicit family selection; there is no ambient "local mode".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResolveOptions {
    pub local_override: bool,
}

impl ResolveOptions {
    #[must_use]
    pub fn for_source(source: DataSource) -> Self {
        Self { local_override: source == DataSource::Local }
    }

    #[must_use]
    pub fn source(self) -> DataSource {
        if self.local_override {
            DataSource::Local
        } else {
            DataSource::Synced
        }
    }
}

/// A resolved physical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableHandle<'a> {
    pub logical: &'a str,
    pub physical: &'a str,
    pub source: DataSource,
    pub def: &'a TableDef,
}

/// Maps logical entity names onto the synced or local physical table.
#[derive(Debug, Clone)]
pub struct TableResolver {
    synced: Catalog,
    local: Catalog,
    local_by_logical: BTreeMap<String, usize>,
    config: SyncConfig,
}

impl TableResolver {
    /// Build both families from the synced catalog.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when the catalog or naming config is invalid.
    pub fn new(catalog: Catalog, config: &SyncConfig) -> Result<Self, CoreError> {
        config.validate()?;
        catalog.validate()?;
        let local = localize_catalog(&catalog, &config.local_suffix);
        Ok(Self::from_families(catalog, local, config.clone()))
    }

    /// Use an explicit local family instead of generating one.
    ///
    /// Synced tables without a counterpart in `local` resolve only for the
    /// synced family.
    #[must_use]
    pub fn from_families(synced: Catalog, local: Catalog, config: SyncConfig) -> Self {
        let local_by_logical = local
            .tables
            .iter()
            .enumerate()
            .filter_map(|(index, table)| {
                table
                    .name
                    .strip_suffix(&config.local_suffix)
                    .map(|logical| (logical.to_string(), index))
            })
            .collect();
        Self { synced, local, local_by_logical, config }
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn synced_catalog(&self) -> &Catalog {
        &self.synced
    }

    #[must_use]
    pub fn local_catalog(&self) -> &Catalog {
        &self.local
    }

    /// Resolve `name` for the family selected by `options`.
    ///
    /// # Errors
    /// Returns [`CoreError::UnknownTable`] for names outside the catalog and
    /// [`CoreError::MissingLocalCounterpart`] when a local table is requested
    /// but none is registered.
    pub fn resolve(&self, name: &str, options: ResolveOptions) -> Result<TableHandle<'_>, CoreError> {
        let Some(synced) = self.synced.table(name) else {
            return Err(CoreError::UnknownTable(name.to_string()));
        };
        if !options.local_override {
            return Ok(TableHandle {
                logical: &synced.name,
                physical: &synced.name,
                source: DataSource::Synced,
                def: synced,
            });
        }
        let local = self
            .local_by_logical
            .get(name)
            .and_then(|index| self.local.tables.get(*index))
            .ok_or_else(|| CoreError::MissingLocalCounterpart(name.to_string()))?;
        Ok(TableHandle {
            logical: &synced.name,
            physical: &local.name,
            source: DataSource::Local,
            def: local,
        })
    }

    /// Shorthand for [`Self::resolve`] with a [`DataSource`].
    ///
    /// # Errors
    /// Same as [`Self::resolve`].
    pub fn resolve_source(&self, name: &str, source: DataSource) -> Result<TableHandle<'_>, CoreError> {
        self.resolve(name, ResolveOptions::for_source(source))
    }

    /// Name of the persisted union view for `name`.
    ///
    /// # Errors
    /// Returns [`CoreError::UnknownTable`] for names outside the catalog.
    pub fn union_view(&self, name: &str) -> Result<String, CoreError> {
        if !self.synced.contains(name) {
            return Err(CoreError::UnknownTable(name.to_string()));
        }
        Ok(format!("{name}{}", self.config.union_view_suffix))
    }

    /// Logical names that have both a synced and a local table.
    #[must_use]
    pub fn paired_tables(&self) -> Vec<&str> {
        self.synced
            .tables
            .iter()
            .map(|table| table.name.as_str())
            .filter(|name| self.local_by_logical.contains_key(*name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::field_catalog;

    fn resolver() -> Result<TableResolver, CoreError> {
        TableResolver::new(field_catalog(), &SyncConfig::default())
    }

    #[test]
    fn resolves_both_families() -> Result<(), CoreError> {
        let resolver = resolver()?;
        let synced = resolver.resolve("asset", ResolveOptions { local_override: false })?;
        assert_eq!(synced.physical, "asset");
        assert_eq!(synced.source, DataSource::Synced);

        let local = resolver.resolve("asset", ResolveOptions { local_override: true })?;
        assert_eq!(local.physical, "asset_local");
        assert_eq!(local.logical, "asset");
        assert_eq!(local.source, DataSource::Local);
        Ok(())
    }

    #[test]
    fn unknown_table_fails_fast() -> Result<(), CoreError> {
        let resolver = resolver()?;
        assert_eq!(
            resolver.resolve("recording", ResolveOptions::default()),
            Err(CoreError::UnknownTable("recording".to_string()))
        );
        Ok(())
    }

    #[test]
    fn missing_local_counterpart_fails_fast() -> Result<(), CoreError> {
        let synced = field_catalog();
        let full_local = localize_catalog(&synced, "_local");
        let partial = Catalog::new(
            full_local.tables.into_iter().filter(|table| table.name != "vote_local").collect(),
        );
        let resolver = TableResolver::from_families(synced, partial, SyncConfig::default());

        assert!(resolver.resolve_source("vote", DataSource::Synced).is_ok());
        assert_eq!(
            resolver.resolve_source("vote", DataSource::Local),
            Err(CoreError::MissingLocalCounterpart("vote".to_string()))
        );
        assert!(!resolver.paired_tables().contains(&"vote"));
        Ok(())
    }

    #[test]
    fn options_map_to_sources() {
        assert_eq!(ResolveOptions::for_source(DataSource::Local).source(), DataSource::Local);
        assert_eq!(ResolveOptions::default().source(), DataSource::Synced);
    }

    #[test]
    fn union_view_names_use_configured_suffix() -> Result<(), CoreError> {
        let resolver = resolver()?;
        assert_eq!(resolver.union_view("quest")?, "quest_union");
        assert!(resolver.union_view("nope").is_err());
        Ok(())
    }
}
