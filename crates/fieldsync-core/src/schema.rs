//! Static description of the synced table family.
//!
//! The catalog is the single source of truth for column order, nullability and
//! semantic type. The local family, the DDL and the JSON decoding rules are all
//! derived from it rather than discovered from a live database.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::value::quote_ident;
use crate::CoreError;

pub const ID_COLUMN: &str = "id";
pub const VERSION_CHAIN_COLUMN: &str = "version_chain_id";
pub const VERSION_NUM_COLUMN: &str = "version_num";
pub const REV_COLUMN: &str = "rev";
pub const CREATED_AT_COLUMN: &str = "created_at";
pub const LAST_UPDATED_COLUMN: &str = "last_updated";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
    /// Structured value stored as JSON text.
    Json,
    Blob,
}

impl ColumnType {
    #[must_use]
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Text | Self::Json => "TEXT",
            Self::Integer | Self::Boolean => "INTEGER",
            Self::Real => "REAL",
            Self::Blob => "BLOB",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    /// Raw SQL default expression, e.g. `1` or `(CURRENT_TIMESTAMP)`.
    pub default: Option<String>,
    pub references: Option<ForeignKey>,
}

impl ColumnDef {
    #[must_use]
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            nullable: true,
            default: None,
            references: None,
        }
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn default_sql(mut self, expression: &str) -> Self {
        self.default = Some(expression.to_string());
        self
    }

    #[must_use]
    pub fn references(mut self, table: &str) -> Self {
        self.references = Some(ForeignKey { table: table.to_string(), column: ID_COLUMN.to_string() });
        self
    }

    fn definition_sql(&self) -> String {
        let mut sql = format!("{} {}", quote_ident(&self.name), self.column_type.sql_type());
        if self.name == ID_COLUMN {
            sql.push_str(" NOT NULL PRIMARY KEY");
        } else if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        sql
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Rows form version chains and carry `version_chain_id`, `version_num`, `rev`.
    pub versioned: bool,
}

impl TableDef {
    /// Start a table with the base columns every entity carries.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: vec![
                ColumnDef::new(ID_COLUMN, ColumnType::Text).not_null(),
                ColumnDef::new("active", ColumnType::Boolean).not_null().default_sql("1"),
                ColumnDef::new(CREATED_AT_COLUMN, ColumnType::Text)
                    .not_null()
                    .default_sql("(CURRENT_TIMESTAMP)"),
                ColumnDef::new(LAST_UPDATED_COLUMN, ColumnType::Text)
                    .not_null()
                    .default_sql("(CURRENT_TIMESTAMP)"),
            ],
            versioned: false,
        }
    }

    #[must_use]
    pub fn column_def(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Append the version chain columns.
    #[must_use]
    pub fn versioned(mut self) -> Self {
        self.versioned = true;
        self.columns.push(ColumnDef::new(VERSION_CHAIN_COLUMN, ColumnType::Text).not_null());
        self.columns.push(ColumnDef::new(VERSION_NUM_COLUMN, ColumnType::Integer).not_null());
        self.columns
            .push(ColumnDef::new(REV_COLUMN, ColumnType::Integer).not_null().default_sql("1"));
        self
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|column| column.name == name)
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name.as_str()).collect()
    }

    pub fn json_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|column| column.column_type == ColumnType::Json)
            .map(|column| column.name.as_str())
    }

    #[must_use]
    pub fn foreign_keys(&self) -> Vec<(&str, &ForeignKey)> {
        self.columns
            .iter()
            .filter_map(|column| column.references.as_ref().map(|fk| (column.name.as_str(), fk)))
            .collect()
    }

    /// `CREATE TABLE IF NOT EXISTS` statement for this definition.
    #[must_use]
    pub fn create_sql(&self) -> String {
        let mut parts = self.columns.iter().map(ColumnDef::definition_sql).collect::<Vec<_>>();
        if self.versioned {
            parts.push(format!(
                "UNIQUE ({}, {})",
                quote_ident(VERSION_CHAIN_COLUMN),
                quote_ident(VERSION_NUM_COLUMN)
            ));
        }
        for (column, fk) in self.foreign_keys() {
            parts.push(format!(
                "FOREIGN KEY ({}) REFERENCES {}({})",
                quote_ident(column),
                quote_ident(&fk.table),
                quote_ident(&fk.column)
            ));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  {}\n);",
            quote_ident(&self.name),
            parts.join(",\n  ")
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Catalog {
    pub tables: Vec<TableDef>,
}

impl Catalog {
    #[must_use]
    pub fn new(tables: Vec<TableDef>) -> Self {
        Self { tables }
    }

    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|table| table.name == name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    #[must_use]
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|table| table.name.as_str()).collect()
    }

    /// JSON-typed columns declared on `table`, empty when the table is unknown.
    #[must_use]
    pub fn json_columns(&self, table: &str) -> Vec<&str> {
        self.table(table).map(|def| def.json_columns().collect()).unwrap_or_default()
    }

    /// Check names are unique, references resolve and versioned tables are complete.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] describing the first problem found.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut seen = BTreeSet::new();
        for table in &self.tables {
            if !seen.insert(table.name.as_str()) {
                return Err(CoreError::Validation(format!("duplicate table {}", table.name)));
            }
            let mut columns = BTreeSet::new();
            for column in &table.columns {
                if !columns.insert(column.name.as_str()) {
                    return Err(CoreError::Validation(format!(
                        "duplicate column {}.{}",
                        table.name, column.name
                    )));
                }
            }
            if table.column(ID_COLUMN).is_none() {
                return Err(CoreError::Validation(format!("table {} has no id column", table.name)));
            }
            if table.versioned {
                for required in [VERSION_CHAIN_COLUMN, VERSION_NUM_COLUMN, REV_COLUMN] {
                    if !table.has_column(required) {
                        return Err(CoreError::Validation(format!(
                            "versioned table {} is missing {required}",
                            table.name
                        )));
                    }
                }
            }
        }
        for table in &self.tables {
            for (column, fk) in table.foreign_keys() {
                let Some(target) = self.table(&fk.table) else {
                    return Err(CoreError::Validation(format!(
                        "{}.{column} references unknown table {}",
                        table.name, fk.table
                    )));
                };
                if !target.has_column(&fk.column) {
                    return Err(CoreError::Validation(format!(
                        "{}.{column} references unknown column {}.{}",
                        table.name, fk.table, fk.column
                    )));
                }
            }
        }
        Ok(())
    }

    /// DDL for every table, in declaration order.
    #[must_use]
    pub fn create_sql(&self) -> String {
        self.tables.iter().map(TableDef::create_sql).collect::<Vec<_>>().join("\n\n")
    }
}

/// Synced-family schema of the field collection app.
#[must_use]
pub fn field_catalog() -> Catalog {
    use ColumnType::{Boolean, Integer, Json, Text};

    Catalog::new(vec![
        TableDef::new("profile")
            .column_def(ColumnDef::new("email", Text))
            .column_def(ColumnDef::new("username", Text))
            .column_def(ColumnDef::new("avatar", Text))
            .column_def(ColumnDef::new("ui_language_id", Text)),
        TableDef::new("language")
            .column_def(ColumnDef::new("native_name", Text))
            .column_def(ColumnDef::new("english_name", Text))
            .column_def(ColumnDef::new("iso639_3", Text))
            .column_def(ColumnDef::new("locale", Text))
            .column_def(ColumnDef::new("ui_ready", Boolean).not_null().default_sql("0"))
            .column_def(ColumnDef::new("download_profiles", Json))
            .column_def(ColumnDef::new("creator_id", Text).references("profile"))
            .versioned(),
        TableDef::new("project")
            .column_def(ColumnDef::new("name", Text).not_null())
            .column_def(ColumnDef::new("description", Text))
            .column_def(ColumnDef::new("private", Boolean).not_null().default_sql("0"))
            .column_def(ColumnDef::new("visible", Boolean).not_null().default_sql("1"))
            .column_def(ColumnDef::new("download_profiles", Json))
            .column_def(ColumnDef::new("template", Text).default_sql("'unstructured'"))
            .column_def(ColumnDef::new("target_language_id", Text))
            .column_def(ColumnDef::new("creator_id", Text).references("profile"))
            .column_def(ColumnDef::new("priority", Integer).not_null().default_sql("0")),
        TableDef::new("quest")
            .column_def(ColumnDef::new("name", Text).not_null())
            .column_def(ColumnDef::new("description", Text))
            .column_def(ColumnDef::new("visible", Boolean).not_null().default_sql("1"))
            .column_def(ColumnDef::new("download_profiles", Json))
            .column_def(ColumnDef::new("metadata", Json))
            .column_def(ColumnDef::new("project_id", Text).not_null().references("project"))
            .column_def(ColumnDef::new("parent_id", Text).references("quest"))
            .column_def(ColumnDef::new("creator_id", Text).references("profile")),
        TableDef::new("asset")
            .column_def(ColumnDef::new("name", Text))
            .column_def(ColumnDef::new("images", Json))
            .column_def(ColumnDef::new("visible", Boolean).not_null().default_sql("1"))
            .column_def(ColumnDef::new("download_profiles", Json))
            .column_def(ColumnDef::new("project_id", Text).references("project"))
            .column_def(ColumnDef::new("source_asset_id", Text).references("asset"))
            .column_def(ColumnDef::new("content_type", Text).default_sql("'source'"))
            .column_def(ColumnDef::new("creator_id", Text).references("profile"))
            .column_def(ColumnDef::new("order_index", Integer).not_null().default_sql("0"))
            .column_def(ColumnDef::new("metadata", Text)),
        TableDef::new("tag")
            .column_def(ColumnDef::new("key", Text).not_null())
            .column_def(ColumnDef::new("value", Text).not_null())
            .column_def(ColumnDef::new("download_profiles", Json)),
        TableDef::new("vote")
            .column_def(ColumnDef::new("polarity", Text).not_null())
            .column_def(ColumnDef::new("comment", Text))
            .column_def(ColumnDef::new("download_profiles", Json))
            .column_def(ColumnDef::new("asset_id", Text).not_null().references("asset"))
            .column_def(ColumnDef::new("creator_id", Text).not_null().references("profile")),
        TableDef::new("quest_asset_link")
            .column_def(ColumnDef::new("quest_id", Text).not_null().references("quest"))
            .column_def(ColumnDef::new("asset_id", Text).not_null().references("asset"))
            .column_def(ColumnDef::new("download_profiles", Json)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_catalog_is_valid() {
        assert_eq!(field_catalog().validate(), Ok(()));
    }

    #[test]
    fn json_columns_follow_declared_types() {
        let catalog = field_catalog();
        assert_eq!(catalog.json_columns("asset"), vec!["images", "download_profiles"]);
        assert_eq!(catalog.json_columns("quest"), vec!["download_profiles", "metadata"]);
        assert!(catalog.json_columns("missing").is_empty());
    }

    #[test]
    fn versioned_tables_render_chain_unique_constraint() {
        let catalog = field_catalog();
        let Some(language) = catalog.table("language") else {
            panic!("language table missing from catalog");
        };
        let sql = language.create_sql();
        assert!(sql.contains(r#"UNIQUE ("version_chain_id", "version_num")"#));
        assert!(sql.contains(r#"FOREIGN KEY ("creator_id") REFERENCES "profile"("id")"#));
        assert!(sql.starts_with(r#"CREATE TABLE IF NOT EXISTS "language""#));
    }

    #[test]
    fn validate_reports_dangling_reference() {
        let catalog = Catalog::new(vec![TableDef::new("asset")
            .column_def(ColumnDef::new("project_id", ColumnType::Text).references("project"))]);
        let Err(CoreError::Validation(message)) = catalog.validate() else {
            panic!("expected validation failure for dangling reference");
        };
        assert!(message.contains("unknown table project"));
    }

    #[test]
    fn validate_requires_version_columns() {
        let mut table = TableDef::new("language");
        table.versioned = true;
        assert!(Catalog::new(vec![table]).validate().is_err());
    }
}
