use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::warn;

use crate::query::{JsonAggregate, Projection, Select};
use crate::schema::{Catalog, ColumnType};
use crate::sql_text::referenced_tables;
use crate::{CoreError, Row, SyncConfig};

/// Result columns holding `json_group_array(json_object(...))` output by convention.
pub const AGGREGATE_COLUMNS: [&str; 4] = ["content", "data", "items", "results"];

/// Parses JSON-typed columns of result rows back into structured values.
///
/// Decoding is best-effort: text that fails to parse is logged and left as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JsonColumnDecoder {
    columns: BTreeSet<String>,
    /// Aggregate output columns and the decoder for their elements.
    aggregates: BTreeMap<String, JsonColumnDecoder>,
    /// Also decode [`AGGREGATE_COLUMNS`] when no aggregate is declared.
    conventional_aggregates: bool,
}

impl JsonColumnDecoder {
    #[must_use]
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            aggregates: BTreeMap::new(),
            conventional_aggregates: true,
        }
    }

    /// JSON columns declared on the given logical tables.
    ///
    /// A column name counts only when no other listed table declares it with
    /// a non-JSON type, since result rows carry bare column names.
    #[must_use]
    pub fn for_tables<'a>(catalog: &Catalog, tables: impl IntoIterator<Item = &'a str>) -> Self {
        let mut json = BTreeSet::new();
        let mut plain = BTreeSet::new();
        for def in tables.into_iter().filter_map(|table| catalog.table(table)) {
            for column in &def.columns {
                if column.column_type == ColumnType::Json {
                    json.insert(column.name.as_str());
                } else {
                    plain.insert(column.name.as_str());
                }
            }
        }
        Self::new(json.difference(&plain).copied())
    }

    /// JSON columns of every catalog table `sql` reads, from either family.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidQuery`] when `sql` cannot be tokenized.
    pub fn for_sql(catalog: &Catalog, sql: &str, config: &SyncConfig) -> Result<Self, CoreError> {
        let tables = referenced_tables(sql, catalog, config)?;
        Ok(Self::for_tables(catalog, tables.iter().map(String::as_str)))
    }

    /// Decoder for the output columns of a structured query.
    ///
    /// Each projected column is typed by the table it is read from, and each
    /// JSON aggregate decodes its elements with the child table's columns.
    #[must_use]
    pub fn for_select(catalog: &Catalog, select: &Select) -> Self {
        let mut json = BTreeSet::new();
        let mut plain = BTreeSet::new();
        let mut aggregates = BTreeMap::new();
        let mut classify = |table: Option<&str>, column: &str| {
            let column_type = table
                .and_then(|table| catalog.table(table))
                .and_then(|def| def.column(column))
                .map(|def| def.column_type);
            if column_type == Some(ColumnType::Json) {
                json.insert(column.to_string());
            } else {
                plain.insert(column.to_string());
            }
        };

        let root_columns = |classify: &mut dyn FnMut(Option<&str>, &str)| {
            if let Some(def) = catalog.table(&select.table) {
                for column in &def.columns {
                    classify(Some(select.table.as_str()), &column.name);
                }
            }
        };
        if select.projections.is_empty() {
            root_columns(&mut classify);
        }
        for projection in &select.projections {
            match projection {
                Projection::All => root_columns(&mut classify),
                Projection::Column { table, column } => {
                    classify(owning_table(catalog, select, table.as_deref(), column), column);
                }
                Projection::Expr { alias, .. } => classify(None, alias),
                Projection::JsonAggregate { aggregate, alias } => {
                    classify(None, alias);
                    aggregates.insert(alias.clone(), aggregate_decoder(catalog, aggregate));
                }
            }
        }

        let columns = json.difference(&plain).cloned().collect();
        Self { columns, aggregates, conventional_aggregates: false }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(String::as_str)
    }

    pub fn decode_rows(&self, rows: &mut [Row]) {
        for row in rows {
            self.decode_row(row);
        }
    }

    pub fn decode_row(&self, row: &mut Row) {
        for (column, value) in row.iter_mut() {
            if let Some(elements) = self.aggregates.get(column.as_str()) {
                decode_in_place(column, value);
                elements.decode_elements(value);
            } else if self.columns.contains(column.as_str()) {
                decode_in_place(column, value);
            } else if self.conventional_aggregates && AGGREGATE_COLUMNS.contains(&column.as_str()) {
                decode_in_place(column, value);
                self.decode_elements(value);
            }
        }
    }

    fn decode_elements(&self, value: &mut Value) {
        match value {
            Value::Array(elements) => {
                for element in elements {
                    self.decode_elements(element);
                }
            }
            Value::Object(object) => self.decode_row(object),
            _ => {}
        }
    }
}

/// Logical table a projected column is read from, if it can be told.
fn owning_table<'a>(
    catalog: &Catalog,
    select: &'a Select,
    qualifier: Option<&str>,
    column: &str,
) -> Option<&'a str> {
    let scope = std::iter::once((select.table.as_str(), select.alias.as_deref()))
        .chain(select.joins.iter().map(|join| (join.table.as_str(), join.alias.as_deref())))
        .collect::<Vec<_>>();
    match qualifier {
        Some(qualifier) => scope
            .iter()
            .find(|(_, alias)| *alias == Some(qualifier))
            .or_else(|| scope.iter().find(|(logical, alias)| alias.is_none() && *logical == qualifier))
            .map(|(logical, _)| *logical),
        None => scope
            .iter()
            .find(|(logical, _)| catalog.table(logical).is_some_and(|def| def.has_column(column)))
            .map(|(logical, _)| *logical),
    }
}

fn aggregate_decoder(catalog: &Catalog, aggregate: &JsonAggregate) -> JsonColumnDecoder {
    let json_columns = catalog.json_columns(&aggregate.table);
    let columns = json_columns
        .into_iter()
        .filter(|column| aggregate.columns.is_empty() || aggregate.columns.iter().any(|name| name.as_str() == *column));
    JsonColumnDecoder { conventional_aggregates: false, ..JsonColumnDecoder::new(columns) }
}

fn decode_in_place(column: &str, value: &mut Value) {
    let Value::String(text) = value else {
        return;
    };
    match serde_json::from_str::<Value>(text) {
        Ok(parsed) => *value = parsed,
        Err(err) => {
            warn!(column, error = %err, "column is not valid JSON; keeping raw text");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::query::{Expr, JoinKind};
    use crate::schema::field_catalog;

    fn row(value: Value) -> Row {
        let Value::Object(map) = value else {
            panic!("test rows must be objects");
        };
        map
    }

    #[test]
    fn decodes_declared_columns_only() {
        let decoder = JsonColumnDecoder::for_tables(&field_catalog(), ["asset"]);
        let mut decoded = row(json!({
            "id": "a1",
            "images": r#"["a","b"]"#,
            "metadata": r#"{"raw":true}"#,
            "name": "[not json]",
        }));
        decoder.decode_row(&mut decoded);
        assert_eq!(decoded["images"], json!(["a", "b"]));
        assert_eq!(decoded["metadata"], json!(r#"{"raw":true}"#));
        assert_eq!(decoded["name"], json!("[not json]"));
    }

    #[test]
    fn malformed_json_is_kept_as_text() {
        let decoder = JsonColumnDecoder::new(["images"]);
        let mut decoded = row(json!({"images": "[\"a\","}));
        decoder.decode_row(&mut decoded);
        assert_eq!(decoded["images"], json!("[\"a\","));
    }

    #[test]
    fn structured_values_pass_through() {
        let decoder = JsonColumnDecoder::new(["images"]);
        let mut decoded = row(json!({"images": ["x"], "download_profiles": null}));
        decoder.decode_row(&mut decoded);
        assert_eq!(decoded["images"], json!(["x"]));
    }

    #[test]
    fn aggregate_columns_decode_nested_properties() {
        let decoder = JsonColumnDecoder::for_tables(&field_catalog(), ["asset"]);
        let mut decoded = row(json!({
            "id": "q1",
            "items": r#"[{"id":"a1","images":"[\"x.png\"]"},{"id":"a2","images":null}]"#,
            "results": "not json",
        }));
        decoder.decode_row(&mut decoded);
        assert_eq!(
            decoded["items"],
            json!([{"id": "a1", "images": ["x.png"]}, {"id": "a2", "images": null}])
        );
        assert_eq!(decoded["results"], json!("not json"));
    }

    #[test]
    fn for_sql_collects_columns_of_both_families() -> Result<(), CoreError> {
        let decoder = JsonColumnDecoder::for_sql(
            &field_catalog(),
            r#"SELECT * FROM "quest_local" JOIN "asset" ON 1"#,
            &SyncConfig::default(),
        )?;
        assert_eq!(decoder.columns().collect::<Vec<_>>(), vec!["download_profiles", "images"]);
        Ok(())
    }

    #[test]
    fn column_typed_json_in_one_table_only_is_not_decoded_for_the_other() {
        let decoder = JsonColumnDecoder::for_tables(&field_catalog(), ["asset", "quest"]);
        let mut decoded = row(json!({"metadata": "123", "images": "[]"}));
        decoder.decode_row(&mut decoded);
        assert_eq!(decoded["metadata"], json!("123"));
        assert_eq!(decoded["images"], json!([]));
    }

    #[test]
    fn select_columns_are_typed_by_their_own_table() {
        let catalog = field_catalog();
        let from_asset = Select::from("asset")
            .columns(["id", "metadata"])
            .join(JoinKind::Inner, "quest", Expr::value(true));
        let decoder = JsonColumnDecoder::for_select(&catalog, &from_asset);
        let mut decoded = row(json!({"id": "a1", "metadata": "123"}));
        decoder.decode_row(&mut decoded);
        assert_eq!(decoded["metadata"], json!("123"));

        let from_quest = Select::from("asset")
            .alias("a")
            .join_as(JoinKind::Inner, "quest", "q", Expr::value(true))
            .column_of("q", "metadata");
        let decoder = JsonColumnDecoder::for_select(&catalog, &from_quest);
        let mut decoded = row(json!({"metadata": r#"{"k":1}"#}));
        decoder.decode_row(&mut decoded);
        assert_eq!(decoded["metadata"], json!({"k": 1}));
    }

    #[test]
    fn select_aggregates_decode_with_the_child_table() {
        let select = Select::from("quest")
            .columns(["id"])
            .json_aggregate("data", JsonAggregate::new("asset", "project_id").columns(["id", "metadata", "images"]));
        let decoder = JsonColumnDecoder::for_select(&field_catalog(), &select);
        let mut decoded = row(json!({
            "id": "q1",
            "data": r#"[{"id":"a1","metadata":"7","images":"[\"x\"]"}]"#,
            "items": "[1]",
        }));
        decoder.decode_row(&mut decoded);
        assert_eq!(decoded["data"], json!([{"id": "a1", "metadata": "7", "images": ["x"]}]));
        assert_eq!(decoded["items"], json!("[1]"));
    }
}
