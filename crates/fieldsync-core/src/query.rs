//! Structured read queries rendered once per table family.
//!
//! A [`Select`] names logical tables only. Rendering binds every table
//! reference to a physical table through the [`TableResolver`], so the synced
//! and local branches of a [`MergeQuery`] come from the same object and never
//! from rewriting SQL text.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::resolver::TableResolver;
use crate::schema::{TableDef, ID_COLUMN};
use crate::value::{quote_ident, quote_literal};
use crate::{CoreError, DataSource, SqlValue, SOURCE_COLUMN};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CompareOp {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
        }
    }
}

/// Filter and projection expressions over logical columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column { table: Option<String>, column: String },
    Value(SqlValue),
    Compare { op: CompareOp, left: Box<Expr>, right: Box<Expr> },
    IsNull { expr: Box<Expr>, negated: bool },
    InList { expr: Box<Expr>, values: Vec<SqlValue> },
    Like { expr: Box<Expr>, pattern: String },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    /// `COUNT(*)` when `None`.
    Count(Option<Box<Expr>>),
}

impl Expr {
    #[must_use]
    pub fn col(column: &str) -> Self {
        Self::Column { table: None, column: column.to_string() }
    }

    /// Column qualified by a logical table name or a query alias.
    #[must_use]
    pub fn qualified(table: &str, column: &str) -> Self {
        Self::Column { table: Some(table.to_string()), column: column.to_string() }
    }

    #[must_use]
    pub fn value(value: impl Into<SqlValue>) -> Self {
        Self::Value(value.into())
    }

    #[must_use]
    pub fn compare(self, op: CompareOp, right: impl Into<Expr>) -> Self {
        Self::Compare { op, left: Box::new(self), right: Box::new(right.into()) }
    }

    #[must_use]
    pub fn equals(self, right: impl Into<Expr>) -> Self {
        self.compare(CompareOp::Eq, right)
    }

    #[must_use]
    pub fn is_null(self) -> Self {
        Self::IsNull { expr: Box::new(self), negated: false }
    }

    #[must_use]
    pub fn is_not_null(self) -> Self {
        Self::IsNull { expr: Box::new(self), negated: true }
    }

    #[must_use]
    pub fn in_list<V: Into<SqlValue>>(self, values: impl IntoIterator<Item = V>) -> Self {
        Self::InList { expr: Box::new(self), values: values.into_iter().map(Into::into).collect() }
    }

    #[must_use]
    pub fn like(self, pattern: &str) -> Self {
        Self::Like { expr: Box::new(self), pattern: pattern.to_string() }
    }

    #[must_use]
    pub fn and(exprs: Vec<Expr>) -> Self {
        Self::And(exprs)
    }

    #[must_use]
    pub fn or(exprs: Vec<Expr>) -> Self {
        Self::Or(exprs)
    }

    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    #[must_use]
    pub fn count(expr: Option<Expr>) -> Self {
        Self::Count(expr.map(Box::new))
    }

    fn is_null_literal(&self) -> bool {
        matches!(self, Self::Value(SqlValue::Null))
    }

    fn render(&self, scope: &Scope<'_>) -> Result<String, CoreError> {
        Ok(match self {
            Self::Column { table, column } => scope.column(table.as_deref(), column)?,
            Self::Value(value) => value.to_sql_literal(),
            // `= NULL` never matches in SQL; equality with null means IS NULL.
            Self::Compare { op: op @ (CompareOp::Eq | CompareOp::Ne), left, right }
                if left.is_null_literal() || right.is_null_literal() =>
            {
                let operand = if right.is_null_literal() { left } else { right };
                let keyword = if *op == CompareOp::Eq { "IS NULL" } else { "IS NOT NULL" };
                format!("({} {keyword})", operand.render(scope)?)
            }
            Self::Compare { op, left, right } => {
                format!("({} {} {})", left.render(scope)?, op.as_sql(), right.render(scope)?)
            }
            Self::IsNull { expr, negated } => {
                let keyword = if *negated { "IS NOT NULL" } else { "IS NULL" };
                format!("({} {keyword})", expr.render(scope)?)
            }
            Self::InList { expr, values } => {
                if values.is_empty() {
                    "0".to_string()
                } else {
                    let literals =
                        values.iter().map(SqlValue::to_sql_literal).collect::<Vec<_>>().join(", ");
                    format!("({} IN ({literals}))", expr.render(scope)?)
                }
            }
            Self::Like { expr, pattern } => {
                format!("({} LIKE {})", expr.render(scope)?, quote_literal(pattern))
            }
            Self::And(exprs) => join_exprs(exprs, " AND ", "1", scope)?,
            Self::Or(exprs) => join_exprs(exprs, " OR ", "0", scope)?,
            Self::Not(expr) => format!("(NOT {})", expr.render(scope)?),
            Self::Count(None) => "COUNT(*)".to_string(),
            Self::Count(Some(expr)) => format!("COUNT({})", expr.render(scope)?),
        })
    }
}

fn join_exprs(
    exprs: &[Expr],
    separator: &str,
    empty: &str,
    scope: &Scope<'_>,
) -> Result<String, CoreError> {
    if exprs.is_empty() {
        return Ok(empty.to_string());
    }
    let parts = exprs.iter().map(|expr| expr.render(scope)).collect::<Result<Vec<_>, _>>()?;
    Ok(format!("({})", parts.join(separator)))
}

impl From<SqlValue> for Expr {
    fn from(value: SqlValue) -> Self {
        Self::Value(value)
    }
}

impl From<&str> for Expr {
    fn from(value: &str) -> Self {
        Self::Value(SqlValue::from(value))
    }
}

impl From<String> for Expr {
    fn from(value: String) -> Self {
        Self::Value(SqlValue::Text(value))
    }
}

impl From<i64> for Expr {
    fn from(value: i64) -> Self {
        Self::Value(SqlValue::Integer(value))
    }
}

impl From<bool> for Expr {
    fn from(value: bool) -> Self {
        Self::Value(SqlValue::Bool(value))
    }
}

impl From<serde_json::Value> for Expr {
    fn from(value: serde_json::Value) -> Self {
        Self::Value(SqlValue::from(value))
    }
}

/// Child rows of another table folded into one JSON array column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonAggregate {
    pub table: String,
    /// Column on the child table pointing at the parent row.
    pub foreign_key: String,
    /// Column on the query's root table the foreign key matches.
    pub parent_column: String,
    pub columns: Vec<String>,
}

impl JsonAggregate {
    #[must_use]
    pub fn new(table: &str, foreign_key: &str) -> Self {
        Self {
            table: table.to_string(),
            foreign_key: foreign_key.to_string(),
            parent_column: ID_COLUMN.to_string(),
            columns: Vec::new(),
        }
    }

    #[must_use]
    pub fn columns<'a>(mut self, columns: impl IntoIterator<Item = &'a str>) -> Self {
        self.columns = columns.into_iter().map(str::to_string).collect();
        self
    }

    #[must_use]
    pub fn parent_column(mut self, column: &str) -> Self {
        self.parent_column = column.to_string();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Every column of the root table.
    All,
    Column { table: Option<String>, column: String },
    Expr { expr: Expr, alias: String },
    JsonAggregate { aggregate: JsonAggregate, alias: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: String,
    pub alias: Option<String>,
    pub on: Expr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTerm {
    pub column: String,
    pub order: SortOrder,
}

/// A read query over logical table names.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub(crate) table: String,
    pub(crate) alias: Option<String>,
    pub(crate) projections: Vec<Projection>,
    pub(crate) joins: Vec<Join>,
    filters: Vec<Expr>,
    group_by: Vec<Expr>,
    order_by: Vec<OrderTerm>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl Select {
    #[must_use]
    pub fn from(table: &str) -> Self {
        Self {
            table: table.to_string(),
            alias: None,
            projections: Vec::new(),
            joins: Vec::new(),
            filters: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Alias the root table. Aliases are rendered per branch, so they are safe here.
    #[must_use]
    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    #[must_use]
    pub fn all(mut self) -> Self {
        self.projections.push(Projection::All);
        self
    }

    #[must_use]
    pub fn columns<'a>(mut self, columns: impl IntoIterator<Item = &'a str>) -> Self {
        self.projections.extend(
            columns
                .into_iter()
                .map(|column| Projection::Column { table: None, column: column.to_string() }),
        );
        self
    }

    #[must_use]
    pub fn column_of(mut self, table: &str, column: &str) -> Self {
        self.projections.push(Projection::Column {
            table: Some(table.to_string()),
            column: column.to_string(),
        });
        self
    }

    #[must_use]
    pub fn project(mut self, expr: Expr, alias: &str) -> Self {
        self.projections.push(Projection::Expr { expr, alias: alias.to_string() });
        self
    }

    #[must_use]
    pub fn json_aggregate(mut self, alias: &str, aggregate: JsonAggregate) -> Self {
        self.projections.push(Projection::JsonAggregate { aggregate, alias: alias.to_string() });
        self
    }

    #[must_use]
    pub fn join(mut self, kind: JoinKind, table: &str, on: Expr) -> Self {
        self.joins.push(Join { kind, table: table.to_string(), alias: None, on });
        self
    }

    #[must_use]
    pub fn join_as(mut self, kind: JoinKind, table: &str, alias: &str, on: Expr) -> Self {
        self.joins.push(Join { kind, table: table.to_string(), alias: Some(alias.to_string()), on });
        self
    }

    /// Add a filter; several filters are combined with `AND`.
    #[must_use]
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filters.push(expr);
        self
    }

    #[must_use]
    pub fn group_by(mut self, expr: Expr) -> Self {
        self.group_by.push(expr);
        self
    }

    /// Order by an output column name.
    #[must_use]
    pub fn order_by(mut self, column: &str, order: SortOrder) -> Self {
        self.order_by.push(OrderTerm { column: column.to_string(), order });
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Logical tables this query reads, root first.
    #[must_use]
    pub fn referenced_tables(&self) -> Vec<&str> {
        let mut tables = vec![self.table.as_str()];
        tables.extend(self.joins.iter().map(|join| join.table.as_str()));
        for projection in &self.projections {
            if let Projection::JsonAggregate { aggregate, .. } = projection {
                tables.push(aggregate.table.as_str());
            }
        }
        let mut seen = BTreeSet::new();
        tables.retain(|table| seen.insert(*table));
        tables
    }

    /// Render against one family, ordering and limits included.
    ///
    /// # Errors
    /// Returns [`CoreError::UnknownTable`], [`CoreError::MissingLocalCounterpart`]
    /// or [`CoreError::UnknownColumn`] when a reference does not resolve.
    pub fn render(&self, resolver: &TableResolver, source: DataSource) -> Result<String, CoreError> {
        let mut sql = self.render_branch(resolver, source, None)?;
        let synced = resolver.resolve_source(&self.table, DataSource::Synced)?;
        sql.push_str(&self.render_tail(synced.def)?);
        Ok(sql)
    }

    fn render_branch(
        &self,
        resolver: &TableResolver,
        source: DataSource,
        tag: Option<&str>,
    ) -> Result<String, CoreError> {
        let mut scope = Scope::default();
        let root = resolver.resolve_source(&self.table, source)?;
        scope.push(&self.table, self.alias.as_deref(), root.physical, root.def);

        let mut joins = Vec::with_capacity(self.joins.len());
        for join in &self.joins {
            let handle = resolver.resolve_source(&join.table, source)?;
            scope.push(&join.table, join.alias.as_deref(), handle.physical, handle.def);
            joins.push((join, table_sql(handle.physical, join.alias.as_deref())));
        }

        let mut projections = Vec::new();
        if self.projections.is_empty() {
            projections.push(format!("{}.*", scope.root_qualifier()));
        }
        for projection in &self.projections {
            projections.push(match projection {
                Projection::All => format!("{}.*", scope.root_qualifier()),
                Projection::Column { table, column } => scope.column(table.as_deref(), column)?,
                Projection::Expr { expr, alias } => {
                    guard_alias(alias)?;
                    format!("{} AS {}", expr.render(&scope)?, quote_ident(alias))
                }
                Projection::JsonAggregate { aggregate, alias } => {
                    guard_alias(alias)?;
                    render_aggregate(aggregate, alias, resolver, source, &scope)?
                }
            });
        }
        if let Some(tag) = tag {
            projections.push(format!("{} AS {}", quote_literal(tag), quote_ident(SOURCE_COLUMN)));
        }

        let mut sql = format!(
            "SELECT {} FROM {}",
            projections.join(", "),
            table_sql(root.physical, self.alias.as_deref())
        );
        for (join, table) in joins {
            let keyword = match join.kind {
                JoinKind::Inner => "JOIN",
                JoinKind::Left => "LEFT JOIN",
            };
            sql.push_str(&format!(" {keyword} {table} ON {}", join.on.render(&scope)?));
        }
        if !self.filters.is_empty() {
            let parts =
                self.filters.iter().map(|expr| expr.render(&scope)).collect::<Result<Vec<_>, _>>()?;
            sql.push_str(" WHERE ");
            sql.push_str(&parts.join(" AND "));
        }
        if !self.group_by.is_empty() {
            let parts =
                self.group_by.iter().map(|expr| expr.render(&scope)).collect::<Result<Vec<_>, _>>()?;
            sql.push_str(" GROUP BY ");
            sql.push_str(&parts.join(", "));
        }
        Ok(sql)
    }

    /// Output column names, used to validate order terms.
    fn output_columns<'a>(&'a self, root: &'a TableDef) -> Vec<&'a str> {
        let mut columns = Vec::new();
        if self.projections.is_empty() {
            columns.extend(root.column_names());
        }
        for projection in &self.projections {
            match projection {
                Projection::All => columns.extend(root.column_names()),
                Projection::Column { column, .. } => columns.push(column.as_str()),
                Projection::Expr { alias, .. } | Projection::JsonAggregate { alias, .. } => {
                    columns.push(alias.as_str());
                }
            }
        }
        columns.push(SOURCE_COLUMN);
        columns
    }

    fn render_tail(&self, root: &TableDef) -> Result<String, CoreError> {
        let mut tail = String::new();
        if !self.order_by.is_empty() {
            let outputs = self.output_columns(root);
            let mut terms = Vec::with_capacity(self.order_by.len());
            for term in &self.order_by {
                if !outputs.contains(&term.column.as_str()) {
                    return Err(CoreError::UnknownColumn {
                        table: self.table.clone(),
                        column: term.column.clone(),
                    });
                }
                terms.push(format!("{} {}", quote_ident(&term.column), term.order.as_sql()));
            }
            tail.push_str(" ORDER BY ");
            tail.push_str(&terms.join(", "));
        }
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => tail.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => tail.push_str(&format!(" LIMIT {limit}")),
            (None, Some(offset)) => tail.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }
        Ok(tail)
    }
}

fn guard_alias(alias: &str) -> Result<(), CoreError> {
    if alias == SOURCE_COLUMN {
        return Err(CoreError::InvalidQuery(format!(
            "projection alias {SOURCE_COLUMN:?} is reserved for the provenance tag"
        )));
    }
    Ok(())
}

fn table_sql(physical: &str, alias: Option<&str>) -> String {
    match alias {
        Some(alias) => format!("{} AS {}", quote_ident(physical), quote_ident(alias)),
        None => quote_ident(physical),
    }
}

fn render_aggregate(
    aggregate: &JsonAggregate,
    alias: &str,
    resolver: &TableResolver,
    source: DataSource,
    outer: &Scope<'_>,
) -> Result<String, CoreError> {
    let child = resolver.resolve_source(&aggregate.table, source)?;
    let row_alias = format!("{alias}_row");
    let qualifier = quote_ident(&row_alias);
    let check = |column: &str| {
        if child.def.has_column(column) {
            Ok(())
        } else {
            Err(CoreError::UnknownColumn {
                table: aggregate.table.clone(),
                column: column.to_string(),
            })
        }
    };

    let columns = if aggregate.columns.is_empty() {
        child.def.column_names().into_iter().map(str::to_string).collect::<Vec<_>>()
    } else {
        aggregate.columns.clone()
    };
    let mut pairs = Vec::with_capacity(columns.len());
    for column in &columns {
        check(column)?;
        pairs.push(format!("{}, {qualifier}.{}", quote_literal(column), quote_ident(column)));
    }
    check(&aggregate.foreign_key)?;
    let parent = outer.column(None, &aggregate.parent_column)?;

    Ok(format!(
        "(SELECT json_group_array(json_object({})) FROM {} WHERE {qualifier}.{} = {parent}) AS {}",
        pairs.join(", "),
        table_sql(child.physical, Some(&row_alias)),
        quote_ident(&aggregate.foreign_key),
        quote_ident(alias)
    ))
}

/// Tables visible to expressions of one branch.
#[derive(Default)]
struct Scope<'a> {
    entries: Vec<ScopeEntry<'a>>,
}

struct ScopeEntry<'a> {
    logical: &'a str,
    alias: Option<&'a str>,
    qualifier: String,
    def: &'a TableDef,
}

impl<'a> Scope<'a> {
    fn push(&mut self, logical: &'a str, alias: Option<&'a str>, physical: &str, def: &'a TableDef) {
        let qualifier = quote_ident(alias.unwrap_or(physical));
        self.entries.push(ScopeEntry { logical, alias, qualifier, def });
    }

    fn root_qualifier(&self) -> &str {
        self.entries.first().map_or("", |entry| entry.qualifier.as_str())
    }

    fn root_logical(&self) -> &str {
        self.entries.first().map_or("", |entry| entry.logical)
    }

    fn column(&self, table: Option<&str>, column: &str) -> Result<String, CoreError> {
        let entry = match table {
            Some(name) => self
                .entries
                .iter()
                .find(|entry| entry.alias == Some(name))
                .or_else(|| {
                    self.entries.iter().find(|entry| entry.alias.is_none() && entry.logical == name)
                })
                .ok_or_else(|| CoreError::UnknownTable(name.to_string()))?,
            None => self
                .entries
                .iter()
                .find(|entry| entry.def.has_column(column))
                .ok_or_else(|| CoreError::UnknownColumn {
                    table: self.root_logical().to_string(),
                    column: column.to_string(),
                })?,
        };
        if !entry.def.has_column(column) {
            return Err(CoreError::UnknownColumn {
                table: entry.logical.to_string(),
                column: column.to_string(),
            });
        }
        Ok(format!("{}.{}", entry.qualifier, quote_ident(column)))
    }
}

/// A [`Select`] evaluated over both families and sorted once after the union.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeQuery {
    select: Select,
}

impl MergeQuery {
    #[must_use]
    pub fn new(select: Select) -> Self {
        Self { select }
    }

    #[must_use]
    pub fn select(&self) -> &Select {
        &self.select
    }

    /// Render `SELECT * FROM (synced UNION ALL local) ORDER BY ... LIMIT ...`.
    ///
    /// # Errors
    /// Same as [`Select::render`]; a missing local counterpart for any
    /// referenced table fails the whole query.
    pub fn render(&self, resolver: &TableResolver) -> Result<String, CoreError> {
        let config = resolver.config();
        let mut branches = Vec::with_capacity(DataSource::ALL.len());
        for source in DataSource::ALL {
            branches.push(self.select.render_branch(resolver, source, Some(source.tag(config)))?);
        }
        let root = resolver.resolve_source(&self.select.table, DataSource::Synced)?;
        let sql = format!(
            "SELECT * FROM ({}){}",
            branches.join(" UNION ALL "),
            self.select.render_tail(root.def)?
        );
        debug!(table = %self.select.table, sql = %sql, "rendered merge query");
        Ok(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::field_catalog;
    use crate::SyncConfig;

    fn resolver() -> TableResolver {
        TableResolver::new(field_catalog(), &SyncConfig::default())
            .unwrap_or_else(|err| panic!("field catalog must resolve: {err}"))
    }

    #[test]
    fn single_branch_renders_physical_tables() -> Result<(), CoreError> {
        let select = Select::from("asset")
            .columns(["id", "name"])
            .filter(Expr::col("project_id").equals("p1"))
            .order_by("name", SortOrder::Asc)
            .limit(10);
        let synced = select.render(&resolver(), DataSource::Synced)?;
        assert_eq!(
            synced,
            r#"SELECT "asset"."id", "asset"."name" FROM "asset" WHERE ("asset"."project_id" = 'p1') ORDER BY "name" ASC LIMIT 10"#
        );
        let local = select.render(&resolver(), DataSource::Local)?;
        assert!(local.contains(r#"FROM "asset_local" WHERE ("asset_local"."project_id" = 'p1')"#));
        Ok(())
    }

    #[test]
    fn merge_orders_once_after_union() -> Result<(), CoreError> {
        let sql = MergeQuery::new(Select::from("asset").order_by("order_index", SortOrder::Desc))
            .render(&resolver())?;
        assert_eq!(
            sql,
            concat!(
                r#"SELECT * FROM (SELECT "asset".*, 'synced' AS "source" FROM "asset""#,
                r#" UNION ALL SELECT "asset_local".*, 'local' AS "source" FROM "asset_local")"#,
                r#" ORDER BY "order_index" DESC"#
            )
        );
        Ok(())
    }

    #[test]
    fn aliases_are_rendered_per_branch() -> Result<(), CoreError> {
        let select = Select::from("asset")
            .alias("a")
            .column_of("a", "id")
            .join_as(
                JoinKind::Inner,
                "quest_asset_link",
                "l",
                Expr::qualified("l", "asset_id").equals(Expr::qualified("a", "id")),
            )
            .filter(Expr::qualified("l", "quest_id").equals("q1"));
        let sql = MergeQuery::new(select).render(&resolver())?;
        assert!(sql.contains(r#"FROM "asset" AS "a" JOIN "quest_asset_link" AS "l" ON ("l"."asset_id" = "a"."id")"#));
        assert!(sql.contains(
            r#"FROM "asset_local" AS "a" JOIN "quest_asset_link_local" AS "l" ON ("l"."asset_id" = "a"."id")"#
        ));
        Ok(())
    }

    #[test]
    fn table_names_inside_identifiers_are_not_rewritten() -> Result<(), CoreError> {
        let sql = MergeQuery::new(Select::from("asset").columns(["source_asset_id"]))
            .render(&resolver())?;
        assert!(sql.contains(r#""asset_local"."source_asset_id""#));
        assert!(!sql.contains("source_asset_local_id"));
        Ok(())
    }

    #[test]
    fn json_aggregate_builds_named_objects_in_both_branches() -> Result<(), CoreError> {
        let select = Select::from("asset")
            .columns(["id"])
            .json_aggregate("items", JsonAggregate::new("vote", "asset_id").columns(["id", "polarity"]));
        let sql = MergeQuery::new(select).render(&resolver())?;
        assert!(sql.contains(
            r#"(SELECT json_group_array(json_object('id', "items_row"."id", 'polarity', "items_row"."polarity")) FROM "vote" AS "items_row" WHERE "items_row"."asset_id" = "asset"."id") AS "items""#
        ));
        assert!(sql.contains(r#"FROM "vote_local" AS "items_row" WHERE "items_row"."asset_id" = "asset_local"."id""#));
        Ok(())
    }

    #[test]
    fn filters_inline_escaped_literals() -> Result<(), CoreError> {
        let select = Select::from("quest").filter(Expr::and(vec![
            Expr::col("name").like("O'%"),
            Expr::col("parent_id").is_null(),
            Expr::col("id").in_list(["a", "b"]),
            Expr::or(vec![Expr::col("visible").equals(true), Expr::col("active").equals(false).negate()]),
        ]));
        let sql = select.render(&resolver(), DataSource::Synced)?;
        assert!(sql.contains(r#"("quest"."name" LIKE 'O''%')"#));
        assert!(sql.contains(r#"("quest"."parent_id" IS NULL)"#));
        assert!(sql.contains(r#"("quest"."id" IN ('a', 'b'))"#));
        assert!(sql.contains(r#"(("quest"."visible" = 1) OR (NOT ("quest"."active" = 0)))"#));
        assert!(!sql.contains('?'));
        Ok(())
    }

    #[test]
    fn group_by_and_count() -> Result<(), CoreError> {
        let select = Select::from("vote")
            .columns(["asset_id"])
            .project(Expr::count(None), "votes")
            .group_by(Expr::col("asset_id"))
            .order_by("votes", SortOrder::Desc)
            .offset(5);
        let sql = MergeQuery::new(select).render(&resolver())?;
        assert!(sql.contains(r#"COUNT(*) AS "votes""#));
        assert!(sql.contains(r#"GROUP BY "vote_local"."asset_id""#));
        assert!(sql.ends_with(r#"ORDER BY "votes" DESC LIMIT -1 OFFSET 5"#));
        Ok(())
    }

    #[test]
    fn unknown_references_fail() {
        let resolver = resolver();
        let unknown_column = Select::from("asset").columns(["nope"]).render(&resolver, DataSource::Synced);
        assert_eq!(
            unknown_column,
            Err(CoreError::UnknownColumn { table: "asset".to_string(), column: "nope".to_string() })
        );

        let unknown_order = MergeQuery::new(Select::from("asset").columns(["id"]).order_by("name", SortOrder::Asc))
            .render(&resolver);
        assert!(matches!(unknown_order, Err(CoreError::UnknownColumn { .. })));

        let unknown_table = MergeQuery::new(Select::from("recording")).render(&resolver);
        assert_eq!(unknown_table, Err(CoreError::UnknownTable("recording".to_string())));

        let reserved = Select::from("asset").project(Expr::value(1_i64), "source").render(&resolver, DataSource::Synced);
        assert!(matches!(reserved, Err(CoreError::InvalidQuery(_))));
    }

    #[test]
    fn ordering_by_source_is_allowed() -> Result<(), CoreError> {
        let sql = MergeQuery::new(Select::from("tag").order_by("source", SortOrder::Asc)).render(&resolver())?;
        assert!(sql.ends_with(r#"ORDER BY "source" ASC"#));
        Ok(())
    }

    #[test]
    fn referenced_tables_lists_root_joins_and_aggregates() {
        let select = Select::from("asset")
            .join(JoinKind::Left, "quest_asset_link", Expr::qualified("quest_asset_link", "asset_id").equals(Expr::qualified("asset", "id")))
            .json_aggregate("items", JsonAggregate::new("vote", "asset_id"));
        assert_eq!(select.referenced_tables(), vec!["asset", "quest_asset_link", "vote"]);
    }

    #[test]
    fn referenced_tables_are_unique_even_when_not_adjacent() {
        let select = Select::from("asset")
            .join(JoinKind::Inner, "quest", Expr::value(true))
            .json_aggregate("items", JsonAggregate::new("asset", "source_asset_id"));
        assert_eq!(select.referenced_tables(), vec!["asset", "quest"]);
    }

    #[test]
    fn equality_with_null_renders_as_is_null() -> Result<(), CoreError> {
        let select = Select::from("asset")
            .columns(["id"])
            .filter(Expr::col("name").equals(SqlValue::Null))
            .filter(Expr::col("metadata").compare(CompareOp::Ne, SqlValue::Null))
            .filter(Expr::value(SqlValue::Null).equals(Expr::col("project_id")));
        let sql = select.render(&resolver(), DataSource::Synced)?;
        assert!(sql.contains(r#"("asset"."name" IS NULL)"#), "{sql}");
        assert!(sql.contains(r#"("asset"."metadata" IS NOT NULL)"#), "{sql}");
        assert!(sql.contains(r#"("asset"."project_id" IS NULL)"#), "{sql}");
        assert!(!sql.contains("= NULL"), "{sql}");
        Ok(())
    }
}
