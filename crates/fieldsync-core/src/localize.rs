//! Derive the local (offline draft) table family from the synced catalog.

use std::collections::BTreeSet;

use crate::schema::{Catalog, TableDef};

/// Name of the local counterpart of `name`; already-suffixed names are kept.
#[must_use]
pub fn local_name(name: &str, suffix: &str) -> String {
    if name.ends_with(suffix) {
        name.to_string()
    } else {
        format!("{name}{suffix}")
    }
}

/// Clone `table` into its local counterpart.
///
/// Columns keep their order, types, nullability and defaults. Every reference to
/// a table in `family` (self references included) is re-pointed at the local
/// counterpart; references outside the family are left alone.
#[must_use]
pub fn localize_table(table: &TableDef, family: &BTreeSet<&str>, suffix: &str) -> TableDef {
    let mut local = table.clone();
    local.name = local_name(&table.name, suffix);
    for column in &mut local.columns {
        if let Some(fk) = &mut column.references {
            let base = fk.table.strip_suffix(suffix).unwrap_or(&fk.table);
            if family.contains(base) || family.contains(fk.table.as_str()) {
                fk.table = local_name(base, suffix);
            }
        }
    }
    local
}

/// Local family for a whole catalog. Running it on its own output is a no-op.
#[must_use]
pub fn localize_catalog(catalog: &Catalog, suffix: &str) -> Catalog {
    let family = catalog
        .tables
        .iter()
        .map(|table| table.name.strip_suffix(suffix).unwrap_or(&table.name))
        .collect::<BTreeSet<_>>();
    Catalog::new(
        catalog.tables.iter().map(|table| localize_table(table, &family, suffix)).collect(),
    )
}

/// DDL of the generated local family with a generated-file header.
#[must_use]
pub fn render_local_ddl(catalog: &Catalog, suffix: &str) -> String {
    let local = localize_catalog(catalog, suffix);
    format!(
        "-- AUTO-GENERATED. DO NOT EDIT.\n-- Local draft tables derived from the synced catalog.\n\n{}\n",
        local.create_sql()
    )
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::schema::{field_catalog, ColumnDef, ColumnType, ForeignKey};

    fn assert_isomorphic(synced: &Catalog, local: &Catalog, suffix: &str) {
        assert_eq!(synced.tables.len(), local.tables.len());
        for (remote, draft) in synced.tables.iter().zip(&local.tables) {
            assert_eq!(draft.name, format!("{}{suffix}", remote.name));
            assert_eq!(draft.versioned, remote.versioned);
            let remote_shape = remote
                .columns
                .iter()
                .map(|c| (c.name.as_str(), c.column_type, c.nullable))
                .collect::<Vec<_>>();
            let draft_shape = draft
                .columns
                .iter()
                .map(|c| (c.name.as_str(), c.column_type, c.nullable))
                .collect::<Vec<_>>();
            assert_eq!(remote_shape, draft_shape, "column shape diverged for {}", remote.name);

            for (remote_col, draft_col) in remote.columns.iter().zip(&draft.columns) {
                match (&remote_col.references, &draft_col.references) {
                    (Some(ForeignKey { table, column }), Some(local_fk)) => {
                        assert_eq!(local_fk.table, format!("{table}{suffix}"));
                        assert_eq!(&local_fk.column, column);
                    }
                    (None, None) => {}
                    other => panic!("reference presence diverged: {other:?}"),
                }
            }
        }
    }

    #[test]
    fn field_catalog_local_family_is_isomorphic() {
        let synced = field_catalog();
        let local = localize_catalog(&synced, "_local");
        assert_isomorphic(&synced, &local, "_local");
        assert_eq!(local.validate(), Ok(()));
    }

    #[test]
    fn self_references_point_at_the_local_table() {
        let local = localize_catalog(&field_catalog(), "_local");
        let Some(quest) = local.table("quest_local") else {
            panic!("quest_local missing");
        };
        let parent = quest.column("parent_id").and_then(|column| column.references.clone());
        assert_eq!(
            parent,
            Some(ForeignKey { table: "quest_local".to_string(), column: "id".to_string() })
        );
        let Some(asset) = local.table("asset_local") else {
            panic!("asset_local missing");
        };
        let source = asset.column("source_asset_id").and_then(|c| c.references.as_ref());
        assert_eq!(source.map(|fk| fk.table.as_str()), Some("asset_local"));
    }

    #[test]
    fn generator_is_idempotent() {
        let once = localize_catalog(&field_catalog(), "_local");
        let twice = localize_catalog(&once, "_local");
        assert_eq!(once, twice);
    }

    #[test]
    fn references_outside_the_family_are_untouched() {
        let mut asset = TableDef::new("asset");
        asset.columns.push(ColumnDef {
            name: "owner_id".to_string(),
            column_type: ColumnType::Text,
            nullable: true,
            default: None,
            references: Some(ForeignKey {
                table: "auth_users".to_string(),
                column: "id".to_string(),
            }),
        });
        let family = BTreeSet::from(["asset"]);
        let local = localize_table(&asset, &family, "_local");
        let fk = local.column("owner_id").and_then(|column| column.references.as_ref());
        assert_eq!(fk.map(|fk| fk.table.as_str()), Some("auth_users"));
    }

    #[test]
    fn rendered_ddl_targets_local_tables() {
        let ddl = render_local_ddl(&field_catalog(), "_local");
        assert!(ddl.starts_with("-- AUTO-GENERATED"));
        assert!(ddl.contains(r#"CREATE TABLE IF NOT EXISTS "quest_local""#));
        assert!(ddl.contains(r#"FOREIGN KEY ("parent_id") REFERENCES "quest_local"("id")"#));
        assert!(!ddl.contains(r#"REFERENCES "quest"("id")"#));
    }

    fn arb_column_type() -> impl Strategy<Value = ColumnType> {
        prop_oneof![
            Just(ColumnType::Text),
            Just(ColumnType::Integer),
            Just(ColumnType::Real),
            Just(ColumnType::Boolean),
            Just(ColumnType::Json),
            Just(ColumnType::Blob),
        ]
    }

    fn arb_catalog() -> impl Strategy<Value = Catalog> {
        let table_count = 1_usize..6;
        table_count.prop_flat_map(|count| {
            let column = (arb_column_type(), any::<bool>(), proptest::option::of(0..count));
            proptest::collection::vec(proptest::collection::vec(column, 0..6), count).prop_map(
                move |tables| {
                    let names = (0..count).map(|index| format!("t{index}")).collect::<Vec<_>>();
                    let defs = tables
                        .into_iter()
                        .enumerate()
                        .map(|(index, columns)| {
                            let mut table = TableDef::new(&names[index]);
                            for (position, (column_type, nullable, target)) in
                                columns.into_iter().enumerate()
                            {
                                let mut column = ColumnDef::new(&format!("c{position}"), column_type);
                                column.nullable = nullable;
                                if let Some(target) = target {
                                    column = column.references(&names[target]);
                                }
                                table.columns.push(column);
                            }
                            table
                        })
                        .collect();
                    Catalog::new(defs)
                },
            )
        })
    }

    proptest! {
        #[test]
        fn property_generated_family_is_isomorphic(catalog in arb_catalog()) {
            let local = localize_catalog(&catalog, "_local");
            assert_isomorphic(&catalog, &local, "_local");
            prop_assert_eq!(localize_catalog(&local, "_local"), local);
        }
    }
}
