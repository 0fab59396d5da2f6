//! Row materialization and shape collapse.
//!
//! Result sets arrive fully drained as [`ResultSet`]s. The untyped path turns
//! each row into an ordered column-to-JSON mapping; the typed path projects
//! rows onto a [`Record`] through a cached accessor list.
//!
//! Collapse rules, applied per single result set:
//! - zero rows: an empty mapping (untyped) or an empty list (typed)
//! - one row: the row itself
//! - more rows: the list
//!
//! More than one result set yields the whole ordinal-indexed map.

use crate::error::{DbError, DbResult};
use crate::mapping::record::Record;
use crate::models::{Column, DbValue, Materialized, QueryResult, ResultSet, Row, TypedResult};
use dashmap::DashMap;
use std::any::TypeId;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Cached binding of one column to one record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accessor {
    pub ordinal: usize,
    /// Index into `Record::fields()`
    pub field: usize,
    pub nullable: bool,
}

type AccessorKey = (TypeId, String);

/// Process-wide accessor cache keyed by record type and column signature.
///
/// Concurrent misses may build the same list twice; the last insert wins and
/// readers only ever see complete lists.
static ACCESSORS: LazyLock<DashMap<AccessorKey, Arc<[Accessor]>>> = LazyLock::new(DashMap::new);

fn column_signature(columns: &[Column]) -> String {
    let mut signature = String::new();
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            signature.push('\u{1f}');
        }
        signature.push_str(&column.name.to_lowercase());
    }
    signature
}

fn build_accessors<T: Record>(columns: &[Column]) -> Vec<Accessor> {
    T::fields()
        .iter()
        .enumerate()
        .filter_map(|(field, def)| {
            columns
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(def.name))
                .map(|ordinal| Accessor {
                    ordinal,
                    field,
                    nullable: def.nullable,
                })
        })
        .collect()
}

/// Accessor list for `T` against a column set, built on first use.
pub fn accessors_for<T: Record>(columns: &[Column]) -> Arc<[Accessor]> {
    let key = (TypeId::of::<T>(), column_signature(columns));
    if let Some(hit) = ACCESSORS.get(&key) {
        return Arc::clone(hit.value());
    }

    let built: Arc<[Accessor]> = build_accessors::<T>(columns).into();
    debug!(
        target_type = std::any::type_name::<T>(),
        columns = columns.len(),
        mapped = built.len(),
        "Built accessor list"
    );
    ACCESSORS.insert(key, Arc::clone(&built));
    built
}

/// Number of cached accessor lists.
pub fn cached_shapes() -> usize {
    ACCESSORS.len()
}

/// Materialize every row of a set as `T`.
pub fn materialize<T: Record>(set: &ResultSet) -> DbResult<Vec<T>> {
    let accessors = accessors_for::<T>(&set.columns);
    let fields = T::fields();
    let mut items = Vec::with_capacity(set.rows.len());

    for row in &set.rows {
        let mut item = T::default();
        for accessor in accessors.iter() {
            let Some(raw) = row.get(accessor.ordinal) else {
                continue;
            };
            if raw.is_null() && !accessor.nullable {
                continue;
            }
            let def = &fields[accessor.field];
            (def.assign)(&mut item, raw).map_err(|failure| DbError::Coercion {
                field: def.name.to_string(),
                owner: std::any::type_name::<T>().to_string(),
                value: raw.to_string(),
                value_type: raw.type_name().to_string(),
                target: failure.target,
                reason: failure.reason,
            })?;
        }
        items.push(item);
    }

    Ok(items)
}

/// Convert every row of a set to an ordered column-to-value mapping.
pub fn to_rows(set: &ResultSet) -> Vec<Row> {
    set.rows
        .iter()
        .map(|values| {
            set.columns
                .iter()
                .zip(values)
                .map(|(column, value)| (column.name.clone(), value.to_json()))
                .collect()
        })
        .collect()
}

/// Collapse drained sets into an untyped result.
pub fn collapse_rows(sets: Vec<ResultSet>) -> QueryResult {
    if sets.len() > 1 {
        let indexed: BTreeMap<usize, Vec<Row>> = sets
            .iter()
            .enumerate()
            .map(|(index, set)| (index, to_rows(set)))
            .collect();
        return QueryResult::ResultSets(indexed);
    }

    let mut rows = sets.first().map(to_rows).unwrap_or_default();
    match rows.len() {
        0 => QueryResult::Row(Row::new()),
        1 => QueryResult::Row(rows.remove(0)),
        _ => QueryResult::Rows(rows),
    }
}

/// Collapse drained sets into a typed result.
pub fn collapse_typed<T: Record>(sets: Vec<ResultSet>) -> DbResult<Materialized<T>> {
    if sets.len() > 1 {
        let mut indexed = BTreeMap::new();
        for (index, set) in sets.iter().enumerate() {
            indexed.insert(index, materialize::<T>(set)?);
        }
        return Ok(Materialized::Sets(indexed));
    }

    let mut items = match sets.first() {
        Some(set) => materialize::<T>(set)?,
        None => Vec::new(),
    };
    Ok(if items.len() == 1 {
        Materialized::One(items.remove(0))
    } else {
        Materialized::Many(items)
    })
}

/// First column of the first row of the first set, uncoerced.
pub fn first_scalar(sets: &[ResultSet]) -> DbValue {
    sets.first()
        .and_then(|set| set.rows.first())
        .and_then(|row| row.first())
        .cloned()
        .unwrap_or(DbValue::Null)
}

/// Type-erased target shape for typed readers.
pub trait RowShape: Send + Sync {
    /// Name of the record type, for logging.
    fn type_name(&self) -> &'static str;

    fn materialize(&self, sets: Vec<ResultSet>) -> DbResult<QueryResult>;
}

/// The [`RowShape`] of record type `T`.
pub struct Shape<T>(PhantomData<fn() -> T>);

impl<T: Record> Shape<T> {
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T: Record> Default for Shape<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Record> RowShape for Shape<T> {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn materialize(&self, sets: Vec<ResultSet>) -> DbResult<QueryResult> {
        Ok(QueryResult::Typed(TypedResult::new(collapse_typed::<T>(
            sets,
        )?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Default, PartialEq)]
    struct Person {
        id: i64,
        name: String,
        nickname: Option<String>,
    }

    crate::impl_record!(Person {
        id: i64,
        name: String,
        nickname: Option<String>,
    });

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Nothing {
        untouched: i32,
    }

    crate::impl_record!(Nothing {});

    fn people(rows: Vec<Vec<DbValue>>) -> ResultSet {
        ResultSet::new(
            vec![
                Column::new("ID", "INTEGER"),
                Column::new("Name", "TEXT"),
                Column::new("nickname", "TEXT"),
            ],
            rows,
        )
    }

    #[test]
    fn test_untyped_single_row_collapses_to_mapping() {
        let set = people(vec![vec![DbValue::Int(1), DbValue::from("ada"), DbValue::Null]]);
        match collapse_rows(vec![set]) {
            QueryResult::Row(row) => {
                assert_eq!(row.get("ID"), Some(&json!(1)));
                assert_eq!(row.get("nickname"), Some(&serde_json::Value::Null));
                let keys: Vec<_> = row.keys().cloned().collect();
                assert_eq!(keys, vec!["ID", "Name", "nickname"]);
            }
            other => panic!("expected single row, got {other:?}"),
        }
    }

    #[test]
    fn test_untyped_zero_rows_is_empty_mapping() {
        match collapse_rows(vec![people(vec![])]) {
            QueryResult::Row(row) => assert!(row.is_empty()),
            other => panic!("expected empty mapping, got {other:?}"),
        }
        assert!(matches!(collapse_rows(vec![]), QueryResult::Row(r) if r.is_empty()));
    }

    #[test]
    fn test_untyped_many_rows_in_order() {
        let set = people(vec![
            vec![DbValue::Int(1), DbValue::from("a"), DbValue::Null],
            vec![DbValue::Int(2), DbValue::from("b"), DbValue::Null],
        ]);
        let rows = match collapse_rows(vec![set]) {
            QueryResult::Rows(rows) => rows,
            other => panic!("expected rows, got {other:?}"),
        };
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("Name"), Some(&json!("a")));
        assert_eq!(rows[1].get("Name"), Some(&json!("b")));
    }

    #[test]
    fn test_multiple_sets_are_indexed() {
        let first = people(vec![vec![DbValue::Int(1), DbValue::from("a"), DbValue::Null]]);
        let second = ResultSet::new(vec![Column::new("n", "")], vec![]);
        let sets = match collapse_rows(vec![first, second]) {
            QueryResult::ResultSets(sets) => sets,
            other => panic!("expected result sets, got {other:?}"),
        };
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[&0].len(), 1);
        assert!(sets[&1].is_empty());
    }

    #[test]
    fn test_typed_case_insensitive_match_and_null_policy() {
        let set = people(vec![vec![DbValue::Int(7), DbValue::Null, DbValue::Null]]);
        let person = match collapse_typed::<Person>(vec![set]).unwrap() {
            Materialized::One(p) => p,
            other => panic!("expected one, got {other:?}"),
        };
        assert_eq!(person.id, 7);
        // non-nullable field keeps its default on null
        assert_eq!(person.name, "");
        assert_eq!(person.nickname, None);
    }

    #[test]
    fn test_typed_zero_rows_is_empty_list() {
        let result = collapse_typed::<Person>(vec![people(vec![])]).unwrap();
        assert_eq!(result, Materialized::Many(vec![]));
    }

    #[test]
    fn test_typed_without_fields_yields_defaults() {
        let set = people(vec![
            vec![DbValue::Int(1), DbValue::from("a"), DbValue::Null],
            vec![DbValue::Int(2), DbValue::from("b"), DbValue::Null],
            vec![DbValue::Int(3), DbValue::from("c"), DbValue::Null],
        ]);
        let items = materialize::<Nothing>(&set).unwrap();
        assert_eq!(items, vec![Nothing::default(); 3]);
    }

    #[test]
    fn test_coercion_failure_names_field_and_value() {
        let set = people(vec![vec![
            DbValue::from("not-a-number"),
            DbValue::from("a"),
            DbValue::Null,
        ]]);
        let err = materialize::<Person>(&set).unwrap_err();
        match err {
            DbError::Coercion {
                field,
                owner,
                value,
                value_type,
                ..
            } => {
                assert_eq!(field, "id");
                assert!(owner.ends_with("Person"));
                assert_eq!(value, "not-a-number");
                assert_eq!(value_type, "text");
            }
            other => panic!("expected coercion error, got {other:?}"),
        }
    }

    #[test]
    fn test_accessors_cached_per_shape() {
        let columns = vec![Column::new("id", ""), Column::new("NAME", "")];
        let first = accessors_for::<Person>(&columns);
        let second = accessors_for::<Person>(&columns);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].ordinal, 1);
        assert!(cached_shapes() >= 1);
    }

    #[test]
    fn test_first_scalar() {
        let set = people(vec![vec![DbValue::Int(9), DbValue::from("a"), DbValue::Null]]);
        assert_eq!(first_scalar(&[set]), DbValue::Int(9));
        assert_eq!(first_scalar(&[]), DbValue::Null);
    }
}
