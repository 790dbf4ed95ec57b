//! Lookup transform tests against plain and materialized references.


use rowpipe_core::prelude::*;
use std::result::Result;
use rowpipe_operators::{
    read_all, BoxedTransform, LookupTransform, MaterializeTransform, MemorySource, OpError,
    SortTransform, Transform,
};
use test_data_gen::column_values;

fn orders_source() -> MemorySource {
    let table = Table::new(
        "orders",
        vec![
            Column::new("order_id", DataType::Int32),
            Column::new("cust", DataType::Int32),
        ],
    );
    let rows = [(1, Some(10)), (2, Some(20)), (3, Some(30)), (4, None)]
        .into_iter()
        .map(|(id, cust)| {
            Row::new(vec![
                Scalar::I32(id),
                cust.map(Scalar::I32).unwrap_or(Scalar::Null),
            ])
        })
        .collect();
    MemorySource::from_rows(table, rows).unwrap()
}

fn orders() -> BoxedTransform {
    Box::new(orders_source().into_transform())
}

/// Customer 10 has three rows, 20 has one, 30 has none.
fn customers_source() -> MemorySource {
    let table = Table::new(
        "customers",
        vec![
            Column::new("id", DataType::Int32),
            Column::new("name", DataType::String),
        ],
    );
    let rows = [(10, "ann"), (20, "bob"), (10, "cat"), (10, "dan")]
        .into_iter()
        .map(|(id, name)| Row::new(vec![Scalar::I32(id), Scalar::Str(name.into())]))
        .collect();
    MemorySource::from_rows(table, rows).unwrap()
}

fn lookup(strategy: DuplicateStrategy) -> LookupTransform {
    LookupTransform::new(
        orders(),
        Box::new(customers_source().into_transform()),
        vec![JoinPair::columns("cust", "id")],
        strategy,
    )
    .unwrap()
}

fn run(mut t: impl Transform) -> Result<Vec<Row>, OpError> {
    let cancel = CancelToken::new();
    t.open(AuditKey::new(1), &Query::new(), &cancel)?;
    read_all(&mut t, &cancel)
}

#[test]
fn test_all_expands_every_match_before_advancing() {
    let rows = run(lookup(DuplicateStrategy::All)).unwrap();
    // 3 matches + 1 match + no match + null key
    assert_eq!(rows.len(), 6);
    assert_eq!(
        column_values(&rows, 0),
        vec![1, 1, 1, 2, 3, 4].into_iter().map(Scalar::I32).collect::<Vec<_>>()
    );
    let names: Vec<_> = column_values(&rows[..3], 3);
    assert_eq!(
        names,
        vec![
            Scalar::Str("ann".into()),
            Scalar::Str("cat".into()),
            Scalar::Str("dan".into())
        ]
    );
    assert!(rows[4][2].is_null() && rows[4][3].is_null());
    assert!(rows[5][2].is_null());
}

#[test]
fn test_first_and_last_keep_one_match() {
    let first = run(lookup(DuplicateStrategy::First)).unwrap();
    let last = run(lookup(DuplicateStrategy::Last)).unwrap();
    assert_eq!(first.len(), 4);
    assert_eq!(last.len(), 4);
    assert_eq!(first[0][3], Scalar::Str("ann".into()));
    assert_eq!(last[0][3], Scalar::Str("dan".into()));
    assert_eq!(first[1][3], Scalar::Str("bob".into()));
}

#[test]
fn test_abend_fails_on_duplicates() {
    let mut t = lookup(DuplicateStrategy::Abend);
    let cancel = CancelToken::new();
    t.open(AuditKey::new(1), &Query::new(), &cancel).unwrap();
    match t.read_next(&cancel) {
        Err(OpError::DuplicateRows { count, key, .. }) => {
            assert_eq!(count, 3);
            assert!(key.contains("id=10"));
        }
        other => panic!("expected duplicate error, got {:?}", other),
    }
}

#[test]
fn test_output_schema_aliases_reference_columns() {
    let t = lookup(DuplicateStrategy::First);
    let table = t.table();
    assert_eq!(table.width(), 4);
    assert_eq!(table.index_of("customers.id"), Some(2));
    assert_eq!(table.index_of("customers.name"), Some(3));
    assert!(t.pass_through_columns());
}

#[test]
fn test_literal_join_pairs() {
    let t = LookupTransform::with_alias(
        orders(),
        Box::new(customers_source().into_transform()),
        vec![JoinPair::literal(20, "id")],
        DuplicateStrategy::Abend,
        "c",
    )
    .unwrap();
    let rows = run(t).unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| r[3] == Scalar::Str("bob".into())));
}

#[test]
fn test_materialized_reference_is_drained_once() {
    let reference = customers_source().restartable(false);
    let stats = reference.stats();
    let cached = MaterializeTransform::new(Box::new(reference.into_transform()));
    let t = LookupTransform::new(
        orders(),
        Box::new(cached),
        vec![JoinPair::columns("cust", "id")],
        DuplicateStrategy::All,
    )
    .unwrap();
    let rows = run(t).unwrap();
    assert_eq!(rows.len(), 6);
    assert_eq!(stats.opens(), 1);
    assert_eq!(stats.rows_read(), 4);
    // Lookups are served by the cache, never by the source.
    assert_eq!(stats.lookups(), 0);
}

#[test]
fn test_expanded_output_needs_an_explicit_sort() {
    let t = lookup(DuplicateStrategy::All);
    assert_eq!(t.produced_sort(), None);
    let mut sort = SortTransform::new(
        Box::new(t),
        vec![SortField::desc("customers.name")],
    )
    .unwrap();
    let cancel = CancelToken::new();
    sort.open(AuditKey::new(1), &Query::new(), &cancel).unwrap();
    assert!(!sort.is_pass_through());
    let rows = read_all(&mut sort, &cancel).unwrap();
    assert_eq!(rows[0][3], Scalar::Str("dan".into()));
    // Nulls sort first ascending, so last descending.
    assert!(rows[5][3].is_null());
}

#[test]
fn test_reset_replays_primary_without_reopening_reference() {
    let reference = customers_source();
    let stats = reference.stats();
    let mut t = LookupTransform::new(
        orders(),
        Box::new(reference.into_transform()),
        vec![JoinPair::columns("cust", "id")],
        DuplicateStrategy::First,
    )
    .unwrap();
    let cancel = CancelToken::new();
    t.open(AuditKey::new(1), &Query::new(), &cancel).unwrap();
    let first = read_all(&mut t, &cancel).unwrap();
    assert!(t.reset().unwrap());
    let second = read_all(&mut t, &cancel).unwrap();
    assert_eq!(first, second);
    assert_eq!(stats.opens(), 1);
}

fn run_with(mut t: impl Transform, query: &Query) -> Result<Vec<Row>, OpError> {
    let cancel = CancelToken::new();
    t.open(AuditKey::new(1), query, &cancel)?;
    read_all(&mut t, &cancel)
}

#[test]
fn test_reference_filter_applies_to_joined_rows() {
    let query = Query::new().with_filter(Filter::equals("customers.name", "cat"));
    let rows = run_with(lookup(DuplicateStrategy::All), &query).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], Scalar::I32(1));
    assert_eq!(rows[0][3], Scalar::Str("cat".into()));
}

#[test]
fn test_primary_filter_and_row_cap() {
    let query = Query::new()
        .with_filter(Filter::equals("order_id", 1))
        .with_rows(2);
    let rows = run_with(lookup(DuplicateStrategy::All), &query).unwrap();
    // Order 1 expands to three matches; the cap counts joined rows.
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r[0] == Scalar::I32(1)));
    assert_eq!(rows[1][3], Scalar::Str("cat".into()));
}

#[test]
fn test_row_cap_holds_after_reset() {
    let mut t = lookup(DuplicateStrategy::All);
    let cancel = CancelToken::new();
    t.open(AuditKey::new(1), &Query::new().with_rows(1), &cancel)
        .unwrap();
    assert_eq!(read_all(&mut t, &cancel).unwrap().len(), 1);
    assert!(t.reset().unwrap());
    let again = read_all(&mut t, &cancel).unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0][3], Scalar::Str("ann".into()));
}

#[test]
fn test_open_can_be_retried_after_reference_fails() {
    let primary = orders_source();
    let primary_stats = primary.stats();
    let reference = customers_source().fail_opens(1);
    let mut t = LookupTransform::new(
        Box::new(primary.into_transform()),
        Box::new(reference.into_transform()),
        vec![JoinPair::columns("cust", "id")],
        DuplicateStrategy::First,
    )
    .unwrap();
    let cancel = CancelToken::new();
    assert!(t.open(AuditKey::new(1), &Query::new(), &cancel).is_err());
    // The primary was released, so a second open starts cleanly.
    t.open(AuditKey::new(1), &Query::new(), &cancel).unwrap();
    let rows = read_all(&mut t, &cancel).unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[1][3], Scalar::Str("bob".into()));
    assert_eq!(primary_stats.opens(), 2);
}
