//! End-to-end pipeline tests: transforms feeding a transactional writer.


use rowpipe_core::prelude::*;
use rowpipe_exec::{Engine, ExecError, OperationSelector, Pipeline};
use rowpipe_io::{Connection, MemoryConnection, WriteOperation, WriterTask};
use rowpipe_operators::{BoxedTransform, LookupTransform, MemorySource, OpError, QueryTransform};
use test_data_gen::{column_values, generate_random_rows, source};

/// `staged(code, name, age, reason)`: the shape of the `people_log` target.
fn staged_table() -> Table {
    Table::new(
        "people_log",
        vec![
            Column::new("code", DataType::String).with_delta_type(DeltaType::DatabaseOperation),
            Column::new("name", DataType::String).with_delta_type(DeltaType::NaturalKey),
            Column::new("age", DataType::Int32),
            Column::new("reason", DataType::String).with_delta_type(DeltaType::RejectedReason),
        ],
    )
}

fn staged(code: &str, name: &str, age: i32, reason: Option<&str>) -> Row {
    Row::new(vec![
        Scalar::Str(code.into()),
        Scalar::Str(name.into()),
        Scalar::I32(age),
        reason.map(|r| Scalar::Str(r.into())).unwrap_or(Scalar::Null),
    ])
}

fn target() -> MemoryConnection {
    let mut conn = MemoryConnection::new("warehouse");
    conn.create_table(&staged_table()).unwrap();
    conn
}

fn s(v: &str) -> Scalar {
    Scalar::Str(v.into())
}

#[test]
fn test_operation_codes_drive_the_writer() {
    let conn = target();
    let rejects = MemoryConnection::new("rejects").with_dynamic_tables();
    let engine = Engine::new(EngineConfig::default());

    let rows = vec![
        staged("C", "ann", 30, None),
        staged("C", "bob", 40, None),
        staged("R", "eve", -1, Some("negative age")),
        staged("U", "ann", 31, None),
        staged("D", "bob", 0, None),
    ];
    let writer = engine.writer(
        staged_table(),
        Box::new(conn.clone()),
        Some(Box::new(rejects.clone())),
    );
    let mut pipeline = engine
        .pipeline(
            source(staged_table(), rows),
            writer,
            OperationSelector::for_table(&staged_table()),
        )
        .unwrap();

    let summary = pipeline.run(AuditKey::new(42), &CancelToken::new()).unwrap();
    assert_eq!(summary.rows_read, 5);
    assert_eq!(summary.counts.created, 2);
    assert_eq!(summary.counts.updated, 1);
    assert_eq!(summary.counts.deleted, 1);
    assert_eq!(summary.counts.rejected, 1);
    assert!(summary.peak_bytes.is_some());

    let stored = conn.rows("people_log");
    assert_eq!(column_values(&stored, 1), vec![s("ann")]);
    assert_eq!(stored[0][2], Scalar::I32(31));

    let rejected = rejects.rows("people_log_reject");
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0][3], s("negative age"));

    let json: serde_json::Value = serde_json::from_str(&summary.to_json().unwrap()).unwrap();
    assert_eq!(json["audit_key"], 42);
    assert_eq!(json["counts"]["created"], 2);
}

#[test]
fn test_source_failure_rolls_back() {
    let conn = target();
    let rows = (0..10)
        .map(|i| staged("C", &format!("p{}", i), i, None))
        .collect();
    let src = MemorySource::from_rows(staged_table(), rows)
        .unwrap()
        .fail_after(6);
    let writer = WriterTask::new(staged_table(), Box::new(conn.clone())).with_batch_size(2);
    let mut pipeline = Pipeline::new(
        Box::new(src.into_transform()),
        writer,
        OperationSelector::Fixed(WriteOperation::Create),
    )
    .unwrap();

    let err = pipeline.run(AuditKey::new(1), &CancelToken::new()).unwrap_err();
    assert!(matches!(
        err,
        ExecError::Operator(OpError::Connection { operation: "read", .. })
    ));
    assert!(conn.rows("people_log").is_empty());
    assert_eq!(conn.transaction_counts(), (0, 1));
}

#[test]
fn test_cancellation_is_distinct_and_rolls_back() {
    let conn = target();
    let cancel = CancelToken::new();
    cancel.cancel();
    let writer = WriterTask::new(staged_table(), Box::new(conn.clone()));
    let mut pipeline = Pipeline::new(
        source(staged_table(), vec![staged("C", "ann", 1, None)]),
        writer,
        OperationSelector::for_table(&staged_table()),
    )
    .unwrap();

    let err = pipeline.run(AuditKey::new(1), &cancel).unwrap_err();
    assert!(err.is_cancelled());
    assert!(!conn.in_transaction());
    assert_eq!(conn.transaction_counts(), (0, 1));
}

#[test]
fn test_engine_row_cap_limits_the_run() {
    let conn = target();
    let engine = Engine::new(EngineConfig {
        max_rows: Some(3),
        ..EngineConfig::default()
    });
    let rows = (0..10)
        .map(|i| staged("C", &format!("p{}", i), i, None))
        .collect();
    let writer = engine.writer(staged_table(), Box::new(conn.clone()), None);
    let mut pipeline = engine
        .pipeline(
            source(staged_table(), rows),
            writer,
            OperationSelector::for_table(&staged_table()),
        )
        .unwrap();
    let summary = pipeline.run(AuditKey::new(1), &CancelToken::new()).unwrap();
    assert_eq!(summary.rows_read, 3);
    assert_eq!(conn.rows("people_log").len(), 3);
}

#[test]
fn test_enriched_and_filtered_rows_are_loaded() {
    // people(name, age) enriched with teams(member, team), keeping adults.
    let people = Table::new(
        "people",
        vec![
            Column::new("name", DataType::String),
            Column::new("age", DataType::Int32),
        ],
    );
    let teams = Table::new(
        "teams",
        vec![
            Column::new("member", DataType::String),
            Column::new("team", DataType::String),
        ],
    );
    let people_rows = [("ann", 30), ("kid", 9), ("bob", 40)]
        .into_iter()
        .map(|(n, a)| Row::new(vec![s(n), Scalar::I32(a)]))
        .collect();
    let team_rows = [("ann", "red"), ("bob", "blue")]
        .into_iter()
        .map(|(m, t)| Row::new(vec![s(m), s(t)]))
        .collect();

    let engine = Engine::new(EngineConfig::default());
    let reference = engine.materialize(source(teams, team_rows));
    let lookup = LookupTransform::new(
        source(people, people_rows),
        Box::new(reference),
        vec![JoinPair::columns("name", "member")],
        DuplicateStrategy::Abend,
    )
    .unwrap();
    let adults = QueryTransform::new(
        Box::new(lookup),
        Query::new().with_filter(Filter::new(
            "age",
            CompareOp::GtEq,
            Operand::Value(Scalar::I32(18)),
        )),
    )
    .unwrap();
    let top: BoxedTransform = Box::new(engine.sort(Box::new(adults), vec![SortField::desc("age")]).unwrap());

    let target_table = top.table().schema();
    let mut conn = MemoryConnection::new("warehouse");
    conn.create_table(&target_table).unwrap();
    let writer = engine.writer(target_table.clone(), Box::new(conn.clone()), None);
    let mut pipeline = engine
        .pipeline(top, writer, OperationSelector::for_table(&target_table))
        .unwrap();
    pipeline.run(AuditKey::new(3), &CancelToken::new()).unwrap();

    let stored = conn.rows("people");
    assert_eq!(column_values(&stored, 0), vec![s("bob"), s("ann")]);
    assert_eq!(column_values(&stored, 3), vec![s("blue"), s("red")]);
}

#[test]
fn test_large_run_commits_in_batches() {
    let (table, rows) = generate_random_rows(5_000, 100, 99);
    let mut conn = MemoryConnection::new("bulk");
    conn.create_table(&table).unwrap();
    let engine = Engine::new(EngineConfig {
        write_batch_size: 250,
        ..EngineConfig::default()
    });
    let writer = engine.writer(table.clone(), Box::new(conn.clone()), None);
    let sorted = engine.sort(source(table.clone(), rows), vec![SortField::asc("key")]).unwrap();
    let mut pipeline = engine
        .pipeline(Box::new(sorted), writer, OperationSelector::for_table(&table))
        .unwrap();
    let summary = pipeline.run(AuditKey::new(9), &CancelToken::new()).unwrap();
    assert_eq!(summary.counts.created, 5_000);
    assert!(summary.sorted);

    let stored = conn.rows("keyed");
    assert!(stored
        .windows(2)
        .all(|w| w[0][0].try_cmp(&w[1][0]).unwrap().is_le()));
}
