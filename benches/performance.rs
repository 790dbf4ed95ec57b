use criterion::{criterion_group, criterion_main, Criterion};
use rowpipe_core::prelude::*;
use rowpipe_mem::MemoryBudgetImpl;
use rowpipe_operators::{read_all, MaterializeTransform, MemorySource, SortTransform, Transform};

fn make_rows(rows: usize) -> (Table, Vec<Row>) {
    let table = Table::new(
        "bench",
        vec![
            Column::new("group", DataType::String),
            Column::new("order", DataType::Int64),
            Column::new("value", DataType::Float64),
        ],
    );
    let rows = (0..rows)
        .map(|i| {
            Row::new(vec![
                Scalar::Str(format!("group-{}", i % 4)),
                Scalar::I64(((i * 7919) % rows) as i64),
                Scalar::F64((i % 10) as f64),
            ])
        })
        .collect();
    (table, rows)
}

fn bench_sort_transform(c: &mut Criterion) {
    let (table, rows) = make_rows(4096);
    let budget = MemoryBudgetImpl::new(64 * 1024 * 1024);
    c.bench_function("sort_transform", |b| {
        b.iter(|| {
            let source = MemorySource::from_rows(table.clone(), rows.clone())
                .unwrap()
                .sort_pushdown(false);
            let mut sort = SortTransform::new(
                Box::new(source.into_transform()),
                vec![SortField::asc("group"), SortField::desc("order")],
            )
            .unwrap()
            .with_budget(budget.clone());
            let cancel = CancelToken::new();
            sort.open(AuditKey::default(), &Query::new(), &cancel).unwrap();
            read_all(&mut sort, &cancel).unwrap()
        })
    });
}

fn bench_materialized_lookup(c: &mut Criterion) {
    let (table, rows) = make_rows(4096);
    let source = MemorySource::from_rows(table, rows).unwrap();
    let mut cached = MaterializeTransform::new(Box::new(source.into_transform()));
    let cancel = CancelToken::new();
    cached.open(AuditKey::default(), &Query::new(), &cancel).unwrap();
    let mut key = 0i64;
    c.bench_function("materialized_lookup", |b| {
        b.iter(|| {
            key = (key + 1) % 4096;
            cached
                .lookup(&[Filter::equals("order", key)], DuplicateStrategy::First, &cancel)
                .unwrap()
        })
    });
}

criterion_group!(transforms, bench_sort_transform, bench_materialized_lookup);
criterion_main!(transforms);
