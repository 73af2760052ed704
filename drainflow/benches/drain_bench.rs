//! Benchmarks for the hot paths of a drain: gate checks taken on every
//! step and the merge of per-unit drain data.

#![allow(clippy::expect_used)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use drainflow::config::DeploymentConfig;
use drainflow::core::{DrainData, DrainDataBuilder, FieldMap, Item, MemberId, Token};
use drainflow::runtime::Deployment;
use drainflow::testing::{MapUnitBuilder, VecSource};
use drainflow::unit::{ExecutionUnit, PhaseGates};
use serde_json::json;
use std::sync::Arc;

fn unit_data(unit: i32, tokens: i32, items: usize) -> DrainData {
    let mut builder = DrainDataBuilder::new();
    for t in 0..tokens {
        builder.extend_items(Token::new(unit * 100 + t, unit * 100 + t + 1), (0..items).map(|i| json!(i)));
    }
    let mut fields = FieldMap::new();
    fields.insert("count".to_string(), json!(unit));
    builder
        .put_state(MemberId(unit.unsigned_abs()), fields)
        .expect("one row per member");
    builder.build()
}

fn gate_benchmark(c: &mut Criterion) {
    let closed = PhaseGates::new();
    c.bench_function("gates_closed", |b| {
        b.iter(|| black_box(closed.past_init()) || black_box(closed.past_drain()));
    });

    let open = PhaseGates::new();
    open.open_init();
    c.bench_function("gates_init_open", |b| {
        b.iter(|| black_box(open.past_init()) && !black_box(open.past_drain()));
    });
}

fn merge_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain_data_merge");
    for units in [4, 16, 64] {
        let parts: Vec<DrainData> = (0..units).map(|u| unit_data(u, 4, 32)).collect();
        group.bench_with_input(BenchmarkId::from_parameter(units), &parts, |b, parts| {
            b.iter(|| {
                parts
                    .iter()
                    .rev()
                    .try_fold(DrainData::empty(), |acc, part| acc.merge(part))
                    .map(|merged| merged.item_count())
            });
        });
    }
    group.finish();
}

fn deployment_benchmark(c: &mut Criterion) {
    c.bench_function("chain_of_three_final_drain", |b| {
        b.iter(|| {
            let units: Vec<Arc<dyn ExecutionUnit>> = (0..3)
                .filter_map(|i| {
                    let input = if i == 0 { Token::new(-1, 0) } else { Token::new(i - 1, i) };
                    let output = if i == 2 { Token::new(i, -1) } else { Token::new(i, i + 1) };
                    let unit = MapUnitBuilder::new(input, output).cores(2).build(Item::clone);
                    unit.ok().map(|unit| Arc::new(unit) as Arc<dyn ExecutionUnit>)
                })
                .collect();
            let items: Vec<Item> = (0..256).map(|i| json!(i)).collect();
            let source = Arc::new(VecSource::new(Token::new(-1, 0), items));
            let deployment =
                Deployment::launch(units, source, &DeploymentConfig::default(), None).expect("valid chain");
            black_box(deployment.finish().expect("clean run").emitted.len())
        });
    });
}

criterion_group!(benches, gate_benchmark, merge_benchmark, deployment_benchmark);
criterion_main!(benches);
