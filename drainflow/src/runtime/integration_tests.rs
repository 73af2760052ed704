//! End-to-end drains of in-process deployments.

use super::{Deployment, InputSource, RunOutcome};
use crate::buffer::Buffer;
use crate::config::{DeploymentConfig, DrainConfig, UnitConfig, WatchdogConfig};
use crate::core::{DrainData, Item, MemberId, Token};
use crate::drainer::{DrainKind, DrainerState};
use crate::events::{CollectingEventSink, DrainEvent};
use crate::testing::{
    assert_drain_order, assert_items_conserved, MapUnitBuilder, MapWorker, StuckUnit, VecSource,
};
use crate::unit::{BarrierUnit, CoreStatus, ExecutionUnit, Interpreter, Worker};
use pretty_assertions::assert_eq;
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn t(a: i32, b: i32) -> Token {
    Token::new(a, b)
}

fn items(range: std::ops::Range<i64>) -> Vec<Item> {
    range.map(|i| json!(i)).collect()
}

fn identity_chain(len: i32, cores: usize, batch: usize) -> Vec<Arc<BarrierUnit>> {
    (0..len)
        .map(|i| {
            let output = if i + 1 == len { t(i, -1) } else { t(i, i + 1) };
            let input = if i == 0 { t(-1, 0) } else { t(i - 1, i) };
            Arc::new(
                MapUnitBuilder::new(input, output)
                    .cores(cores)
                    .batch(batch)
                    .member(MemberId(u32::try_from(i).unwrap()))
                    .build(Item::clone)
                    .unwrap(),
            )
        })
        .collect()
}

fn erase(units: &[Arc<BarrierUnit>]) -> Vec<Arc<dyn ExecutionUnit>> {
    units.iter().map(|u| u.clone() as Arc<dyn ExecutionUnit>).collect()
}

fn emitted(outcome: &RunOutcome) -> Vec<Item> {
    outcome.emitted.values().flatten().cloned().collect()
}

#[test]
fn test_final_drain_empties_the_pipeline() {
    let producer = MapUnitBuilder::new(t(-1, 0), t(0, 1))
        .build(Item::clone)
        .unwrap();
    let consumer = MapUnitBuilder::new(t(0, 1), t(1, -1))
        .cores(2)
        .with_fallback()
        .build(Item::clone)
        .unwrap();
    let source = Arc::new(VecSource::new(t(-1, 0), items(0..100)));
    let deployment = Deployment::launch(
        vec![Arc::new(producer) as Arc<dyn ExecutionUnit>, Arc::new(consumer)],
        source.clone(),
        &DeploymentConfig::default().with_buffer_capacity(16),
        None,
    )
    .unwrap();
    let drainer = deployment.drainer().clone();

    let outcome = deployment.finish().unwrap();
    let data = outcome.drain_data.clone().unwrap();
    assert!(data.get_data(t(0, 1)).map_or(true, <[Item]>::is_empty));
    assert_eq!(data.item_count(), 0);
    assert_eq!(emitted(&outcome), items(0..100));
    assert_eq!(source.stopped_by(), Some(DrainKind::Final));
    assert_eq!(drainer.state(), DrainerState::Terminated);
    assert!(!drainer.request_drain(DrainKind::Intermediate).unwrap());

    let report = outcome.report.unwrap();
    assert_eq!(report.kind, DrainKind::Final);
    assert!(report.is_clean());
}

#[test]
fn test_intermediate_drain_loses_nothing_and_resumes() {
    let config = DeploymentConfig::default().with_buffer_capacity(10);
    let units = identity_chain(3, 1, 2);
    let source = Arc::new(VecSource::new(t(-1, 0), items(0..25)).with_chunk(3));
    let deployment = Deployment::launch(erase(&units), source.clone(), &config, None).unwrap();

    std::thread::sleep(Duration::from_millis(5));
    let first = deployment.pause().unwrap();
    let data = first.drain_data.clone().unwrap();
    assert_items_conserved(&data, &emitted(&first), &source.remaining_items(), &items(0..25));
    assert_eq!(source.stopped_by(), Some(DrainKind::Intermediate));

    // Resume in a fresh configuration with the same shape.
    let resumed_units = identity_chain(3, 1, 2);
    let resumed_source = Arc::new(source.resume());
    let deployment = Deployment::launch(erase(&resumed_units), resumed_source, &config, Some(&data)).unwrap();
    let second = deployment.finish().unwrap();

    let mut all = emitted(&first);
    all.extend(emitted(&second));
    let leftover = second.drain_data.unwrap();
    assert_items_conserved(&leftover, &all, &[], &items(0..25));

    // A batch of two strands at most one item per buffer, and what was
    // emitted is a prefix of the stream.
    assert!(leftover.item_count() <= 3);
    assert_eq!(all, items(0..25)[..all.len()].to_vec());

    // Counters carried across the pause.
    let processed = |d: &DrainData, m: u32| d.get_state(MemberId(m), "processed").and_then(serde_json::Value::as_u64);
    assert_eq!(processed(&leftover, 2), Some(u64::try_from(all.len()).unwrap()));
    assert!(processed(&leftover, 0) >= processed(&data, 0));
}

#[test]
fn test_no_steady_steps_after_drain() {
    let units = identity_chain(2, 2, 2);
    let source = Arc::new(VecSource::new(t(-1, 0), items(0..40)));
    let deployment =
        Deployment::launch(erase(&units), source, &DeploymentConfig::default().with_buffer_capacity(8), None).unwrap();
    let outcome = deployment.finish().unwrap();

    for unit in &units {
        let before = unit.execution_statistics();
        assert_eq!(outcome.statistics[&unit.id()], before);
        assert!(unit.gates().past_drain());
        for core in 0..unit.core_count() {
            let mut code = unit.core_code(core).unwrap();
            assert_eq!(code().unwrap(), CoreStatus::Drained);
        }
        assert_eq!(unit.execution_statistics().steady_steps, before.steady_steps);
    }
    // 40 items in rounds of 4 on each unit: 10 rounds of 2 steps.
    assert_eq!(outcome.statistics[&t(-1, 0)].steady_steps, 20);
}

#[test]
fn test_watchdog_forces_stuck_consumer() {
    let producer = Arc::new(MapUnitBuilder::new(t(-1, 0), t(0, 1)).build(Item::clone).unwrap());
    let stuck = Arc::new(StuckUnit::new([t(0, 1)], [t(1, -1)]));
    let config = DeploymentConfig::default().with_buffer_capacity(64).with_drain(
        DrainConfig::default().with_watchdog(WatchdogConfig::enabled_with_timeout(Duration::from_millis(100))),
    );
    let source = Arc::new(VecSource::new(t(-1, 0), items(0..10)));
    let deployment = Deployment::launch(
        vec![producer as Arc<dyn ExecutionUnit>, stuck.clone()],
        source,
        &config,
        None,
    )
    .unwrap();
    deployment.wait_exhausted();
    let stranded = deployment.buffer(t(0, 1)).unwrap().clone();

    let outcome = deployment.pause().unwrap();
    let report = outcome.report.unwrap();
    assert_eq!(report.forced_units, vec![t(0, 1)]);
    assert!(!report.is_clean());
    assert!(stuck.is_armed());
    assert!(!stuck.is_drained());

    // A forced unit contributes nothing, so the items waiting on its input
    // are not part of the round's data.
    let data = outcome.drain_data.unwrap();
    assert_eq!(data.item_count(), 0);
    assert_eq!(stranded.size(), 10);
}

#[test]
fn test_units_drain_in_dependency_order_under_random_delays() {
    let mut rng = rand::thread_rng();
    for round in 0..4 {
        let units: Vec<Arc<dyn ExecutionUnit>> = (0..4)
            .map(|i| {
                let input = if i == 0 { t(-1, 0) } else { t(i - 1, i) };
                let output = if i == 3 { t(i, -1) } else { t(i, i + 1) };
                let delay = rng.gen_range(0..300_u64);
                Arc::new(
                    MapUnitBuilder::new(input, output)
                        .cores(rng.gen_range(1..=3))
                        .build(move |v| {
                            std::thread::sleep(Duration::from_micros(delay));
                            v.clone()
                        })
                        .unwrap(),
                ) as Arc<dyn ExecutionUnit>
            })
            .collect();
        let source = Arc::new(VecSource::new(t(-1, 0), items(0..60)).with_chunk(rng.gen_range(1..8)));
        let deployment =
            Deployment::launch(units, source, &DeploymentConfig::default().with_buffer_capacity(6), None).unwrap();
        let sink = Arc::new(CollectingEventSink::new());
        deployment.drainer().set_event_sink(sink.clone());

        std::thread::sleep(Duration::from_millis(rng.gen_range(0..5)));
        let kind = if round % 2 == 0 { DrainKind::Intermediate } else { DrainKind::SemiFinal };
        let graph = deployment.graph().clone();
        deployment.drain_and_shutdown(kind).unwrap();

        assert_drain_order(&sink, &graph);
        assert_eq!(sink.count(DrainEvent::UnitCompleted), 4);
        assert_eq!(sink.count(DrainEvent::UnitForced), 0);
    }
}

#[cfg(feature = "persistence")]
#[test]
fn test_resume_from_persisted_drain_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("drain.json");
    let config = DeploymentConfig::default().with_buffer_capacity(4);

    let units = identity_chain(2, 1, 3);
    let source = Arc::new(VecSource::new(t(-1, 0), items(0..20)).with_chunk(2));
    let deployment = Deployment::launch(erase(&units), source.clone(), &config, None).unwrap();
    let first = deployment.pause().unwrap();
    crate::persist::dump_drain_data(&path, first.drain_data.as_ref().unwrap()).unwrap();

    let restored = crate::persist::read_drain_data(&path).unwrap();
    assert_eq!(Some(&restored), first.drain_data.as_ref());

    let units = identity_chain(2, 1, 3);
    let deployment = Deployment::launch(erase(&units), Arc::new(source.resume()), &config, Some(&restored)).unwrap();
    let second = deployment.finish().unwrap();

    let mut all = emitted(&first);
    all.extend(emitted(&second));
    assert_items_conserved(&second.drain_data.unwrap(), &all, &[], &items(0..20));
}

#[test]
fn test_initial_data_for_unknown_token_rejected() {
    let units = identity_chain(1, 1, 1);
    let mut data = std::collections::BTreeMap::new();
    data.insert(t(7, 8), items(0..1));
    let initial = DrainData::new(data, std::collections::BTreeMap::new());
    let source: Arc<dyn InputSource> = Arc::new(VecSource::new(t(-1, 0), items(0..1)));

    let err = Deployment::launch(erase(&units), source, &DeploymentConfig::default(), Some(&initial)).unwrap_err();
    assert!(err.to_string().contains("Token(7, 8)"));
}

#[test]
fn test_failed_unit_surfaces_on_finish() {
    let unit = MapUnitBuilder::new(t(-1, 0), t(0, -1))
        .config(UnitConfig::default().with_timings())
        .build(|v| {
            assert!(v.as_i64() != Some(3), "poisoned item");
            v.clone()
        })
        .unwrap();
    let source = Arc::new(VecSource::new(t(-1, 0), items(0..10)));
    let deployment = Deployment::launch(vec![Arc::new(unit) as Arc<dyn ExecutionUnit>], source, &DeploymentConfig::default(), None).unwrap();

    let err = deployment.finish().unwrap_err();
    assert!(err.to_string().contains("poisoned item"));
}

#[test]
fn test_pause_right_after_resume_returns_same_data() {
    let config = DeploymentConfig::default().with_buffer_capacity(4);
    let units = identity_chain(2, 1, 3);
    let source = Arc::new(VecSource::new(t(-1, 0), items(0..20)).with_chunk(2));
    let deployment = Deployment::launch(erase(&units), source, &config, None).unwrap();
    let first = deployment.pause().unwrap().drain_data.unwrap();

    // Residue never fills a batch of three, so nothing fires on resume.
    let units = identity_chain(2, 1, 3);
    let empty = Arc::new(VecSource::new(t(-1, 0), Vec::new()));
    let deployment = Deployment::launch(erase(&units), empty, &config, Some(&first)).unwrap();
    let second = deployment.pause().unwrap();

    assert!(emitted(&second).is_empty());
    assert_eq!(second.drain_data.unwrap(), first);
}

#[test]
fn test_failed_interpreter_surfaces_on_finish() {
    let workers: Vec<Box<dyn Worker>> = vec![Box::new(MapWorker::new(MemberId(0), t(-1, 0), t(0, -1), 1, |v| {
        assert!(v.as_i64() != Some(3), "poisoned item");
        v.clone()
    }))];
    let unit = Interpreter::new(workers, UnitConfig::default()).unwrap();
    let source = Arc::new(VecSource::new(t(-1, 0), items(0..10)));
    let deployment = Deployment::launch(vec![Arc::new(unit) as Arc<dyn ExecutionUnit>], source, &DeploymentConfig::default(), None).unwrap();

    let err = deployment.finish().unwrap_err();
    assert!(err.to_string().contains("poisoned item"));
}
