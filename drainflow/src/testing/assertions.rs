//! Test assertions for drain rounds.

use crate::core::{DrainData, Item};
use crate::events::{CollectingEventSink, DrainEvent};
use crate::graph::UnitGraph;

fn event_index(events: &[(String, Option<serde_json::Value>)], event: DrainEvent, unit: &str) -> Option<usize> {
    events.iter().position(|(kind, data)| {
        kind == event.as_str()
            && data
                .as_ref()
                .and_then(|d| d.get("unit"))
                .and_then(serde_json::Value::as_str)
                == Some(unit)
    })
}

/// Asserts that no unit was asked to drain before every one of its
/// predecessors completed or was forced.
pub fn assert_drain_order(sink: &CollectingEventSink, graph: &UnitGraph) {
    let events = sink.events();
    for node in graph.nodes() {
        let Some(requested) = event_index(&events, DrainEvent::UnitRequested, &node.id().to_string()) else {
            continue;
        };
        for predecessor in node.predecessors() {
            let name = predecessor.to_string();
            let done = event_index(&events, DrainEvent::UnitCompleted, &name)
                .or_else(|| event_index(&events, DrainEvent::UnitForced, &name));
            assert!(
                done.is_some_and(|done| done < requested),
                "{} was asked to drain before {} finished",
                node.id(),
                name
            );
        }
    }
}

/// Asserts that the items left in `data`, plus those already emitted, plus
/// those never offered, are exactly `expected` as a multiset.
pub fn assert_items_conserved(data: &DrainData, emitted: &[Item], unoffered: &[Item], expected: &[Item]) {
    let mut seen: Vec<String> = data
        .data()
        .values()
        .flatten()
        .chain(emitted)
        .chain(unoffered)
        .map(ToString::to_string)
        .collect();
    let mut wanted: Vec<String> = expected.iter().map(ToString::to_string).collect();
    seen.sort();
    wanted.sort();
    assert_eq!(seen, wanted, "items were lost or duplicated across the drain");
}
