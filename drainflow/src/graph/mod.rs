//! The dependency graph between execution units.
//!
//! Unit A feeds unit B when one of A's output tokens is one of B's input
//! tokens. The graph is built once per deployment and never changes; only
//! the per-node drain counters move during a round.

mod node;

pub use node::{NodeDrainState, UnitNode};

use crate::core::Token;
use crate::errors::ConfigurationError;
use crate::unit::ExecutionUnit;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Acyclic graph of [`UnitNode`]s with exactly one source.
#[derive(Debug)]
pub struct UnitGraph {
    nodes: BTreeMap<Token, UnitNode>,
    source: Token,
    order: Vec<Token>,
    head: BTreeSet<Token>,
    tail: BTreeSet<Token>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl UnitGraph {
    /// Builds the graph.
    ///
    /// Fails if a unit has no inputs, if two units read or write the same
    /// token, if the units form a cycle, or if there is not exactly one unit
    /// without predecessors.
    pub fn new(units: Vec<Arc<dyn ExecutionUnit>>) -> Result<Self, ConfigurationError> {
        let mut readers: BTreeMap<Token, Token> = BTreeMap::new();
        let mut writers: BTreeMap<Token, Token> = BTreeMap::new();
        let mut by_id: BTreeMap<Token, Arc<dyn ExecutionUnit>> = BTreeMap::new();

        for (index, unit) in units.into_iter().enumerate() {
            let Some(&id) = unit.inputs().first() else {
                return Err(ConfigurationError::UnitWithoutInputs { index });
            };
            claim(&mut readers, unit.inputs(), id, "input")?;
            claim(&mut writers, unit.outputs(), id, "output")?;
            by_id.insert(id, unit);
        }

        let mut successors: BTreeMap<Token, BTreeSet<Token>> =
            by_id.keys().map(|id| (*id, BTreeSet::new())).collect();
        let mut predecessors = successors.clone();
        for (token, producer) in &writers {
            if let Some(consumer) = readers.get(token) {
                if consumer != producer {
                    successors.entry(*producer).or_default().insert(*consumer);
                    predecessors.entry(*consumer).or_default().insert(*producer);
                }
            }
        }

        find_cycle(&successors)?;

        let sources: Vec<Token> = predecessors
            .iter()
            .filter(|(_, preds)| preds.is_empty())
            .map(|(id, _)| *id)
            .collect();
        let source = match sources.as_slice() {
            [] => return Err(ConfigurationError::NoSourceUnit),
            [only] => *only,
            _ => return Err(ConfigurationError::MultipleSourceUnits { units: sources }),
        };

        let order = topological_order(source, &successors, &predecessors);
        let head = readers.keys().filter(|t| !writers.contains_key(*t)).copied().collect();
        let tail = writers.keys().filter(|t| !readers.contains_key(*t)).copied().collect();

        let nodes = by_id
            .into_iter()
            .map(|(id, unit)| {
                let preds = predecessors.remove(&id).unwrap_or_default().into_iter().collect();
                let succs = successors.remove(&id).unwrap_or_default().into_iter().collect();
                (id, UnitNode::new(unit, preds, succs))
            })
            .collect::<BTreeMap<_, _>>();

        debug!(units = nodes.len(), source = %source, "Built unit graph");
        Ok(Self {
            nodes,
            source,
            order,
            head,
            tail,
        })
    }

    /// The unique node without predecessors.
    #[must_use]
    pub fn source(&self) -> &UnitNode {
        &self.nodes[&self.source]
    }

    /// Identity of the source node.
    #[must_use]
    pub fn source_id(&self) -> Token {
        self.source
    }

    /// Looks up a node.
    #[must_use]
    pub fn node(&self, id: Token) -> Option<&UnitNode> {
        self.nodes.get(&id)
    }

    /// All nodes, ordered by identity.
    pub fn nodes(&self) -> impl Iterator<Item = &UnitNode> {
        self.nodes.values()
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes. A built graph always has one.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node identities in a topological order starting at the source.
    #[must_use]
    pub fn topological_order(&self) -> &[Token] {
        &self.order
    }

    /// Tokens read by some unit but written by none: the pipeline's input.
    #[must_use]
    pub fn head_tokens(&self) -> &BTreeSet<Token> {
        &self.head
    }

    /// Tokens written by some unit but read by none: the pipeline's output.
    #[must_use]
    pub fn tail_tokens(&self) -> &BTreeSet<Token> {
        &self.tail
    }

    /// Every token that crosses a unit boundary.
    #[must_use]
    pub fn buffer_tokens(&self) -> BTreeSet<Token> {
        self.nodes
            .values()
            .flat_map(|n| n.unit().inputs().iter().chain(n.unit().outputs()))
            .copied()
            .collect()
    }

    /// Resets every node for a new drain round.
    pub(crate) fn reset(&self) {
        for node in self.nodes.values() {
            node.reset();
        }
    }
}

fn claim(
    owners: &mut BTreeMap<Token, Token>,
    tokens: &BTreeSet<Token>,
    unit: Token,
    side: &'static str,
) -> Result<(), ConfigurationError> {
    for token in tokens {
        if let Some(first) = owners.insert(*token, unit) {
            return Err(ConfigurationError::DuplicateTokenOwnership {
                token: *token,
                side,
                first,
                second: unit,
            });
        }
    }
    Ok(())
}

/// Three-color depth-first search. A gray successor closes a cycle; the
/// returned path starts and ends at that successor.
fn find_cycle(successors: &BTreeMap<Token, BTreeSet<Token>>) -> Result<(), ConfigurationError> {
    let adjacency: BTreeMap<Token, Vec<Token>> = successors
        .iter()
        .map(|(id, succs)| (*id, succs.iter().copied().collect()))
        .collect();
    let mut color: BTreeMap<Token, Color> = adjacency.keys().map(|id| (*id, Color::White)).collect();

    for start in adjacency.keys() {
        if color[start] != Color::White {
            continue;
        }
        let mut stack: Vec<(Token, usize)> = vec![(*start, 0)];
        color.insert(*start, Color::Gray);

        while let Some(&(current, next)) = stack.last() {
            let succs = &adjacency[&current];
            if next == succs.len() {
                color.insert(current, Color::Black);
                stack.pop();
                continue;
            }
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }

            let successor = succs[next];
            match color.get(&successor).copied().unwrap_or(Color::Black) {
                Color::White => {
                    color.insert(successor, Color::Gray);
                    stack.push((successor, 0));
                }
                Color::Gray => {
                    let from = stack.iter().position(|(id, _)| *id == successor).unwrap_or(0);
                    let mut path: Vec<Token> = stack[from..].iter().map(|(id, _)| *id).collect();
                    path.push(successor);
                    return Err(ConfigurationError::Cycle { path });
                }
                Color::Black => {}
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm from the source, smallest identity first.
fn topological_order(
    source: Token,
    successors: &BTreeMap<Token, BTreeSet<Token>>,
    predecessors: &BTreeMap<Token, BTreeSet<Token>>,
) -> Vec<Token> {
    let mut remaining: BTreeMap<Token, usize> =
        predecessors.iter().map(|(id, p)| (*id, p.len())).collect();
    let mut ready = VecDeque::from([source]);
    let mut order = Vec::with_capacity(remaining.len());

    while let Some(id) = ready.pop_front() {
        order.push(id);
        for succ in successors.get(&id).into_iter().flatten() {
            if let Some(count) = remaining.get_mut(succ) {
                *count -= 1;
                if *count == 0 {
                    ready.push_back(*succ);
                }
            }
        }
    }
    order
}
