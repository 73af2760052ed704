//! Simple workers for interpreter tests.

use crate::core::{FieldMap, Item, MemberId, Token};
use crate::errors::DrainflowError;
use crate::unit::{Rate, Worker};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

type MapFn = Arc<dyn Fn(&Item) -> Item + Send + Sync>;

/// Pops `pop` items per firing and pushes `f` of each.
pub struct MapWorker {
    id: MemberId,
    inputs: [Token; 1],
    outputs: [Token; 1],
    rates: [Rate; 1],
    f: MapFn,
}

impl MapWorker {
    /// Creates a map worker.
    #[must_use]
    pub fn new(
        id: MemberId,
        input: Token,
        output: Token,
        pop: usize,
        f: impl Fn(&Item) -> Item + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            inputs: [input],
            outputs: [output],
            rates: [Rate::pop(pop.max(1))],
            f: Arc::new(f),
        }
    }
}

impl fmt::Debug for MapWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapWorker")
            .field("id", &self.id)
            .field("input", &self.inputs[0])
            .field("output", &self.outputs[0])
            .field("pop", &self.rates[0].pop)
            .finish_non_exhaustive()
    }
}

impl Worker for MapWorker {
    fn id(&self) -> MemberId {
        self.id
    }

    fn inputs(&self) -> &[Token] {
        &self.inputs
    }

    fn outputs(&self) -> &[Token] {
        &self.outputs
    }

    fn input_rates(&self) -> &[Rate] {
        &self.rates
    }

    fn work(&mut self, inputs: &mut [VecDeque<Item>], outputs: &mut [VecDeque<Item>]) -> Result<(), DrainflowError> {
        let (Some(input), Some(output)) = (inputs.first_mut(), outputs.first_mut()) else {
            return Err(DrainflowError::execution(format!("member {} fired without ports", self.id)));
        };
        for _ in 0..self.rates[0].pop {
            let item = input
                .pop_front()
                .ok_or_else(|| DrainflowError::execution(format!("member {} fired on a short input", self.id)))?;
            output.push_back((self.f)(&item));
        }
        Ok(())
    }
}

/// Passes items through one at a time and counts them. The count is its
/// drain state, under the field `count`.
#[derive(Debug)]
pub struct CountingWorker {
    id: MemberId,
    inputs: [Token; 1],
    outputs: [Token; 1],
    rates: [Rate; 1],
    count: u64,
}

impl CountingWorker {
    /// Creates a counting worker.
    #[must_use]
    pub fn new(id: MemberId, input: Token, output: Token) -> Self {
        Self {
            id,
            inputs: [input],
            outputs: [output],
            rates: [Rate::pop(1)],
            count: 0,
        }
    }

    /// Items passed so far.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl Worker for CountingWorker {
    fn id(&self) -> MemberId {
        self.id
    }

    fn inputs(&self) -> &[Token] {
        &self.inputs
    }

    fn outputs(&self) -> &[Token] {
        &self.outputs
    }

    fn input_rates(&self) -> &[Rate] {
        &self.rates
    }

    fn work(&mut self, inputs: &mut [VecDeque<Item>], outputs: &mut [VecDeque<Item>]) -> Result<(), DrainflowError> {
        let item = inputs
            .first_mut()
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| DrainflowError::execution(format!("member {} fired on a short input", self.id)))?;
        let output = outputs
            .first_mut()
            .ok_or_else(|| DrainflowError::execution(format!("member {} has no output", self.id)))?;
        output.push_back(item);
        self.count += 1;
        Ok(())
    }

    fn capture_state(&self) -> Option<FieldMap> {
        let mut fields = FieldMap::new();
        fields.insert("count".to_string(), self.count.into());
        Some(fields)
    }

    fn restore_state(&mut self, fields: &FieldMap) -> Result<(), DrainflowError> {
        if let Some(value) = fields.get("count") {
            self.count = value
                .as_u64()
                .ok_or_else(|| DrainflowError::execution(format!("member {}: count is not a number", self.id)))?;
        }
        Ok(())
    }
}
