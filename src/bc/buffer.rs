//! Expert trajectory buffer - every expert (state, action) pair seen in a run

use rand::Rng;
use rand::seq::SliceRandom;

use crate::env::Action;
use crate::error::{Error, Result};

/// Append-only store of expert states and the actions the expert took in them.
///
/// States are recorded one step ahead of their actions: after each transition the
/// buffer holds exactly one state that is still waiting for its expert action.
#[derive(Debug, Clone)]
pub struct ExpertBuffer {
    state_size: usize,
    states: Vec<Vec<f32>>,
    actions: Vec<Action>,
}

/// One shuffled mini-batch, borrowed from the buffer
#[derive(Debug, Clone)]
pub struct MiniBatch<'a> {
    /// Buffer positions the rows were drawn from
    pub indices: Vec<usize>,
    pub states: Vec<&'a [f32]>,
    pub actions: Vec<&'a Action>,
}

impl ExpertBuffer {
    pub fn new(state_size: usize) -> Self {
        Self {
            state_size,
            states: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn state_size(&self) -> usize {
        self.state_size
    }

    /// Record the states the expert is about to act in
    pub fn append_states(&mut self, batch: &[Vec<f32>]) -> Result<()> {
        if let Some(row) = batch.iter().find(|row| row.len() != self.state_size) {
            return Err(Error::MalformedStep(format!(
                "expert state has {} values, expected {}",
                row.len(),
                self.state_size
            )));
        }
        self.states.extend(batch.iter().cloned());
        Ok(())
    }

    /// Record the expert's response to the previously appended states.
    ///
    /// The batch must answer every pending state, one action each.
    pub fn append_actions(&mut self, batch: &[Action]) -> Result<()> {
        let actions = self.actions.len() + batch.len();
        if batch.len() != self.pending_states() {
            return Err(Error::BufferMisaligned {
                states: self.states.len(),
                actions,
            });
        }
        self.actions.extend(batch.iter().cloned());
        Ok(())
    }

    /// Number of complete (state, action) pairs
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    /// States still waiting for the expert's action
    pub fn pending_states(&self) -> usize {
        self.states.len() - self.actions.len()
    }

    /// Draw up to `max_batches` disjoint mini-batches of exactly `batch_size` pairs
    /// from a fresh permutation of the buffer.
    ///
    /// Yields `min(len / batch_size, max_batches)` batches; nothing at all when the
    /// buffer holds less than one batch.
    pub fn shuffled_batches<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        max_batches: usize,
        rng: &mut R,
    ) -> ShuffledBatches<'_> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);

        let available = if batch_size == 0 {
            0
        } else {
            self.len() / batch_size
        };

        ShuffledBatches {
            buffer: self,
            order,
            batch_size,
            remaining: available.min(max_batches),
            cursor: 0,
        }
    }
}

/// Lazy iterator over the mini-batches of one permutation
#[derive(Debug)]
pub struct ShuffledBatches<'a> {
    buffer: &'a ExpertBuffer,
    order: Vec<usize>,
    batch_size: usize,
    remaining: usize,
    cursor: usize,
}

impl<'a> Iterator for ShuffledBatches<'a> {
    type Item = MiniBatch<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let end = self.cursor + self.batch_size;
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = end;

        let buffer = self.buffer;
        Some(MiniBatch {
            states: indices.iter().map(|&i| buffer.states[i].as_slice()).collect(),
            actions: indices.iter().map(|&i| &buffer.actions[i]).collect(),
            indices,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for ShuffledBatches<'_> {}
