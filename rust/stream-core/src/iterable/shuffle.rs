// rust/stream-core/src/iterable/shuffle.rs

//! Approximate shuffling with a fixed-size buffer.
//!
//! Records fill a buffer of `buffer_size`; once it is full each new record
//! replaces a randomly chosen buffered one, which is yielded. At the end of
//! the stream the remaining buffer is shuffled and drained.
//!
//! The buffer content is not part of the snapshot. Resuming refills the
//! buffer from the child's position, so the records that were buffered at
//! snapshot time are lost and the order differs from an uninterrupted run.

use std::collections::VecDeque;
use std::mem;

use tracing::warn;

use super::{BoxedIterable, ExamplesIterable};
use crate::error::Result;
use crate::features::Features;
use crate::generator::Generator;
use crate::records::{Key, Row};
use crate::state::IterableState;

/// Indices drawn from the generator at a time.
const RANDOM_BATCH_SIZE: usize = 1000;

struct ShufflePass {
    rng: Generator,
    indices: Vec<usize>,
    next_index: usize,
    buffer: Vec<(Key, Row)>,
    // Set once the child is exhausted.
    draining: Option<VecDeque<(Key, Row)>>,
}

impl ShufflePass {
    fn random_index(&mut self, buffer_size: usize) -> usize {
        if self.next_index >= self.indices.len() {
            self.indices = self.rng.integers(buffer_size, RANDOM_BATCH_SIZE);
            self.next_index = 0;
        }
        let i = self.indices[self.next_index];
        self.next_index += 1;
        i
    }
}

pub struct BufferShuffledExamplesIterable {
    ex_iterable: BoxedIterable,
    buffer_size: usize,
    generator: Generator,
    original_state: Option<IterableState>,
    pass: Option<ShufflePass>,
}

impl BufferShuffledExamplesIterable {
    pub fn new(ex_iterable: BoxedIterable, buffer_size: usize, generator: Generator) -> Self {
        Self {
            ex_iterable,
            buffer_size: buffer_size.max(1),
            generator,
            original_state: None,
            pass: None,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn open(&self) -> ShufflePass {
        ShufflePass {
            rng: self.generator.fork(),
            indices: Vec::new(),
            next_index: 0,
            buffer: Vec::with_capacity(self.buffer_size),
            draining: None,
        }
    }
}

impl ExamplesIterable for BufferShuffledExamplesIterable {
    fn name(&self) -> &'static str {
        "BufferShuffledExamplesIterable"
    }

    fn num_shards(&self) -> usize {
        self.ex_iterable.num_shards()
    }

    fn is_typed(&self) -> bool {
        self.ex_iterable.is_typed()
    }

    fn features(&self) -> Option<Features> {
        self.ex_iterable.features()
    }

    /// Shuffles the child's shards and reseeds the buffer with `generator`.
    fn shuffle_shards(&self, generator: &Generator) -> BoxedIterable {
        Box::new(Self::new(
            self.ex_iterable.shuffle_shards(generator),
            self.buffer_size,
            generator.clone(),
        ))
    }

    fn shard(&self, num_shards: usize, index: usize, contiguous: bool) -> Result<BoxedIterable> {
        Ok(Box::new(Self::new(
            self.ex_iterable.shard(num_shards, index, contiguous)?,
            self.buffer_size,
            self.generator.clone(),
        )))
    }

    fn boxed_clone(&self) -> BoxedIterable {
        Box::new(Self {
            original_state: self.original_state.clone(),
            ..Self::new(
                self.ex_iterable.boxed_clone(),
                self.buffer_size,
                self.generator.clone(),
            )
        })
    }

    fn init_state(&mut self) -> IterableState {
        let state = self.ex_iterable.init_state();
        self.original_state = Some(state.clone());
        self.pass = None;
        state
    }

    fn load_state(&mut self, state: &IterableState) -> Result<()> {
        if self
            .original_state
            .as_ref()
            .is_some_and(|original| original != state)
        {
            warn!(
                "Loading a snapshot of a shuffle buffer without the buffer content. \
                 The buffer will be refilled before new records are yielded."
            );
        }
        self.ex_iterable.load_state(state)?;
        self.pass = None;
        Ok(())
    }

    fn state(&self) -> IterableState {
        self.ex_iterable.state()
    }

    fn next_row(&mut self) -> Result<Option<(Key, Row)>> {
        let mut pass = match self.pass.take() {
            Some(pass) => pass,
            None => self.open(),
        };
        let result = self.advance(&mut pass);
        self.pass = Some(pass);
        result
    }
}

impl BufferShuffledExamplesIterable {
    fn advance(&mut self, pass: &mut ShufflePass) -> Result<Option<(Key, Row)>> {
        loop {
            if let Some(draining) = pass.draining.as_mut() {
                return Ok(draining.pop_front());
            }
            match self.ex_iterable.next_row()? {
                Some(record) if pass.buffer.len() == self.buffer_size => {
                    let i = pass.random_index(self.buffer_size);
                    return Ok(Some(mem::replace(&mut pass.buffer[i], record)));
                }
                Some(record) => pass.buffer.push(record),
                None => {
                    let mut rest = mem::take(&mut pass.buffer);
                    pass.rng.shuffle(&mut rest);
                    pass.draining = Some(rest.into());
                }
            }
        }
    }
}
