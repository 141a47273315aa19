// rust/stream-core/src/iterable/cycling.rs

//! Interleaving of several sources.
//!
//! Each source keeps one record of lookahead so exhaustion is known as soon
//! as its last record is picked. The snapshot of a source taken before its
//! lookahead is stored in `previous_states`, and resuming reloads it so the
//! buffered record is fetched again instead of being lost.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{BoxedIterable, ExamplesIterable};
use crate::error::{Result, StreamError};
use crate::features::Features;
use crate::generator::Generator;
use crate::records::{Key, Row};
use crate::state::{check_len, mismatch, CyclingState, IterableState, RandomlyCyclingState};

/// Indices drawn from the generator at a time.
const RANDOM_BATCH_SIZE: usize = 1000;

/// When an interleave stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoppingStrategy {
    /// Stop once any source is drained.
    #[default]
    FirstExhausted,
    /// Restart drained sources until every source was drained at least once.
    AllExhausted,
}

impl StoppingStrategy {
    pub fn is_met(&self, is_exhausted: &[bool]) -> bool {
        match self {
            StoppingStrategy::FirstExhausted => is_exhausted.iter().any(|&e| e),
            StoppingStrategy::AllExhausted => is_exhausted.iter().all(|&e| e),
        }
    }
}

impl FromStr for StoppingStrategy {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "first_exhausted" => Ok(StoppingStrategy::FirstExhausted),
            "all_exhausted" => Ok(StoppingStrategy::AllExhausted),
            other => Err(StreamError::config(format!(
                "unknown stopping strategy '{other}', expected 'first_exhausted' or 'all_exhausted'"
            ))),
        }
    }
}

impl fmt::Display for StoppingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoppingStrategy::FirstExhausted => write!(f, "first_exhausted"),
            StoppingStrategy::AllExhausted => write!(f, "all_exhausted"),
        }
    }
}

/// Children of an interleave with their lookahead bookkeeping.
struct Sources {
    ex_iterables: Vec<BoxedIterable>,
    previous_states: Vec<Option<IterableState>>,
    is_exhausted: Vec<bool>,
    // `None` until the source's lookahead is fetched; `Some(None)` marks the
    // end of the source.
    nexts: Vec<Option<Option<(Key, Row)>>>,
    open: bool,
}

impl Sources {
    fn new(ex_iterables: Vec<BoxedIterable>) -> Self {
        let n = ex_iterables.len();
        Self {
            ex_iterables,
            previous_states: vec![None; n],
            is_exhausted: vec![false; n],
            nexts: vec![None; n],
            open: false,
        }
    }

    fn len(&self) -> usize {
        self.ex_iterables.len()
    }

    fn boxed_clone(&self) -> Self {
        Self {
            previous_states: self.previous_states.clone(),
            is_exhausted: self.is_exhausted.clone(),
            ..Self::new(self.ex_iterables.iter().map(|e| e.boxed_clone()).collect())
        }
    }

    fn num_shards(&self) -> usize {
        self.ex_iterables
            .iter()
            .map(|e| e.num_shards())
            .min()
            .unwrap_or(0)
    }

    fn shuffled(&self, generator: &Generator) -> Vec<BoxedIterable> {
        self.ex_iterables
            .iter()
            .map(|e| e.shuffle_shards(generator))
            .collect()
    }

    fn sharded(&self, num_shards: usize, index: usize, contiguous: bool) -> Result<Vec<BoxedIterable>> {
        self.ex_iterables
            .iter()
            .map(|e| e.shard(num_shards, index, contiguous))
            .collect()
    }

    fn reset(&mut self) {
        for ex_iterable in &mut self.ex_iterables {
            ex_iterable.init_state();
        }
        let n = self.len();
        self.previous_states = vec![None; n];
        self.is_exhausted = vec![false; n];
        self.nexts = vec![None; n];
        self.open = false;
    }

    fn load(
        &mut self,
        operator: &str,
        ex_iterables: &[IterableState],
        previous_states: &[Option<IterableState>],
        is_exhausted: &[bool],
    ) -> Result<()> {
        let n = self.len();
        check_len(operator, "ex_iterables", ex_iterables.len(), n)?;
        check_len(operator, "previous_states", previous_states.len(), n)?;
        check_len(operator, "is_exhausted", is_exhausted.len(), n)?;
        for (ex_iterable, state) in self.ex_iterables.iter_mut().zip(ex_iterables) {
            ex_iterable.load_state(state)?;
        }
        self.previous_states = previous_states.to_vec();
        self.is_exhausted = is_exhausted.to_vec();
        self.nexts = vec![None; n];
        self.open = false;
        Ok(())
    }

    fn states(&self) -> Vec<IterableState> {
        self.ex_iterables.iter().map(|e| e.state()).collect()
    }

    fn ensure_open(&mut self) -> Result<()> {
        if self.open {
            return Ok(());
        }
        for (ex_iterable, previous) in self.ex_iterables.iter_mut().zip(&self.previous_states) {
            if let Some(previous) = previous {
                ex_iterable.load_state(previous)?;
            }
        }
        self.nexts = vec![None; self.len()];
        self.open = true;
        Ok(())
    }

    /// Takes source `i`'s buffered record and fetches the next one. A drained
    /// source is marked and rewound.
    fn pick(&mut self, i: usize) -> Result<Option<(Key, Row)>> {
        let result = match self.nexts[i].take() {
            Some(buffered) => buffered,
            None => self.ex_iterables[i].next_row()?,
        };
        self.previous_states[i] = Some(self.ex_iterables[i].state());
        match self.ex_iterables[i].next_row()? {
            Some(next) => self.nexts[i] = Some(Some(next)),
            None => {
                self.is_exhausted[i] = true;
                self.ex_iterables[i].init_state();
                self.previous_states[i] = None;
                self.nexts[i] = None;
            }
        }
        Ok(result)
    }
}

/// Round-robin interleave.
///
/// The stopping condition is checked whenever a round starts, so every
/// source contributes the same number of picks per round.
pub struct CyclingMultiSourcesExamplesIterable {
    sources: Sources,
    stopping_strategy: StoppingStrategy,
    ex_iterable_idx: usize,
}

impl CyclingMultiSourcesExamplesIterable {
    pub fn new(ex_iterables: Vec<BoxedIterable>, stopping_strategy: StoppingStrategy) -> Self {
        Self {
            sources: Sources::new(ex_iterables),
            stopping_strategy,
            ex_iterable_idx: 0,
        }
    }
}

impl ExamplesIterable for CyclingMultiSourcesExamplesIterable {
    fn name(&self) -> &'static str {
        "CyclingMultiSourcesExamplesIterable"
    }

    fn num_shards(&self) -> usize {
        self.sources.num_shards()
    }

    fn is_typed(&self) -> bool {
        self.sources.ex_iterables.first().is_some_and(|e| e.is_typed())
    }

    fn features(&self) -> Option<Features> {
        self.sources.ex_iterables.first().and_then(|e| e.features())
    }

    fn shuffle_shards(&self, generator: &Generator) -> BoxedIterable {
        Box::new(Self::new(self.sources.shuffled(generator), self.stopping_strategy))
    }

    fn shard(&self, num_shards: usize, index: usize, contiguous: bool) -> Result<BoxedIterable> {
        Ok(Box::new(Self::new(
            self.sources.sharded(num_shards, index, contiguous)?,
            self.stopping_strategy,
        )))
    }

    fn boxed_clone(&self) -> BoxedIterable {
        Box::new(Self {
            sources: self.sources.boxed_clone(),
            stopping_strategy: self.stopping_strategy,
            ex_iterable_idx: self.ex_iterable_idx,
        })
    }

    fn init_state(&mut self) -> IterableState {
        self.sources.reset();
        self.ex_iterable_idx = 0;
        self.state()
    }

    fn load_state(&mut self, state: &IterableState) -> Result<()> {
        let IterableState::Cycling(s) = state else {
            return Err(mismatch(self.name(), "cycling", state));
        };
        self.sources
            .load(self.name(), &s.ex_iterables, &s.previous_states, &s.is_exhausted)?;
        self.ex_iterable_idx = s.ex_iterable_idx;
        Ok(())
    }

    fn state(&self) -> IterableState {
        IterableState::Cycling(CyclingState {
            ex_iterable_idx: self.ex_iterable_idx,
            ex_iterables: self.sources.states(),
            previous_states: self.sources.previous_states.clone(),
            is_exhausted: self.sources.is_exhausted.clone(),
        })
    }

    fn next_row(&mut self) -> Result<Option<(Key, Row)>> {
        let n = self.sources.len();
        if n == 0 {
            return Ok(None);
        }
        self.sources.ensure_open()?;
        loop {
            let i = self.ex_iterable_idx % n;
            if i == 0 && self.stopping_strategy.is_met(&self.sources.is_exhausted) {
                return Ok(None);
            }
            self.ex_iterable_idx = (i + 1) % n;
            if let Some(record) = self.sources.pick(i)? {
                return Ok(Some(record));
            }
        }
    }
}

struct RandomPass {
    rng: Generator,
    indices: Vec<usize>,
}

/// Interleave drawing the next source at random, optionally weighted.
///
/// Source indices are drawn in batches. The snapshot keeps the generator as
/// it was before the current batch plus the offset into it, so a resumed
/// stream draws the same sequence.
pub struct RandomlyCyclingMultiSourcesExamplesIterable {
    sources: Sources,
    generator: Generator,
    probabilities: Option<Vec<f64>>,
    stopping_strategy: StoppingStrategy,
    state_generator: Generator,
    index_offset: usize,
    pass: Option<RandomPass>,
}

impl RandomlyCyclingMultiSourcesExamplesIterable {
    /// # Errors
    ///
    /// Returns a config error if `probabilities` does not have one
    /// non-negative weight per source, with a positive total.
    pub fn new(
        ex_iterables: Vec<BoxedIterable>,
        generator: Generator,
        probabilities: Option<Vec<f64>>,
        stopping_strategy: StoppingStrategy,
    ) -> Result<Self> {
        if let Some(probabilities) = &probabilities {
            if probabilities.len() != ex_iterables.len() {
                return Err(StreamError::config(format!(
                    "got {} probabilities for {} sources",
                    probabilities.len(),
                    ex_iterables.len()
                )));
            }
            if probabilities.iter().any(|p| !p.is_finite() || *p < 0.0)
                || probabilities.iter().sum::<f64>() <= 0.0
            {
                return Err(StreamError::config(format!(
                    "invalid probabilities {probabilities:?}"
                )));
            }
        }
        Ok(Self {
            sources: Sources::new(ex_iterables),
            state_generator: generator.clone(),
            generator,
            probabilities,
            stopping_strategy,
            index_offset: 0,
            pass: None,
        })
    }

    fn rebuild(&self, ex_iterables: Vec<BoxedIterable>, generator: Generator) -> Self {
        Self {
            sources: Sources::new(ex_iterables),
            state_generator: generator.clone(),
            generator,
            probabilities: self.probabilities.clone(),
            stopping_strategy: self.stopping_strategy,
            index_offset: 0,
            pass: None,
        }
    }

    fn draw(&self, rng: &mut Generator) -> Result<Vec<usize>> {
        match &self.probabilities {
            None => Ok(rng.integers(self.sources.len(), RANDOM_BATCH_SIZE)),
            Some(weights) => rng.choice(weights, RANDOM_BATCH_SIZE),
        }
    }

    fn next_index(&mut self) -> Result<usize> {
        let mut pass = match self.pass.take() {
            Some(pass) => pass,
            None => {
                let mut rng = self.state_generator.clone();
                let indices = self.draw(&mut rng)?;
                RandomPass { rng, indices }
            }
        };
        let i = pass.indices[self.index_offset % RANDOM_BATCH_SIZE];
        self.index_offset = (self.index_offset + 1) % RANDOM_BATCH_SIZE;
        if self.index_offset == 0 {
            self.state_generator = pass.rng.clone();
            pass.indices = self.draw(&mut pass.rng)?;
        }
        self.pass = Some(pass);
        Ok(i)
    }
}

impl ExamplesIterable for RandomlyCyclingMultiSourcesExamplesIterable {
    fn name(&self) -> &'static str {
        "RandomlyCyclingMultiSourcesExamplesIterable"
    }

    fn num_shards(&self) -> usize {
        self.sources.num_shards()
    }

    fn is_typed(&self) -> bool {
        self.sources.ex_iterables.first().is_some_and(|e| e.is_typed())
    }

    fn features(&self) -> Option<Features> {
        self.sources.ex_iterables.first().and_then(|e| e.features())
    }

    fn shuffle_shards(&self, generator: &Generator) -> BoxedIterable {
        Box::new(self.rebuild(self.sources.shuffled(generator), generator.clone()))
    }

    fn shard(&self, num_shards: usize, index: usize, contiguous: bool) -> Result<BoxedIterable> {
        Ok(Box::new(self.rebuild(
            self.sources.sharded(num_shards, index, contiguous)?,
            self.generator.clone(),
        )))
    }

    fn boxed_clone(&self) -> BoxedIterable {
        Box::new(Self {
            sources: self.sources.boxed_clone(),
            generator: self.generator.clone(),
            probabilities: self.probabilities.clone(),
            stopping_strategy: self.stopping_strategy,
            state_generator: self.state_generator.clone(),
            index_offset: self.index_offset,
            pass: None,
        })
    }

    fn init_state(&mut self) -> IterableState {
        self.sources.reset();
        self.state_generator = self.generator.clone();
        self.index_offset = 0;
        self.pass = None;
        self.state()
    }

    fn load_state(&mut self, state: &IterableState) -> Result<()> {
        let IterableState::RandomlyCycling(s) = state else {
            return Err(mismatch(self.name(), "randomly_cycling", state));
        };
        if s.index_offset >= RANDOM_BATCH_SIZE {
            return Err(StreamError::state(
                self.name(),
                format!("index offset {} is past the draw batch", s.index_offset),
            ));
        }
        self.sources
            .load(self.name(), &s.ex_iterables, &s.previous_states, &s.is_exhausted)?;
        self.state_generator = s.generator.clone();
        self.index_offset = s.index_offset;
        self.pass = None;
        Ok(())
    }

    fn state(&self) -> IterableState {
        IterableState::RandomlyCycling(RandomlyCyclingState {
            generator: self.state_generator.clone(),
            index_offset: self.index_offset,
            ex_iterables: self.sources.states(),
            previous_states: self.sources.previous_states.clone(),
            is_exhausted: self.sources.is_exhausted.clone(),
        })
    }

    fn next_row(&mut self) -> Result<Option<(Key, Row)>> {
        if self.sources.len() == 0 {
            return Ok(None);
        }
        self.sources.ensure_open()?;
        loop {
            if self.stopping_strategy.is_met(&self.sources.is_exhausted) {
                return Ok(None);
            }
            let i = self.next_index()?;
            if let Some(record) = self.sources.pick(i)? {
                return Ok(Some(record));
            }
        }
    }
}
