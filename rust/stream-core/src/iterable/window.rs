// rust/stream-core/src/iterable/window.rs

//! Windowing operators: skip, take, step-stride and repeat.

use super::{BoxedIterable, ExamplesIterable};
use crate::error::Result;
use crate::features::Features;
use crate::generator::Generator;
use crate::records::{Key, Row};
use crate::sharding::split_number;
use crate::state::{mismatch, IterableState, RepeatState, SkipState, TakeState};

/// Drops the first `n` records.
///
/// The skip happens once per position: after it the snapshot records that
/// it was done, so a resumed stream does not skip again.
pub struct SkipExamplesIterable {
    ex_iterable: BoxedIterable,
    n: usize,
    block_sources_order_when_shuffling: bool,
    split_when_sharding: bool,
    skipped: bool,
}

impl SkipExamplesIterable {
    pub fn new(
        ex_iterable: BoxedIterable,
        n: usize,
        block_sources_order_when_shuffling: bool,
        split_when_sharding: bool,
    ) -> Self {
        Self {
            ex_iterable,
            n,
            block_sources_order_when_shuffling,
            split_when_sharding,
            skipped: false,
        }
    }

    fn rebuild(&self, ex_iterable: BoxedIterable, n: usize) -> Self {
        Self::new(
            ex_iterable,
            n,
            self.block_sources_order_when_shuffling,
            self.split_when_sharding,
        )
    }
}

impl ExamplesIterable for SkipExamplesIterable {
    fn name(&self) -> &'static str {
        "SkipExamplesIterable"
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

    /// Keeps the source order when blocked, since skipping after a shuffle
    /// would drop records from other shards.
    fn shuffle_shards(&self, generator: &Generator) -> BoxedIterable {
        if self.block_sources_order_when_shuffling {
            return self.boxed_clone();
        }
        Box::new(self.rebuild(self.ex_iterable.shuffle_shards(generator), self.n))
    }

    fn shard(&self, num_shards: usize, index: usize, contiguous: bool) -> Result<BoxedIterable> {
        if !self.split_when_sharding {
            return Ok(self.boxed_clone());
        }
        let n = split_number(self.n, num_shards)
            .get(index)
            .copied()
            .unwrap_or(0);
        Ok(Box::new(self.rebuild(
            self.ex_iterable.shard(num_shards, index, contiguous)?,
            n,
        )))
    }

    fn boxed_clone(&self) -> BoxedIterable {
        let mut copy = self.rebuild(self.ex_iterable.boxed_clone(), self.n);
        copy.skipped = self.skipped;
        Box::new(copy)
    }

    fn init_state(&mut self) -> IterableState {
        self.ex_iterable.init_state();
        self.skipped = false;
        self.state()
    }

    fn load_state(&mut self, state: &IterableState) -> Result<()> {
        let IterableState::Skip(s) = state else {
            return Err(mismatch(self.name(), "skip", state));
        };
        self.ex_iterable.load_state(&s.examples_iterable)?;
        self.skipped = s.skipped;
        Ok(())
    }

    fn state(&self) -> IterableState {
        IterableState::Skip(SkipState {
            skipped: self.skipped,
            examples_iterable: Box::new(self.ex_iterable.state()),
        })
    }

    fn next_row(&mut self) -> Result<Option<(Key, Row)>> {
        if !self.skipped {
            self.skipped = true;
            for _ in 0..self.n {
                if self.ex_iterable.next_row()?.is_none() {
                    return Ok(None);
                }
            }
        }
        self.ex_iterable.next_row()
    }
}

/// Yields at most `n` records.
pub struct TakeExamplesIterable {
    ex_iterable: BoxedIterable,
    n: usize,
    block_sources_order_when_shuffling: bool,
    split_when_sharding: bool,
    num_taken: usize,
}

impl TakeExamplesIterable {
    pub fn new(
        ex_iterable: BoxedIterable,
        n: usize,
        block_sources_order_when_shuffling: bool,
        split_when_sharding: bool,
    ) -> Self {
        Self {
            ex_iterable,
            n,
            block_sources_order_when_shuffling,
            split_when_sharding,
            num_taken: 0,
        }
    }

    fn rebuild(&self, ex_iterable: BoxedIterable, n: usize) -> Self {
        Self::new(
            ex_iterable,
            n,
            self.block_sources_order_when_shuffling,
            self.split_when_sharding,
        )
    }
}

impl ExamplesIterable for TakeExamplesIterable {
    fn name(&self) -> &'static str {
        "TakeExamplesIterable"
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

    fn shuffle_shards(&self, generator: &Generator) -> BoxedIterable {
        if self.block_sources_order_when_shuffling {
            return self.boxed_clone();
        }
        Box::new(self.rebuild(self.ex_iterable.shuffle_shards(generator), self.n))
    }

    /// Splits `n` across the shards, or keeps `n` for each shard when not
    /// splitting.
    fn shard(&self, num_shards: usize, index: usize, contiguous: bool) -> Result<BoxedIterable> {
        let n = if self.split_when_sharding {
            split_number(self.n, num_shards)
                .get(index)
                .copied()
                .unwrap_or(0)
        } else {
            self.n
        };
        Ok(Box::new(self.rebuild(
            self.ex_iterable.shard(num_shards, index, contiguous)?,
            n,
        )))
    }

    fn boxed_clone(&self) -> BoxedIterable {
        let mut copy = self.rebuild(self.ex_iterable.boxed_clone(), self.n);
        copy.num_taken = self.num_taken;
        Box::new(copy)
    }

    fn init_state(&mut self) -> IterableState {
        self.ex_iterable.init_state();
        self.num_taken = 0;
        self.state()
    }

    fn load_state(&mut self, state: &IterableState) -> Result<()> {
        let IterableState::Take(s) = state else {
            return Err(mismatch(self.name(), "take", state));
        };
        self.ex_iterable.load_state(&s.examples_iterable)?;
        self.num_taken = s.num_taken;
        Ok(())
    }

    fn state(&self) -> IterableState {
        IterableState::Take(TakeState {
            num_taken: self.num_taken,
            examples_iterable: Box::new(self.ex_iterable.state()),
        })
    }

    fn next_row(&mut self) -> Result<Option<(Key, Row)>> {
        if self.num_taken >= self.n {
            return Ok(None);
        }
        let record = self.ex_iterable.next_row()?;
        if record.is_some() {
            self.num_taken += 1;
        }
        Ok(record)
    }
}

/// Yields every `step`-th record starting at `offset`.
///
/// Reads `step` records at a time, so the child's snapshot after a yield is
/// already past the rest of the stride.
pub struct StepExamplesIterable {
    ex_iterable: BoxedIterable,
    step: usize,
    offset: usize,
}

impl StepExamplesIterable {
    pub fn new(ex_iterable: BoxedIterable, step: usize, offset: usize) -> Self {
        Self {
            ex_iterable,
            step: step.max(1),
            offset,
        }
    }
}

impl ExamplesIterable for StepExamplesIterable {
    fn name(&self) -> &'static str {
        "StepExamplesIterable"
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

    fn shuffle_shards(&self, generator: &Generator) -> BoxedIterable {
        Box::new(Self::new(
            self.ex_iterable.shuffle_shards(generator),
            self.step,
            self.offset,
        ))
    }

    fn shard(&self, num_shards: usize, index: usize, contiguous: bool) -> Result<BoxedIterable> {
        Ok(Box::new(Self::new(
            self.ex_iterable.shard(num_shards, index, contiguous)?,
            self.step,
            self.offset,
        )))
    }

    fn boxed_clone(&self) -> BoxedIterable {
        Box::new(Self::new(
            self.ex_iterable.boxed_clone(),
            self.step,
            self.offset,
        ))
    }

    fn init_state(&mut self) -> IterableState {
        self.ex_iterable.init_state()
    }

    fn load_state(&mut self, state: &IterableState) -> Result<()> {
        self.ex_iterable.load_state(state)
    }

    fn state(&self) -> IterableState {
        self.ex_iterable.state()
    }

    fn next_row(&mut self) -> Result<Option<(Key, Row)>> {
        let mut picked = None;
        for i in 0..self.step {
            match self.ex_iterable.next_row()? {
                Some(record) if i == self.offset => picked = Some(record),
                Some(_) => {}
                None => break,
            }
        }
        Ok(picked)
    }
}

/// Replays the child `num_times` times, or forever when `None`.
///
/// The child is rewound between laps. An unbounded repeat stops if a full
/// lap yields nothing.
pub struct RepeatExamplesIterable {
    ex_iterable: BoxedIterable,
    num_times: Option<usize>,
    repeat_index: usize,
    // Whether the current lap started from the beginning of the child.
    lap_from_start: bool,
    lap_yielded: bool,
}

impl RepeatExamplesIterable {
    pub fn new(ex_iterable: BoxedIterable, num_times: Option<usize>) -> Self {
        Self {
            ex_iterable,
            num_times,
            repeat_index: 0,
            lap_from_start: true,
            lap_yielded: false,
        }
    }
}

impl ExamplesIterable for RepeatExamplesIterable {
    fn name(&self) -> &'static str {
        "RepeatExamplesIterable"
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

    fn shuffle_shards(&self, generator: &Generator) -> BoxedIterable {
        Box::new(Self::new(
            self.ex_iterable.shuffle_shards(generator),
            self.num_times,
        ))
    }

    fn shard(&self, num_shards: usize, index: usize, contiguous: bool) -> Result<BoxedIterable> {
        Ok(Box::new(Self::new(
            self.ex_iterable.shard(num_shards, index, contiguous)?,
            self.num_times,
        )))
    }

    fn boxed_clone(&self) -> BoxedIterable {
        Box::new(Self {
            repeat_index: self.repeat_index,
            lap_from_start: self.lap_from_start,
            lap_yielded: self.lap_yielded,
            ..Self::new(self.ex_iterable.boxed_clone(), self.num_times)
        })
    }

    fn init_state(&mut self) -> IterableState {
        self.ex_iterable.init_state();
        self.repeat_index = 0;
        self.lap_from_start = true;
        self.lap_yielded = false;
        self.state()
    }

    fn load_state(&mut self, state: &IterableState) -> Result<()> {
        let IterableState::Repeat(s) = state else {
            return Err(mismatch(self.name(), "repeat", state));
        };
        self.ex_iterable.load_state(&s.examples_iterable)?;
        self.repeat_index = s.repeat_index;
        self.lap_from_start = false;
        self.lap_yielded = false;
        Ok(())
    }

    fn state(&self) -> IterableState {
        IterableState::Repeat(RepeatState {
            repeat_index: self.repeat_index,
            examples_iterable: Box::new(self.ex_iterable.state()),
        })
    }

    fn next_row(&mut self) -> Result<Option<(Key, Row)>> {
        loop {
            if self.num_times.is_some_and(|n| self.repeat_index >= n) {
                return Ok(None);
            }
            if let Some(record) = self.ex_iterable.next_row()? {
                self.lap_yielded = true;
                return Ok(Some(record));
            }
            if self.lap_from_start && !self.lap_yielded {
                return Ok(None);
            }
            self.repeat_index += 1;
            self.ex_iterable.init_state();
            self.lap_from_start = true;
            self.lap_yielded = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterable::test_utils::*;

    #[test]
    fn test_skip() {
        let mut it = SkipExamplesIterable::new(id_source(6, 2), 4, true, true);
        it.init_state();
        assert_eq!(drain_ids(&mut it), vec![4, 5]);
        assert_resumes_everywhere(&it);

        let mut past_end = SkipExamplesIterable::new(id_source(3, 1), 10, true, true);
        past_end.init_state();
        assert!(drain_ids(&mut past_end).is_empty());
    }

    #[test]
    fn test_skip_is_not_repeated_after_resume() {
        let mut it = SkipExamplesIterable::new(id_source(6, 1), 2, true, true);
        it.init_state();
        it.next_row().unwrap();
        let snapshot = it.state();
        let mut resumed = it.boxed_clone();
        resumed.load_state(&snapshot).unwrap();
        assert_eq!(drain_ids(resumed.as_mut()), vec![3, 4, 5]);
    }

    #[test]
    fn test_take() {
        let mut it = TakeExamplesIterable::new(id_source(6, 2), 4, true, true);
        it.init_state();
        assert_eq!(drain_ids(&mut it), vec![0, 1, 2, 3]);
        assert_resumes_everywhere(&it);
    }

    #[test]
    fn test_take_shard_splits_n() {
        let it = TakeExamplesIterable::new(id_source(8, 2), 5, true, true);
        let mut first = it.shard(2, 0, true).unwrap();
        first.init_state();
        assert_eq!(drain_ids(first.as_mut()), vec![0, 1, 2]);
        let mut second = it.shard(2, 1, true).unwrap();
        second.init_state();
        assert_eq!(drain_ids(second.as_mut()), vec![4, 5]);

        let unsplit = TakeExamplesIterable::new(id_source(8, 2), 5, true, false);
        let mut second = unsplit.shard(2, 1, true).unwrap();
        second.init_state();
        assert_eq!(drain_ids(second.as_mut()), vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_take_and_skip_block_shuffling() {
        let take = TakeExamplesIterable::new(id_source(8, 4), 3, true, true);
        let mut shuffled = take.shuffle_shards(&Generator::new(1));
        shuffled.init_state();
        assert_eq!(drain_ids(shuffled.as_mut()), vec![0, 1, 2]);

        let skip = SkipExamplesIterable::new(id_source(8, 4), 6, true, true);
        let mut shuffled = skip.shuffle_shards(&Generator::new(1));
        shuffled.init_state();
        assert_eq!(drain_ids(shuffled.as_mut()), vec![6, 7]);
    }

    #[test]
    fn test_step() {
        let mut it = StepExamplesIterable::new(id_source(10, 2), 3, 1);
        it.init_state();
        assert_eq!(drain_ids(&mut it), vec![1, 4, 7]);
        assert_resumes_everywhere(&it);

        let mut it = StepExamplesIterable::new(id_source(5, 1), 2, 0);
        it.init_state();
        assert_eq!(drain_ids(&mut it), vec![0, 2, 4]);
    }

    #[test]
    fn test_repeat() {
        let mut it = RepeatExamplesIterable::new(id_source(3, 1), Some(2));
        it.init_state();
        assert_eq!(drain_ids(&mut it), vec![0, 1, 2, 0, 1, 2]);
        assert_resumes_everywhere(&it);

        let mut none = RepeatExamplesIterable::new(id_source(3, 1), Some(0));
        none.init_state();
        assert!(drain_ids(&mut none).is_empty());
    }

    #[test]
    fn test_unbounded_repeat() {
        let mut it = RepeatExamplesIterable::new(id_source(2, 1), None);
        it.init_state();
        let ids: Vec<i64> = (0..7)
            .map(|_| it.next_row().unwrap().unwrap().1["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![0, 1, 0, 1, 0, 1, 0]);
        let IterableState::Repeat(state) = it.state() else {
            panic!("expected a repeat snapshot");
        };
        assert_eq!(state.repeat_index, 3);

        let mut empty = RepeatExamplesIterable::new(id_source(0, 1), None);
        empty.init_state();
        assert!(empty.next_row().unwrap().is_none());
    }
}
