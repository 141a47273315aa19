// rust/stream-core/src/state.rs

//! Checkpoint snapshots for the operator chain.
//!
//! Every stateful operator owns one variant of [`IterableState`]. A wrapping
//! operator embeds its child's snapshot by value, so the shape of a chain's
//! snapshot mirrors the chain itself. Operators that keep no position of
//! their own (step, column selection, formatting, buffer shuffle) report
//! their child's snapshot unchanged.
//!
//! # Example
//!
//! ```
//! use stream_core::state::{IterableState, SourceState};
//!
//! let state = IterableState::Source(SourceState { shard_idx: 1, shard_example_idx: 4 });
//! let json = serde_json::to_string(&state).unwrap();
//! assert_eq!(json, r#"{"type":"source","shard_idx":1,"shard_example_idx":4}"#);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};
use crate::generator::Generator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IterableState {
    Source(SourceState),
    Rebatched(RebatchedState),
    Mapped(MappedState),
    Cycling(CyclingState),
    RandomlyCycling(RandomlyCyclingState),
    VerticallyConcatenated(VerticallyConcatenatedState),
    HorizontallyConcatenated(HorizontallyConcatenatedState),
    Skip(SkipState),
    Take(TakeState),
    Repeat(RepeatState),
}

impl IterableState {
    /// Variant name, as written in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Source(_) => "source",
            Self::Rebatched(_) => "rebatched",
            Self::Mapped(_) => "mapped",
            Self::Cycling(_) => "cycling",
            Self::RandomlyCycling(_) => "randomly_cycling",
            Self::VerticallyConcatenated(_) => "vertically_concatenated",
            Self::HorizontallyConcatenated(_) => "horizontally_concatenated",
            Self::Skip(_) => "skip",
            Self::Take(_) => "take",
            Self::Repeat(_) => "repeat",
        }
    }
}

/// Error for a snapshot loaded into the wrong operator.
pub(crate) fn mismatch(operator: &str, expected: &str, got: &IterableState) -> StreamError {
    StreamError::state(
        operator,
        format!("expected a '{expected}' snapshot, got '{}'", got.kind()),
    )
}

/// Checks that per-source vectors match the number of sources.
pub(crate) fn check_len(operator: &str, field: &str, len: usize, expected: usize) -> Result<()> {
    if len != expected {
        return Err(StreamError::state(
            operator,
            format!("'{field}' has {len} entries for {expected} sources"),
        ));
    }
    Ok(())
}

/// Position of a source operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceState {
    /// Shards fully consumed.
    pub shard_idx: usize,
    /// Records consumed in the current shard.
    pub shard_example_idx: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebatchedState {
    pub examples_iterable: Box<IterableState>,
    /// Child snapshot taken before the chunk the next batch starts in.
    pub previous_state: Option<Box<IterableState>>,
    pub batch_idx: usize,
    /// Chunks consumed since `previous_state`.
    pub num_chunks_since_previous_state: usize,
    /// Rows of the next chunk already emitted in a previous batch.
    pub cropped_chunk_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedState {
    pub examples_iterable: Box<IterableState>,
    pub previous_state: Option<Box<IterableState>>,
    /// Outputs yielded since `previous_state`.
    pub num_examples_since_previous_state: usize,
    /// Index of the next input, as passed with `with_indices`.
    pub previous_state_example_idx: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CyclingState {
    pub ex_iterable_idx: usize,
    pub ex_iterables: Vec<IterableState>,
    /// Each source's snapshot before its buffered lookahead record.
    pub previous_states: Vec<Option<IterableState>>,
    pub is_exhausted: Vec<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomlyCyclingState {
    /// Generator state before the current batch of drawn indices.
    pub generator: Generator,
    /// Indices of the current batch already used.
    pub index_offset: usize,
    pub ex_iterables: Vec<IterableState>,
    pub previous_states: Vec<Option<IterableState>>,
    pub is_exhausted: Vec<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerticallyConcatenatedState {
    pub ex_iterable_idx: usize,
    pub ex_iterables: Vec<IterableState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HorizontallyConcatenatedState {
    pub ex_iterables: Vec<IterableState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipState {
    pub skipped: bool,
    pub examples_iterable: Box<IterableState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeState {
    pub num_taken: usize,
    pub examples_iterable: Box<IterableState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatState {
    pub repeat_index: usize,
    pub examples_iterable: Box<IterableState>,
}

/// Snapshot of a whole dataset, tagged with the epoch it was taken in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetState {
    pub examples_iterable: IterableState,
    pub epoch: u64,
}

impl DatasetState {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(shard_idx: usize, shard_example_idx: usize) -> IterableState {
        IterableState::Source(SourceState {
            shard_idx,
            shard_example_idx,
        })
    }

    #[test]
    fn test_nested_state_json_roundtrip() {
        let state = DatasetState {
            examples_iterable: IterableState::Skip(SkipState {
                skipped: true,
                examples_iterable: Box::new(IterableState::Mapped(MappedState {
                    examples_iterable: Box::new(source(2, 3)),
                    previous_state: Some(Box::new(source(2, 0))),
                    num_examples_since_previous_state: 3,
                    previous_state_example_idx: 10,
                })),
            }),
            epoch: 4,
        };
        let json = state.to_json().unwrap();
        assert!(json.contains(r#""type":"skip""#));
        assert!(json.contains(r#""type":"mapped""#));
        assert_eq!(DatasetState::from_json(&json).unwrap(), state);
    }

    #[test]
    fn test_random_cycling_state_keeps_generator() {
        let state = IterableState::RandomlyCycling(RandomlyCyclingState {
            generator: Generator::new(5),
            index_offset: 17,
            ex_iterables: vec![source(0, 1), source(0, 0)],
            previous_states: vec![Some(source(0, 0)), None],
            is_exhausted: vec![false, true],
        });
        let json = serde_json::to_string(&state).unwrap();
        let back: IterableState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.kind(), "randomly_cycling");
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = DatasetState::from_json(r#"{"examples_iterable":{"type":"bogus"},"epoch":0}"#);
        assert!(matches!(err, Err(StreamError::Serialization { .. })));
    }

    #[test]
    fn test_mismatch_error() {
        let err = mismatch("TakeExamplesIterable", "take", &source(0, 0));
        assert_eq!(
            err.to_string(),
            "State error in TakeExamplesIterable: expected a 'take' snapshot, got 'source'"
        );
        assert!(check_len("Cycling", "is_exhausted", 1, 2).is_err());
    }
}
