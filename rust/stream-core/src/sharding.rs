// rust/stream-core/src/sharding.rs

//! Shard partitioning for source generation arguments.
//!
//! A source is described by `GenKwargs`, a JSON object whose array-valued
//! entries list one element per shard. All arrays must share one length,
//! which is the number of shards; scalar entries are passed to every shard.

use std::collections::BTreeMap;
use std::ops::Range;

use serde_json::Value;

use crate::error::{Result, StreamError};
use crate::generator::Generator;

/// Keyword arguments handed to a generation function.
pub type GenKwargs = serde_json::Map<String, Value>;

/// Counts the shards described by `kwargs`.
///
/// # Errors
///
/// Returns a config error when array-valued entries have different lengths.
pub fn number_of_shards_in_gen_kwargs(kwargs: &GenKwargs) -> Result<usize> {
    let lengths: BTreeMap<&str, usize> = kwargs
        .iter()
        .filter_map(|(k, v)| v.as_array().map(|a| (k.as_str(), a.len())))
        .collect();
    let mut distinct: Vec<usize> = lengths.values().copied().collect();
    distinct.sort_unstable();
    distinct.dedup();
    if distinct.len() > 1 {
        let details: Vec<String> = lengths
            .iter()
            .map(|(k, l)| format!("- key {k} has length {l}"))
            .collect();
        return Err(StreamError::config(format!(
            "Sharding is ambiguous for this dataset: we found several data sources lists of different lengths, and we don't know over which list we should parallelize:\n{}",
            details.join("\n")
        )));
    }
    Ok(distinct.first().copied().unwrap_or(0).max(1))
}

/// Splits `num_shards` into at most `max_num_jobs` contiguous, non-empty
/// ranges. The first `num_shards % max_num_jobs` ranges get one extra shard.
pub fn distribute_shards(num_shards: usize, max_num_jobs: usize) -> Vec<Range<usize>> {
    let mut groups = Vec::new();
    if max_num_jobs == 0 {
        return groups;
    }
    let mut start = 0;
    for job in 0..max_num_jobs {
        let count = num_shards / max_num_jobs + usize::from(job < num_shards % max_num_jobs);
        if count == 0 {
            break;
        }
        groups.push(start..start + count);
        start += count;
    }
    groups
}

/// Splits `kwargs` into at most `max_num_jobs` argument sets.
pub fn split_gen_kwargs(kwargs: &GenKwargs, max_num_jobs: usize) -> Result<Vec<GenKwargs>> {
    let num_shards = number_of_shards_in_gen_kwargs(kwargs)?;
    if num_shards == 1 {
        return Ok(vec![kwargs.clone()]);
    }
    Ok(distribute_shards(num_shards, max_num_jobs)
        .into_iter()
        .map(|range| {
            kwargs
                .iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::Array(items) => Value::Array(items[range.clone()].to_vec()),
                        other => other.clone(),
                    };
                    (k.clone(), v)
                })
                .collect()
        })
        .collect())
}

/// Concatenates the lists of several argument sets; scalars come from the
/// first set.
pub fn merge_gen_kwargs(kwargs_list: &[GenKwargs]) -> GenKwargs {
    let Some(first) = kwargs_list.first() else {
        return GenKwargs::new();
    };
    first
        .iter()
        .map(|(k, v)| {
            let merged = match v {
                Value::Array(_) => Value::Array(
                    kwargs_list
                        .iter()
                        .filter_map(|kw| kw.get(k).and_then(Value::as_array))
                        .flat_map(|items| items.iter().cloned())
                        .collect(),
                ),
                other => other.clone(),
            };
            (k.clone(), merged)
        })
        .collect()
}

/// Permutes the shard lists of `kwargs`.
///
/// Lists of the same length receive the same permutation, so parallel lists
/// stay aligned.
pub fn shuffle_gen_kwargs(rng: &mut Generator, kwargs: &GenKwargs) -> GenKwargs {
    let mut sizes: Vec<usize> = kwargs
        .values()
        .filter_map(|v| v.as_array().map(Vec::len))
        .collect();
    sizes.sort_unstable();
    sizes.dedup();
    let permutations: BTreeMap<usize, Vec<usize>> =
        sizes.into_iter().map(|s| (s, rng.permutation(s))).collect();
    kwargs
        .iter()
        .map(|(k, v)| {
            let v = match v {
                Value::Array(items) => match permutations.get(&items.len()) {
                    Some(perm) => Value::Array(perm.iter().map(|&i| items[i].clone()).collect()),
                    None => v.clone(),
                },
                other => other.clone(),
            };
            (k.clone(), v)
        })
        .collect()
}

/// Shard indices owned by worker `index` out of `num_workers`.
///
/// Contiguous mode hands out consecutive runs; otherwise worker `i` gets
/// `i, i + n, i + 2n, ...`.
pub fn split_shard_indices_by_worker(
    total_shards: usize,
    num_workers: usize,
    index: usize,
    contiguous: bool,
) -> Vec<usize> {
    if num_workers == 0 {
        return Vec::new();
    }
    if contiguous {
        let div = total_shards / num_workers;
        let rem = total_shards % num_workers;
        let start = div * index + index.min(rem);
        let end = start + div + usize::from(index < rem);
        (start..end.min(total_shards)).collect()
    } else {
        (index..total_shards).step_by(num_workers).collect()
    }
}

/// Splits `num` into `n` parts whose sizes differ by at most one; the first
/// parts take the remainder.
pub fn split_number(num: usize, n: usize) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    (0..n)
        .map(|i| num / n + usize::from(i < num % n))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kwargs(value: Value) -> GenKwargs {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_number_of_shards() {
        assert_eq!(number_of_shards_in_gen_kwargs(&kwargs(json!({"x": 1}))).unwrap(), 1);
        assert_eq!(
            number_of_shards_in_gen_kwargs(&kwargs(json!({"files": ["a", "b", "c"], "n": 2})))
                .unwrap(),
            3
        );
        assert_eq!(number_of_shards_in_gen_kwargs(&kwargs(json!({"files": []}))).unwrap(), 1);
        let err =
            number_of_shards_in_gen_kwargs(&kwargs(json!({"a": [1, 2], "b": [1]}))).unwrap_err();
        assert!(err.to_string().contains("Sharding is ambiguous"));
    }

    #[test]
    fn test_distribute_shards() {
        assert_eq!(distribute_shards(10, 3), vec![0..4, 4..7, 7..10]);
        assert_eq!(distribute_shards(2, 4), vec![0..1, 1..2]);
        assert!(distribute_shards(0, 2).is_empty());
    }

    #[test]
    fn test_split_and_merge() {
        let kw = kwargs(json!({"files": ["a", "b", "c", "d", "e"], "mode": "r"}));
        let parts = split_gen_kwargs(&kw, 5).unwrap();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[2], kwargs(json!({"files": ["c"], "mode": "r"})));
        assert_eq!(merge_gen_kwargs(&parts), kw);

        let grouped = split_gen_kwargs(&kw, 2).unwrap();
        assert_eq!(grouped[0]["files"], json!(["a", "b", "c"]));
        assert_eq!(grouped[1]["files"], json!(["d", "e"]));
    }

    #[test]
    fn test_shuffle_keeps_lists_aligned() {
        let kw = kwargs(json!({"a": [0, 1, 2, 3, 4, 5], "b": [0, 1, 2, 3, 4, 5], "c": 9}));
        let mut rng = Generator::new(1);
        let shuffled = shuffle_gen_kwargs(&mut rng, &kw);
        assert_eq!(shuffled["a"], shuffled["b"]);
        assert_eq!(shuffled["c"], json!(9));

        let mut values: Vec<i64> = shuffled["a"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect();
        values.sort_unstable();
        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);

        let mut rng = Generator::new(1);
        assert_eq!(shuffle_gen_kwargs(&mut rng, &kw), shuffled);
    }

    #[test]
    fn test_split_shard_indices_contiguous_partition() {
        let mut all = Vec::new();
        for i in 0..3 {
            all.extend(split_shard_indices_by_worker(10, 3, i, true));
        }
        assert_eq!(all, (0..10).collect::<Vec<_>>());
        assert_eq!(split_shard_indices_by_worker(10, 3, 0, true), vec![0, 1, 2, 3]);
        assert_eq!(split_shard_indices_by_worker(10, 3, 2, true), vec![7, 8, 9]);
    }

    #[test]
    fn test_split_shard_indices_strided() {
        assert_eq!(split_shard_indices_by_worker(7, 3, 1, false), vec![1, 4]);
        assert!(split_shard_indices_by_worker(2, 4, 3, false).is_empty());
    }

    #[test]
    fn test_split_number() {
        assert_eq!(split_number(10, 3), vec![4, 3, 3]);
        assert_eq!(split_number(2, 4), vec![1, 1, 0, 0]);
        assert_eq!(split_number(10, 3).iter().sum::<usize>(), 10);
    }
}
