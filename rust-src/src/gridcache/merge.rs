use std::cmp::Ordering;
use std::path::Path;

use failure::Error;
use itertools::{EitherOrBoth, Itertools};
use log::info;
use serde::{Deserialize, Serialize};

use crate::gridcache::common::*;
use crate::gridcache::error::*;
use crate::gridcache::format::encode_grids;
use crate::gridcache::store::{open_writable, same_path, RocksDBCache, ENTRY_MARKER};

/// Phrase whose values track a running maximum under `MergePolicy::Aggregate`.
pub const MAX_KEY: &str = "__MAX__";
/// Phrase whose values track a running sum under `MergePolicy::Aggregate`.
pub const COUNT_KEY: &str = "__COUNT__";

/// How two values lists stored under the same key are combined.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Concatenate and de-duplicate.
    Union,
    /// Like `Union`, except for the `__MAX__` and `__COUNT__` frequency keys.
    Aggregate,
}

fn combine(key: &[u8], a: Vec<u64>, b: Vec<u64>, policy: MergePolicy) -> Result<Vec<u64>, Error> {
    let is_entry = key.first() == Some(&ENTRY_MARKER);
    if policy == MergePolicy::Aggregate && is_entry {
        let phrase = CacheKey::read_from(&key[1..])?.phrase;
        if phrase == MAX_KEY {
            return Ok(a.iter().chain(b.iter()).max().cloned().into_iter().collect());
        }
        if phrase == COUNT_KEY {
            let total = a.iter().chain(b.iter()).fold(0u64, |sum, value| sum.saturating_add(*value));
            if total > MAX_GRID_VALUE {
                return Err(range_error("merged count too large to fit in a double"));
            }
            return Ok(vec![total]);
        }
    }

    let mut values = a;
    values.extend(b);
    sort_grids(&mut values);
    if !is_entry {
        values.truncate(PREFIX_MAX_GRID_LENGTH);
    }
    Ok(values)
}

/// Merges two persistent caches into a new one at `destination`.
///
/// Keys present in only one input are copied; keys present in both are combined according
/// to `policy`. Neither input is modified.
pub fn merge<A, B, D>(file_a: A, file_b: B, destination: D, policy: MergePolicy) -> Result<(), Error>
where
    A: AsRef<Path>,
    B: AsRef<Path>,
    D: AsRef<Path>,
{
    let destination = destination.as_ref();
    if same_path(file_a.as_ref(), destination) || same_path(file_b.as_ref(), destination) {
        return Err(invalid_argument("merge destination must differ from both inputs"));
    }

    let cache_a = RocksDBCache::new(file_a)?;
    let cache_b = RocksDBCache::new(file_b)?;
    let db = open_writable(destination)?;

    let joined = cache_a.records().merge_join_by(cache_b.records(), |a, b| match (a, b) {
        (Ok((key_a, _)), Ok((key_b, _))) => key_a.cmp(key_b),
        // surface read errors as early as possible
        (Err(_), _) => Ordering::Less,
        (_, Err(_)) => Ordering::Greater,
    });

    let mut shared = 0;
    let mut total = 0;
    for pair in joined {
        let (key, values) = match pair {
            EitherOrBoth::Left(record) | EitherOrBoth::Right(record) => record?,
            EitherOrBoth::Both(a, b) => {
                let (key, a_values) = a?;
                let (_, b_values) = b?;
                shared += 1;
                let values = combine(&key, a_values, b_values, policy)?;
                (key, values)
            }
        };
        db.put(&key, encode_grids(&values))?;
        total += 1;
    }

    info!(
        "merged {} and {} into {} ({:?}): {} records, {} shared",
        cache_a.path.display(),
        cache_b.path.display(),
        destination.display(),
        policy,
        total,
        shared
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry_key(phrase: &str) -> Vec<u8> {
        let mut key = vec![ENTRY_MARKER];
        CacheKey::new(phrase, None).unwrap().write_to(&mut key);
        key
    }

    #[test]
    fn combine_test() {
        let key = entry_key("....1");
        assert_eq!(
            combine(&key, vec![3, 2, 1, 0], vec![13, 12, 11, 10, 3], MergePolicy::Union).unwrap(),
            vec![13, 12, 11, 10, 3, 2, 1, 0]
        );
        assert_eq!(
            combine(&key, vec![3], vec![10], MergePolicy::Aggregate).unwrap(),
            vec![10, 3],
            "regular keys are unioned under aggregate too"
        );
    }

    #[test]
    fn combine_aggregate_test() {
        assert_eq!(
            combine(&entry_key(MAX_KEY), vec![1], vec![2], MergePolicy::Aggregate).unwrap(),
            vec![2]
        );
        assert_eq!(
            combine(&entry_key(COUNT_KEY), vec![1], vec![2], MergePolicy::Aggregate).unwrap(),
            vec![3]
        );
        assert_eq!(
            combine(&entry_key(COUNT_KEY), vec![1], vec![2], MergePolicy::Union).unwrap(),
            vec![2, 1],
            "sentinels are plain keys under union"
        );
        assert!(combine(&entry_key(COUNT_KEY), vec![MAX_GRID_VALUE], vec![1], MergePolicy::Aggregate)
            .is_err());
    }
}
