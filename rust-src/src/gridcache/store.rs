use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use failure::Error;
use log::{debug, info};
use min_max_heap::MinMaxHeap;
use rocksdb::{Direction, IteratorMode, Options, DB};

use crate::gridcache::cache::GridCache;
use crate::gridcache::common::*;
use crate::gridcache::error::*;
use crate::gridcache::format::{decode_grids, encode_grids};

// keys consist of a marker byte indicating type (regular entry or one of the prefix memo
// tiers) followed by the phrase, the separator and the language bytes
pub(crate) const ENTRY_MARKER: u8 = 0;
pub(crate) const MEMO_T1_MARKER: u8 = 1;
pub(crate) const MEMO_T2_MARKER: u8 = 2;

/// An immutable cache backed by a RocksDB directory written by `MemoryCache::pack`.
#[derive(Debug)]
pub struct RocksDBCache {
    db: DB,
    pub path: PathBuf,
}

struct QueueElement {
    next_value: u64,
    boost: u64,
    values: std::vec::IntoIter<u64>,
}

impl Ord for QueueElement {
    fn cmp(&self, other: &Self) -> Ordering {
        self.next_value.cmp(&other.next_value)
    }
}

impl PartialOrd for QueueElement {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueElement {
    fn eq(&self, other: &Self) -> bool {
        self.next_value == other.next_value
    }
}

impl Eq for QueueElement {}

/// Opens an empty store at `path`, destroying whatever store was there before.
pub(crate) fn open_writable(path: &Path) -> Result<DB, Error> {
    if path.exists() {
        DB::destroy(&Options::default(), path).map_err(|err| {
            debug!("rocksdb destroy of {} failed: {}", path.display(), err);
            invalid_argument("unable to replace existing rocksdb file")
        })?;
    }
    let mut opts = Options::default();
    opts.create_if_missing(true);
    DB::open(&opts, path).map_err(|err| {
        debug!("rocksdb open of {} failed: {}", path.display(), err);
        invalid_argument("unable to open rocksdb file for packing")
    })
}

/// Same file on disk, whether or not either spelling of the path is canonical.
pub(crate) fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Phrase bytes of an entry key stripped to `limit`, with its language bytes re-appended.
fn memo_key(marker: u8, key: &[u8], phrase_len: usize, limit: usize) -> Vec<u8> {
    let mut memo = Vec::with_capacity(key.len() + 1);
    memo.push(marker);
    if phrase_len < limit {
        memo.extend_from_slice(key);
    } else {
        memo.extend_from_slice(&key[..limit]);
        memo.extend_from_slice(&key[phrase_len..]);
    }
    memo
}

/// Writes entries (encoded CacheKey -> grids) and the derived prefix memos into a new store.
pub(crate) fn write_store<'a, I>(path: &Path, entries: I) -> Result<(), Error>
where
    I: Iterator<Item = (&'a [u8], &'a Vec<u64>)>,
{
    let db = open_writable(path)?;
    let mut memos: BTreeMap<Vec<u8>, Vec<u64>> = BTreeMap::new();
    let mut entry_count = 0;
    let mut db_key: Vec<u8> = Vec::new();

    for (key, values) in entries {
        if values.is_empty() {
            continue;
        }
        db_key.clear();
        db_key.push(ENTRY_MARKER);
        db_key.extend_from_slice(key);
        db.put(&db_key, encode_grids(values))?;
        entry_count += 1;

        let phrase_len = key
            .iter()
            .position(|byte| *byte == LANGFIELD_SEPARATOR)
            .ok_or_else(|| io_error("stored key is missing its language separator"))?;

        memos
            .entry(memo_key(MEMO_T1_MARKER, key, phrase_len, MEMO_PREFIX_LENGTH_T1))
            .or_insert_with(Vec::new)
            .extend_from_slice(values);
        // phrases shorter than the first tier are fully covered by it
        if phrase_len >= MEMO_PREFIX_LENGTH_T1 {
            memos
                .entry(memo_key(MEMO_T2_MARKER, key, phrase_len, MEMO_PREFIX_LENGTH_T2))
                .or_insert_with(Vec::new)
                .extend_from_slice(values);
        }
    }

    for (key, values) in memos.iter_mut() {
        sort_grids(values);
        values.truncate(PREFIX_MAX_GRID_LENGTH);
        db.put(key, encode_grids(values))?;
    }

    info!("packed {} entries and {} prefix memos into {}", entry_count, memos.len(), path.display());
    Ok(())
}

impl RocksDBCache {
    /// Opens a packed cache read-only.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_owned();
        let mut opts = Options::default();
        opts.set_allow_mmap_reads(true);
        let db = DB::open_for_read_only(&opts, &path, false).map_err(|err| {
            debug!("rocksdb read-only open of {} failed: {}", path.display(), err);
            invalid_argument("unable to open rocksdb file for loading")
        })?;
        info!("opened rocksdb cache at {}", path.display());
        Ok(RocksDBCache { db, path })
    }

    /// Copies the whole store, memos included, into a new store at `path`.
    pub fn pack<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        if same_path(&self.path, path) {
            return Err(invalid_argument(
                "rocksdb file is already loaded read-only; unload first",
            ));
        }
        let clone = open_writable(path)?;
        let mut count = 0;
        for item in self.db.iterator(IteratorMode::Start) {
            let (key, value) = item?;
            clone.put(&key, &value)?;
            count += 1;
        }
        info!("copied {} records from {} into {}", count, self.path.display(), path.display());
        Ok(())
    }

    /// Every record, memos included, as raw `(key, grids)` pairs in key order.
    pub(crate) fn records<'i>(&'i self) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u64>), Error>> + 'i {
        self.db.iterator(IteratorMode::Start).map(|item| {
            let (key, value) = item?;
            Ok((key.to_vec(), decode_grids(&value)?))
        })
    }
}

impl GridCache for RocksDBCache {
    fn get(&self, phrase: &str, languages: Option<&[u32]>) -> Result<Option<Vec<u64>>, Error> {
        let key = CacheKey::new(phrase, languages)?;
        let mut db_key: Vec<u8> = vec![ENTRY_MARKER];
        key.write_to(&mut db_key);

        Ok(match self.db.get(&db_key)? {
            Some(value) => Some(decode_grids(&value)?),
            None => None,
        })
    }

    fn get_matching_values(
        &self,
        phrase: &str,
        prefix: PrefixMatch,
        langfield: u128,
        max_results: usize,
    ) -> Result<Vec<u64>, Error> {
        let search = match_prefix(phrase, prefix);

        // a word-boundary lookup needs one byte past the phrase, so make sure the memo
        // it reads from wasn't cut off right there
        let mut phrase_length = search.len();
        if prefix == PrefixMatch::WordBoundary {
            phrase_length += 1;
        }
        let marker = if prefix == PrefixMatch::Disabled {
            ENTRY_MARKER
        } else if phrase_length <= MEMO_PREFIX_LENGTH_T1 {
            MEMO_T1_MARKER
        } else if phrase_length <= MEMO_PREFIX_LENGTH_T2 {
            MEMO_T2_MARKER
        } else {
            ENTRY_MARKER
        };

        let mut db_prefix = Vec::with_capacity(search.len() + 1);
        db_prefix.push(marker);
        db_prefix.extend_from_slice(&search);

        let mut pri_queue = MinMaxHeap::<QueueElement>::new();
        for item in self.db.iterator(IteratorMode::From(&db_prefix, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(&db_prefix) {
                break;
            }
            if !accepts_key(&key, db_prefix.len(), prefix) {
                continue;
            }
            let boost =
                if key_lang_set(&key[1..])? & langfield != 0 { LANGUAGE_MATCH_BOOST } else { 0 };
            let mut values = decode_grids(&value)?.into_iter();
            if let Some(first) = values.next() {
                pri_queue.push(QueueElement { next_value: first | boost, boost, values });
            }
        }

        let mut out: Vec<u64> = Vec::new();
        while out.len() < max_results {
            let value = match pri_queue.peek_max_mut() {
                Some(mut best_entry) => {
                    let value = best_entry.next_value;
                    match best_entry.values.next() {
                        Some(next_value) => best_entry.next_value = next_value | best_entry.boost,
                        None => {
                            best_entry.pop();
                        }
                    }
                    value
                }
                None => break,
            };
            if out.last() != Some(&value) {
                out.push(value);
            }
        }
        Ok(out)
    }

    fn list(&self) -> Result<Vec<(String, Option<Vec<u32>>)>, Error> {
        let mut out = Vec::new();
        for item in self.db.iterator(IteratorMode::Start) {
            let (key, _) = item?;
            // entries sort ahead of the memos
            if key.first() != Some(&ENTRY_MARKER) {
                break;
            }
            let key = CacheKey::read_from(&key[1..])?;
            let languages = key.languages();
            out.push((key.phrase, languages));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gridcache::memory::MemoryCache;

    #[test]
    fn memo_key_test() {
        let key = CacheKey::new("testing", Some(&[1])).unwrap().to_bytes();
        assert_eq!(memo_key(MEMO_T1_MARKER, &key, 7, 3), b"\x01tes|\x02".to_vec());
        assert_eq!(memo_key(MEMO_T2_MARKER, &key, 7, 6), b"\x02testin|\x02".to_vec());

        let short = CacheKey::new("te", None).unwrap().to_bytes();
        assert_eq!(memo_key(MEMO_T1_MARKER, &short, 2, 3), b"\x01te|".to_vec());
    }

    #[test]
    fn pack_and_get_test() {
        let directory: tempfile::TempDir = tempfile::tempdir().unwrap();
        let mut memory = MemoryCache::new();
        memory.set("test", &[3, 1, 2], None, false).unwrap();
        memory.set("test", &[9], Some(&[2]), false).unwrap();
        memory.pack(directory.path()).unwrap();

        let store = RocksDBCache::new(directory.path()).unwrap();
        assert_eq!(store.get("test", None).unwrap(), Some(vec![3, 2, 1]));
        assert_eq!(store.get("test", Some(&[2])).unwrap(), Some(vec![9]));
        assert_eq!(store.get("tes", None).unwrap(), None);
        assert_eq!(
            store.list().unwrap(),
            vec![("test".to_owned(), None), ("test".to_owned(), Some(vec![2]))],
            "memos are not listed"
        );

        let records: Vec<_> = store.records().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 6, "two entries plus a memo per tier and language bucket");
    }

    #[test]
    fn open_missing_test() {
        let directory: tempfile::TempDir = tempfile::tempdir().unwrap();
        let err = RocksDBCache::new(directory.path().join("nope")).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CacheError>(),
            Some(&CacheError::InvalidArgument("unable to open rocksdb file for loading".into()))
        );
    }
}
