use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use failure::Error;
use log::info;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};

use crate::gridcache::error::*;

pub const DEFAULT_SCAN_MAX: usize = 100;
pub const DEFAULT_RETURN_MAX: usize = 10;

/// Maps word indexes (positions in a sorted word list) onto the indexes of their
/// normalized forms.
pub trait Normalizer {
    fn normalize(&self, word_index: u32) -> Result<Option<Vec<u32>>, Error>;

    /// Normalized forms of the words in `[start, start + count)` that point outside of
    /// that range.
    fn normalize_prefix_range(&self, start: u32, count: u32) -> Result<Vec<u32>, Error>;
}

#[derive(Debug)]
pub struct NormalizationCache {
    db: DB,
    read_only: bool,
    pub path: PathBuf,
}

fn encode_key(id: u32) -> Result<Vec<u8>, Error> {
    let mut key = Vec::with_capacity(4);
    key.write_u32::<BigEndian>(id)?;
    Ok(key)
}

fn decode_key(key: &[u8]) -> Result<u32, Error> {
    if key.len() != 4 {
        return Err(io_error("corrupt normalization key"));
    }
    Ok(BigEndian::read_u32(key))
}

fn decode_values(value: &[u8]) -> Result<Vec<u32>, Error> {
    if value.len() % 4 != 0 {
        return Err(io_error("corrupt normalization value"));
    }
    Ok(value.chunks(4).map(LittleEndian::read_u32).collect())
}

impl NormalizationCache {
    /// Opens (creating if needed, unless `read_only`) the cache at `path`.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self, Error> {
        let path = path.as_ref().to_owned();
        let mut opts = Options::default();
        let db = if read_only {
            DB::open_for_read_only(&opts, &path, false)
        } else {
            opts.create_if_missing(true);
            DB::open(&opts, &path)
        }
        .map_err(|err| invalid_argument(format!("unable to open normalization cache: {}", err)))?;
        info!("opened normalization cache at {} (read only: {})", path.display(), read_only);
        Ok(NormalizationCache { db, read_only, path })
    }

    pub fn write_batch(&self, entries: &[(u32, Vec<u32>)]) -> Result<(), Error> {
        if self.read_only {
            return Err(invalid_argument("normalization cache was opened read-only"));
        }
        let mut batch = WriteBatch::default();
        for (id, targets) in entries {
            let mut value = Vec::with_capacity(targets.len() * 4);
            for target in targets {
                value.write_u32::<LittleEndian>(*target)?;
            }
            batch.put(encode_key(*id)?, value);
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn get(&self, id: u32) -> Result<Option<Vec<u32>>, Error> {
        match self.db.get(encode_key(id)?)? {
            Some(value) => Ok(Some(decode_values(&value)?)),
            None => Ok(None),
        }
    }

    /// Scans the entries of `[start, start + count)` in id order and collects targets that
    /// fall outside of that range. Stops after `scan_max` entries or `return_max` targets.
    pub fn get_prefix_range(
        &self,
        start: u32,
        count: u32,
        scan_max: usize,
        return_max: usize,
    ) -> Result<Vec<u32>, Error> {
        let ceiling = start as u64 + count as u64;
        let start_key = encode_key(start)?;
        let mut out = Vec::new();
        let mut scanned = 0;

        for item in self.db.iterator(IteratorMode::From(&start_key, Direction::Forward)) {
            let (key, value) = item?;
            if decode_key(&key)? as u64 >= ceiling {
                break;
            }
            for target in decode_values(&value)? {
                if target < start || target as u64 >= ceiling {
                    out.push(target);
                    if out.len() >= return_max {
                        return Ok(out);
                    }
                }
            }
            scanned += 1;
            if scanned >= scan_max {
                break;
            }
        }
        Ok(out)
    }

    /// Every entry, in id order.
    pub fn get_all(&self) -> Result<Vec<(u32, Vec<u32>)>, Error> {
        self.db
            .iterator(IteratorMode::Start)
            .map(|item| {
                let (key, value) = item?;
                Ok((decode_key(&key)?, decode_values(&value)?))
            })
            .collect()
    }
}

impl Normalizer for NormalizationCache {
    fn normalize(&self, word_index: u32) -> Result<Option<Vec<u32>>, Error> {
        self.get(word_index)
    }

    fn normalize_prefix_range(&self, start: u32, count: u32) -> Result<Vec<u32>, Error> {
        self.get_prefix_range(start, count, DEFAULT_SCAN_MAX, DEFAULT_RETURN_MAX)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_order_test() {
        // big-endian keys sort numerically
        assert!(encode_key(255).unwrap() < encode_key(256).unwrap());
        assert_eq!(decode_key(&encode_key(70_000).unwrap()).unwrap(), 70_000);
        assert!(decode_key(&[1, 2, 3]).is_err());
    }

    #[test]
    fn decode_values_test() {
        assert_eq!(decode_values(&[1, 0, 0, 0, 0, 1, 0, 0]).unwrap(), vec![1, 256]);
        assert!(decode_values(&[1, 0]).is_err());
    }

    #[test]
    fn read_only_test() {
        let directory: tempfile::TempDir = tempfile::tempdir().unwrap();
        NormalizationCache::open(directory.path(), false).unwrap().write_batch(&[(1, vec![0])]).unwrap();

        let cache = NormalizationCache::open(directory.path(), true).unwrap();
        assert_eq!(cache.normalize(1).unwrap(), Some(vec![0]));
        assert!(cache.write_batch(&[(2, vec![0])]).is_err());
    }
}
