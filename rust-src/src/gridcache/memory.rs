use std::collections::BTreeMap;
use std::path::Path;

use failure::Error;
use log::debug;

use crate::gridcache::cache::GridCache;
use crate::gridcache::common::*;
use crate::gridcache::error::*;
use crate::gridcache::store::write_store;

/// A mutable, in-process cache. Build it up with `set`, then `pack` it to disk.
#[derive(Debug, Default, Clone)]
pub struct MemoryCache {
    // encoded CacheKey -> grids, descending and de-duplicated
    data: BTreeMap<Vec<u8>, Vec<u64>>,
}

impl MemoryCache {
    /// Makes a new, empty MemoryCache.
    pub fn new() -> Self {
        MemoryCache { data: BTreeMap::new() }
    }

    /// Replaces (or with `append`, unions into) the grids of one `(phrase, languages)` entry.
    pub fn set(
        &mut self,
        phrase: &str,
        values: &[u64],
        languages: Option<&[u32]>,
        append: bool,
    ) -> Result<(), Error> {
        if values.is_empty() {
            return Err(invalid_argument("data must be a non-empty array of grids"));
        }
        if values.iter().any(|value| *value > MAX_GRID_VALUE) {
            return Err(range_error("encountered grid value too large to fit in a double"));
        }
        let key = CacheKey::new(phrase, languages)?.to_bytes();

        let entry = self.data.entry(key).or_insert_with(Vec::new);
        if !append {
            entry.clear();
        }
        entry.extend_from_slice(values);
        sort_grids(entry);
        Ok(())
    }

    /// Evicts every language bucket stored under `phrase`.
    pub fn unload(&mut self, phrase: &str) -> bool {
        let prefix = match_prefix(phrase, PrefixMatch::Disabled);
        let doomed: Vec<Vec<u8>> = self
            .data
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed.iter() {
            self.data.remove(key);
        }
        debug!("unloaded {} entries for {:?}", doomed.len(), phrase);
        !doomed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Writes the cache, plus its prefix memos, to a new persistent store at `path`.
    pub fn pack<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        write_store(path.as_ref(), self.data.iter().map(|(key, values)| (key.as_slice(), values)))
    }
}

impl GridCache for MemoryCache {
    fn get(&self, phrase: &str, languages: Option<&[u32]>) -> Result<Option<Vec<u64>>, Error> {
        let key = CacheKey::new(phrase, languages)?.to_bytes();
        Ok(self.data.get(&key).cloned())
    }

    fn get_matching_values(
        &self,
        phrase: &str,
        prefix: PrefixMatch,
        langfield: u128,
        max_results: usize,
    ) -> Result<Vec<u64>, Error> {
        let search = match_prefix(phrase, prefix);
        let mut values: Vec<u64> = Vec::new();
        for (key, grids) in
            self.data.range(search.clone()..).take_while(|(key, _)| key.starts_with(&search))
        {
            if !accepts_key(key, search.len(), prefix) {
                continue;
            }
            if key_lang_set(key)? & langfield != 0 {
                values.extend(grids.iter().map(|grid| grid | LANGUAGE_MATCH_BOOST));
            } else {
                values.extend_from_slice(grids);
            }
        }
        sort_grids(&mut values);
        values.truncate(max_results);
        Ok(values)
    }

    fn list(&self) -> Result<Vec<(String, Option<Vec<u32>>)>, Error> {
        self.data
            .keys()
            .map(|key| {
                let key = CacheKey::read_from(key)?;
                let languages = key.languages();
                Ok((key.phrase, languages))
            })
            .collect()
    }
}
