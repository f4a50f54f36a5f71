extern crate carmen_cache;
extern crate failure;
extern crate serde;
extern crate serde_json;

use carmen_cache::gridcache::*;

use env_logger::Builder;
use failure::Error;
use log::{info, LevelFilter};
use serde::{Deserialize, Serialize};

use std::fs::File;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::Path;
use std::sync::Once;

// Util functions for tests and benchmarks

static LOGGER: Once = Once::new();

/// Sets up env_logger once per process; `RUST_LOG` overrides the default warn level
pub fn init_logger() {
    LOGGER.call_once(|| {
        let mut builder = Builder::new();
        builder.filter_level(LevelFilter::Warn).is_test(true).parse_default_env();
        let _ = builder.try_init();
    });
}

/// Round a float to a number of digits past the decimal point
pub fn round(value: f64, digits: i32) -> f64 {
    let multiplier = 10.0_f64.powi(digits);
    (value * multiplier).round() / multiplier
}

/// Packs a grid, panicking on out-of-range fields
pub fn grid(id: u32, x: u16, y: u16, relev: f64, score: u8) -> u64 {
    GridEntry { id, x, y, relev, score }.encode().expect("grid out of range")
}

/// One line of a JSON dump: a cache entry and its decoded grids
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct CacheRecord {
    pub phrase: String,
    pub languages: Option<Vec<u32>>,
    pub grids: Vec<GridEntry>,
}

/// Utility to create a memory cache from `(phrase, languages, grids)` triples
pub fn build_memory_cache(entries: &[(&str, Option<&[u32]>, Vec<u64>)]) -> MemoryCache {
    let mut cache = MemoryCache::new();
    for (phrase, languages, grids) in entries {
        cache.set(phrase, grids, *languages, true).expect("Unable to set");
    }
    cache
}

/// Packs a memory cache into a temporary directory and opens it. The directory must outlive
/// the returned cache.
pub fn build_persistent_cache(memory: &MemoryCache) -> (tempfile::TempDir, RocksDBCache) {
    let directory: tempfile::TempDir = tempfile::tempdir().unwrap();
    memory.pack(directory.path()).unwrap();
    let cache = RocksDBCache::new(directory.path()).unwrap();
    (directory, cache)
}

/// Every entry of `cache` as dump records, in key order
pub fn cache_records(cache: &dyn GridCache) -> Result<Vec<CacheRecord>, Error> {
    let mut out = Vec::new();
    for (phrase, languages) in cache.list()? {
        let grids = cache
            .get(&phrase, languages.as_ref().map(|l| l.as_slice()))?
            .unwrap_or_default()
            .into_iter()
            .map(GridEntry::decode)
            .collect();
        out.push(CacheRecord { phrase, languages, grids });
    }
    Ok(out)
}

/// Reads a persistent cache and writes it out as JSON lines
pub fn dump_cache_to_json(cache_path: &str, json_path: &str) -> Result<usize, Error> {
    let cache = RocksDBCache::new(cache_path)?;
    let mut writer = BufWriter::new(File::create(json_path)?);
    let records = cache_records(&cache)?;
    for record in records.iter() {
        writer.write_all(serde_json::to_string(record)?.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    info!("dumped {} records from {} to {}", records.len(), cache_path, json_path);
    Ok(records.len())
}

/// Builds a persistent cache from a JSON lines dump
pub fn load_cache_from_json(json_path: &str, cache_path: &str) -> Result<usize, Error> {
    let reader = io::BufReader::new(File::open(Path::new(json_path))?);
    let mut cache = MemoryCache::new();
    let mut count = 0;
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let record: CacheRecord = serde_json::from_str(&line)?;
        let grids = record.grids.iter().map(|entry| entry.encode()).collect::<Result<Vec<_>, _>>()?;
        cache.set(&record.phrase, &grids, record.languages.as_ref().map(|l| l.as_slice()), true)?;
        count += 1;
    }
    cache.pack(cache_path)?;
    info!("loaded {} records from {} into {}", count, json_path, cache_path);
    Ok(count)
}

/// Distinct feature ids of a coalesce result, context by context
pub fn context_ids(contexts: &[CoalesceContext]) -> Vec<Vec<u32>> {
    contexts
        .iter()
        .map(|context| context.entries.iter().map(|entry| entry.grid_entry.id).collect())
        .collect()
}
