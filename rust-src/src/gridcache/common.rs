use byteorder::{BigEndian, ReadBytesExt};
use failure::Error;
use serde::{Deserialize, Serialize};

use crate::gridcache::error::*;

/// Separates the phrase from the language bytes inside a stored key.
pub const LANGFIELD_SEPARATOR: u8 = b'|';
/// Language field meaning "no language scoping".
pub const ALL_LANGUAGES: u128 = std::u128::MAX;
pub const MAX_LANG: u32 = 127;
/// Or'd into a grid value by `get_matching` to flag a language match; sorts matches first.
pub const LANGUAGE_MATCH_BOOST: u64 = 1 << 63;
/// Largest value that survives a trip through a double.
pub const MAX_GRID_VALUE: u64 = (1 << 53) - 1;

pub const MAX_CONTEXTS: usize = 40;
pub const MAX_GRIDS_PER_PHRASE: usize = 100_000;
pub const LANGUAGE_MISMATCH_PENALTY: f64 = 0.96;
pub const DEFAULT_RADIUS: f64 = 40.;
/// Contexts this far below the best relevance are dropped.
pub const RELEV_CUTOFF: f64 = 0.25;

pub const MEMO_PREFIX_LENGTH_T1: usize = 3;
pub const MEMO_PREFIX_LENGTH_T2: usize = 6;
pub const PREFIX_MAX_GRID_LENGTH: usize = 500_000;

// packed grid layout, most significant first:
// relev (2 bits) | score (3 bits) | y (14 bits) | x (14 bits) | id (20 bits)
pub(crate) const RELEV_SHIFT: u64 = 51;
pub(crate) const SCORE_SHIFT: u64 = 48;
pub(crate) const Y_SHIFT: u64 = 34;
pub(crate) const X_SHIFT: u64 = 20;
pub(crate) const COORD_BITS: u64 = 14;
pub(crate) const ID_BITS: u64 = 20;

const COORD_MASK: u64 = (1 << COORD_BITS) - 1;
const ID_MASK: u64 = (1 << ID_BITS) - 1;

/// A single candidate: a feature covering one tile at the index zoom.
#[derive(Serialize, Deserialize, Debug, PartialOrd, PartialEq, Clone, Copy)]
pub struct GridEntry {
    // quantized to one of 0.4, 0.6, 0.8, 1.0
    pub relev: f64,
    // clamped to 0-7
    pub score: u8,
    pub x: u16,
    pub y: u16,
    // < 2^20
    pub id: u32,
}

impl GridEntry {
    /// Packs the entry into a single integer no larger than `MAX_GRID_VALUE`.
    pub fn encode(&self) -> Result<u64, Error> {
        if self.id as u64 > ID_MASK {
            return Err(range_error("id must be < 2^20"));
        }
        if self.x as u64 > COORD_MASK {
            return Err(range_error("x must be < 2^14"));
        }
        if self.y as u64 > COORD_MASK {
            return Err(range_error("y must be < 2^14"));
        }
        if !(self.relev >= 0.4 && self.relev <= 1.) {
            return Err(range_error("relev must be between 0.4 and 1"));
        }
        let relev = relev_float_to_int(self.relev) as u64;
        let score = self.score.min(7) as u64;
        Ok((relev << RELEV_SHIFT)
            | (score << SCORE_SHIFT)
            | ((self.y as u64) << Y_SHIFT)
            | ((self.x as u64) << X_SHIFT)
            | self.id as u64)
    }

    /// Unpacks a value produced by `encode`. Bits above the grid layout are ignored.
    pub fn decode(value: u64) -> Self {
        GridEntry {
            relev: relev_int_to_float(((value >> RELEV_SHIFT) & 3) as u8),
            score: ((value >> SCORE_SHIFT) & 7) as u8,
            y: ((value >> Y_SHIFT) & COORD_MASK) as u16,
            x: ((value >> X_SHIFT) & COORD_MASK) as u16,
            id: (value & ID_MASK) as u32,
        }
    }
}

/// A decoded `get_matching` result.
#[derive(Serialize, Deserialize, Debug, PartialOrd, PartialEq, Clone, Copy)]
pub struct MatchEntry {
    pub grid_entry: GridEntry,
    pub matches_language: bool,
}

impl MatchEntry {
    pub fn from_value(value: u64) -> Self {
        MatchEntry {
            grid_entry: GridEntry::decode(value & !LANGUAGE_MATCH_BOOST),
            matches_language: value & LANGUAGE_MATCH_BOOST != 0,
        }
    }
}

/// Rounds half-up on the 0..3 scale; the epsilon keeps 0.5 and 0.7 from rounding down.
#[inline]
pub fn relev_float_to_int(relev: f64) -> u8 {
    let scaled = ((relev - 0.4) / 0.2 + 0.5 + 1e-9).floor();
    scaled.max(0.).min(3.) as u8
}

#[inline]
pub fn relev_int_to_float(relev: u8) -> f64 {
    match relev {
        0 => 0.4,
        1 => 0.6,
        2 => 0.8,
        _ => 1.,
    }
}

/// Convert an array of language ids into a langfield
pub fn langarray_to_langfield(languages: &[u32]) -> Result<u128, Error> {
    let mut out = 0u128;
    for lang in languages {
        if *lang > MAX_LANG {
            return Err(range_error(format!("language ids must be <= {}", MAX_LANG)));
        }
        out |= 1 << *lang;
    }
    Ok(out)
}

/// Absent languages mean "no language scoping".
pub fn languages_to_langfield(languages: Option<&[u32]>) -> Result<u128, Error> {
    match languages {
        Some(languages) => langarray_to_langfield(languages),
        None => Ok(ALL_LANGUAGES),
    }
}

pub fn langfield_to_langarray(langfield: u128) -> Option<Vec<u32>> {
    if langfield == ALL_LANGUAGES {
        return None;
    }
    Some((0..=MAX_LANG).filter(|lang| langfield & (1 << *lang) != 0).collect())
}

/// Phrases are opaque byte strings, but they may not be empty or contain the separator.
pub fn validate_phrase(phrase: &str) -> Result<(), Error> {
    if phrase.is_empty() || phrase.as_bytes().contains(&LANGFIELD_SEPARATOR) {
        return Err(invalid_argument("encountered invalid phrase"));
    }
    Ok(())
}

/// Appends the language bytes of a key: nothing for `ALL_LANGUAGES`, a single zero byte
/// for the empty set, otherwise the big-endian bytes with leading zeros stripped.
pub fn write_lang_set(lang_set: u128, db_key: &mut Vec<u8>) {
    match lang_set {
        ALL_LANGUAGES => { /* do nothing -- this is the all-languages marker */ }
        0 => {
            db_key.push(0);
        }
        _ => {
            let lang_set = lang_set.to_be_bytes();
            db_key.extend(lang_set.iter().skip_while(|byte| **byte == 0u8));
        }
    }
}

pub fn read_lang_set(key_lang_partial: &[u8]) -> Result<u128, Error> {
    if key_lang_partial.is_empty() {
        // 0-length language array is the shorthand for "matches everything"
        return Ok(ALL_LANGUAGES);
    }
    if key_lang_partial.len() > 16 {
        return Err(io_error("language field longer than 128 bits"));
    }
    let mut key_lang_full = [0u8; 16];
    key_lang_full[(16 - key_lang_partial.len())..].copy_from_slice(key_lang_partial);
    Ok((&key_lang_full[..]).read_u128::<BigEndian>()?)
}

/// Language set of a stored key (phrase bytes, separator, language bytes).
pub fn key_lang_set(db_key: &[u8]) -> Result<u128, Error> {
    match db_key.iter().position(|byte| *byte == LANGFIELD_SEPARATOR) {
        Some(pos) => read_lang_set(&db_key[pos + 1..]),
        None => Err(io_error("stored key is missing its language separator")),
    }
}

/// Identifies one stored entry: a phrase plus the language set it is scoped to.
#[derive(Serialize, Deserialize, Debug, PartialOrd, Ord, PartialEq, Eq, Clone, Hash)]
pub struct CacheKey {
    pub phrase: String,
    pub lang_set: u128,
}

impl CacheKey {
    pub fn new(phrase: &str, languages: Option<&[u32]>) -> Result<Self, Error> {
        validate_phrase(phrase)?;
        Ok(CacheKey { phrase: phrase.to_owned(), lang_set: languages_to_langfield(languages)? })
    }

    pub fn write_to(&self, db_key: &mut Vec<u8>) {
        db_key.extend_from_slice(self.phrase.as_bytes());
        db_key.push(LANGFIELD_SEPARATOR);
        write_lang_set(self.lang_set, db_key);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut db_key = Vec::with_capacity(self.phrase.len() + 17);
        self.write_to(&mut db_key);
        db_key
    }

    pub fn read_from(db_key: &[u8]) -> Result<Self, Error> {
        let pos = db_key
            .iter()
            .position(|byte| *byte == LANGFIELD_SEPARATOR)
            .ok_or_else(|| io_error("stored key is missing its language separator"))?;
        let phrase = std::str::from_utf8(&db_key[..pos])
            .map_err(|_| io_error("stored phrase is not valid utf-8"))?
            .to_owned();
        let lang_set = read_lang_set(&db_key[pos + 1..])?;
        Ok(CacheKey { phrase, lang_set })
    }

    pub fn languages(&self) -> Option<Vec<u32>> {
        langfield_to_langarray(self.lang_set)
    }
}

/// How `get_matching` compares the query phrase against stored phrases.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum PrefixMatch {
    /// The stored phrase must equal the query.
    Disabled,
    /// The stored phrase must start with the query.
    Enabled,
    /// The stored phrase must start with the query followed by a space or its end.
    WordBoundary,
}

impl PrefixMatch {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(PrefixMatch::Disabled),
            1 => Some(PrefixMatch::Enabled),
            2 => Some(PrefixMatch::WordBoundary),
            _ => None,
        }
    }
}

impl Default for PrefixMatch {
    fn default() -> Self {
        PrefixMatch::Disabled
    }
}

/// The bytes a stored key must start with to be considered by `get_matching`.
pub fn match_prefix(phrase: &str, prefix: PrefixMatch) -> Vec<u8> {
    let mut bytes = phrase.as_bytes().to_vec();
    if prefix == PrefixMatch::Disabled {
        bytes.push(LANGFIELD_SEPARATOR);
    }
    bytes
}

/// Word-boundary check on the byte right after the matched prefix. Always present,
/// since every stored key carries a separator after its phrase.
#[inline]
pub fn accepts_key(db_key: &[u8], prefix_len: usize, prefix: PrefixMatch) -> bool {
    match prefix {
        PrefixMatch::WordBoundary => match db_key.get(prefix_len) {
            Some(&LANGFIELD_SEPARATOR) | Some(&b' ') => true,
            _ => false,
        },
        _ => true,
    }
}

/// Sorts descending and removes duplicates in place.
pub fn sort_grids(values: &mut Vec<u64>) {
    values.sort_by(|a, b| b.cmp(a));
    values.dedup();
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Proximity {
    pub zoom: u32,
    pub x: u32,
    pub y: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub zoom: u32,
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

/// Global options of a coalesce call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CoalesceOptions {
    pub proximity: Option<Proximity>,
    pub radius: f64,
    pub bbox: Option<BBox>,
}

impl Default for CoalesceOptions {
    fn default() -> Self {
        CoalesceOptions { proximity: None, radius: DEFAULT_RADIUS, bbox: None }
    }
}
