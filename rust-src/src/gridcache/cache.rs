use std::fmt::Debug;

use failure::Error;

use crate::gridcache::common::*;

/// Read access shared by the in-memory and the persistent cache.
///
/// Writes (`set`, `pack`, `unload`) live on `MemoryCache` only; a `RocksDBCache` can never
/// be mutated in place.
pub trait GridCache: Debug + Send + Sync {
    /// Exact lookup of one `(phrase, languages)` entry, values in descending order.
    /// Absent languages address the unscoped entry only.
    fn get(&self, phrase: &str, languages: Option<&[u32]>) -> Result<Option<Vec<u64>>, Error>;

    /// Raw matching lookup: every value of every entry whose key matches `phrase` under
    /// `prefix`, with `LANGUAGE_MATCH_BOOST` set on values whose entry shares a language with
    /// `langfield`. Descending, consecutive duplicates removed, at most `max_results` long.
    fn get_matching_values(
        &self,
        phrase: &str,
        prefix: PrefixMatch,
        langfield: u128,
        max_results: usize,
    ) -> Result<Vec<u64>, Error>;

    /// All stored entries as `(phrase, languages)`.
    fn list(&self) -> Result<Vec<(String, Option<Vec<u32>>)>, Error>;

    /// Like `get`, but a single trailing `.` on either side is not significant.
    fn get_ignoring_trailing_dot(
        &self,
        phrase: &str,
        languages: Option<&[u32]>,
    ) -> Result<Option<Vec<u64>>, Error> {
        let bare = phrase.strip_suffix('.').unwrap_or(phrase);
        let dotted = format!("{}.", bare);

        let mut values = Vec::new();
        let mut found = false;
        for candidate in [bare, dotted.as_str()].iter() {
            if candidate.is_empty() {
                continue;
            }
            if let Some(grids) = self.get(candidate, languages)? {
                found = true;
                values.extend(grids);
            }
        }
        if !found {
            return Ok(None);
        }
        sort_grids(&mut values);
        Ok(Some(values))
    }

    /// Union of the values of every entry, in any language, whose phrase starts with `prefix`.
    fn get_by_prefix(&self, prefix: &str) -> Result<Option<Vec<u64>>, Error> {
        validate_phrase(prefix)?;
        let mut values: Vec<u64> = self
            .get_matching_values(prefix, PrefixMatch::Enabled, ALL_LANGUAGES, std::usize::MAX)?
            .into_iter()
            .map(|value| value & !LANGUAGE_MATCH_BOOST)
            .collect();
        if values.is_empty() {
            return Ok(None);
        }
        sort_grids(&mut values);
        Ok(Some(values))
    }

    /// Decoded matching lookup; language-matching candidates come first.
    fn get_matching(
        &self,
        phrase: &str,
        prefix: PrefixMatch,
        languages: Option<&[u32]>,
    ) -> Result<Option<Vec<MatchEntry>>, Error> {
        validate_phrase(phrase)?;
        let langfield = languages_to_langfield(languages)?;
        let values = self.get_matching_values(phrase, prefix, langfield, std::usize::MAX)?;
        if values.is_empty() {
            return Ok(None);
        }
        Ok(Some(values.into_iter().map(MatchEntry::from_value).collect()))
    }
}
