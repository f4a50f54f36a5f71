use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};

use failure::Error;
use itertools::Itertools;
use log::{debug, warn};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::gridcache::cache::GridCache;
use crate::gridcache::common::*;
use crate::gridcache::error::*;
use crate::gridcache::spatial::*;

const TMP_ID_IDX_SHIFT: u64 = 25;
const CONTRIBUTOR_BITS: usize = 64;
const STACKING_PENALTY: f64 = 0.01;

/// One term slot of a query: which cache to read, which phrase to look up, and how much a
/// match is worth.
///
/// `idx` and `zoom` are 16 bit wide; the dynamic argument parser rejects larger values with
/// a range error.
#[derive(Debug, Clone)]
pub struct PhrasematchSubquery<'a> {
    pub cache: &'a dyn GridCache,
    pub phrase: String,
    pub prefix: PrefixMatch,
    pub languages: Option<Vec<u32>>,
    pub weight: f64,
    pub idx: u16,
    pub zoom: u16,
    pub mask: u32,
}

/// A matched candidate together with the subquery it came from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CoalesceEntry {
    /// `relev` is already weighted (and penalized for a language mismatch).
    pub grid_entry: GridEntry,
    pub matches_language: bool,
    pub idx: u16,
    pub tmp_id: u64,
    pub mask: u32,
    pub distance: f64,
    pub scoredist: f64,
    /// Position of the contributing subquery in the stack passed to `coalesce`.
    pub subquery: usize,
}

/// A group of candidates from different subqueries that describe the same place.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CoalesceContext {
    pub entries: Vec<CoalesceEntry>,
    pub mask: u32,
    pub relev: f64,
}

// subqueries that already contributed to a context under construction
#[derive(Debug, Clone)]
enum Contributors {
    Bits(u64),
    Positions(SmallVec<[usize; 8]>),
}

impl Contributors {
    fn new(wide: bool) -> Self {
        if wide {
            Contributors::Positions(SmallVec::new())
        } else {
            Contributors::Bits(0)
        }
    }

    fn contains(&self, position: usize) -> bool {
        match self {
            Contributors::Bits(bits) => {
                position < CONTRIBUTOR_BITS && *bits & (1u64 << position) != 0
            }
            Contributors::Positions(positions) => positions.contains(&position),
        }
    }

    fn insert(&mut self, position: usize) {
        match self {
            Contributors::Bits(bits) => {
                if position < CONTRIBUTOR_BITS {
                    *bits |= 1u64 << position;
                }
            }
            Contributors::Positions(positions) => {
                if !positions.contains(&position) {
                    positions.push(position);
                }
            }
        }
    }

    fn remove(&mut self, position: usize) {
        match self {
            Contributors::Bits(bits) => {
                if position < CONTRIBUTOR_BITS {
                    *bits &= !(1u64 << position);
                }
            }
            Contributors::Positions(positions) => positions.retain(|p| *p != position),
        }
    }
}

/// Takes a stack of phrasematch subqueries and coalesce options, gets the matching grids of
/// every subquery, joins them spatially and returns the best contexts, most relevant first.
///
/// All arguments are validated before any cache is read.
pub fn coalesce(
    stack: &[PhrasematchSubquery],
    options: &CoalesceOptions,
) -> Result<Vec<CoalesceContext>, Error> {
    let langfields = validate_stack(stack, options)?;

    let contexts = if stack.len() == 1 {
        coalesce_single(&stack[0], langfields[0], options)?
    } else {
        coalesce_multi(stack, &langfields, options)?
    };

    let out = finalize(contexts);
    debug!("coalesced {} subqueries into {} contexts", stack.len(), out.len());
    Ok(out)
}

fn validate_stack(stack: &[PhrasematchSubquery], options: &CoalesceOptions) -> Result<Vec<u128>, Error> {
    if stack.is_empty() {
        return Err(invalid_argument(
            "Arg 1 must be an array with one or more PhrasematchSubquery objects",
        ));
    }
    let mut langfields = Vec::with_capacity(stack.len());
    for subquery in stack {
        validate_phrase(&subquery.phrase)?;
        if !subquery.weight.is_finite() {
            return Err(range_error("encountered weight value too large to fit in double"));
        }
        if subquery.weight < 0. {
            return Err(invalid_argument("weight value must be a non-negative number"));
        }
        langfields.push(languages_to_langfield(subquery.languages.as_ref().map(|l| l.as_slice()))?);
    }
    if !options.radius.is_finite() || options.radius < 0. || options.radius > std::u32::MAX as f64 {
        return Err(range_error("encountered radius too large to fit in unsigned"));
    }
    Ok(langfields)
}

fn finalize(contexts: Vec<CoalesceContext>) -> Vec<CoalesceContext> {
    let mut out = Vec::with_capacity(MAX_CONTEXTS);
    if let Some(first) = contexts.first() {
        let max_relevance = first.relev;
        let mut sets: HashSet<u64> = HashSet::new();
        for context in contexts {
            if out.len() >= MAX_CONTEXTS {
                break;
            }
            // contexts come sorted by relevance, so the first one below the cutoff ends it
            if max_relevance - context.relev >= RELEV_CUTOFF {
                break;
            }
            if sets.insert(context.entries[0].tmp_id) {
                out.push(context);
            }
        }
    }
    out
}

fn to_coalesce_entry(value: u64, subquery: &PhrasematchSubquery, position: usize) -> CoalesceEntry {
    let matched = MatchEntry::from_value(value);
    let mut relevance = matched.grid_entry.relev * subquery.weight;
    if !matched.matches_language {
        relevance *= LANGUAGE_MISMATCH_PENALTY;
    }

    CoalesceEntry {
        grid_entry: GridEntry { relev: relevance, ..matched.grid_entry },
        matches_language: matched.matches_language,
        idx: subquery.idx,
        tmp_id: ((subquery.idx as u64) << TMP_ID_IDX_SHIFT) + matched.grid_entry.id as u64,
        mask: subquery.mask,
        distance: 0.,
        scoredist: matched.grid_entry.score as f64,
        subquery: position,
    }
}

fn coalesce_single(
    subquery: &PhrasematchSubquery,
    langfield: u128,
    options: &CoalesceOptions,
) -> Result<Vec<CoalesceContext>, Error> {
    let grids = subquery.cache.get_matching_values(
        &subquery.phrase,
        subquery.prefix,
        langfield,
        MAX_GRIDS_PER_PHRASE,
    )?;
    let candidate_count = grids.len();

    // bbox corners at the zoom of the candidates
    let bbox = options.bbox.as_ref().map(|bbox| {
        let zoom = subquery.zoom as u32;
        (
            bbox_corner_to_zoom(bbox.zoom, bbox.min_x, bbox.min_y, zoom, false),
            bbox_corner_to_zoom(bbox.zoom, bbox.max_x, bbox.max_y, zoom, true),
        )
    });

    let mut max_relevance: f64 = 0.;
    let mut previous_id: Option<u32> = None;
    let mut previous_relevance: f64 = 0.;
    let mut previous_scoredist: f64 = 0.;
    let mut min_scoredist = std::f64::MAX;
    let mut feature_count: usize = 0;

    let mut covers: Vec<CoalesceEntry> = Vec::new();

    for value in grids {
        let mut coalesce_entry = to_coalesce_entry(value, subquery, 0);
        if let Some(proximity) = &options.proximity {
            coalesce_entry.distance = tile_dist(
                proximity.x,
                proximity.y,
                coalesce_entry.grid_entry.x as u32,
                coalesce_entry.grid_entry.y as u32,
            );
            coalesce_entry.scoredist = scoredist(
                proximity.zoom,
                coalesce_entry.distance,
                coalesce_entry.grid_entry.score as f64,
                options.radius,
            );
        }
        let current_id = coalesce_entry.grid_entry.id;
        let current_relev = coalesce_entry.grid_entry.relev;
        let current_scoredist = coalesce_entry.scoredist;

        // If it's the same feature as the last one, but a lower scoredist don't add it
        if previous_id == Some(current_id) && current_scoredist <= previous_scoredist {
            continue;
        }

        if feature_count > MAX_CONTEXTS {
            if current_scoredist < min_scoredist {
                continue;
            } else if current_relev < previous_relevance {
                // grids come out of get_matching sorted by relevance
                break;
            }
        }

        if max_relevance - current_relev >= RELEV_CUTOFF {
            break;
        }
        if current_relev > max_relevance {
            max_relevance = current_relev;
        }

        if let Some((min, max)) = bbox {
            let (x, y) = (coalesce_entry.grid_entry.x as u32, coalesce_entry.grid_entry.y as u32);
            if x < min.0 || y < min.1 || x > max.0 || y > max.1 {
                continue;
            }
        }

        covers.push(coalesce_entry);

        if previous_id != Some(current_id) {
            feature_count += 1;
        }
        if options.proximity.is_none() && feature_count > MAX_CONTEXTS {
            break;
        }
        if current_scoredist < min_scoredist {
            min_scoredist = current_scoredist;
        }
        previous_id = Some(current_id);
        previous_relevance = current_relev;
        previous_scoredist = current_scoredist;
    }

    covers.sort_by_key(|entry| {
        (
            Reverse(OrderedFloat(entry.grid_entry.relev)),
            Reverse(OrderedFloat(entry.scoredist)),
            entry.idx,
            entry.grid_entry.id,
            entry.grid_entry.x,
            entry.grid_entry.y,
        )
    });

    let mut contexts: Vec<CoalesceContext> = Vec::with_capacity(MAX_CONTEXTS);
    let mut previous_id: Option<u32> = None;
    for entry in covers {
        if contexts.len() == MAX_CONTEXTS {
            break;
        }
        // one context per feature, even when it covers several tiles
        if previous_id == Some(entry.grid_entry.id) {
            continue;
        }
        previous_id = Some(entry.grid_entry.id);
        contexts.push(CoalesceContext {
            mask: entry.mask,
            relev: entry.grid_entry.relev.min(1.),
            entries: vec![entry],
        });
    }

    debug!("coalesce_single: {} candidates, {} contexts", candidate_count, contexts.len());
    Ok(contexts)
}

fn coalesce_multi(
    stack: &[PhrasematchSubquery],
    langfields: &[u128],
    options: &CoalesceOptions,
) -> Result<Vec<CoalesceContext>, Error> {
    let mut order: Vec<usize> = (0..stack.len()).collect();
    order.sort_by_key(|position| (stack[*position].zoom, stack[*position].idx));

    let wide = stack.len() > CONTRIBUTOR_BITS;
    if wide {
        warn!(
            "{} subqueries exceed the {} bit contributor set; tracking contributor positions",
            stack.len(),
            CONTRIBUTOR_BITS
        );
    }

    let mut coalesced: BTreeMap<(u16, u16, u16), Vec<CoalesceContext>> = BTreeMap::new();
    let mut contexts: Vec<CoalesceContext> = Vec::new();
    let mut candidate_count = 0;

    for (i, position) in order.iter().enumerate() {
        let position = *position;
        let subquery = &stack[position];
        let zoom = subquery.zoom;
        let mut to_add_to_coalesced: BTreeMap<(u16, u16, u16), Vec<CoalesceContext>> =
            BTreeMap::new();

        // lower (or equal) zooms of the other indexes, where parent contexts may live
        let compatible_zooms: Vec<u16> = stack
            .iter()
            .filter(|other| other.idx != subquery.idx && other.zoom <= zoom)
            .map(|other| other.zoom)
            .sorted()
            .dedup()
            .collect();

        let bbox = options.bbox.map(|bbox| {
            (
                bbox_corner_to_zoom(bbox.zoom, bbox.min_x, bbox.min_y, zoom as u32, false),
                bbox_corner_to_zoom(bbox.zoom, bbox.max_x, bbox.max_y, zoom as u32, true),
            )
        });

        let grids = subquery.cache.get_matching_values(
            &subquery.phrase,
            subquery.prefix,
            langfields[position],
            MAX_GRIDS_PER_PHRASE,
        )?;
        candidate_count += grids.len();

        for value in grids {
            let mut coalesce_entry = to_coalesce_entry(value, subquery, position);
            let (x, y) = (coalesce_entry.grid_entry.x, coalesce_entry.grid_entry.y);

            if let Some(proximity) = &options.proximity {
                let (px, py) = project_point(zoom as u32, x as u32, y as u32, proximity.zoom);
                coalesce_entry.distance = tile_dist(proximity.x, proximity.y, px, py);
                coalesce_entry.scoredist = scoredist(
                    proximity.zoom,
                    coalesce_entry.distance,
                    coalesce_entry.grid_entry.score as f64,
                    options.radius,
                );
            }

            if let Some(((min_x, min_y), (max_x, max_y))) = bbox {
                let (x, y) = (x as u32, y as u32);
                if x < min_x || y < min_y || x > max_x || y > max_y {
                    continue;
                }
            }

            let mut context_mask = coalesce_entry.mask;
            let mut context_relevance = coalesce_entry.grid_entry.relev;
            let mut contributors = Contributors::new(wide);
            contributors.insert(position);
            let mut entries: Vec<CoalesceEntry> = vec![coalesce_entry];

            // parents live at lower zooms, so "zoom out" by shifting off the zoom difference
            for other_zoom in compatible_zooms.iter() {
                let shift = (zoom - *other_zoom) as u32;
                let other_zxy = (
                    *other_zoom,
                    x.checked_shr(shift).unwrap_or(0),
                    y.checked_shr(shift).unwrap_or(0),
                );

                if let Some(already_coalesced) = coalesced.get(&other_zxy) {
                    let mut prev_mask = 0;
                    let mut prev_relev: f64 = 0.;
                    let mut prev_added = false;
                    for parent_context in already_coalesced {
                        for parent_entry in &parent_context.entries {
                            let replaces = prev_added
                                && parent_entry.mask == prev_mask
                                && parent_entry.grid_entry.relev > prev_relev
                                && (entries.last().map(|e| e.subquery) == Some(parent_entry.subquery)
                                    || !contributors.contains(parent_entry.subquery));

                            if replaces {
                                // this cover is functionally identical with previous and
                                // is more relevant, replace the previous.
                                if let Some(replaced) = entries.pop() {
                                    contributors.remove(replaced.subquery);
                                }
                                contributors.insert(parent_entry.subquery);
                                entries.push(parent_entry.clone());

                                context_relevance -= prev_relev;
                                context_relevance += parent_entry.grid_entry.relev;
                                prev_relev = parent_entry.grid_entry.relev;
                            } else if (context_mask & parent_entry.mask) == 0
                                && !contributors.contains(parent_entry.subquery)
                            {
                                contributors.insert(parent_entry.subquery);
                                entries.push(parent_entry.clone());

                                context_relevance += parent_entry.grid_entry.relev;
                                context_mask |= parent_entry.mask;

                                prev_mask = parent_entry.mask;
                                prev_relev = parent_entry.grid_entry.relev;
                                prev_added = true;
                            }
                        }
                    }
                }
            }

            if i == order.len() - 1 {
                if entries.len() == 1 {
                    // Slightly penalize contexts that have no stacking
                    context_relevance -= STACKING_PENALTY;
                } else if entries[0].mask > entries[1].mask {
                    // Slightly penalize contexts in ascending order
                    context_relevance -= STACKING_PENALTY;
                }
                contexts.push(CoalesceContext {
                    entries,
                    mask: context_mask,
                    relev: context_relevance.min(1.),
                });
            } else if i == 0 || entries.len() > 1 {
                to_add_to_coalesced.entry((zoom, x, y)).or_insert_with(Vec::new).push(
                    CoalesceContext { entries, mask: context_mask, relev: context_relevance.min(1.) },
                );
            }
        }

        for (zxy, to_add) in to_add_to_coalesced {
            coalesced.entry(zxy).or_insert_with(Vec::new).extend(to_add);
        }
    }

    for (_, matched) in coalesced {
        contexts.extend(matched);
    }

    contexts.sort_by_key(|context| {
        (
            Reverse(OrderedFloat(context.relev)),
            Reverse(OrderedFloat(context.entries[0].scoredist)),
            context.entries[0].idx,
            context.entries[0].grid_entry.id,
        )
    });

    debug!(
        "coalesce_multi: {} subqueries, {} candidates, {} contexts",
        stack.len(),
        candidate_count,
        contexts.len()
    );
    Ok(contexts)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gridcache::memory::MemoryCache;

    fn grid(id: u32, x: u16, y: u16, relev: f64, score: u8) -> u64 {
        GridEntry { id, x, y, relev, score }.encode().unwrap()
    }

    fn subquery<'a>(cache: &'a MemoryCache, idx: u16, zoom: u16, mask: u32, weight: f64) -> PhrasematchSubquery<'a> {
        PhrasematchSubquery {
            cache,
            phrase: "1".to_owned(),
            prefix: PrefixMatch::Disabled,
            languages: None,
            weight,
            idx,
            zoom,
            mask,
        }
    }

    #[test]
    fn contributors_test() {
        for wide in [false, true].iter() {
            let mut contributors = Contributors::new(*wide);
            contributors.insert(3);
            contributors.insert(63);
            assert!(contributors.contains(3));
            assert!(contributors.contains(63));
            assert!(!contributors.contains(4));
            contributors.remove(3);
            assert!(!contributors.contains(3), "removed from {:?}", contributors);
        }
        let mut positions = Contributors::new(true);
        positions.insert(100);
        assert!(positions.contains(100), "positions beyond the bitset are tracked");
    }

    #[test]
    fn validation_test() {
        let cache = MemoryCache::new();
        let err = coalesce(&[], &CoalesceOptions::default()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CacheError>(),
            Some(&CacheError::InvalidArgument(
                "Arg 1 must be an array with one or more PhrasematchSubquery objects".to_owned()
            ))
        );

        let mut bad_phrase = subquery(&cache, 0, 0, 1, 1.);
        bad_phrase.phrase = String::new();
        assert!(coalesce(&[bad_phrase], &CoalesceOptions::default()).is_err());

        let bad_weight = subquery(&cache, 0, 0, 1, std::f64::INFINITY);
        match coalesce(&[bad_weight], &CoalesceOptions::default()).unwrap_err().downcast_ref() {
            Some(CacheError::RangeError(_)) => {}
            other => panic!("expected a range error, got {:?}", other),
        }

        let mut bad_languages = subquery(&cache, 0, 0, 1, 1.);
        bad_languages.languages = Some(vec![128]);
        assert!(coalesce(&[bad_languages], &CoalesceOptions::default()).is_err());

        let options = CoalesceOptions { radius: -1., ..CoalesceOptions::default() };
        assert!(coalesce(&[subquery(&cache, 0, 0, 1, 1.)], &options).is_err());

        // same bound as the dynamic options parser
        let options = CoalesceOptions { radius: std::u32::MAX as f64 + 1., ..CoalesceOptions::default() };
        assert_eq!(
            coalesce(&[subquery(&cache, 0, 0, 1, 1.)], &options).unwrap_err().downcast_ref::<CacheError>(),
            Some(&CacheError::RangeError("encountered radius too large to fit in unsigned".to_owned()))
        );
        let options = CoalesceOptions { radius: std::u32::MAX as f64, ..CoalesceOptions::default() };
        assert!(coalesce(&[subquery(&cache, 0, 0, 1, 1.)], &options).is_ok());
    }

    #[test]
    fn empty_result_test() {
        let cache = MemoryCache::new();
        let stack = vec![subquery(&cache, 0, 0, 1, 1.)];
        assert_eq!(coalesce(&stack, &CoalesceOptions::default()).unwrap(), vec![], "a miss is not an error");
    }

    #[test]
    fn single_id_zero_test() {
        let mut cache = MemoryCache::new();
        cache.set("1", &[grid(0, 1, 1, 1., 0), grid(1, 1, 1, 1., 0)], None, false).unwrap();
        let stack = vec![subquery(&cache, 0, 2, 1, 1.)];
        let result = coalesce(&stack, &CoalesceOptions::default()).unwrap();
        let ids: Vec<u32> = result.iter().map(|context| context.entries[0].grid_entry.id).collect();
        assert_eq!(ids, vec![0, 1], "feature id 0 is a regular feature");
    }

    #[test]
    fn relev_cap_test() {
        let mut a = MemoryCache::new();
        let mut b = MemoryCache::new();
        a.set("1", &[grid(1, 0, 0, 1., 1)], None, false).unwrap();
        b.set("1", &[grid(2, 0, 0, 1., 1)], None, false).unwrap();
        let stack = vec![subquery(&a, 0, 0, 1 << 1, 0.8), subquery(&b, 1, 0, 1 << 0, 0.8)];
        let result = coalesce(&stack, &CoalesceOptions::default()).unwrap();
        assert_eq!(result[0].entries.len(), 2);
        assert_eq!(result[0].relev, 1., "relevance never exceeds 1");
    }

    #[test]
    fn tmp_id_test() {
        let mut cache = MemoryCache::new();
        cache.set("1", &[grid(2, 2, 2, 1., 7)], None, false).unwrap();
        let stack = vec![subquery(&cache, 1, 2, 1, 1.)];
        let result = coalesce(&stack, &CoalesceOptions::default()).unwrap();
        assert_eq!(result[0].entries[0].tmp_id, 33554434);
    }
}
