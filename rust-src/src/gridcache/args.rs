//! Validation of dynamically assembled arguments.
//!
//! Upstream services build subqueries and options as JSON; these helpers turn them into
//! the typed structures `coalesce` takes, reporting exactly which parameter is wrong.

use std::collections::HashMap;

use failure::Error;
use serde_json::{Map, Value};

use crate::gridcache::cache::GridCache;
use crate::gridcache::coalesce::PhrasematchSubquery;
use crate::gridcache::common::*;
use crate::gridcache::error::*;
use crate::gridcache::store::RocksDBCache;

fn require<'v>(object: &'v Map<String, Value>, name: &str) -> Result<&'v Value, Error> {
    object.get(name).ok_or_else(|| invalid_argument(format!("missing {} property", name)))
}

fn number(value: &Value, name: &str) -> Result<f64, Error> {
    value.as_f64().ok_or_else(|| invalid_argument(format!("{} value must be a number", name)))
}

/// A non-negative integer no larger than `max`.
fn bounded(value: f64, max: u64, too_large: &str) -> Result<u64, Error> {
    if value < 0. || value > max as f64 || value.fract() != 0. {
        return Err(range_error(too_large.to_owned()));
    }
    Ok(value as u64)
}

fn parse_languages(value: &Value) -> Result<Option<Vec<u32>>, Error> {
    let array = match value {
        Value::Null => return Ok(None),
        Value::Array(array) => array,
        _ => return Err(invalid_argument("languages must be an array")),
    };
    let mut languages = Vec::with_capacity(array.len());
    for language in array {
        let language = language
            .as_f64()
            .ok_or_else(|| invalid_argument("languages must be an array of numbers"))?;
        languages.push(bounded(
            language,
            MAX_LANG as u64,
            &format!("language ids must be <= {}", MAX_LANG),
        )? as u32);
    }
    Ok(Some(languages))
}

fn parse_prefix(value: &Value) -> Result<PrefixMatch, Error> {
    match value {
        Value::Bool(true) => Ok(PrefixMatch::Enabled),
        Value::Bool(false) => Ok(PrefixMatch::Disabled),
        Value::Number(code) => code
            .as_u64()
            .and_then(PrefixMatch::from_code)
            .ok_or_else(|| invalid_argument("prefix value must be a boolean")),
        _ => Err(invalid_argument("prefix value must be a boolean")),
    }
}

fn parse_subquery<'a>(
    value: &Value,
    caches: &HashMap<String, &'a dyn GridCache>,
) -> Result<PhrasematchSubquery<'a>, Error> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("All items in array must be valid PhrasematchSubqObjects"))?;

    let idx = bounded(
        number(require(object, "idx")?, "idx")?,
        std::u16::MAX as u64,
        "encountered idx value too large to fit in unsigned short",
    )? as u16;
    let zoom = bounded(
        number(require(object, "zoom")?, "zoom")?,
        std::u16::MAX as u64,
        "encountered zoom value too large to fit in unsigned short",
    )? as u16;

    let weight = number(require(object, "weight")?, "weight")?;
    if !weight.is_finite() || weight < 0. {
        return Err(range_error("encountered weight value too large to fit in double"));
    }

    let phrase = require(object, "phrase")?
        .as_str()
        .ok_or_else(|| invalid_argument("phrase value must be a string"))?;
    validate_phrase(phrase)?;

    let prefix = parse_prefix(require(object, "prefix")?)?;

    let mask = bounded(
        number(require(object, "mask")?, "mask")?,
        std::u32::MAX as u64,
        "encountered mask value too large to fit in uint32_t",
    )? as u32;

    let languages = match object.get("languages") {
        Some(languages) => parse_languages(languages)?,
        None => None,
    };

    let cache = match require(object, "cache")? {
        Value::String(name) => caches.get(name).cloned(),
        _ => None,
    }
    .ok_or_else(|| invalid_argument("cache value must be a Cache object"))?;

    Ok(PhrasematchSubquery {
        cache,
        phrase: phrase.to_owned(),
        prefix,
        languages,
        weight,
        idx,
        zoom,
        mask,
    })
}

/// Parses an array of subquery objects. Each object names its cache; the name is resolved
/// against `caches`.
pub fn parse_subqueries<'a>(
    value: &Value,
    caches: &HashMap<String, &'a dyn GridCache>,
) -> Result<Vec<PhrasematchSubquery<'a>>, Error> {
    let array = match value {
        Value::Array(array) if !array.is_empty() => array,
        _ => {
            return Err(invalid_argument(
                "Arg 1 must be an array with one or more PhrasematchSubquery objects",
            ))
        }
    };
    array.iter().map(|subquery| parse_subquery(subquery, caches)).collect()
}

fn parse_coords(value: &Value, name: &str, len: usize) -> Result<Vec<u32>, Error> {
    let array =
        value.as_array().ok_or_else(|| invalid_argument(format!("{} must be an array", name)))?;
    if array.len() != len {
        return Err(invalid_argument(format!("{} must be an array of {} numbers", name, len)));
    }
    array
        .iter()
        .map(|coord| {
            let coord = coord
                .as_f64()
                .ok_or_else(|| invalid_argument(format!("{} values must be number", name)))?;
            Ok(bounded(
                coord,
                std::u32::MAX as u64,
                &format!("encountered {} value too large to fit in uint32_t", name),
            )? as u32)
        })
        .collect()
}

/// Parses the options object of a coalesce call: `radius`, `centerzxy` and `bboxzxy`, all
/// optional. `null` or a missing object yields the defaults.
pub fn parse_options(value: &Value) -> Result<CoalesceOptions, Error> {
    let mut options = CoalesceOptions::default();
    let object = match value {
        Value::Null => return Ok(options),
        Value::Object(object) => object,
        _ => return Err(invalid_argument("Arg 2 must be an options object")),
    };

    if let Some(radius) = object.get("radius") {
        let radius = radius.as_f64().ok_or_else(|| invalid_argument("radius must be a number"))?;
        if radius < 0. || radius > std::u32::MAX as f64 {
            return Err(range_error("encountered radius too large to fit in unsigned"));
        }
        options.radius = radius;
    }

    if let Some(center) = object.get("centerzxy") {
        let center = parse_coords(center, "centerzxy", 3)?;
        options.proximity = Some(Proximity { zoom: center[0], x: center[1], y: center[2] });
    }

    if let Some(bbox) = object.get("bboxzxy") {
        let bbox = parse_coords(bbox, "bboxzxy", 5)?;
        options.bbox = Some(BBox {
            zoom: bbox[0],
            min_x: bbox[1],
            min_y: bbox[2],
            max_x: bbox[3],
            max_y: bbox[4],
        });
    }

    Ok(options)
}

/// Opens a persistent cache from a dynamic filename argument.
pub fn open_persistent(value: &Value) -> Result<RocksDBCache, Error> {
    match value {
        Value::String(filename) => RocksDBCache::new(filename),
        _ => Err(invalid_argument("expected 'filename' to be a string")),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn message(err: Error) -> CacheError {
        err.downcast_ref::<CacheError>().cloned().unwrap()
    }

    #[test]
    fn bounded_test() {
        assert_eq!(bounded(3., 10, "too large").unwrap(), 3);
        assert!(bounded(11., 10, "too large").is_err());
        assert!(bounded(-1., 10, "too large").is_err());
        assert!(bounded(1.5, 10, "too large").is_err());
    }

    #[test]
    fn prefix_test() {
        assert_eq!(parse_prefix(&json!(false)).unwrap(), PrefixMatch::Disabled);
        assert_eq!(parse_prefix(&json!(true)).unwrap(), PrefixMatch::Enabled);
        assert_eq!(parse_prefix(&json!(2)).unwrap(), PrefixMatch::WordBoundary);
        assert_eq!(
            message(parse_prefix(&json!("yes")).unwrap_err()),
            CacheError::InvalidArgument("prefix value must be a boolean".to_owned())
        );
        assert!(parse_prefix(&json!(3)).is_err());
    }

    #[test]
    fn options_test() {
        assert_eq!(parse_options(&json!(null)).unwrap(), CoalesceOptions::default());
        let options =
            parse_options(&json!({ "radius": 200, "centerzxy": [14, 1, 2], "bboxzxy": [2, 0, 0, 3, 3] }))
                .unwrap();
        assert_eq!(options.radius, 200.);
        assert_eq!(options.proximity, Some(Proximity { zoom: 14, x: 1, y: 2 }));
        assert_eq!(options.bbox, Some(BBox { zoom: 2, min_x: 0, min_y: 0, max_x: 3, max_y: 3 }));

        assert_eq!(
            message(parse_options(&json!({ "centerzxy": [1, 2] })).unwrap_err()),
            CacheError::InvalidArgument("centerzxy must be an array of 3 numbers".to_owned())
        );
        assert_eq!(
            message(parse_options(&json!({ "bboxzxy": [1, 2, 3, 4, -5] })).unwrap_err()),
            CacheError::RangeError("encountered bboxzxy value too large to fit in uint32_t".to_owned())
        );
    }
}
