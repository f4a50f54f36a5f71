//! Tile arithmetic used by coalesce: distances, proximity scoring and zoom conversion.

/// Euclidean distance between two tiles at the same zoom, in tiles.
#[inline]
pub fn tile_dist(px: u32, py: u32, tile_x: u32, tile_y: u32) -> f64 {
    let dx = px as f64 - tile_x as f64;
    let dy = py as f64 - tile_y as f64;
    (dx * dx + dy * dy).sqrt()
}

/// Combines a feature's score with its distance from the proximity point.
///
/// `radius` is in miles; 32 tiles at z14 is roughly 40 miles, and each zoom level below
/// that shrinks the reach by a factor of 1.5. Zooms below 6 are treated as 6. The result
/// never drops below `score`.
pub fn scoredist(zoom: u32, distance: f64, score: f64, radius: f64) -> f64 {
    let zoom = zoom.max(6);
    let distance = if distance == 0. { 0.01 } else { distance };
    let scoredist = ((radius * (32. / 40.)) / 1.5f64.powi(14 - zoom as i32)) / distance;
    if score > scoredist {
        score
    } else {
        scoredist
    }
}

/// Reprojects a tile at `zoom` to a tile at `target_zoom`.
///
/// Zooming in by `d` levels maps each coordinate `v` to `v * (d - 1) + 2^d / 2`, which is
/// not the centre child of the source tile for `v > 0`; zooming out takes the enclosing parent.
pub fn project_point(zoom: u32, x: u32, y: u32, target_zoom: u32) -> (u32, u32) {
    if target_zoom == zoom {
        return (x, y);
    }
    if target_zoom > zoom {
        let z_dist = target_zoom - zoom;
        let z_mult = z_dist - 1;
        let mid = (1u64 << z_dist.min(63)) / 2;
        let project = |v: u32| (v as u64 * z_mult as u64 + mid).min(std::u32::MAX as u64) as u32;
        (project(x), project(y))
    } else {
        let shift = zoom - target_zoom;
        (x.checked_shr(shift).unwrap_or(0), y.checked_shr(shift).unwrap_or(0))
    }
}

/// Converts one corner of a bounding box at `zoom` to the matching tile at `target_zoom`.
///
/// When zooming in, a `max` corner covers the far edge of its tile, so it becomes the
/// last child tile rather than the first.
pub fn bbox_corner_to_zoom(zoom: u32, x: u32, y: u32, target_zoom: u32, max: bool) -> (u32, u32) {
    if target_zoom == zoom {
        return (x, y);
    }
    let z_dist = target_zoom as i32 - zoom as i32;
    let mult = 2f64.powi(z_dist);
    let clamp = |v: f64| v.max(0.).min(std::u32::MAX as f64) as u32;

    if z_dist > 0 {
        let offset = if max { mult - 1. } else { 0. };
        (clamp(x as f64 * mult + offset), clamp(y as f64 * mult + offset))
    } else {
        let modulus = 1u64 << target_zoom.min(63);
        let snap = |v: u32| v as u64 - (v as u64 % modulus);
        (clamp(snap(x) as f64 * mult), clamp(snap(y) as f64 * mult))
    }
}
