use serde::Serialize;

use crate::coord::{GeoBoundingBox, StatusOr, TileGridBounds};

/// Relative slack used when deciding whether a span is an exact multiple of
/// the slice step, so 0.3 / 0.1 yields three slices rather than four.
const STEP_EPSILON: f64 = 1e-9;

/// One unit of work handed to a worker.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Region {
    /// A geographic box at one zoom. `slice` is the (column, row) of the cell
    /// when the box was cut out of a larger request, counted from the
    /// north-west cell; it keeps each cell's output name distinct.
    Geo {
        bbox: GeoBoundingBox,
        zoom: u8,
        slice: Option<(usize, usize)>,
    },
    /// An explicit tile rectangle.
    Tiles(TileGridBounds),
}

/// Extent of a region as written to the success log.
#[derive(Serialize)]
#[serde(untagged)]
pub enum Extent<'a> {
    Geo(&'a GeoBoundingBox),
    Tiles(&'a TileGridBounds),
}

impl Region {
    pub fn zoom(&self) -> u8 {
        match self {
            Region::Geo { zoom, .. } => *zoom,
            Region::Tiles(bounds) => bounds.zoom,
        }
    }

    pub fn is_sliced(&self) -> bool {
        self.slice().is_some()
    }

    pub fn slice(&self) -> Option<(usize, usize)> {
        match self {
            Region::Geo { slice, .. } => *slice,
            Region::Tiles(_) => None,
        }
    }

    pub fn extent(&self) -> Extent<'_> {
        match self {
            Region::Geo { bbox, .. } => Extent::Geo(bbox),
            Region::Tiles(bounds) => Extent::Tiles(bounds),
        }
    }

    /// Tile rectangle this region covers.
    pub fn tile_bounds(&self) -> StatusOr<TileGridBounds> {
        match self {
            Region::Geo { bbox, zoom, .. } => bbox.tile_bounds(*zoom),
            Region::Tiles(bounds) => Ok(*bounds),
        }
    }
}

/// Splits `bbox` into regions for every zoom in `[min_zoom, max_zoom]`.
///
/// Zooms below `slice_level` get the whole box as a single region. From
/// `slice_level` up the box is cut into cells of at most `slice_step` degrees
/// per axis, emitted west to east and, within each column, north to south.
pub fn partition(
    bbox: &GeoBoundingBox,
    min_zoom: u8,
    max_zoom: u8,
    slice_step: f64,
    slice_level: u8,
) -> Vec<Region> {
    let lng_breaks = breakpoints(bbox.west, bbox.east, slice_step);
    let mut lat_breaks = breakpoints(bbox.south, bbox.north, slice_step);
    lat_breaks.reverse();

    let mut regions = Vec::new();
    for zoom in min_zoom..=max_zoom {
        if zoom < slice_level {
            regions.push(Region::Geo {
                bbox: *bbox,
                zoom,
                slice: None,
            });
            continue;
        }
        for (column, lng) in lng_breaks.windows(2).enumerate() {
            for (row, lat) in lat_breaks.windows(2).enumerate() {
                regions.push(Region::Geo {
                    bbox: GeoBoundingBox {
                        north: lat[0],
                        south: lat[1],
                        west: lng[0],
                        east: lng[1],
                    },
                    zoom,
                    slice: Some((column, row)),
                });
            }
        }
    }
    regions
}

/// Ascending breakpoints from `min` to `max` spaced by `step`. The last gap
/// may be shorter than `step` but is never dropped, and `max` is always the
/// final value.
pub fn breakpoints(min: f64, max: f64, step: f64) -> Vec<f64> {
    if !(step > 0.0) || !step.is_finite() || max <= min {
        return vec![min, max];
    }

    let ratio = (max - min) / step;
    let mut slices = ratio.ceil();
    if ratio - ratio.floor() <= STEP_EPSILON * ratio.max(1.0) {
        slices = ratio.floor();
    }
    let slices = (slices as usize).max(1);

    let mut points: Vec<f64> = (0..slices).map(|i| min + i as f64 * step).collect();
    points.push(max);
    points
}
