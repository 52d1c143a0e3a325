use std::f64::consts::PI;

use serde::Serialize;
use thiserror::Error;

/// Highest zoom level accepted anywhere in the pipeline.
pub const MAX_ZOOM: u8 = 24;

/// Edge length of a tile in pixels.
pub const TILE_SIZE: u32 = 256;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordError {
    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),
}

pub type StatusOr<T> = Result<T, CoordError>;

/// A tile address in the quad-tree pyramid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoordinate {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

impl TileCoordinate {
    pub fn new(x: u32, y: u32, z: u8) -> StatusOr<Self> {
        check_zoom(z)?;
        let n = tiles_per_side(z);
        if x >= n || y >= n {
            return Err(CoordError::InvalidCoordinate(format!(
                "tile ({}, {}) is outside the {}x{} grid at zoom {}",
                x, y, n, n, z
            )));
        }
        Ok(Self { x, y, z })
    }
}

/// Geographic bounding box in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct GeoBoundingBox {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl GeoBoundingBox {
    /// Builds a box, rejecting anything outside the open lat/lng ranges or
    /// with an empty extent.
    pub fn new(north: f64, south: f64, east: f64, west: f64) -> StatusOr<Self> {
        check_latitude(north)?;
        check_latitude(south)?;
        check_longitude(east)?;
        check_longitude(west)?;
        if south >= north {
            return Err(CoordError::InvalidCoordinate(format!(
                "south {} must be below north {}",
                south, north
            )));
        }
        if west >= east {
            return Err(CoordError::InvalidCoordinate(format!(
                "west {} must be left of east {}",
                west, east
            )));
        }
        Ok(Self { north, south, east, west })
    }

    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    /// Tile rectangle covering this box at `zoom`.
    ///
    /// The north-west corner gives (left, top), the south-east corner gives
    /// (right, bottom).
    pub fn tile_bounds(&self, zoom: u8) -> StatusOr<TileGridBounds> {
        let (left, top) = project(self.north, self.west, zoom)?;
        let (right, bottom) = project(self.south, self.east, zoom)?;
        TileGridBounds::new(left, right, top, bottom, zoom)
    }
}

/// Inclusive rectangle of tile indices at one zoom level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TileGridBounds {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
    #[serde(skip)]
    pub zoom: u8,
}

impl TileGridBounds {
    pub fn new(left: u32, right: u32, top: u32, bottom: u32, zoom: u8) -> StatusOr<Self> {
        check_zoom(zoom)?;
        if right < left || bottom < top {
            return Err(CoordError::InvalidCoordinate(format!(
                "tile bounds left={} right={} top={} bottom={} are inverted",
                left, right, top, bottom
            )));
        }
        let n = tiles_per_side(zoom);
        if right >= n || bottom >= n {
            return Err(CoordError::InvalidCoordinate(format!(
                "tile bounds right={} bottom={} exceed the {}x{} grid at zoom {}",
                right, bottom, n, n, zoom
            )));
        }
        Ok(Self { left, right, top, bottom, zoom })
    }

    pub fn columns(&self) -> u32 {
        self.right - self.left + 1
    }

    pub fn rows(&self) -> u32 {
        self.bottom - self.top + 1
    }

    pub fn tile_count(&self) -> u64 {
        self.columns() as u64 * self.rows() as u64
    }

    /// Tiles in row-major download order: x outer, y inner.
    pub fn tiles(&self) -> impl Iterator<Item = TileCoordinate> + '_ {
        (self.left..=self.right).flat_map(move |x| {
            (self.top..=self.bottom).map(move |y| TileCoordinate { x, y, z: self.zoom })
        })
    }
}

/// Number of tiles along one axis at `zoom`.
pub fn tiles_per_side(zoom: u8) -> u32 {
    1u32 << zoom
}

/// Projects a latitude/longitude to the spherical Web-Mercator tile holding it.
///
/// Latitudes beyond the Mercator limit (about ±85.0511°) land on the first or
/// last tile row. The poles themselves are rejected since sec(±90°) is
/// undefined.
pub fn project(lat: f64, lng: f64, zoom: u8) -> StatusOr<(u32, u32)> {
    check_latitude(lat)?;
    check_longitude(lng)?;
    check_zoom(zoom)?;

    let n = tiles_per_side(zoom) as f64;
    let xtile = (lng + 180.0) / 360.0 * n;
    let lat_rad = lat / 180.0 * PI;
    let ytile = (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n;

    if !xtile.is_finite() || !ytile.is_finite() {
        return Err(CoordError::InvalidCoordinate(format!(
            "({}, {}) does not project at zoom {}",
            lat, lng, zoom
        )));
    }

    let max = n - 1.0;
    Ok((
        xtile.floor().clamp(0.0, max) as u32,
        ytile.floor().clamp(0.0, max) as u32,
    ))
}

fn check_latitude(lat: f64) -> StatusOr<()> {
    if lat.is_nan() || lat <= -90.0 || lat >= 90.0 {
        return Err(CoordError::InvalidCoordinate(format!(
            "latitude {} is outside (-90, 90)",
            lat
        )));
    }
    Ok(())
}

fn check_longitude(lng: f64) -> StatusOr<()> {
    if lng.is_nan() || lng <= -180.0 || lng >= 180.0 {
        return Err(CoordError::InvalidCoordinate(format!(
            "longitude {} is outside (-180, 180)",
            lng
        )));
    }
    Ok(())
}

fn check_zoom(zoom: u8) -> StatusOr<()> {
    if zoom > MAX_ZOOM {
        return Err(CoordError::InvalidCoordinate(format!(
            "zoom {} is above the maximum of {}",
            zoom, MAX_ZOOM
        )));
    }
    Ok(())
}
