use log::{debug, info, warn};

use crate::coord::{TileCoordinate, TileGridBounds};

/// What happened to one tile during a grid fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileStatus {
    Cached,
    Downloaded,
    Failed,
}

/// Observer for grid fetch progress, kept apart from the retry and IO logic.
pub trait FetchProgress: Send + Sync {
    fn grid_started(&self, _bounds: &TileGridBounds) {}

    /// Called once per tile, `done` counting from 1 up to `total`.
    fn tile_finished(&self, tile: &TileCoordinate, status: TileStatus, done: u64, total: u64);

    fn grid_finished(&self, _bounds: &TileGridBounds, _report: &GridReport) {}
}

/// Tally of a grid fetch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GridReport {
    pub cached: u64,
    pub downloaded: u64,
    pub failed: Vec<TileCoordinate>,
}

impl GridReport {
    pub fn record(&mut self, tile: TileCoordinate, status: TileStatus) {
        match status {
            TileStatus::Cached => self.cached += 1,
            TileStatus::Downloaded => self.downloaded += 1,
            TileStatus::Failed => self.failed.push(tile),
        }
    }

    pub fn total(&self) -> u64 {
        self.cached + self.downloaded + self.failed.len() as u64
    }
}

/// Reports progress through the `log` facade.
pub struct LogProgress;

impl FetchProgress for LogProgress {
    fn grid_started(&self, bounds: &TileGridBounds) {
        info!(
            "Zoom {}: fetching {} tiles, nw ({}, {}) se ({}, {})",
            bounds.zoom,
            bounds.tile_count(),
            bounds.left,
            bounds.top,
            bounds.right,
            bounds.bottom
        );
    }

    fn tile_finished(&self, tile: &TileCoordinate, status: TileStatus, done: u64, total: u64) {
        match status {
            TileStatus::Failed => warn!("[{}/{}] tile {}/{}/{} unavailable", done, total, tile.z, tile.x, tile.y),
            _ => debug!("[{}/{}] tile {}/{}/{} {:?}", done, total, tile.z, tile.x, tile.y, status),
        }
    }

    fn grid_finished(&self, bounds: &TileGridBounds, report: &GridReport) {
        info!(
            "Zoom {}: {} downloaded, {} cached, {} failed",
            bounds.zoom,
            report.downloaded,
            report.cached,
            report.failed.len()
        );
    }
}

/// Discards all progress events.
pub struct NoProgress;

impl FetchProgress for NoProgress {
    fn tile_finished(&self, _tile: &TileCoordinate, _status: TileStatus, _done: u64, _total: u64) {}
}
