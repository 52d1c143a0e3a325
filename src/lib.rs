//! Downloads rectangular areas of a slippy-map tile pyramid and stitches the
//! tiles of each area into one mosaic image per zoom level.

pub mod cache;
pub mod config;
pub mod coord;
pub mod download;
pub mod mosaic;
pub mod orchestrator;
pub mod partition;
pub mod provider;
pub mod runlog;
