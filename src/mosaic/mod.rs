use std::fs;
use std::path::{Path, PathBuf};

use image::io::Reader as ImageReader;
use image::{ImageFormat, RgbaImage, imageops};
use log::{info, warn};
use thiserror::Error;
use uuid::Uuid;

use crate::cache::TileCache;
use crate::coord::{TILE_SIZE, TileCoordinate, TileGridBounds};

#[derive(Error, Debug)]
pub enum AssembleError {
    /// A tile file exists but could not be read as an image.
    #[error("Failed to decode tile {path}: {reason}")]
    DecodeFailure { path: PathBuf, reason: String },

    #[error("Mosaic of {columns}x{rows} tiles does not fit in a single image")]
    CanvasTooLarge { columns: u32, rows: u32 },

    #[error("Failed to write mosaic to {path}: {reason}")]
    Write { path: PathBuf, reason: String },
}

/// A composed raster plus the cells that were left blank.
pub struct Mosaic {
    pub image: RgbaImage,
    pub absent: Vec<TileCoordinate>,
    pub corrupt: Vec<TileCoordinate>,
}

/// Pastes cached tiles of one project into single images written under
/// `<root>/<project>/<zoom>/`.
#[derive(Clone, Debug)]
pub struct MosaicAssembler {
    cache: TileCache,
    output_dir: PathBuf,
}

impl MosaicAssembler {
    pub fn new<P: AsRef<Path>>(cache: TileCache, output_root: P, project: &str) -> Self {
        Self {
            cache,
            output_dir: output_root.as_ref().join(project),
        }
    }

    /// Where a mosaic named `name` for `zoom` is written.
    pub fn output_path(&self, zoom: u8, name: &str) -> PathBuf {
        self.output_dir.join(zoom.to_string()).join(format!("{}.png", name))
    }

    /// Composes every present tile of `bounds` onto a transparent canvas.
    ///
    /// Missing and undecodable tiles leave their cell transparent and are
    /// listed in the returned `Mosaic`.
    pub fn assemble(&self, bounds: &TileGridBounds) -> Result<Mosaic, AssembleError> {
        let (width, height) = canvas_size(bounds)?;
        let mut mosaic = Mosaic {
            image: RgbaImage::new(width, height),
            absent: Vec::new(),
            corrupt: Vec::new(),
        };

        for tile in bounds.tiles() {
            let tile_image = match self.load_tile(&tile) {
                Ok(Some(image)) => image,
                Ok(None) => {
                    mosaic.absent.push(tile);
                    continue;
                }
                Err(err) => {
                    warn!("{}", err);
                    mosaic.corrupt.push(tile);
                    continue;
                }
            };
            let offset_x = (tile.x - bounds.left) as i64 * TILE_SIZE as i64;
            let offset_y = (tile.y - bounds.top) as i64 * TILE_SIZE as i64;
            imageops::replace(&mut mosaic.image, &tile_image, offset_x, offset_y);
        }

        Ok(mosaic)
    }

    /// Assembles `bounds` and writes it as `<zoom>/<name>.png`.
    pub fn assemble_to_file(
        &self,
        bounds: &TileGridBounds,
        name: &str,
    ) -> Result<(Mosaic, PathBuf), AssembleError> {
        let mosaic = self.assemble(bounds)?;
        let path = self.output_path(bounds.zoom, name);
        save(&mosaic.image, &path)?;
        info!(
            "Wrote {}x{} mosaic to {} ({} absent, {} corrupt)",
            mosaic.image.width(),
            mosaic.image.height(),
            path.display(),
            mosaic.absent.len(),
            mosaic.corrupt.len()
        );
        Ok((mosaic, path))
    }

    fn load_tile(&self, tile: &TileCoordinate) -> Result<Option<RgbaImage>, AssembleError> {
        let Some(path) = self.cache.get_cached_file(tile) else {
            return Ok(None);
        };
        let decode_err = |reason: String| AssembleError::DecodeFailure {
            path: path.clone(),
            reason,
        };
        // Tile servers do not always serve PNG behind a .png name, so sniff
        // the content instead of trusting the extension.
        let image = ImageReader::open(&path)
            .map_err(|e| decode_err(e.to_string()))?
            .with_guessed_format()
            .map_err(|e| decode_err(e.to_string()))?
            .decode()
            .map_err(|e| decode_err(e.to_string()))?;
        Ok(Some(image.to_rgba8()))
    }
}

/// Pixel size of the canvas for `bounds`.
pub fn canvas_size(bounds: &TileGridBounds) -> Result<(u32, u32), AssembleError> {
    let too_large = || AssembleError::CanvasTooLarge {
        columns: bounds.columns(),
        rows: bounds.rows(),
    };
    let width = bounds.columns().checked_mul(TILE_SIZE).ok_or_else(too_large)?;
    let height = bounds.rows().checked_mul(TILE_SIZE).ok_or_else(too_large)?;
    Ok((width, height))
}

/// Writes `image` as PNG, creating parent directories. The file is written
/// beside its target and renamed, so readers never see half a mosaic.
pub fn save(image: &RgbaImage, path: &Path) -> Result<(), AssembleError> {
    let write_err = |reason: String| AssembleError::Write {
        path: path.to_path_buf(),
        reason,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
    }
    let temp_path = path.with_extension(format!("png.{}.part", Uuid::new_v4().simple()));
    let saved = image
        .save_with_format(&temp_path, ImageFormat::Png)
        .map_err(|e| write_err(e.to_string()))
        .and_then(|_| fs::rename(&temp_path, path).map_err(|e| write_err(e.to_string())));
    if saved.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    saved
}
