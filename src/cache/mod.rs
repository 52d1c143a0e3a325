use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::coord::TileCoordinate;

/// On-disk tile store laid out as `<root>/<project>/<zoom>/<x>/<y>.png`.
///
/// A file's presence is the only validity signal: no expiry, no checksum.
#[derive(Clone, Debug)]
pub struct TileCache {
    project_dir: PathBuf,
}

impl TileCache {
    /// Cache for `project` under `root` (normally `./tiles`). Directories are
    /// created lazily on first write.
    pub fn new<P: AsRef<Path>>(root: P, project: &str) -> Self {
        Self {
            project_dir: root.as_ref().join(project),
        }
    }

    /// Path a tile lives at, whether or not it exists yet.
    pub fn tile_path(&self, tile: &TileCoordinate) -> PathBuf {
        self.project_dir
            .join(tile.z.to_string())
            .join(tile.x.to_string())
            .join(format!("{}.png", tile.y))
    }

    /// Get the cached file for a tile, or None on a cache miss
    pub fn get_cached_file(&self, tile: &TileCoordinate) -> Option<PathBuf> {
        let file_path = self.tile_path(tile);
        if file_path.exists() {
            Some(file_path)
        } else {
            None
        }
    }

    pub fn contains(&self, tile: &TileCoordinate) -> bool {
        self.tile_path(tile).exists()
    }

    /// Stores tile bytes.
    ///
    /// The bytes go to a uniquely named sibling first and are renamed into
    /// place, so the final path either holds a complete tile or nothing, even
    /// with two writers racing on the same tile.
    pub fn save_to_cache(&self, tile: &TileCoordinate, data: &[u8]) -> io::Result<PathBuf> {
        let file_path = self.tile_path(tile);

        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = file_path.with_extension(format!("png.{}.part", Uuid::new_v4().simple()));
        let written = File::create(&temp_path).and_then(|mut file| {
            file.write_all(data)?;
            file.sync_all()
        });
        if let Err(err) = written.and_then(|_| fs::rename(&temp_path, &file_path)) {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }

        Ok(file_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout() {
        let cache = TileCache::new("tiles", "beijing");
        let path = cache.tile_path(&TileCoordinate { x: 842, y: 387, z: 10 });
        assert_eq!(path, PathBuf::from("tiles/beijing/10/842/387.png"));
    }

    #[test]
    fn test_save_and_lookup() {
        let dir = TempDir::new().unwrap();
        let cache = TileCache::new(dir.path(), "p");
        let tile = TileCoordinate { x: 3, y: 4, z: 5 };

        assert!(cache.get_cached_file(&tile).is_none());
        let saved = cache.save_to_cache(&tile, b"tile-bytes").unwrap();
        assert_eq!(cache.get_cached_file(&tile), Some(saved.clone()));
        assert_eq!(fs::read(&saved).unwrap(), b"tile-bytes");

        // No temporary files left next to the tile
        let siblings: Vec<_> = fs::read_dir(saved.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(siblings, vec![std::ffi::OsString::from("4.png")]);
    }

    #[test]
    fn test_overwrite_is_whole() {
        let dir = TempDir::new().unwrap();
        let cache = TileCache::new(dir.path(), "p");
        let tile = TileCoordinate { x: 0, y: 0, z: 0 };
        cache.save_to_cache(&tile, b"first version").unwrap();
        cache.save_to_cache(&tile, b"second").unwrap();
        assert_eq!(fs::read(cache.tile_path(&tile)).unwrap(), b"second");
    }
}
