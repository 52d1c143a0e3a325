use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::partition::{Extent, Region};

#[derive(Error, Debug)]
pub enum RunLogError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode log entry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One line of the success log.
#[derive(Serialize)]
pub struct SuccessEntry<'a> {
    pub zoom: u8,
    pub bbox: Extent<'a>,
    pub timestamp: DateTime<Utc>,
}

impl<'a> SuccessEntry<'a> {
    pub fn for_region(region: &'a Region) -> Self {
        Self {
            zoom: region.zoom(),
            bbox: region.extent(),
            timestamp: Utc::now(),
        }
    }
}

/// The per-project `error_log_<project>.txt` and `success_log_<project>.txt`.
///
/// Both files are append-only and shared by all workers; every append holds
/// the lock for the whole line.
#[derive(Debug)]
pub struct RunLog {
    error_path: PathBuf,
    success_path: PathBuf,
    lock: Mutex<()>,
}

impl RunLog {
    pub fn new<P: AsRef<Path>>(dir: P, project: &str) -> Self {
        let dir = dir.as_ref();
        Self {
            error_path: dir.join(format!("error_log_{}.txt", project)),
            success_path: dir.join(format!("success_log_{}.txt", project)),
            lock: Mutex::new(()),
        }
    }

    pub fn error_path(&self) -> &Path {
        &self.error_path
    }

    pub fn success_path(&self) -> &Path {
        &self.success_path
    }

    pub fn append_error(&self, line: &str) -> Result<(), RunLogError> {
        self.append(&self.error_path, line)
    }

    pub fn append_success(&self, entry: &SuccessEntry<'_>) -> Result<(), RunLogError> {
        let line = serde_json::to_string(entry)?;
        self.append(&self.success_path, &line)
    }

    /// Truncates both logs to empty.
    pub fn reset(&self) -> Result<(), RunLogError> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for path in [&self.error_path, &self.success_path] {
            File::create(path).map_err(|source| RunLogError::Io {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn append(&self, path: &Path, line: &str) -> Result<(), RunLogError> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let io_err = |source| RunLogError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;
        file.write_all(format!("{}\n", line).as_bytes()).map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{GeoBoundingBox, TileGridBounds};
    use std::fs;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_paths() {
        let log = RunLog::new("/tmp/run", "beijing");
        assert_eq!(log.error_path(), Path::new("/tmp/run/error_log_beijing.txt"));
        assert_eq!(log.success_path(), Path::new("/tmp/run/success_log_beijing.txt"));
    }

    #[test]
    fn test_success_entry_format() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::new(dir.path(), "p");
        let geo = Region::Geo {
            bbox: GeoBoundingBox::new(40.0, 39.9, 116.4, 116.3).unwrap(),
            zoom: 10,
            slice: None,
        };
        let tiles = Region::Tiles(TileGridBounds::new(1, 2, 3, 4, 5).unwrap());
        log.append_success(&SuccessEntry::for_region(&geo)).unwrap();
        log.append_success(&SuccessEntry::for_region(&tiles)).unwrap();

        let content = fs::read_to_string(log.success_path()).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["zoom"], 10);
        assert_eq!(lines[0]["bbox"]["north"], 40.0);
        assert_eq!(lines[0]["bbox"]["west"], 116.3);
        assert!(lines[0]["timestamp"].is_string());
        assert_eq!(lines[1]["zoom"], 5);
        assert_eq!(lines[1]["bbox"]["left"], 1);
        assert_eq!(lines[1]["bbox"]["bottom"], 4);
    }

    #[test]
    fn test_reset_truncates_both() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::new(dir.path(), "p");
        log.append_error("http://a/1").unwrap();
        log.append_error("http://a/2").unwrap();
        assert_eq!(fs::read_to_string(log.error_path()).unwrap(), "http://a/1\nhttp://a/2\n");

        log.reset().unwrap();
        assert_eq!(fs::read_to_string(log.error_path()).unwrap(), "");
        assert_eq!(fs::read_to_string(log.success_path()).unwrap(), "");
    }

    #[test]
    fn test_concurrent_appends_keep_lines_whole() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(RunLog::new(dir.path(), "p"));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for i in 0..50 {
                        log.append_error(&format!("worker-{}-line-{}", worker, i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let content = fs::read_to_string(log.error_path()).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 400);
        assert!(lines.iter().all(|l| l.starts_with("worker-") && l.contains("-line-")));
    }
}
