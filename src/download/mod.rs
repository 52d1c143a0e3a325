use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use reqwest::blocking::Client;
use thiserror::Error;

use crate::cache::TileCache;
use crate::coord::{TileCoordinate, TileGridBounds};
use crate::provider::ProviderTable;
use crate::runlog::RunLog;

pub mod progress;

pub use progress::{FetchProgress, GridReport, LogProgress, NoProgress, TileStatus};

/// A single failed attempt. Retried by the fetcher, never returned from it.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum FetchError {
    /// Every attempt failed; the tile is unavailable for this run.
    #[error("Gave up on {url} after {attempts} attempts")]
    Exhausted { url: String, attempts: u32 },

    #[error("Failed to store tile at {path}: {source}")]
    Cache {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Fetches raw tile bytes for a URL.
pub trait Transport: Send + Sync {
    fn get(&self, url: &str) -> Result<Vec<u8>, TransportError>;
}

/// Blocking HTTP transport. Non-success statuses count as failures.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tilemosaic/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        let response = self.client.get(url).send()?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        let data = response.bytes()?;
        Ok(data.to_vec())
    }
}

/// How hard to try for one tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Pause after a failed attempt before the next one.
    pub retry_delay: Duration,
    /// Pause after a successful download, bounding the request rate.
    pub pacing_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            retry_delay: Duration::from_millis(500),
            pacing_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Same attempt budget with no sleeping.
    pub fn without_delays(self) -> Self {
        Self {
            retry_delay: Duration::ZERO,
            pacing_delay: Duration::ZERO,
            ..self
        }
    }
}

/// Result of the retry loop. Callers must match on it; there is no response
/// to read once attempts are exhausted.
#[derive(Debug)]
pub enum DownloadOutcome {
    Success(Vec<u8>),
    Exhausted {
        attempts: u32,
        last_error: Option<TransportError>,
    },
}

/// How `ensure` satisfied a tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fetched {
    /// Already on disk; no request was made.
    Cached,
    Downloaded,
}

/// Makes sure tiles exist in the cache, downloading the missing ones.
pub struct TileFetcher {
    transport: Arc<dyn Transport>,
    providers: Arc<ProviderTable>,
    cache: TileCache,
    run_log: Arc<RunLog>,
    retry: RetryPolicy,
}

impl TileFetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        providers: Arc<ProviderTable>,
        cache: TileCache,
        run_log: Arc<RunLog>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            providers,
            cache,
            run_log,
            retry,
        }
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    /// Ensures the tile is on disk.
    ///
    /// A cached tile returns immediately. Otherwise the provider template is
    /// resolved and downloaded under the retry policy; on exhaustion the URL
    /// goes to the error log and nothing is written.
    pub fn ensure(&self, tile: &TileCoordinate, provider_id: &str) -> Result<Fetched, FetchError> {
        if self.cache.contains(tile) {
            return Ok(Fetched::Cached);
        }

        let url = self.providers.resolve(provider_id).render(tile);
        match self.download_with_retry(&url) {
            DownloadOutcome::Success(data) => {
                let path = self.cache.save_to_cache(tile, &data).map_err(|source| {
                    let path = self.cache.tile_path(tile).display().to_string();
                    self.record_failure(&format!("{} (store {} failed: {})", url, path, source));
                    FetchError::Cache { path, source }
                })?;
                debug!("Saved {} to {}", url, path.display());
                Ok(Fetched::Downloaded)
            }
            DownloadOutcome::Exhausted { attempts, last_error } => {
                warn!(
                    "Giving up on {} after {} attempts: {}",
                    url,
                    attempts,
                    last_error.map_or_else(|| "no attempts made".to_string(), |e| e.to_string())
                );
                self.record_failure(&url);
                Err(FetchError::Exhausted { url, attempts })
            }
        }
    }

    /// Runs the retry loop for one URL.
    pub fn download_with_retry(&self, url: &str) -> DownloadOutcome {
        let mut last_error = None;
        for attempt in 1..=self.retry.attempts {
            match self.transport.get(url) {
                Ok(data) => {
                    thread::sleep(self.retry.pacing_delay);
                    return DownloadOutcome::Success(data);
                }
                Err(err) => {
                    debug!("Attempt {}/{} for {} failed: {}", attempt, self.retry.attempts, url, err);
                    last_error = Some(err);
                    if attempt < self.retry.attempts {
                        thread::sleep(self.retry.retry_delay);
                    }
                }
            }
        }
        DownloadOutcome::Exhausted {
            attempts: self.retry.attempts,
            last_error,
        }
    }

    /// Ensures every tile of `bounds`, one at a time in row-major order.
    /// Failures are tallied, never propagated.
    pub fn fetch_grid(
        &self,
        bounds: &TileGridBounds,
        provider_id: &str,
        progress: &dyn FetchProgress,
    ) -> GridReport {
        let total = bounds.tile_count();
        let mut report = GridReport::default();
        progress.grid_started(bounds);

        for (index, tile) in bounds.tiles().enumerate() {
            let status = match self.ensure(&tile, provider_id) {
                Ok(Fetched::Cached) => TileStatus::Cached,
                Ok(Fetched::Downloaded) => TileStatus::Downloaded,
                Err(_) => TileStatus::Failed,
            };
            report.record(tile, status);
            progress.tile_finished(&tile, status, index as u64 + 1, total);
        }

        progress.grid_finished(bounds, &report);
        report
    }

    fn record_failure(&self, line: &str) {
        if let Err(err) = self.run_log.append_error(line) {
            info!("Could not write error log entry for {}: {}", line, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use tempfile::TempDir;

    struct FailingTransport {
        calls: AtomicU32,
    }

    impl Transport for FailingTransport {
        fn get(&self, _url: &str) -> Result<Vec<u8>, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Other("connection refused".to_string()))
        }
    }

    /// Fails a fixed number of times, then serves the URL as the body.
    struct FlakyTransport {
        failures: u32,
        calls: AtomicU32,
        urls: Mutex<Vec<String>>,
    }

    impl FlakyTransport {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                urls: Mutex::new(Vec::new()),
            }
        }
    }

    impl Transport for FlakyTransport {
        fn get(&self, url: &str) -> Result<Vec<u8>, TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_string());
            if call < self.failures {
                Err(TransportError::Status(503))
            } else {
                Ok(url.as_bytes().to_vec())
            }
        }
    }

    fn fetcher(dir: &TempDir, transport: Arc<dyn Transport>) -> (TileFetcher, Arc<RunLog>) {
        let run_log = Arc::new(RunLog::new(dir.path(), "test"));
        let fetcher = TileFetcher::new(
            transport,
            Arc::new(ProviderTable::builtin()),
            TileCache::new(dir.path().join("tiles"), "test"),
            Arc::clone(&run_log),
            RetryPolicy::default().without_delays(),
        );
        (fetcher, run_log)
    }

    #[test]
    fn test_exhausted_retries() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FailingTransport { calls: AtomicU32::new(0) });
        let (fetcher, run_log) = fetcher(&dir, transport.clone());
        let tile = TileCoordinate { x: 842, y: 387, z: 10 };

        let result = fetcher.ensure(&tile, "default");

        match result {
            Err(FetchError::Exhausted { url, attempts }) => {
                assert_eq!(url, "http://a.tile.openstreetmap.org/10/842/387.png");
                assert_eq!(attempts, 10);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 10);
        assert!(!fetcher.cache().tile_path(&tile).exists());
        assert!(!fetcher.cache().tile_path(&tile).parent().unwrap().exists());

        let errors = fs::read_to_string(run_log.error_path()).unwrap();
        assert_eq!(errors.lines().count(), 1);
        assert!(errors.contains("http://a.tile.openstreetmap.org/10/842/387.png"));
    }

    #[test]
    fn test_retry_then_success() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FlakyTransport::new(3));
        let (fetcher, run_log) = fetcher(&dir, transport.clone());
        let tile = TileCoordinate { x: 1, y: 2, z: 3 };

        assert_eq!(fetcher.ensure(&tile, "default").unwrap(), Fetched::Downloaded);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            fs::read(fetcher.cache().tile_path(&tile)).unwrap(),
            b"http://a.tile.openstreetmap.org/3/1/2.png"
        );
        assert!(!run_log.error_path().exists());
    }

    #[test]
    fn test_literal_template_provider() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FlakyTransport::new(0));
        let (fetcher, _) = fetcher(&dir, transport.clone());
        let tile = TileCoordinate { x: 5, y: 6, z: 7 };

        fetcher.ensure(&tile, "https://example.com/t?x={x}&y={y}&z={z}").unwrap();
        assert_eq!(
            *transport.urls.lock().unwrap(),
            vec!["https://example.com/t?x=5&y=6&z=7".to_string()]
        );
    }

    #[test]
    fn test_cached_grid_makes_no_requests() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FlakyTransport::new(0));
        let (fetcher, _) = fetcher(&dir, transport.clone());
        let bounds = TileGridBounds::new(10, 12, 20, 21, 6).unwrap();

        for tile in bounds.tiles() {
            fetcher.cache().save_to_cache(&tile, b"cached").unwrap();
        }

        let report = fetcher.fetch_grid(&bounds, "default", &NoProgress);
        assert_eq!(report.cached, 6);
        assert_eq!(report.downloaded, 0);
        assert!(report.failed.is_empty());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        for tile in bounds.tiles() {
            assert_eq!(fs::read(fetcher.cache().tile_path(&tile)).unwrap(), b"cached");
        }
    }

    #[test]
    fn test_grid_fetch_order_and_progress() {
        struct Recorder(Mutex<Vec<(u32, u32, TileStatus, u64, u64)>>);
        impl FetchProgress for Recorder {
            fn tile_finished(&self, tile: &TileCoordinate, status: TileStatus, done: u64, total: u64) {
                self.0.lock().unwrap().push((tile.x, tile.y, status, done, total));
            }
        }

        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FlakyTransport::new(0));
        let (fetcher, _) = fetcher(&dir, transport.clone());
        let bounds = TileGridBounds::new(0, 1, 0, 1, 1).unwrap();
        fetcher
            .cache()
            .save_to_cache(&TileCoordinate { x: 1, y: 0, z: 1 }, b"cached")
            .unwrap();

        let recorder = Recorder(Mutex::new(Vec::new()));
        let report = fetcher.fetch_grid(&bounds, "default", &recorder);

        assert_eq!(report.total(), 4);
        assert_eq!(report.downloaded, 3);
        assert_eq!(report.cached, 1);
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                (0, 0, TileStatus::Downloaded, 1, 4),
                (0, 1, TileStatus::Downloaded, 2, 4),
                (1, 0, TileStatus::Cached, 3, 4),
                (1, 1, TileStatus::Downloaded, 4, 4),
            ]
        );
    }

    #[test]
    fn test_failed_tiles_are_reported() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FailingTransport { calls: AtomicU32::new(0) });
        let (fetcher, run_log) = fetcher(&dir, transport.clone());
        let bounds = TileGridBounds::new(0, 0, 0, 1, 1).unwrap();

        let report = fetcher.fetch_grid(&bounds, "default", &NoProgress);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 20);
        let errors = fs::read_to_string(run_log.error_path()).unwrap();
        assert_eq!(errors.lines().count(), 2);
    }

    /// Answers a single HTTP request on a local port with `response`.
    fn serve_once(response: &'static [u8]) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/7/5/6.png", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            assert!(request.starts_with(b"GET /7/5/6.png "));
            stream.write_all(response).unwrap();
        });
        (url, handle)
    }

    #[test]
    fn test_http_error_status() {
        let (url, server) = serve_once(
            b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();

        let result = transport.get(&url);
        server.join().unwrap();
        assert!(matches!(result, Err(TransportError::Status(503))), "{:?}", result);
    }

    #[test]
    fn test_http_body_is_returned() {
        let (url, server) = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: 9\r\nConnection: close\r\n\r\ntile-body",
        );
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();

        let body = transport.get(&url).unwrap();
        server.join().unwrap();
        assert_eq!(body, b"tile-body");
    }

    #[test]
    fn test_default_retry_policy() {
        assert_eq!(
            RetryPolicy::default(),
            RetryPolicy {
                attempts: 10,
                retry_delay: Duration::from_millis(500),
                pacing_delay: Duration::from_millis(100),
            }
        );
        let quick = RetryPolicy::default().without_delays();
        assert_eq!(quick.attempts, 10);
        assert_eq!(quick.pacing_delay, Duration::ZERO);
    }
}
