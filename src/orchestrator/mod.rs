use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{error, info, warn};
use rayon::ThreadPoolBuilder;
use thiserror::Error;

use crate::cache::TileCache;
use crate::config::{Mode, ProjectConfig};
use crate::coord::{CoordError, TileGridBounds};
use crate::download::{FetchProgress, GridReport, LogProgress, RetryPolicy, TileFetcher, Transport};
use crate::mosaic::{AssembleError, MosaicAssembler};
use crate::partition::{Region, partition};
use crate::provider::ProviderTable;
use crate::runlog::{RunLog, SuccessEntry};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Coordinate(#[from] CoordError),

    #[error("Failed to start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Shared stop flag. Cancelling stops new regions from starting; regions
/// already running finish normally.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Totals for a finished run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub regions_completed: usize,
    pub regions_failed: usize,
    pub regions_skipped: usize,
    pub tiles_downloaded: u64,
    pub tiles_cached: u64,
    pub tiles_failed: u64,
}

impl RunSummary {
    fn record(&mut self, outcome: Result<GridReport, AssembleError>) {
        match outcome {
            Ok(report) => {
                self.regions_completed += 1;
                self.tiles_downloaded += report.downloaded;
                self.tiles_cached += report.cached;
                self.tiles_failed += report.failed.len() as u64;
            }
            Err(_) => self.regions_failed += 1,
        }
    }
}

/// Directory a run works in: `tiles/`, `merged/` and the log files live
/// directly under it.
#[derive(Clone, Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn tiles_dir(&self) -> PathBuf {
        self.root.join("tiles")
    }

    pub fn merged_dir(&self) -> PathBuf {
        self.root.join("merged")
    }

    pub fn log_dir(&self) -> &Path {
        &self.root
    }
}

/// Turns a `ProjectConfig` into regions and drives each through fetch and
/// assembly.
pub struct Orchestrator {
    config: ProjectConfig,
    fetcher: TileFetcher,
    assembler: MosaicAssembler,
    run_log: Arc<RunLog>,
    progress: Arc<dyn FetchProgress>,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(
        config: ProjectConfig,
        workspace: &Workspace,
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
    ) -> Self {
        let providers = Arc::new(
            ProviderTable::builtin().with_entries(config.extra_providers.iter().cloned()),
        );
        let cache = TileCache::new(workspace.tiles_dir(), &config.project);
        let run_log = Arc::new(RunLog::new(workspace.log_dir(), &config.project));
        let fetcher = TileFetcher::new(
            transport,
            providers,
            cache.clone(),
            Arc::clone(&run_log),
            retry,
        );
        let assembler = MosaicAssembler::new(cache, workspace.merged_dir(), &config.project);

        Self {
            config,
            fetcher,
            assembler,
            run_log,
            progress: Arc::new(LogProgress),
            cancel: CancelToken::default(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn FetchProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn run_log(&self) -> &RunLog {
        &self.run_log
    }

    /// Every region of the run with its tile rectangle, in dispatch order.
    ///
    /// All coordinates are validated here, so a bad request fails before any
    /// tile is requested.
    pub fn plan(&self) -> Result<Vec<(Region, TileGridBounds)>, CoordError> {
        let config = &self.config;
        let regions: Vec<Region> = match &config.mode {
            Mode::TileCode(range) => (config.min_zoom..=config.max_zoom)
                .map(|zoom| {
                    TileGridBounds::new(range.left, range.right, range.top, range.bottom, zoom)
                        .map(Region::Tiles)
                })
                .collect::<Result<_, _>>()?,
            Mode::LatLng(bbox) => partition(
                bbox,
                config.min_zoom,
                config.max_zoom,
                config.slice_step,
                config.slice_level,
            ),
        };

        regions
            .into_iter()
            .map(|region| Ok((region, region.tile_bounds()?)))
            .collect()
    }

    /// Runs every region and returns once all of them are done.
    ///
    /// Tile-code requests run zoom by zoom on the calling thread. Geographic
    /// requests fan out over a pool of `workers` threads. Region and tile
    /// failures are logged and counted, never returned.
    pub fn run(&self) -> Result<RunSummary, OrchestratorError> {
        let plan = self.plan()?;
        info!(
            "Project {}: {} regions, zoom {}..={}, provider {}",
            self.config.project,
            plan.len(),
            self.config.min_zoom,
            self.config.max_zoom,
            self.config.provider
        );

        let summary = Mutex::new(RunSummary::default());
        match self.config.mode {
            Mode::TileCode(_) => {
                for (region, bounds) in &plan {
                    self.dispatch(region, bounds, &summary);
                }
            }
            Mode::LatLng(_) => {
                let pool = ThreadPoolBuilder::new()
                    .num_threads(self.config.workers)
                    .thread_name(|i| format!("region-worker-{}", i))
                    .build()?;
                // scope() returns only after every spawned region has finished
                pool.scope(|scope| {
                    for (region, bounds) in &plan {
                        let summary = &summary;
                        scope.spawn(move |_| self.dispatch(region, bounds, summary));
                    }
                });
            }
        }

        let summary = summary.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        info!(
            "Project {} finished: {} regions done, {} failed, {} skipped; {} tiles downloaded, {} cached, {} unavailable",
            self.config.project,
            summary.regions_completed,
            summary.regions_failed,
            summary.regions_skipped,
            summary.tiles_downloaded,
            summary.tiles_cached,
            summary.tiles_failed
        );
        Ok(summary)
    }

    fn dispatch(&self, region: &Region, bounds: &TileGridBounds, summary: &Mutex<RunSummary>) {
        if self.cancel.is_cancelled() {
            lock(summary).regions_skipped += 1;
            return;
        }
        let outcome = self.process_region(region, bounds);
        if let Err(err) = &outcome {
            error!("Zoom {} region failed: {}", region.zoom(), err);
        }
        lock(summary).record(outcome);
    }

    /// Fetches then assembles one region. Everything the fetch left behind is
    /// on disk before assembly starts.
    fn process_region(
        &self,
        region: &Region,
        bounds: &TileGridBounds,
    ) -> Result<GridReport, AssembleError> {
        let report = self
            .fetcher
            .fetch_grid(bounds, &self.config.provider, self.progress.as_ref());

        let name = self.output_name(region);
        let (mosaic, _) = self.assembler.assemble_to_file(bounds, &name)?;
        for tile in &mosaic.corrupt {
            let path = self.fetcher.cache().tile_path(tile);
            if let Err(err) = self.run_log.append_error(&format!("corrupt tile {}", path.display())) {
                warn!("Could not record corrupt tile {}: {}", path.display(), err);
            }
        }

        if let Err(err) = self.run_log.append_success(&SuccessEntry::for_region(region)) {
            warn!("Could not write success log: {}", err);
        }
        Ok(report)
    }

    /// Base file name of a region's mosaic. Slices of one zoom are named by
    /// their cell, since neighbouring cells can cover the same tiles.
    pub fn output_name(&self, region: &Region) -> String {
        match region.slice() {
            Some((column, row)) => format!("{}_{}_{}", self.config.output, column, row),
            None => self.config.output.clone(),
        }
    }
}

fn lock(summary: &Mutex<RunSummary>) -> MutexGuard<'_, RunSummary> {
    summary.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
