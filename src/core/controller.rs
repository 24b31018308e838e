use crate::core::estimator::EstimatorFactory;
use crate::core::graph::AdjacencyGraph;
use crate::core::tasks::{SpanningTask, TaskQueue};
use crate::core::workers::{NormalizationRunner, WorkerPool};
use crate::io::{RasterHandle, SharedDriver};
use crate::types::{PipelineParams, RrnError, RrnResult, TaskOutcome, MAX_WORKERS};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Final or current state of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: usize,
    pub source: PathBuf,
    pub target: PathBuf,
    pub weight: u64,
    /// `None` while the task has not been processed
    pub outcome: Option<TaskOutcome>,
}

/// Summary of a normalization run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub generated_at: DateTime<Utc>,
    pub rasters: usize,
    pub progress: f64,
    pub succeeded: usize,
    pub failed: usize,
    pub pending: usize,
    pub tasks: Vec<TaskReport>,
}

/// Entry point tying the mosaic graph, task queue and worker pool together.
///
/// Task lists are derived from the graph and rebuilt whenever a raster was
/// added since they were last computed.
pub struct Controller {
    driver: SharedDriver,
    params: PipelineParams,
    estimators: Option<EstimatorFactory>,
    graph: AdjacencyGraph,
    tasks: Option<(u64, Vec<Arc<SpanningTask>>)>,
    queue: Option<Arc<TaskQueue>>,
    pool: Option<WorkerPool>,
}

impl Controller {
    pub fn new(driver: SharedDriver, params: PipelineParams) -> RrnResult<Self> {
        params.validate()?;
        Ok(Self {
            driver,
            params,
            estimators: None,
            graph: AdjacencyGraph::new(),
            tasks: None,
            queue: None,
            pool: None,
        })
    }

    /// Use a custom estimator instead of the least-squares default
    pub fn with_estimator(mut self, estimators: EstimatorFactory) -> Self {
        self.estimators = Some(estimators);
        self
    }

    pub fn params(&self) -> &PipelineParams {
        &self.params
    }

    pub fn graph(&self) -> &AdjacencyGraph {
        &self.graph
    }

    /// Open a raster and add it to the mosaic. Returns false for a path
    /// already in the mosaic.
    pub fn add_raster(&mut self, path: impl AsRef<Path>) -> RrnResult<bool> {
        if self.is_running() {
            return Err(RrnError::Protocol(
                "cannot add rasters while a run is in progress".to_string(),
            ));
        }
        let raster = RasterHandle::open(&*self.driver, path)?;
        log::info!(
            "📂 Added {} ({}x{}, {} bands)",
            raster,
            raster.size().0,
            raster.size().1,
            raster.band_count()
        );
        Ok(self.graph.add(raster))
    }

    /// Number of workers used by the next [`Controller::execute`]
    pub fn set_worker_count(&mut self, workers: usize) -> RrnResult<()> {
        if workers > MAX_WORKERS {
            return Err(RrnError::WorkerCount {
                requested: workers,
                max: MAX_WORKERS,
            });
        }
        if self.is_running() {
            return Err(RrnError::Protocol(
                "worker count cannot change while a run is in progress".to_string(),
            ));
        }
        self.params.workers = workers;
        Ok(())
    }

    /// Tasks of the current mosaic; rebuilt if rasters were added since
    /// the last call
    pub fn tasks(&mut self) -> Vec<Arc<SpanningTask>> {
        let version = self.graph.version();
        match &self.tasks {
            Some((built, tasks)) if *built == version => tasks.clone(),
            _ => {
                let tasks = self.graph.tasks();
                self.tasks = Some((version, tasks.clone()));
                tasks
            }
        }
    }

    /// Start normalizing every task of the mosaic; returns immediately
    pub fn execute(&mut self) -> RrnResult<()> {
        if self.is_running() {
            return Err(RrnError::Protocol("a run is already in progress".to_string()));
        }

        // Tasks carry their result, so each run gets fresh ones
        let tasks = self.graph.tasks();
        self.tasks = Some((self.graph.version(), tasks.clone()));

        log::info!(
            "🗺️ Normalizing mosaic of {} rasters through {} tasks",
            self.graph.vertex_count(),
            tasks.len()
        );

        let queue = Arc::new(TaskQueue::new(tasks));
        let mut runner = NormalizationRunner::new(Arc::clone(&self.driver), self.params.clone());
        if let Some(estimators) = &self.estimators {
            runner = runner.with_estimator(Arc::clone(estimators));
        }

        let pool = WorkerPool::new(Arc::clone(&queue), Arc::new(runner), self.params.workers)?;

        // Kept even if start fails part way, so spawned workers stay joinable
        self.queue = Some(queue);
        self.pool.insert(pool).start()
    }

    pub fn is_running(&self) -> bool {
        self.pool.as_ref().is_some_and(|pool| pool.is_running())
    }

    /// Fraction of tasks done in the current run; 0 before the first run
    pub fn progress(&self) -> f64 {
        self.queue.as_ref().map_or(0.0, |queue| queue.progress())
    }

    /// Wait for the current run to finish
    pub fn join(&mut self) -> RrnResult<()> {
        match self.pool.as_mut() {
            Some(pool) => pool.join(),
            None => Ok(()),
        }
    }

    /// Execute and wait
    pub fn run(&mut self) -> RrnResult<RunReport> {
        self.execute()?;
        self.join()?;
        let report = self.report();
        log::info!(
            "🏁 Run finished: {} succeeded, {} failed",
            report.succeeded,
            report.failed
        );
        Ok(report)
    }

    /// Write the spanning tree of the mosaic as a DOT graph
    pub fn export_graph(&self, path: impl AsRef<Path>) -> RrnResult<()> {
        self.graph.export_dot(path)
    }

    pub fn report(&mut self) -> RunReport {
        let tasks: Vec<TaskReport> = self
            .tasks()
            .iter()
            .map(|task| TaskReport {
                id: task.id(),
                source: task.source().path().to_path_buf(),
                target: task.target().path().to_path_buf(),
                weight: task.weight(),
                outcome: task.outcome().cloned(),
            })
            .collect();

        let succeeded = tasks
            .iter()
            .filter(|t| matches!(t.outcome, Some(TaskOutcome::Normalized(_))))
            .count();
        let failed = tasks
            .iter()
            .filter(|t| matches!(t.outcome, Some(TaskOutcome::Failed(_))))
            .count();

        RunReport {
            generated_at: Utc::now(),
            rasters: self.graph.vertex_count(),
            progress: self.progress(),
            succeeded,
            failed,
            pending: tasks.len() - succeeded - failed,
            tasks,
        }
    }

    /// Write [`Controller::report`] as pretty-printed JSON
    pub fn export_report(&mut self, path: impl AsRef<Path>) -> RrnResult<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.report())?;
        std::fs::write(path, json)?;
        log::info!("📝 Run report written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::grid::RasterGrid;
    use crate::io::{MemoryDriver, MemoryRaster};

    fn driver() -> Arc<MemoryDriver> {
        let driver = Arc::new(MemoryDriver::new());
        for (i, x) in [0.0, 6.0, 12.0].iter().enumerate() {
            let grid = RasterGrid::new(*x, x + 10.0, 0.0, 8.0, 1.0, 1.0, "LOCAL").unwrap();
            let raster = MemoryRaster::from_fn(grid, 1, move |_, r, c| (r * 3 + c + i) as f64).unwrap();
            driver.insert(format!("tile_{}.tif", i), raster);
        }
        driver
    }

    #[test]
    fn test_tasks_rebuilt_after_add() {
        let mut controller = Controller::new(driver(), PipelineParams::default()).unwrap();
        controller.add_raster("tile_0.tif").unwrap();
        controller.add_raster("tile_1.tif").unwrap();
        assert_eq!(controller.tasks().len(), 1);

        controller.add_raster("tile_2.tif").unwrap();
        assert_eq!(controller.tasks().len(), 2);
        assert!(!controller.add_raster("tile_2.tif").unwrap());
    }

    #[test]
    fn test_unknown_raster_fails_to_add() {
        let mut controller = Controller::new(driver(), PipelineParams::default()).unwrap();
        assert!(matches!(
            controller.add_raster("missing.tif"),
            Err(RrnError::Open { .. })
        ));
    }

    #[test]
    fn test_worker_count_bounds() {
        let mut controller = Controller::new(driver(), PipelineParams::default()).unwrap();
        assert!(controller.set_worker_count(MAX_WORKERS + 1).is_err());
        assert_eq!(controller.params().workers, 10);
        controller.set_worker_count(3).unwrap();
        assert_eq!(controller.params().workers, 3);
    }

    #[test]
    fn test_empty_mosaic_runs_to_completion() {
        let mut controller = Controller::new(driver(), PipelineParams::default()).unwrap();
        assert_eq!(controller.progress(), 0.0);
        let report = controller.run().unwrap();
        assert!(report.tasks.is_empty());
        assert_eq!(report.progress, 1.0);
    }

    #[test]
    fn test_run_reports_every_task() {
        let mut controller = Controller::new(driver(), PipelineParams::default().with_workers(2)).unwrap();
        for i in 0..3 {
            controller.add_raster(format!("tile_{}.tif", i)).unwrap();
        }
        let report = controller.run().unwrap();
        assert_eq!(report.tasks.len(), 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.pending, 0);
        assert_eq!(controller.progress(), 1.0);
        assert!(!controller.is_running());
    }
}
