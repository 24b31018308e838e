use crate::core::block_plan::BlockPlan;
use crate::core::block_stream::BlockStream;
use crate::core::estimator::{EstimatorFactory, RegressionEstimator};
use crate::core::tasks::{SpanningTask, TaskQueue};
use crate::io::SharedDriver;
use crate::types::{PipelineParams, RrnCoefficients, RrnError, RrnResult, TaskOutcome, MAX_WORKERS};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Work done for one task by a worker thread
pub trait TaskRunner: Send + Sync {
    fn run(&self, task: &SpanningTask) -> RrnResult<RrnCoefficients>;
}

/// Streams the overlap of a task's raster pair through an estimator
pub struct NormalizationRunner {
    driver: SharedDriver,
    params: PipelineParams,
    estimators: EstimatorFactory,
}

impl NormalizationRunner {
    pub fn new(driver: SharedDriver, params: PipelineParams) -> Self {
        Self {
            driver,
            params,
            estimators: RegressionEstimator::factory(),
        }
    }

    /// Replace the default least-squares estimator
    pub fn with_estimator(mut self, estimators: EstimatorFactory) -> Self {
        self.estimators = estimators;
        self
    }
}

impl TaskRunner for NormalizationRunner {
    fn run(&self, task: &SpanningTask) -> RrnResult<RrnCoefficients> {
        let (source, target) = (task.source(), task.target());
        if !source.grid().is_comparable(target.grid()) {
            return Err(RrnError::IncomparableGrids(format!(
                "{} and {} cannot be normalized against each other",
                source, target
            )));
        }
        if !source.grid().aligned_with(target.grid()) {
            return Err(RrnError::IncomparableGrids(format!(
                "{} and {} are not aligned",
                source, target
            )));
        }

        let rasters = [source.clone(), target.clone()];
        let plan = BlockPlan::for_rasters(&rasters, self.params.tile_size)?;
        let mut stream = BlockStream::new(Arc::clone(&self.driver), &rasters, plan, &self.params)?;
        let mut estimator = (self.estimators)(stream.n_bands());

        stream.start()?;
        let mut tiles = 0usize;
        while let Some(tile) = stream.next()? {
            estimator.push(tile.raster_bands(0), tile.raster_bands(1))?;
            tiles += 1;
        }
        log::debug!("{}: {} tiles pushed to estimator", task, tiles);

        estimator.compute()
    }
}

type WorkerFn = Box<dyn FnOnce() -> RrnResult<()> + Send>;

/// Fixed-size set of worker threads draining a [`TaskQueue`]
pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    runner: Arc<dyn TaskRunner>,
    size: usize,
    handles: Vec<JoinHandle<RrnResult<()>>>,
    started: bool,
}

impl WorkerPool {
    pub fn new(queue: Arc<TaskQueue>, runner: Arc<dyn TaskRunner>, size: usize) -> RrnResult<Self> {
        check_worker_count(size)?;
        Ok(Self {
            queue,
            runner,
            size,
            handles: Vec::new(),
            started: false,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Change the number of workers. Only possible before [`WorkerPool::start`].
    pub fn resize(&mut self, size: usize) -> RrnResult<()> {
        check_worker_count(size)?;
        if self.started {
            return Err(RrnError::Protocol(
                "worker pool cannot be resized once started".to_string(),
            ));
        }
        self.size = size;
        Ok(())
    }

    /// Spawn every worker; returns immediately.
    ///
    /// If a spawn fails, the workers already running stay owned by the pool
    /// and can still be joined.
    pub fn start(&mut self) -> RrnResult<()> {
        self.start_with(|builder, work| builder.spawn(work))
    }

    fn start_with<S>(&mut self, mut spawn: S) -> RrnResult<()>
    where
        S: FnMut(thread::Builder, WorkerFn) -> io::Result<JoinHandle<RrnResult<()>>>,
    {
        if self.started {
            return Err(RrnError::Protocol("worker pool already started".to_string()));
        }
        self.started = true;

        log::info!(
            "🚀 Starting {} workers on {} tasks",
            self.size,
            self.queue.counts().total
        );

        for index in 0..self.size {
            let queue = Arc::clone(&self.queue);
            let runner = Arc::clone(&self.runner);
            let builder = thread::Builder::new().name(format!("rrn-worker-{}", index));
            match spawn(builder, Box::new(move || work(index, &queue, runner.as_ref()))) {
                Ok(handle) => self.handles.push(handle),
                Err(e) => {
                    log::error!(
                        "Could not spawn worker {} ({} of {} running): {}",
                        index,
                        self.handles.len(),
                        self.size,
                        e
                    );
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// True while any worker thread is alive
    pub fn is_running(&self) -> bool {
        self.handles.iter().any(|handle| !handle.is_finished())
    }

    /// Wait for every worker to exit. Returns the first error a worker
    /// stopped with; task failures are recorded on the tasks instead.
    pub fn join(&mut self) -> RrnResult<()> {
        let mut first_error = None;
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            let error = match handle.join() {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(_) => RrnError::Protocol(format!("{} panicked", name)),
            };
            log::error!("{} stopped: {}", name, error);
            first_error.get_or_insert(error);
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn check_worker_count(size: usize) -> RrnResult<()> {
    if size > MAX_WORKERS {
        return Err(RrnError::WorkerCount {
            requested: size,
            max: MAX_WORKERS,
        });
    }
    Ok(())
}

/// Worker loop: grab, run, record, release until the queue runs dry
fn work(index: usize, queue: &TaskQueue, runner: &dyn TaskRunner) -> RrnResult<()> {
    let mut processed = 0usize;

    while let Some(task) = queue.grab() {
        log::info!("▶️ Worker {} processing {}", index, task);

        let outcome = match catch_unwind(AssertUnwindSafe(|| runner.run(&task))) {
            Ok(Ok(coefficients)) => {
                log::info!("✅ {} normalized", task);
                TaskOutcome::Normalized(coefficients)
            }
            Ok(Err(e)) => {
                log::warn!("❌ {} failed: {}", task, e);
                TaskOutcome::Failed(e.to_string())
            }
            Err(_) => {
                log::warn!("❌ {} failed: runner panicked", task);
                TaskOutcome::Failed("runner panicked".to_string())
            }
        };

        let recorded = task.set_outcome(outcome);
        queue.release(&task)?;
        recorded?;
        processed += 1;
    }

    log::debug!("Worker {} done after {} tasks", index, processed);
    Ok(())
}
