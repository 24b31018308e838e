use crate::io::RasterHandle;
use crate::types::{RrnCoefficients, RrnError, RrnResult, TaskOutcome};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, OnceLock};

/// One spanning-tree edge to normalize: `target` is mapped onto `source`
#[derive(Debug)]
pub struct SpanningTask {
    id: usize,
    source: RasterHandle,
    target: RasterHandle,
    weight: u64,
    outcome: OnceLock<TaskOutcome>,
}

impl SpanningTask {
    pub fn new(id: usize, source: RasterHandle, target: RasterHandle, weight: u64) -> Self {
        Self {
            id,
            source,
            target,
            weight,
            outcome: OnceLock::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Reference raster of the pair
    pub fn source(&self) -> &RasterHandle {
        &self.source
    }

    /// Raster whose values get normalized
    pub fn target(&self) -> &RasterHandle {
        &self.target
    }

    /// Overlap of the pair in pixels
    pub fn weight(&self) -> u64 {
        self.weight
    }

    /// Result of the task, once a worker has processed it
    pub fn outcome(&self) -> Option<&TaskOutcome> {
        self.outcome.get()
    }

    pub fn coefficients(&self) -> Option<&RrnCoefficients> {
        match self.outcome.get() {
            Some(TaskOutcome::Normalized(coefficients)) => Some(coefficients),
            _ => None,
        }
    }

    /// Record the task result. The slot can be written once.
    pub fn set_outcome(&self, outcome: TaskOutcome) -> RrnResult<()> {
        self.outcome.set(outcome).map_err(|_| {
            RrnError::Protocol(format!("outcome of task {} already recorded", self.id))
        })
    }
}

impl std::fmt::Display for SpanningTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task {} ({} <- {})", self.id, self.source.name(), self.target.name())
    }
}

/// Sizes of the three task sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskCounts {
    pub queued: usize,
    pub in_flight: usize,
    pub done: usize,
    pub total: usize,
}

impl TaskCounts {
    /// Fraction of tasks done, in [0, 1]. An empty run counts as complete.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.done as f64 / self.total as f64
        }
    }
}

#[derive(Default)]
struct QueueState {
    tasks: Vec<Arc<SpanningTask>>,
    queued: VecDeque<Arc<SpanningTask>>,
    in_flight: HashSet<usize>,
    done: Vec<Arc<SpanningTask>>,
}

/// Hands tasks out to competing workers, each exactly once.
///
/// Every task is in exactly one of the queued, in-flight and done sets.
/// Tasks move forward only: [`TaskQueue::grab`] takes a queued task in
/// flight, [`TaskQueue::release`] retires it.
#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new(tasks: Vec<Arc<SpanningTask>>) -> Self {
        let queue = Self::default();
        queue.initialize(tasks);
        queue
    }

    /// Reset the queue: every task queued, nothing in flight or done
    pub fn initialize(&self, tasks: Vec<Arc<SpanningTask>>) {
        let mut state = self.state.lock();
        state.queued = tasks.iter().cloned().collect();
        state.in_flight.clear();
        state.done.clear();
        state.tasks = tasks;
    }

    /// Take the next queued task, or `None` when nothing is left to hand out
    pub fn grab(&self) -> Option<Arc<SpanningTask>> {
        let mut state = self.state.lock();
        let task = state.queued.pop_front()?;
        state.in_flight.insert(task.id());
        Some(task)
    }

    /// Retire a task previously returned by [`TaskQueue::grab`]
    pub fn release(&self, task: &Arc<SpanningTask>) -> RrnResult<()> {
        let mut state = self.state.lock();
        let known = state
            .tasks
            .iter()
            .any(|candidate| Arc::ptr_eq(candidate, task));
        if !known || !state.in_flight.remove(&task.id()) {
            return Err(RrnError::UnknownTask(task.id()));
        }
        state.done.push(Arc::clone(task));
        Ok(())
    }

    pub fn counts(&self) -> TaskCounts {
        let state = self.state.lock();
        TaskCounts {
            queued: state.queued.len(),
            in_flight: state.in_flight.len(),
            done: state.done.len(),
            total: state.tasks.len(),
        }
    }

    pub fn progress(&self) -> f64 {
        self.counts().progress()
    }

    /// All tasks, in creation order
    pub fn tasks(&self) -> Vec<Arc<SpanningTask>> {
        self.state.lock().tasks.clone()
    }
}
