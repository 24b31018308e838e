//! Core mosaic normalization modules

pub mod grid;
pub mod block_plan;
pub mod block_stream;
pub mod graph;
pub mod tasks;
pub mod estimator;
pub mod workers;
pub mod controller;

// Re-export main types
pub use grid::{RasterGrid, GeoTransform, snap_to_grid};
pub use block_plan::{BlockPlan, TileGeometry};
pub use block_stream::{BlockStream, Tile};
pub use graph::{AdjacencyGraph, AdjacencyEdge};
pub use tasks::{SpanningTask, TaskQueue, TaskCounts};
pub use estimator::{Estimator, EstimatorFactory, BandStatistics, RegressionEstimator};
pub use workers::{WorkerPool, TaskRunner, NormalizationRunner};
pub use controller::{Controller, RunReport, TaskReport};
