//! mosaic-rrn: Concurrent Relative Radiometric Normalization for Raster Mosaics
//!
//! This library decides which overlapping rasters of a mosaic must be
//! normalized against each other (minimum spanning tree of the overlap
//! graph), then streams the pixels of every selected pair through a
//! normalization estimator using a pool of worker threads, each driving
//! its own multi-threaded tile reader.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    RrnError, RrnResult, DataType, PixelWindow, WorldBox, RrnCoefficients,
    TaskOutcome, PipelineParams, MAX_WORKERS
};

pub use io::{RasterDriver, RasterReader, RasterHandle, SharedDriver, MemoryDriver, MemoryRaster};
#[cfg(feature = "gdal")]
pub use io::GdalDriver;

pub use crate::core::{
    RasterGrid, BlockPlan, BlockStream, Tile, AdjacencyGraph, SpanningTask, TaskQueue,
    Estimator, RegressionEstimator, WorkerPool, Controller, RunReport
};
