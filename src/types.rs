use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Decoded samples of one band inside one tile (rows x columns)
pub type BandBuffer = Array2<f64>;

/// Hard ceiling on the number of worker threads a pool may run
pub const MAX_WORKERS: usize = 1000;

/// Element type of a raster band as stored on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    UInt8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    Float32,
    Float64,
}

impl DataType {
    /// Size of one sample in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::UInt8 => 1,
            DataType::UInt16 | DataType::Int16 => 2,
            DataType::UInt32 | DataType::Int32 | DataType::Float32 => 4,
            DataType::Float64 => 8,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::UInt8 => write!(f, "Byte"),
            DataType::UInt16 => write!(f, "UInt16"),
            DataType::Int16 => write!(f, "Int16"),
            DataType::UInt32 => write!(f, "UInt32"),
            DataType::Int32 => write!(f, "Int32"),
            DataType::Float32 => write!(f, "Float32"),
            DataType::Float64 => write!(f, "Float64"),
        }
    }
}

/// Rectangular pixel window in the coordinates of one raster grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelWindow {
    pub x_off: i64,
    pub y_off: i64,
    pub width: usize,
    pub height: usize,
}

impl PixelWindow {
    /// Build a window from two corners, swapping coordinates so min <= max
    pub fn from_corners(a: (i64, i64), b: (i64, i64)) -> Self {
        let (x_min, x_max) = if a.0 <= b.0 { (a.0, b.0) } else { (b.0, a.0) };
        let (y_min, y_max) = if a.1 <= b.1 { (a.1, b.1) } else { (b.1, a.1) };
        Self {
            x_off: x_min,
            y_off: y_min,
            width: (x_max - x_min) as usize,
            height: (y_max - y_min) as usize,
        }
    }

    pub fn x_end(&self) -> i64 {
        self.x_off + self.width as i64
    }

    pub fn y_end(&self) -> i64 {
        self.y_off + self.height as i64
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// True if the window lies entirely inside a `width` x `height` raster
    pub fn fits_within(&self, width: usize, height: usize) -> bool {
        self.x_off >= 0
            && self.y_off >= 0
            && self.x_end() <= width as i64
            && self.y_end() <= height as i64
    }
}

/// Axis-aligned box in world (map) coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldBox {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl WorldBox {
    /// Build a box from two corners, swapping coordinates so min <= max
    pub fn from_corners(a: (f64, f64), b: (f64, f64)) -> Self {
        Self {
            x_min: a.0.min(b.0),
            y_min: a.1.min(b.1),
            x_max: a.0.max(b.0),
            y_max: a.1.max(b.1),
        }
    }
}

/// Linear normalization derived for one raster pair.
///
/// For every band `b`, target samples are mapped onto the source scale as
/// `gains[b] * value + offsets[b]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RrnCoefficients {
    pub gains: Vec<f64>,
    pub offsets: Vec<f64>,
    /// Number of valid sample pairs the fit was computed from, per band
    pub samples: Vec<u64>,
}

impl RrnCoefficients {
    pub fn n_bands(&self) -> usize {
        self.gains.len()
    }

    /// Apply the band transform to a single target value
    pub fn apply(&self, band: usize, value: f64) -> f64 {
        self.gains[band] * value + self.offsets[band]
    }
}

/// Final state of a normalization task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Normalized(RrnCoefficients),
    Failed(String),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Normalized(_))
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineParams {
    /// Number of worker threads processing raster pairs
    pub workers: usize,
    /// Number of producer threads reading tiles for one pair
    pub reader_threads: usize,
    /// Capacity of the bounded tile queue between readers and estimator
    pub buffer_size: usize,
    /// Explicit tile size (width, height); natural block size of the source when unset
    pub tile_size: Option<(usize, usize)>,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            workers: 10,
            reader_threads: 2,
            buffer_size: 20,
            tile_size: None,
        }
    }
}

impl PipelineParams {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_reader_threads(mut self, threads: usize) -> Self {
        self.reader_threads = threads;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_tile_size(mut self, width: usize, height: usize) -> Self {
        self.tile_size = Some((width, height));
        self
    }

    /// Check that every parameter is within its supported range
    pub fn validate(&self) -> RrnResult<()> {
        if self.workers > MAX_WORKERS {
            return Err(RrnError::WorkerCount {
                requested: self.workers,
                max: MAX_WORKERS,
            });
        }
        if self.reader_threads == 0 {
            return Err(RrnError::InvalidParameter(
                "At least one reader thread is required".to_string(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(RrnError::InvalidParameter(
                "Tile buffer size must be positive".to_string(),
            ));
        }
        if let Some((w, h)) = self.tile_size {
            if w == 0 || h == 0 {
                return Err(RrnError::InvalidParameter(format!(
                    "Tile size must be positive, got {}x{}",
                    w, h
                )));
            }
        }
        Ok(())
    }
}

/// Error types for mosaic normalization
#[derive(Debug, thiserror::Error)]
pub enum RrnError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("Could not open {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("Read error: {0}")]
    Read(String),

    #[error("Grids are not comparable: {0}")]
    IncomparableGrids(String),

    #[error("Rasters do not intersect")]
    EmptyIntersection,

    #[error("Invalid grid: {0}")]
    InvalidGrid(String),

    #[error("Unknown task {0}: not in flight")]
    UnknownTask(usize),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Worker count {requested} outside allowed range 0..={max}")]
    WorkerCount { requested: usize, max: usize },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Estimator error: {0}")]
    Estimator(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for normalization operations
pub type RrnResult<T> = Result<T, RrnError>;
