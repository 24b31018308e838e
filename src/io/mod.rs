//! Raster access: driver/reader traits, dataset handles and backends

pub mod memory;
#[cfg(feature = "gdal")]
pub mod gdal_raster;

pub use memory::{MemoryDriver, MemoryRaster};
#[cfg(feature = "gdal")]
pub use gdal_raster::GdalDriver;

use crate::core::grid::RasterGrid;
use crate::types::{BandBuffer, DataType, PixelWindow, RrnError, RrnResult};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Backend able to open raster datasets by path.
///
/// Drivers are shared between threads; each thread opens its own readers.
pub trait RasterDriver: Send + Sync {
    fn open(&self, path: &Path) -> RrnResult<Box<dyn RasterReader>>;
}

/// An open raster dataset. Closed when dropped.
pub trait RasterReader {
    fn grid(&self) -> &RasterGrid;

    fn band_count(&self) -> usize;

    /// Natural storage block size (width, height)
    fn block_size(&self) -> (usize, usize);

    /// Element type of a band (0-based)
    fn band_type(&self, band: usize) -> RrnResult<DataType>;

    /// Read one band (0-based) inside `window`, decoded to f64
    fn read_window(&self, band: usize, window: &PixelWindow) -> RrnResult<BandBuffer>;
}

/// Metadata snapshot of a raster dataset, identified by its path.
///
/// Opening a handle reads the grid and band layout and closes the dataset
/// again; whoever needs pixels reopens it through the driver.
#[derive(Debug, Clone)]
pub struct RasterHandle {
    path: PathBuf,
    grid: RasterGrid,
    size: (usize, usize),
    block_size: (usize, usize),
    band_types: Vec<DataType>,
}

impl RasterHandle {
    /// Open `path` through `driver` and capture its metadata
    pub fn open(driver: &dyn RasterDriver, path: impl AsRef<Path>) -> RrnResult<Self> {
        let path = path.as_ref();
        log::debug!("Opening raster {}", path.display());

        let reader = driver.open(path)?;
        let grid = reader.grid().clone();
        let band_types = (0..reader.band_count())
            .map(|band| reader.band_type(band))
            .collect::<RrnResult<Vec<_>>>()?;

        if band_types.is_empty() {
            return Err(RrnError::Open {
                path: path.to_path_buf(),
                reason: "raster has no bands".to_string(),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            size: (grid.width(), grid.height()),
            grid,
            block_size: reader.block_size(),
            band_types,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn grid(&self) -> &RasterGrid {
        &self.grid
    }

    /// Pixel dimensions (width, height)
    pub fn size(&self) -> (usize, usize) {
        self.size
    }

    pub fn block_size(&self) -> (usize, usize) {
        self.block_size
    }

    pub fn band_count(&self) -> usize {
        self.band_types.len()
    }

    pub fn band_types(&self) -> &[DataType] {
        &self.band_types
    }

    /// Overlap with another raster in pixels, the adjacency weight
    pub fn overlap_area(&self, other: &RasterHandle) -> u64 {
        self.grid.overlap_area(&other.grid)
    }

    /// Short display name: the file name, or the full path if it has none
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

impl PartialEq for RasterHandle {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for RasterHandle {}

impl Hash for RasterHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

impl std::fmt::Display for RasterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Shared driver reference handed to worker and producer threads
pub type SharedDriver = Arc<dyn RasterDriver>;
