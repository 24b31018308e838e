use super::{RasterDriver, RasterReader};
use crate::core::grid::RasterGrid;
use crate::types::{BandBuffer, DataType, PixelWindow, RrnError, RrnResult};
use ndarray::{s, Array2};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Raster held entirely in memory
#[derive(Debug, Clone)]
pub struct MemoryRaster {
    grid: RasterGrid,
    block_size: (usize, usize),
    data_type: DataType,
    bands: Vec<Array2<f64>>,
}

impl MemoryRaster {
    /// Build a raster from band arrays shaped (rows, columns) matching the grid
    pub fn new(grid: RasterGrid, bands: Vec<Array2<f64>>) -> RrnResult<Self> {
        let shape = (grid.height(), grid.width());
        if bands.is_empty() {
            return Err(RrnError::InvalidParameter(
                "Memory raster needs at least one band".to_string(),
            ));
        }
        if let Some(band) = bands.iter().find(|band| band.dim() != shape) {
            return Err(RrnError::InvalidParameter(format!(
                "Band shape {:?} does not match grid shape {:?}",
                band.dim(),
                shape
            )));
        }

        Ok(Self {
            block_size: (shape.1, 1),
            data_type: DataType::Float64,
            grid,
            bands,
        })
    }

    /// Build a raster whose band values are a function of (band, row, column)
    pub fn from_fn<F>(grid: RasterGrid, n_bands: usize, f: F) -> RrnResult<Self>
    where
        F: Fn(usize, usize, usize) -> f64,
    {
        let shape = (grid.height(), grid.width());
        let bands = (0..n_bands)
            .map(|band| Array2::from_shape_fn(shape, |(row, col)| f(band, row, col)))
            .collect();
        Self::new(grid, bands)
    }

    /// Override the natural block size (defaults to one full row)
    pub fn with_block_size(mut self, width: usize, height: usize) -> Self {
        self.block_size = (width.max(1), height.max(1));
        self
    }

    /// Override the reported element type
    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn grid(&self) -> &RasterGrid {
        &self.grid
    }
}

/// Driver serving rasters registered under virtual paths
#[derive(Default)]
pub struct MemoryDriver {
    rasters: RwLock<HashMap<PathBuf, Arc<MemoryRaster>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raster; replaces any raster previously stored at `path`
    pub fn insert(&self, path: impl Into<PathBuf>, raster: MemoryRaster) {
        self.rasters.write().insert(path.into(), Arc::new(raster));
    }

    /// Unregister a raster; later opens of `path` fail
    pub fn remove(&self, path: impl AsRef<Path>) -> Option<MemoryRaster> {
        self.rasters
            .write()
            .remove(path.as_ref())
            .map(|raster| Arc::try_unwrap(raster).unwrap_or_else(|shared| (*shared).clone()))
    }

    pub fn len(&self) -> usize {
        self.rasters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rasters.read().is_empty()
    }
}

impl RasterDriver for MemoryDriver {
    fn open(&self, path: &Path) -> RrnResult<Box<dyn RasterReader>> {
        let raster = self
            .rasters
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| RrnError::Open {
                path: path.to_path_buf(),
                reason: "no such raster registered".to_string(),
            })?;
        Ok(Box::new(MemoryReader { raster }))
    }
}

struct MemoryReader {
    raster: Arc<MemoryRaster>,
}

impl RasterReader for MemoryReader {
    fn grid(&self) -> &RasterGrid {
        &self.raster.grid
    }

    fn band_count(&self) -> usize {
        self.raster.bands.len()
    }

    fn block_size(&self) -> (usize, usize) {
        self.raster.block_size
    }

    fn band_type(&self, band: usize) -> RrnResult<DataType> {
        if band >= self.raster.bands.len() {
            return Err(RrnError::Read(format!("Band {} does not exist", band)));
        }
        Ok(self.raster.data_type)
    }

    fn read_window(&self, band: usize, window: &PixelWindow) -> RrnResult<BandBuffer> {
        let data = self
            .raster
            .bands
            .get(band)
            .ok_or_else(|| RrnError::Read(format!("Band {} does not exist", band)))?;

        let (rows, cols) = data.dim();
        if !window.fits_within(cols, rows) {
            return Err(RrnError::Read(format!(
                "Window {:?} outside raster of {}x{}",
                window, cols, rows
            )));
        }

        let (x, y) = (window.x_off as usize, window.y_off as usize);
        Ok(data
            .slice(s![y..y + window.height, x..x + window.width])
            .to_owned())
    }
}
