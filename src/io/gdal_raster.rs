use super::{RasterDriver, RasterReader};
use crate::core::grid::RasterGrid;
use crate::types::{BandBuffer, DataType, PixelWindow, RrnError, RrnResult};
use gdal::raster::GdalDataType;
use gdal::spatial_ref::SpatialRef;
use gdal::Dataset;
use std::path::Path;

/// Driver opening rasters read-only through GDAL
#[derive(Debug, Default, Clone, Copy)]
pub struct GdalDriver;

impl GdalDriver {
    pub fn new() -> Self {
        Self
    }
}

impl RasterDriver for GdalDriver {
    fn open(&self, path: &Path) -> RrnResult<Box<dyn RasterReader>> {
        let dataset = Dataset::open(path).map_err(|e| RrnError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let geo_transform = dataset.geo_transform()?;
        let (width, height) = dataset.raster_size();
        let projection = canonical_projection(&dataset.projection());
        let grid = RasterGrid::from_geo_transform(&geo_transform, width, height, projection)?;

        let band_count = dataset.raster_count().max(0) as usize;
        let block_size = if band_count > 0 {
            dataset.rasterband(1)?.block_size()
        } else {
            (width, 1)
        };

        log::debug!(
            "GDAL dataset {}: {}x{} pixels, {} bands, block {:?}",
            path.display(),
            width,
            height,
            band_count,
            block_size
        );

        Ok(Box::new(GdalReader {
            dataset,
            grid,
            band_count,
            block_size,
        }))
    }
}

/// Reduce a dataset's WKT to `AUTHORITY:CODE` when GDAL can identify it,
/// so equivalent definitions compare equal. Falls back to GDAL's own WKT
/// rendering, then to the input.
fn canonical_projection(wkt: &str) -> String {
    let wkt = wkt.trim();
    if wkt.is_empty() {
        return String::new();
    }
    let mut srs = match SpatialRef::from_wkt(wkt) {
        Ok(srs) => srs,
        Err(e) => {
            log::debug!("Keeping projection as read, GDAL cannot parse it: {}", e);
            return wkt.to_string();
        }
    };
    // Only fills in a missing authority; failure leaves the definition as is
    let _ = srs.auto_identify_epsg();

    match (srs.auth_name(), srs.auth_code()) {
        (Ok(name), Ok(code)) => format!("{}:{}", name, code),
        _ => srs.to_wkt().unwrap_or_else(|_| wkt.to_string()),
    }
}

struct GdalReader {
    dataset: Dataset,
    grid: RasterGrid,
    band_count: usize,
    block_size: (usize, usize),
}

impl GdalReader {
    fn band(&self, band: usize) -> RrnResult<gdal::raster::RasterBand<'_>> {
        if band >= self.band_count {
            return Err(RrnError::Read(format!("Band {} does not exist", band)));
        }
        Ok(self.dataset.rasterband(band as isize + 1)?)
    }
}

impl RasterReader for GdalReader {
    fn grid(&self) -> &RasterGrid {
        &self.grid
    }

    fn band_count(&self) -> usize {
        self.band_count
    }

    fn block_size(&self) -> (usize, usize) {
        self.block_size
    }

    fn band_type(&self, band: usize) -> RrnResult<DataType> {
        let data_type = match self.band(band)?.band_type() {
            GdalDataType::UInt8 => DataType::UInt8,
            GdalDataType::UInt16 => DataType::UInt16,
            GdalDataType::Int16 => DataType::Int16,
            GdalDataType::UInt32 => DataType::UInt32,
            GdalDataType::Int32 => DataType::Int32,
            GdalDataType::Float32 => DataType::Float32,
            _ => DataType::Float64,
        };
        Ok(data_type)
    }

    fn read_window(&self, band: usize, window: &PixelWindow) -> RrnResult<BandBuffer> {
        if !window.fits_within(self.grid.width(), self.grid.height()) {
            return Err(RrnError::Read(format!(
                "Window {:?} outside raster of {}x{}",
                window,
                self.grid.width(),
                self.grid.height()
            )));
        }

        let size = (window.width, window.height);
        let data = self.band(band)?.read_as_array::<f64>(
            (window.x_off as isize, window.y_off as isize),
            size,
            size,
            None,
        )?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gdal::DriverManager;

    #[test]
    fn test_gdal_reader_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.tif");

        {
            let driver = DriverManager::get_driver_by_name("GTiff").unwrap();
            let mut dataset = driver
                .create_with_band_type::<f32, _>(&path, 6, 4, 2)
                .unwrap();
            dataset
                .set_geo_transform(&[1000.0, 30.0, 0.0, 2000.0, 0.0, -30.0])
                .unwrap();
            for band_index in 1..=2 {
                let mut band = dataset.rasterband(band_index).unwrap();
                let data: Vec<f32> = (0..24).map(|i| (i as f32) * band_index as f32).collect();
                let buffer = gdal::raster::Buffer::new((6, 4), data);
                band.write((0, 0), (6, 4), &buffer).unwrap();
            }
        }

        let reader = GdalDriver::new().open(&path).unwrap();
        assert_eq!(reader.band_count(), 2);
        assert_eq!(reader.grid().width(), 6);
        assert_eq!(reader.band_type(0).unwrap(), DataType::Float32);

        let window = PixelWindow { x_off: 2, y_off: 1, width: 3, height: 2 };
        let data = reader.read_window(1, &window).unwrap();
        assert_eq!(data.dim(), (2, 3));
        assert_eq!(data[[0, 0]], 16.0);
    }

    #[test]
    fn test_equivalent_wkt_share_canonical_projection() {
        let srs = SpatialRef::from_epsg(32637).unwrap();
        let compact = srs.to_wkt().unwrap();
        let pretty = srs.to_pretty_wkt().unwrap();
        assert_ne!(compact.trim(), pretty.trim());

        assert_eq!(canonical_projection(&compact), "EPSG:32637");
        assert_eq!(canonical_projection(&pretty), "EPSG:32637");

        // Same UTM zone without any authority in the definition
        let bare = SpatialRef::from_proj4("+proj=utm +zone=37 +datum=WGS84 +units=m +no_defs")
            .unwrap()
            .to_wkt()
            .unwrap();
        assert_eq!(canonical_projection(&bare), "EPSG:32637");

        assert_eq!(canonical_projection("  "), "");
    }

    #[test]
    fn test_opened_grids_compare_by_canonical_projection() {
        let dir = tempfile::tempdir().unwrap();
        let srs = SpatialRef::from_epsg(32637).unwrap();
        let definitions = [srs.to_wkt().unwrap(), srs.to_pretty_wkt().unwrap()];

        let mut grids = Vec::new();
        for (i, wkt) in definitions.iter().enumerate() {
            let path = dir.path().join(format!("scene_{}.tif", i));
            {
                let driver = DriverManager::get_driver_by_name("GTiff").unwrap();
                let mut dataset = driver.create_with_band_type::<f32, _>(&path, 4, 4, 1).unwrap();
                dataset
                    .set_geo_transform(&[1000.0 + 60.0 * i as f64, 30.0, 0.0, 2000.0, 0.0, -30.0])
                    .unwrap();
                dataset.set_projection(wkt).unwrap();
            }
            grids.push(GdalDriver::new().open(&path).unwrap().grid().clone());
        }

        assert!(grids[0].equal_projection(&grids[1]));
        assert!(grids[0].is_comparable(&grids[1]));
        assert_eq!(grids[0].overlap_area(&grids[1]), 8);
    }
}
