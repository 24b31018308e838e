use crate::types::{RrnError, RrnResult};
use serde::{Deserialize, Serialize};

/// GDAL-style affine geotransform
/// `[x_origin, pixel_width, row_rotation, y_origin, column_rotation, pixel_height]`
pub type GeoTransform = [f64; 6];

/// Convert map coordinates to fractional pixel coordinates
pub fn wld2pix(transform: &GeoTransform, geo_x: f64, geo_y: f64) -> (f64, f64) {
    let t = transform;
    let det = t[2] * t[4] - t[1] * t[5];
    let x = (t[0] * t[5] - t[2] * t[3] + t[2] * geo_y - t[5] * geo_x) / det;
    let y = (t[1] * t[3] - t[0] * t[4] - t[1] * geo_y + t[4] * geo_x) / det;
    (x, y)
}

/// Convert fractional pixel coordinates to map coordinates
pub fn pix2wld(transform: &GeoTransform, x: f64, y: f64) -> (f64, f64) {
    let t = transform;
    (t[0] + t[1] * x + t[2] * y, t[3] + t[4] * x + t[5] * y)
}

/// Definition of a north-up pixel grid: extent, resolution and projection.
///
/// Bounds are the external corners of the image, i.e. from the top-left
/// corner of the top-left pixel to the bottom-right corner of the
/// bottom-right pixel, following GDAL conventions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterGrid {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
    pub x_res: f64,
    pub y_res: f64,
    /// Projection definition (WKT or authority code)
    pub projection: String,
}

impl RasterGrid {
    /// Create a grid from explicit bounds and resolution
    pub fn new(
        x_min: f64,
        x_max: f64,
        y_min: f64,
        y_max: f64,
        x_res: f64,
        y_res: f64,
        projection: impl Into<String>,
    ) -> RrnResult<Self> {
        if !(x_res > 0.0 && y_res > 0.0) {
            return Err(RrnError::InvalidGrid(format!(
                "Resolution must be positive, got ({}, {})",
                x_res, y_res
            )));
        }
        if !(x_max > x_min && y_max > y_min) {
            return Err(RrnError::InvalidGrid(format!(
                "Empty extent x=[{}, {}] y=[{}, {}]",
                x_min, x_max, y_min, y_max
            )));
        }

        Ok(Self {
            x_min,
            x_max,
            y_min,
            y_max,
            x_res,
            y_res,
            projection: projection.into(),
        })
    }

    /// Create a grid from a geotransform and raster dimensions
    pub fn from_geo_transform(
        transform: &GeoTransform,
        columns: usize,
        rows: usize,
        projection: impl Into<String>,
    ) -> RrnResult<Self> {
        if transform[2] != 0.0 || transform[4] != 0.0 {
            return Err(RrnError::InvalidGrid(
                "Rotated geotransforms are not supported".to_string(),
            ));
        }

        let x_res = transform[1];
        let y_res = transform[5].abs();
        let x_min = transform[0];
        let y_max = transform[3];

        Self::new(
            x_min,
            x_min + columns as f64 * x_res,
            y_max - rows as f64 * y_res,
            y_max,
            x_res,
            y_res,
            projection,
        )
    }

    /// North-up geotransform anchored on the top-left corner
    pub fn geo_transform(&self) -> GeoTransform {
        [self.x_min, self.x_res, 0.0, self.y_max, 0.0, -self.y_res]
    }

    /// Number of columns
    pub fn width(&self) -> usize {
        num_pix(self.x_max, self.x_min, self.x_res)
    }

    /// Number of rows
    pub fn height(&self) -> usize {
        num_pix(self.y_max, self.y_min, self.y_res)
    }

    /// Area of the grid in pixels
    pub fn pixel_area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn wld2pix(&self, x: f64, y: f64) -> (f64, f64) {
        wld2pix(&self.geo_transform(), x, y)
    }

    pub fn pix2wld(&self, x: f64, y: f64) -> (f64, f64) {
        pix2wld(&self.geo_transform(), x, y)
    }

    /// Exact pixel size equality
    pub fn equal_pix_size(&self, other: &RasterGrid) -> bool {
        self.x_res == other.x_res && self.y_res == other.y_res
    }

    /// Projection equality; surrounding whitespace is ignored.
    ///
    /// Drivers store projections in canonical form (`AUTHORITY:CODE` where
    /// known), so equivalent definitions compare equal here.
    pub fn equal_projection(&self, other: &RasterGrid) -> bool {
        self.projection.trim() == other.projection.trim()
    }

    /// Grids are comparable when they share pixel size and projection
    pub fn is_comparable(&self, other: &RasterGrid) -> bool {
        self.equal_pix_size(other) && self.equal_projection(other)
    }

    /// True if both grids describe the same lattice with different extents.
    ///
    /// The tolerance is `0.001 * pixel_size / npix`, where `npix` is the
    /// largest dimension of either grid, so that accumulated error across
    /// the whole grid stays well under a pixel.
    pub fn aligned_with(&self, other: &RasterGrid) -> bool {
        if !self.is_comparable(other) {
            return false;
        }

        let npix = self
            .width()
            .max(self.height())
            .max(other.width())
            .max(other.height())
            .max(1);
        let tolerance = 0.001 * self.x_res.min(self.y_res) / npix as f64;

        let x_snapped = snap_to_grid(self.x_min, other.x_min, self.x_res);
        if (x_snapped - self.x_min).abs() > tolerance {
            return false;
        }
        let y_snapped = snap_to_grid(self.y_max, other.y_max, self.y_res);
        (y_snapped - self.y_max).abs() <= tolerance
    }

    /// Intersection with another grid.
    ///
    /// Returns `None` when the grids are not comparable or do not overlap
    /// by at least one whole pixel on each axis.
    pub fn intersection(&self, other: &RasterGrid) -> Option<RasterGrid> {
        if !self.is_comparable(other) {
            return None;
        }

        let x_min = self.x_min.max(other.x_min);
        let x_max = self.x_max.min(other.x_max);
        let y_min = self.y_min.max(other.y_min);
        let y_max = self.y_max.min(other.y_max);

        if x_min >= x_max || y_min >= y_max {
            return None;
        }

        let grid = RasterGrid {
            x_min,
            x_max,
            y_min,
            y_max,
            x_res: self.x_res,
            y_res: self.y_res,
            projection: self.projection.clone(),
        };
        if grid.width() == 0 || grid.height() == 0 {
            return None;
        }
        Some(grid)
    }

    /// Overlap with another grid in pixels; 0 when the grids are not
    /// aligned on a common lattice or do not intersect
    pub fn overlap_area(&self, other: &RasterGrid) -> u64 {
        if !self.aligned_with(other) {
            return 0;
        }
        self.intersection(other)
            .map(|grid| grid.pixel_area())
            .unwrap_or(0)
    }
}

/// Number of pixels between `max` and `min` at `res`, rounded half away from zero
fn num_pix(max: f64, min: f64, res: f64) -> usize {
    ((max - min) / res).round().max(0.0) as usize
}

/// Nearest value to `val` that lies a whole number of `res` steps from `on_grid`
pub fn snap_to_grid(val: f64, on_grid: f64, res: f64) -> f64 {
    let whole_pixels = ((val - on_grid) / res).round();
    on_grid + whole_pixels * res
}
