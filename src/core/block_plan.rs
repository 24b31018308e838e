use crate::core::grid::RasterGrid;
use crate::io::RasterHandle;
use crate::types::{PixelWindow, RrnError, RrnResult, WorldBox};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Geometry of one tile: its place in the tiling and the matching pixel
/// window inside every participating raster
#[derive(Debug, Clone, PartialEq)]
pub struct TileGeometry {
    pub id: usize,
    pub column: usize,
    pub row: usize,
    /// Window in read-grid pixels, clamped to the read grid
    pub read_window: PixelWindow,
    /// World-space footprint of the tile
    pub world: WorldBox,
    /// Window in each raster's own pixel grid, in raster order
    pub windows: Vec<PixelWindow>,
}

/// Tiling of the common area of several rasters.
///
/// Tiles are laid on the read grid with boundaries at
/// `offset + k * tile_size`, so every pixel of the read grid belongs to
/// exactly one tile. Tile ids are handed out once each through
/// [`BlockPlan::next_tile_id`], which may be called from any number of
/// threads.
#[derive(Debug)]
pub struct BlockPlan {
    grids: Vec<RasterGrid>,
    read_grid: RasterGrid,
    tile_width: usize,
    tile_height: usize,
    x_offset: i64,
    y_offset: i64,
    n_columns: usize,
    n_rows: usize,
    cursor: AtomicUsize,
}

impl BlockPlan {
    /// Create a plan over `read_grid` for rasters laid on `grids`.
    ///
    /// `offset` is the position of a tile boundary in read-grid pixels;
    /// any value is accepted and normalized into `(-tile_size, 0]`.
    pub fn new(
        grids: Vec<RasterGrid>,
        read_grid: RasterGrid,
        offset: (i64, i64),
        tile_size: (usize, usize),
    ) -> RrnResult<Self> {
        if grids.is_empty() {
            return Err(RrnError::InvalidParameter(
                "Block plan needs at least one raster".to_string(),
            ));
        }
        let (tile_width, tile_height) = tile_size;
        if tile_width == 0 || tile_height == 0 {
            return Err(RrnError::InvalidParameter(format!(
                "Tile size must be positive, got {}x{}",
                tile_width, tile_height
            )));
        }

        let x_offset = normalize_offset(offset.0, tile_width);
        let y_offset = normalize_offset(offset.1, tile_height);
        let n_columns = blocks_along(read_grid.width(), x_offset, tile_width);
        let n_rows = blocks_along(read_grid.height(), y_offset, tile_height);

        log::debug!(
            "Block plan: {}x{} read grid, {}x{} tiles of {}x{} at offset ({}, {})",
            read_grid.width(),
            read_grid.height(),
            n_columns,
            n_rows,
            tile_width,
            tile_height,
            x_offset,
            y_offset
        );

        Ok(Self {
            grids,
            read_grid,
            tile_width,
            tile_height,
            x_offset,
            y_offset,
            n_columns,
            n_rows,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Plan over the intersection of `grids`, with tile boundaries aligned
    /// on the block lattice of the first grid
    pub fn from_grids(grids: Vec<RasterGrid>, tile_size: (usize, usize)) -> RrnResult<Self> {
        let read_grid = Self::intersection(&grids)?;

        let (origin_x, origin_y) = grids[0].pix2wld(0.0, 0.0);
        let (off_x, off_y) = read_grid.wld2pix(origin_x, origin_y);
        let offset = (off_x.round() as i64, off_y.round() as i64);

        Self::new(grids, read_grid, offset, tile_size)
    }

    /// Plan over the intersection of opened rasters. Without an explicit
    /// tile size, the natural block size of the first raster is used.
    pub fn for_rasters(rasters: &[RasterHandle], tile_size: Option<(usize, usize)>) -> RrnResult<Self> {
        let first = rasters.first().ok_or_else(|| {
            RrnError::InvalidParameter("Block plan needs at least one raster".to_string())
        })?;
        let tile_size = tile_size.unwrap_or_else(|| first.block_size());
        let grids = rasters.iter().map(|raster| raster.grid().clone()).collect();
        Self::from_grids(grids, tile_size)
    }

    /// Area covered by every grid
    pub fn intersection(grids: &[RasterGrid]) -> RrnResult<RasterGrid> {
        let (first, rest) = grids.split_first().ok_or_else(|| {
            RrnError::InvalidParameter("Cannot intersect an empty set of grids".to_string())
        })?;

        let mut result = first.clone();
        for grid in rest {
            if !result.is_comparable(grid) {
                return Err(RrnError::IncomparableGrids(format!(
                    "resolution ({}, {}) / ({}, {}), projections '{}' / '{}'",
                    result.x_res, result.y_res, grid.x_res, grid.y_res, result.projection, grid.projection
                )));
            }
            result = result.intersection(grid).ok_or(RrnError::EmptyIntersection)?;
        }
        Ok(result)
    }

    /// Hand out the next unvisited tile id, or `None` once every tile was taken
    pub fn next_tile_id(&self) -> Option<usize> {
        let n_tiles = self.n_tiles();
        self.cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < n_tiles).then_some(current + 1)
            })
            .ok()
    }

    pub fn n_columns(&self) -> usize {
        self.n_columns
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_tiles(&self) -> usize {
        self.n_columns * self.n_rows
    }

    pub fn n_rasters(&self) -> usize {
        self.grids.len()
    }

    pub fn tile_size(&self) -> (usize, usize) {
        (self.tile_width, self.tile_height)
    }

    /// Normalized tile offset, each component in `(-tile_size, 0]`
    pub fn offset(&self) -> (i64, i64) {
        (self.x_offset, self.y_offset)
    }

    pub fn read_grid(&self) -> &RasterGrid {
        &self.read_grid
    }

    pub fn grids(&self) -> &[RasterGrid] {
        &self.grids
    }

    pub fn tile_id(&self, column: usize, row: usize) -> usize {
        row * self.n_columns + column
    }

    /// (column, row) of a tile id
    pub fn tile_position(&self, id: usize) -> (usize, usize) {
        (id % self.n_columns, id / self.n_columns)
    }

    /// Pixel bounds of a tile in the read grid; border tiles are clamped
    pub fn tile_pixel_bounds(&self, id: usize) -> RrnResult<PixelWindow> {
        self.check_id(id)?;
        let (column, row) = self.tile_position(id);

        let x_beg = column as i64 * self.tile_width as i64 + self.x_offset;
        let y_beg = row as i64 * self.tile_height as i64 + self.y_offset;
        let x_end = (x_beg + self.tile_width as i64).min(self.read_grid.width() as i64);
        let y_end = (y_beg + self.tile_height as i64).min(self.read_grid.height() as i64);

        Ok(PixelWindow::from_corners((x_beg.max(0), y_beg.max(0)), (x_end, y_end)))
    }

    /// World-space footprint of a tile
    pub fn tile_world_box(&self, id: usize) -> RrnResult<WorldBox> {
        let bounds = self.tile_pixel_bounds(id)?;
        let corner_a = self.read_grid.pix2wld(bounds.x_off as f64, bounds.y_off as f64);
        let corner_b = self.read_grid.pix2wld(bounds.x_end() as f64, bounds.y_end() as f64);
        Ok(WorldBox::from_corners(corner_a, corner_b))
    }

    /// Window of a tile in the pixel space of an arbitrary grid
    pub fn pixel_window(&self, grid: &RasterGrid, id: usize) -> RrnResult<PixelWindow> {
        let world = self.tile_world_box(id)?;
        Ok(world_to_window(grid, &world))
    }

    /// Window of a tile in the pixel space of the `raster`-th participating grid
    pub fn raster_window(&self, raster: usize, id: usize) -> RrnResult<PixelWindow> {
        let grid = self.grids.get(raster).ok_or_else(|| {
            RrnError::InvalidParameter(format!(
                "Raster index {} out of range ({} rasters)",
                raster,
                self.grids.len()
            ))
        })?;
        self.pixel_window(grid, id)
    }

    /// Full geometry of a tile
    pub fn tile(&self, id: usize) -> RrnResult<TileGeometry> {
        let (column, row) = self.tile_position(id);
        let read_window = self.tile_pixel_bounds(id)?;
        let world = self.tile_world_box(id)?;
        let windows = self.grids.iter().map(|grid| world_to_window(grid, &world)).collect();

        Ok(TileGeometry {
            id,
            column,
            row,
            read_window,
            world,
            windows,
        })
    }

    /// Number of natural blocks of size `bw` x `bh` intersecting the pixel
    /// area at (`xoff`, `yoff`) of size `xsize` x `ysize`
    pub fn count_blocks(bw: usize, bh: usize, xoff: i64, yoff: i64, xsize: usize, ysize: usize) -> usize {
        let span = |off: i64, size: usize, block: usize| -> usize {
            let block = block as i64;
            let begin = off.div_euclid(block);
            let end = off + size as i64;
            let end_block = end.div_euclid(block) + i64::from(end.rem_euclid(block) != 0);
            (end_block - begin).max(0) as usize
        };
        span(xoff, xsize, bw) * span(yoff, ysize, bh)
    }

    fn check_id(&self, id: usize) -> RrnResult<()> {
        if id >= self.n_tiles() {
            return Err(RrnError::InvalidParameter(format!(
                "Tile id {} out of range ({} tiles)",
                id,
                self.n_tiles()
            )));
        }
        Ok(())
    }
}

fn world_to_window(grid: &RasterGrid, world: &WorldBox) -> PixelWindow {
    let (ax, ay) = grid.wld2pix(world.x_min, world.y_max);
    let (bx, by) = grid.wld2pix(world.x_max, world.y_min);
    PixelWindow::from_corners(
        (ax.round() as i64, ay.round() as i64),
        (bx.round() as i64, by.round() as i64),
    )
}

/// Bring an offset into `(-size, 0]`
fn normalize_offset(offset: i64, size: usize) -> i64 {
    let size = size as i64;
    let rem = offset.rem_euclid(size);
    if rem == 0 {
        0
    } else {
        rem - size
    }
}

/// Number of blocks of `size` needed to cover `[0, len)` when the first
/// boundary sits at `offset` (`-size < offset <= 0`)
fn blocks_along(len: usize, offset: i64, size: usize) -> usize {
    let span = len as i64 - offset;
    let size = size as i64;
    ((span + size - 1) / size) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROJ: &str = "EPSG:32637";

    fn fixture_grids() -> Vec<RasterGrid> {
        vec![
            RasterGrid::from_geo_transform(&[376485.0, 30.0, 0.0, 6158655.0, 0.0, -30.0], 700, 1000, PROJ)
                .unwrap(),
            RasterGrid::from_geo_transform(&[371985.0, 30.0, 0.0, 6156555.0, 0.0, -30.0], 1000, 1000, PROJ)
                .unwrap(),
        ]
    }

    #[test]
    fn test_normalize_offset() {
        assert_eq!(normalize_offset(0, 100), 0);
        assert_eq!(normalize_offset(1, 100), -99);
        assert_eq!(normalize_offset(-1, 100), -1);
        assert_eq!(normalize_offset(-100, 100), 0);
        assert_eq!(normalize_offset(-101, 100), -1);
        assert_eq!(normalize_offset(100, 100), 0);
        assert_eq!(normalize_offset(101, 100), -99);
        assert_eq!(normalize_offset(5, 13), -8);
    }

    #[test]
    fn test_count_blocks() {
        assert_eq!(BlockPlan::count_blocks(2, 2, 2, 1, 6, 4), 9);
        assert_eq!(BlockPlan::count_blocks(3, 3, 4, 1, 2, 2), 1);
        assert_eq!(BlockPlan::count_blocks(3, 3, 2, 2, 1, 1), 1);
        assert_eq!(BlockPlan::count_blocks(3, 3, 2, 2, 2, 1), 2);
        assert_eq!(BlockPlan::count_blocks(3, 3, 2, 2, 2, 2), 4);
        assert_eq!(BlockPlan::count_blocks(3, 3, 0, 0, 1, 1), 1);
        assert_eq!(BlockPlan::count_blocks(3, 3, 5, 2, 6, 5), 9);
        assert_eq!(BlockPlan::count_blocks(3, 3, 5, 2, 7, 5), 9);
        assert_eq!(BlockPlan::count_blocks(3, 3, 5, 2, 6, 4), 6);
        assert_eq!(BlockPlan::count_blocks(3, 3, 5, 2, 8, 5), 12);
    }

    #[test]
    fn test_blocks_along_matches_count_blocks() {
        // One axis of the tiling equals the number of natural blocks the
        // area spans when the area starts `-offset` pixels into a block.
        for size in 1..8usize {
            for len in 1..20usize {
                for raw in -10i64..10 {
                    let offset = normalize_offset(raw, size);
                    let expected = BlockPlan::count_blocks(size, 1, -offset, 0, len, 1);
                    assert_eq!(blocks_along(len, offset, size), expected);
                }
            }
        }
    }

    #[test]
    fn test_strip_blocks_from_reference() {
        let plan = BlockPlan::from_grids(fixture_grids(), (700, 1)).unwrap();
        assert_eq!(plan.n_tiles(), 930);
        assert_eq!(plan.n_columns(), 1);
        assert_eq!(plan.n_rows(), 930);
        assert_eq!(plan.n_rasters(), 2);
        assert_eq!(plan.offset(), (0, 0));

        let read_grid = plan.read_grid().clone();
        let first = plan.tile_world_box(0).unwrap();
        assert_eq!(first.x_min, read_grid.x_min);
        assert_eq!(first.x_max, read_grid.x_max);
        assert_eq!(first.y_max, read_grid.y_max);
        assert_eq!(first.y_max - first.y_min, read_grid.y_res);

        let mut visited = vec![0u32; plan.n_tiles()];
        while let Some(id) = plan.next_tile_id() {
            let world = plan.tile_world_box(id).unwrap();
            assert_eq!(world.y_max, read_grid.y_max - read_grid.y_res * id as f64);
            visited[id] += 1;
        }
        assert!(visited.iter().all(|&count| count == 1));
        assert_eq!(plan.next_tile_id(), None);
    }

    #[test]
    fn test_square_tiles() {
        let grids = fixture_grids();
        let read_grid = BlockPlan::intersection(&grids).unwrap();
        let plan = BlockPlan::new(grids, read_grid, (0, 0), (100, 100)).unwrap();
        assert_eq!(plan.n_columns(), 7);
        assert_eq!(plan.n_rows(), 10);

        let last = plan.tile_pixel_bounds(plan.n_tiles() - 1).unwrap();
        assert_eq!(last.width, 100);
        assert_eq!(last.height, 30);
    }

    #[test]
    fn test_raster_windows_follow_each_grid() {
        let plan = BlockPlan::from_grids(fixture_grids(), (100, 100)).unwrap();
        let tile = plan.tile(0).unwrap();

        // Intersection starts at row 70 of the first raster and column 150 of the second
        assert_eq!(tile.windows[0].x_off, 0);
        assert_eq!(tile.windows[0].y_off, 70);
        assert_eq!(tile.windows[1].x_off, 150);
        assert_eq!(tile.windows[1].y_off, 0);
        // First raster blocks start at row 0, so the first tile is clipped to 30 rows
        assert_eq!(tile.read_window.height, 30);
        assert_eq!(tile.windows[0].height, 30);
        assert_eq!(tile.windows[1].height, 30);
    }

    #[test]
    fn test_tile_id_roundtrip() {
        let plan = BlockPlan::from_grids(fixture_grids(), (64, 64)).unwrap();
        for id in 0..plan.n_tiles() {
            let (column, row) = plan.tile_position(id);
            assert_eq!(plan.tile_id(column, row), id);
        }
        assert!(plan.tile_pixel_bounds(plan.n_tiles()).is_err());
    }

    #[test]
    fn test_incomparable_intersection_fails() {
        let mut grids = fixture_grids();
        grids[1].projection = "EPSG:4326".to_string();
        assert!(matches!(
            BlockPlan::from_grids(grids, (10, 10)),
            Err(RrnError::IncomparableGrids(_))
        ));
    }

    #[test]
    fn test_sub_pixel_overlap_is_empty() {
        let grids = vec![
            RasterGrid::new(0.0, 10.0, 0.0, 10.0, 1.0, 1.0, "LOCAL").unwrap(),
            RasterGrid::new(9.7, 19.7, 0.0, 10.0, 1.0, 1.0, "LOCAL").unwrap(),
        ];
        assert!(matches!(BlockPlan::intersection(&grids), Err(RrnError::EmptyIntersection)));
        assert!(matches!(
            BlockPlan::from_grids(grids, (4, 4)),
            Err(RrnError::EmptyIntersection)
        ));
    }

    #[test]
    fn test_zero_tile_size_rejected() {
        assert!(BlockPlan::from_grids(fixture_grids(), (0, 10)).is_err());
    }
}
