use crate::core::block_plan::{BlockPlan, TileGeometry};
use crate::io::{RasterHandle, RasterReader, SharedDriver};
use crate::types::{BandBuffer, PipelineParams, RrnError, RrnResult};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Pixels of one tile, read from every raster of the stream
#[derive(Debug, Clone)]
pub struct Tile {
    pub geometry: TileGeometry,
    /// Band buffers indexed `[raster][band]`, each shaped (rows, columns)
    pub bands: Vec<Vec<BandBuffer>>,
}

impl Tile {
    pub fn id(&self) -> usize {
        self.geometry.id
    }

    /// Band buffers of the `raster`-th raster
    pub fn raster_bands(&self, raster: usize) -> &[BandBuffer] {
        &self.bands[raster]
    }
}

enum TileMessage {
    Data(Tile),
    Failed(RrnError),
    ProducerDone,
}

/// Everything a producer thread needs, moved into the thread
struct Producer {
    driver: SharedDriver,
    paths: Vec<PathBuf>,
    plan: Arc<BlockPlan>,
    n_bands: usize,
    abort: Arc<AtomicBool>,
    sender: SyncSender<TileMessage>,
}

impl Producer {
    fn run(self) {
        let readers = match self.open_readers() {
            Ok(readers) => readers,
            Err(e) => {
                self.fail(e);
                let _ = self.sender.send(TileMessage::ProducerDone);
                return;
            }
        };

        while !self.abort.load(Ordering::Acquire) {
            let Some(id) = self.plan.next_tile_id() else {
                break;
            };

            match self.read_tile(&readers, id) {
                Ok(tile) => {
                    if self.sender.send(TileMessage::Data(tile)).is_err() {
                        // Consumer is gone, nobody is waiting for the marker
                        return;
                    }
                }
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }

        let _ = self.sender.send(TileMessage::ProducerDone);
    }

    fn open_readers(&self) -> RrnResult<Vec<Box<dyn RasterReader>>> {
        self.paths.iter().map(|path| self.driver.open(path)).collect()
    }

    fn read_tile(&self, readers: &[Box<dyn RasterReader>], id: usize) -> RrnResult<Tile> {
        let geometry = self.plan.tile(id)?;
        log::debug!(
            "Reading tile {} (column {}, row {}) on {:?}",
            id,
            geometry.column,
            geometry.row,
            thread::current().name()
        );

        let bands = readers
            .iter()
            .zip(&geometry.windows)
            .map(|(reader, window)| {
                (0..self.n_bands)
                    .map(|band| reader.read_window(band, window))
                    .collect::<RrnResult<Vec<_>>>()
            })
            .collect::<RrnResult<Vec<_>>>()?;

        Ok(Tile { geometry, bands })
    }

    fn fail(&self, error: RrnError) {
        log::warn!("Tile producer stopping: {}", error);
        self.abort.store(true, Ordering::Release);
        let _ = self.sender.send(TileMessage::Failed(error));
    }
}

/// Multi-threaded tile reader over a [`BlockPlan`].
///
/// Producer threads pull tile ids from the plan, read the matching window
/// of every raster and push the result into a bounded queue; a single
/// consumer drains it through [`BlockStream::next`]. Tiles arrive in no
/// particular order, each exactly once.
pub struct BlockStream {
    driver: SharedDriver,
    paths: Vec<PathBuf>,
    plan: Arc<BlockPlan>,
    n_bands: usize,
    n_threads: usize,
    buffer_size: usize,
    abort: Arc<AtomicBool>,
    receiver: Option<Receiver<TileMessage>>,
    handles: Vec<JoinHandle<()>>,
    live_producers: usize,
    failed: bool,
}

impl BlockStream {
    /// Stream over `rasters` tiled by `plan`, using the reader thread count
    /// and buffer size of `params`
    pub fn new(
        driver: SharedDriver,
        rasters: &[RasterHandle],
        plan: BlockPlan,
        params: &PipelineParams,
    ) -> RrnResult<Self> {
        params.validate()?;
        if rasters.len() != plan.n_rasters() {
            return Err(RrnError::InvalidParameter(format!(
                "Block plan covers {} rasters, stream was given {}",
                plan.n_rasters(),
                rasters.len()
            )));
        }

        let n_bands = rasters
            .iter()
            .map(|raster| raster.band_count())
            .min()
            .unwrap_or(0);

        Ok(Self {
            driver,
            paths: rasters.iter().map(|raster| raster.path().to_path_buf()).collect(),
            plan: Arc::new(plan),
            n_bands,
            n_threads: params.reader_threads,
            buffer_size: params.buffer_size,
            abort: Arc::new(AtomicBool::new(false)),
            receiver: None,
            handles: Vec::new(),
            live_producers: 0,
            failed: false,
        })
    }

    /// Number of bands read per raster: the smallest band count among them
    pub fn n_bands(&self) -> usize {
        self.n_bands
    }

    pub fn n_tiles(&self) -> usize {
        self.plan.n_tiles()
    }

    pub fn plan(&self) -> &BlockPlan {
        &self.plan
    }

    /// Launch the producer threads. May be called once.
    pub fn start(&mut self) -> RrnResult<()> {
        if self.receiver.is_some() {
            return Err(RrnError::Protocol("block stream already started".to_string()));
        }

        log::info!(
            "🧱 Streaming {} tiles of {:?} from {} rasters with {} readers",
            self.plan.n_tiles(),
            self.plan.tile_size(),
            self.paths.len(),
            self.n_threads
        );

        let (sender, receiver) = sync_channel(self.buffer_size);
        self.receiver = Some(receiver);

        for index in 0..self.n_threads {
            let producer = Producer {
                driver: Arc::clone(&self.driver),
                paths: self.paths.clone(),
                plan: Arc::clone(&self.plan),
                n_bands: self.n_bands,
                abort: Arc::clone(&self.abort),
                sender: sender.clone(),
            };

            let spawned = thread::Builder::new()
                .name(format!("rrn-reader-{}", index))
                .spawn(move || producer.run());

            match spawned {
                Ok(handle) => {
                    self.handles.push(handle);
                    self.live_producers += 1;
                }
                Err(e) => {
                    self.abort.store(true, Ordering::Release);
                    return Err(RrnError::Io(e));
                }
            }
        }

        Ok(())
    }

    /// Next tile, blocking until one is available.
    ///
    /// Returns `Ok(None)` once every producer has signalled completion.
    /// A read failure in any producer is returned as an error; the
    /// remaining producers stop pulling new tiles, and every later call
    /// fails as well.
    pub fn next(&mut self) -> RrnResult<Option<Tile>> {
        if self.failed {
            return Err(RrnError::Protocol("block stream already failed".to_string()));
        }
        let receiver = self
            .receiver
            .as_ref()
            .ok_or_else(|| RrnError::Protocol("next() called before start()".to_string()))?;

        // Each producer sends its completion marker last, so once all
        // markers are in, the queue holds nothing else.
        while self.live_producers > 0 {
            match receiver.recv() {
                Ok(TileMessage::Data(tile)) => return Ok(Some(tile)),
                Ok(TileMessage::Failed(e)) => {
                    self.failed = true;
                    return Err(e);
                }
                Ok(TileMessage::ProducerDone) => self.live_producers -= 1,
                Err(_) => {
                    self.failed = true;
                    return Err(RrnError::Protocol(
                        "tile producers exited without signalling completion".to_string(),
                    ))
                }
            }
        }
        Ok(None)
    }

    /// Stop producers and wait for them to exit
    fn shutdown(&mut self) {
        self.abort.store(true, Ordering::Release);
        self.receiver.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("Tile producer panicked");
            }
        }
    }
}

impl Drop for BlockStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::grid::RasterGrid;
    use crate::io::{MemoryDriver, MemoryRaster};

    fn setup() -> (Arc<MemoryDriver>, Vec<RasterHandle>) {
        let driver = Arc::new(MemoryDriver::new());
        let grid = RasterGrid::new(0.0, 10.0, 0.0, 6.0, 1.0, 1.0, "LOCAL").unwrap();
        driver.insert("a", MemoryRaster::from_fn(grid.clone(), 2, |_, r, c| (r * 10 + c) as f64).unwrap());
        driver.insert("b", MemoryRaster::from_fn(grid, 1, |_, _, _| 1.0).unwrap());
        let handles = ["a", "b"]
            .iter()
            .map(|p| RasterHandle::open(&*driver, p).unwrap())
            .collect();
        (driver, handles)
    }

    #[test]
    fn test_next_before_start_is_protocol_error() {
        let (driver, rasters) = setup();
        let plan = BlockPlan::for_rasters(&rasters, Some((4, 4))).unwrap();
        let mut stream = BlockStream::new(driver, &rasters, plan, &PipelineParams::default()).unwrap();
        assert!(matches!(stream.next(), Err(RrnError::Protocol(_))));
    }

    #[test]
    fn test_double_start_is_protocol_error() {
        let (driver, rasters) = setup();
        let plan = BlockPlan::for_rasters(&rasters, Some((4, 4))).unwrap();
        let mut stream = BlockStream::new(driver, &rasters, plan, &PipelineParams::default()).unwrap();
        stream.start().unwrap();
        assert!(matches!(stream.start(), Err(RrnError::Protocol(_))));
    }

    #[test]
    fn test_band_count_is_minimum() {
        let (driver, rasters) = setup();
        let plan = BlockPlan::for_rasters(&rasters, None).unwrap();
        let mut stream = BlockStream::new(driver, &rasters, plan, &PipelineParams::default()).unwrap();
        assert_eq!(stream.n_bands(), 1);

        stream.start().unwrap();
        let mut tiles = 0;
        while let Some(tile) = stream.next().unwrap() {
            assert_eq!(tile.bands.len(), 2);
            assert_eq!(tile.raster_bands(0).len(), 1);
            assert_eq!(tile.raster_bands(1).len(), 1);
            tiles += 1;
        }
        // Natural block size of "a" is one full row
        assert_eq!(tiles, 6);
        assert!(stream.next().unwrap().is_none());
    }

    #[test]
    fn test_stream_stays_failed_after_error() {
        let (driver, rasters) = setup();
        driver.remove("b");
        let plan = BlockPlan::for_rasters(&rasters, Some((4, 4))).unwrap();
        let params = PipelineParams::default().with_reader_threads(1);
        let mut stream = BlockStream::new(driver, &rasters, plan, &params).unwrap();
        stream.start().unwrap();

        assert!(matches!(stream.next(), Err(RrnError::Open { .. })));
        for _ in 0..3 {
            assert!(matches!(stream.next(), Err(RrnError::Protocol(_))));
        }
    }

    #[test]
    fn test_drop_mid_stream_does_not_hang() {
        let (driver, rasters) = setup();
        let plan = BlockPlan::for_rasters(&rasters, Some((1, 1))).unwrap();
        let params = PipelineParams::default().with_reader_threads(4).with_buffer_size(1);
        let mut stream = BlockStream::new(driver, &rasters, plan, &params).unwrap();
        stream.start().unwrap();
        assert!(stream.next().unwrap().is_some());
        drop(stream);
    }
}
