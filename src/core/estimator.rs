use crate::types::{BandBuffer, RrnCoefficients, RrnError, RrnResult};
use ndarray::{Array1, Zip};

/// Consumer of paired tile samples producing normalization coefficients.
///
/// One estimator serves one task: every tile of the pair is pushed, then
/// [`Estimator::compute`] is called once.
pub trait Estimator: Send {
    /// Accumulate one tile. Slices hold one buffer per band, source and
    /// target buffers of the same band share their shape.
    fn push(&mut self, source: &[BandBuffer], target: &[BandBuffer]) -> RrnResult<()>;

    fn compute(&self) -> RrnResult<RrnCoefficients>;
}

/// Builds a fresh estimator for a given band count
pub type EstimatorFactory = std::sync::Arc<dyn Fn(usize) -> Box<dyn Estimator> + Send + Sync>;

/// Running first and second order moments of paired band samples
#[derive(Debug, Clone)]
pub struct BandStatistics {
    count: Array1<u64>,
    sum_source: Array1<f64>,
    sum_target: Array1<f64>,
    sum_sq_source: Array1<f64>,
    sum_sq_target: Array1<f64>,
    sum_cross: Array1<f64>,
}

impl BandStatistics {
    pub fn new(n_bands: usize) -> Self {
        Self {
            count: Array1::zeros(n_bands),
            sum_source: Array1::zeros(n_bands),
            sum_target: Array1::zeros(n_bands),
            sum_sq_source: Array1::zeros(n_bands),
            sum_sq_target: Array1::zeros(n_bands),
            sum_cross: Array1::zeros(n_bands),
        }
    }

    pub fn n_bands(&self) -> usize {
        self.count.len()
    }

    /// Add the sample pairs of one band; pairs with a non-finite member are skipped
    pub fn push_band(&mut self, band: usize, source: &BandBuffer, target: &BandBuffer) -> RrnResult<()> {
        if band >= self.n_bands() {
            return Err(RrnError::Estimator(format!(
                "Band {} out of range ({} bands)",
                band,
                self.n_bands()
            )));
        }
        if source.dim() != target.dim() {
            return Err(RrnError::Estimator(format!(
                "Source tile {:?} and target tile {:?} differ in shape",
                source.dim(),
                target.dim()
            )));
        }

        let mut count = 0u64;
        let (mut s, mut t, mut ss, mut tt, mut st) = (0.0, 0.0, 0.0, 0.0, 0.0);
        Zip::from(source).and(target).for_each(|&x, &y| {
            if x.is_finite() && y.is_finite() {
                count += 1;
                s += x;
                t += y;
                ss += x * x;
                tt += y * y;
                st += x * y;
            }
        });

        self.count[band] += count;
        self.sum_source[band] += s;
        self.sum_target[band] += t;
        self.sum_sq_source[band] += ss;
        self.sum_sq_target[band] += tt;
        self.sum_cross[band] += st;
        Ok(())
    }

    pub fn count(&self, band: usize) -> u64 {
        self.count[band]
    }

    pub fn sum_source(&self, band: usize) -> f64 {
        self.sum_source[band]
    }

    pub fn sum_target(&self, band: usize) -> f64 {
        self.sum_target[band]
    }

    pub fn mean_source(&self, band: usize) -> f64 {
        self.sum_source[band] / self.count[band] as f64
    }

    pub fn mean_target(&self, band: usize) -> f64 {
        self.sum_target[band] / self.count[band] as f64
    }

    /// Population variance of the source samples
    pub fn variance_source(&self, band: usize) -> f64 {
        let n = self.count[band] as f64;
        self.sum_sq_source[band] / n - self.mean_source(band).powi(2)
    }

    /// Population variance of the target samples
    pub fn variance_target(&self, band: usize) -> f64 {
        let n = self.count[band] as f64;
        self.sum_sq_target[band] / n - self.mean_target(band).powi(2)
    }

    /// Population covariance of source and target samples
    pub fn covariance(&self, band: usize) -> f64 {
        let n = self.count[band] as f64;
        self.sum_cross[band] / n - self.mean_source(band) * self.mean_target(band)
    }

    /// Pearson correlation of source and target samples
    pub fn correlation(&self, band: usize) -> f64 {
        self.covariance(band) / (self.variance_source(band) * self.variance_target(band)).sqrt()
    }
}

/// Least-squares band-by-band fit of the target onto the source scale,
/// `source ≈ gain * target + offset`
#[derive(Debug, Clone)]
pub struct RegressionEstimator {
    stats: BandStatistics,
}

impl RegressionEstimator {
    pub fn new(n_bands: usize) -> Self {
        Self {
            stats: BandStatistics::new(n_bands),
        }
    }

    pub fn statistics(&self) -> &BandStatistics {
        &self.stats
    }

    /// Factory usable by worker pools
    pub fn factory() -> EstimatorFactory {
        std::sync::Arc::new(|n_bands| Box::new(RegressionEstimator::new(n_bands)) as Box<dyn Estimator>)
    }
}

impl Estimator for RegressionEstimator {
    fn push(&mut self, source: &[BandBuffer], target: &[BandBuffer]) -> RrnResult<()> {
        let n_bands = self.stats.n_bands();
        if source.len() < n_bands || target.len() < n_bands {
            return Err(RrnError::Estimator(format!(
                "Expected {} bands, got {} source and {} target",
                n_bands,
                source.len(),
                target.len()
            )));
        }
        for band in 0..n_bands {
            self.stats.push_band(band, &source[band], &target[band])?;
        }
        Ok(())
    }

    fn compute(&self) -> RrnResult<RrnCoefficients> {
        let n_bands = self.stats.n_bands();
        let mut gains = Vec::with_capacity(n_bands);
        let mut offsets = Vec::with_capacity(n_bands);
        let mut samples = Vec::with_capacity(n_bands);

        for band in 0..n_bands {
            let count = self.stats.count(band);
            if count < 2 {
                return Err(RrnError::Estimator(format!(
                    "Band {}: {} valid sample pairs, need at least 2",
                    band, count
                )));
            }

            let variance = self.stats.variance_target(band);
            if !(variance > f64::EPSILON * self.stats.mean_target(band).abs().max(1.0)) {
                return Err(RrnError::Estimator(format!(
                    "Band {}: target has no variance",
                    band
                )));
            }

            let gain = self.stats.covariance(band) / variance;
            gains.push(gain);
            offsets.push(self.stats.mean_source(band) - gain * self.stats.mean_target(band));
            samples.push(count);
        }

        Ok(RrnCoefficients {
            gains,
            offsets,
            samples,
        })
    }
}
