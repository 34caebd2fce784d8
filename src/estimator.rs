//! Per-unit activation statistics (Welford's online algorithm)
//!
//! The bottleneck replaces suppressed activations with noise drawn from
//! the layer's own activation distribution, and normalizes the capacity
//! by it. Both need per-unit mean and standard deviation, estimated here
//! over many dataset samples before training.
//!
//! Accumulation runs in F64; finished statistics are handed out in F32.

use std::collections::HashMap;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use crate::hooks::LayerId;
use crate::loader::DataLoader;
use crate::model::IbaModel;

/// Online estimator of mean, standard deviation and activity per unit
#[derive(Debug, Clone, Default)]
pub struct WelfordEstimator {
    m: Option<Tensor>,
    s: Option<Tensor>,
    n_samples: usize,
    neuron_nonzero: Option<Tensor>,
}

impl WelfordEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the estimates with a batch `(B, ...)`; the batch is not altered
    pub fn fit(&mut self, x: &Tensor) -> Result<()> {
        let x = x.detach().to_dtype(DType::F64)?;
        let batch = x.dim(0)?;
        for i in 0..batch {
            let xi = x.get(i)?;
            if self.n_samples == 0 {
                self.m = Some(xi.zeros_like()?);
                self.s = Some(xi.zeros_like()?);
                self.neuron_nonzero = Some(xi.zeros_like()?);
            }
            let (m, s, nonzero) = match (&self.m, &self.s, &self.neuron_nonzero) {
                (Some(m), Some(s), Some(nz)) => (m, s, nz),
                _ => anyhow::bail!("Estimator state is incomplete"),
            };
            anyhow::ensure!(
                xi.dims() == m.dims(),
                "Sample shape {:?} does not match estimator shape {:?}",
                xi.dims(),
                m.dims()
            );

            let nonzero = (nonzero + xi.ne(0f64)?.to_dtype(DType::F64)?)?;
            let old_m = m.clone();
            let m = (m + ((&xi - m)? / (self.n_samples + 1) as f64)?)?;
            let s = (s + ((&xi - &m)? * (&xi - &old_m)?)?)?;

            self.m = Some(m);
            self.s = Some(s);
            self.neuron_nonzero = Some(nonzero);
            self.n_samples += 1;
        }
        Ok(())
    }

    /// Number of samples seen
    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Shape of a single sample, once the first batch has been seen
    pub fn shape(&self) -> Option<&[usize]> {
        self.m.as_ref().map(|m| m.dims())
    }

    /// Estimated mean
    pub fn mean(&self) -> Result<Tensor> {
        let m = self.m.as_ref().context("Estimator has seen no samples")?;
        Ok(m.to_dtype(DType::F32)?)
    }

    /// Estimated (sample) standard deviation
    pub fn std(&self) -> Result<Tensor> {
        anyhow::ensure!(
            self.n_samples >= 2,
            "Standard deviation needs at least 2 samples, have {}",
            self.n_samples
        );
        let s = self.s.as_ref().context("Estimator has seen no samples")?;
        Ok((s / (self.n_samples - 1) as f64)?
            .relu()?
            .sqrt()?
            .to_dtype(DType::F32)?)
    }

    /// Mask (1.0 / 0.0) of units that are non-zero in more than `threshold` of samples
    pub fn active_neurons(&self, threshold: f64) -> Result<Tensor> {
        let nz = self
            .neuron_nonzero
            .as_ref()
            .context("Estimator has seen no samples")?;
        let freq = (nz / self.n_samples as f64)?;
        Ok(freq.gt(threshold)?.to_dtype(DType::F32)?)
    }

    /// Serialize state under `prefix` (`{prefix}.m`, `{prefix}.s`, ...)
    pub fn state_dict(&self, prefix: &str) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        let (m, s, nz) = match (&self.m, &self.s, &self.neuron_nonzero) {
            (Some(m), Some(s), Some(nz)) => (m, s, nz),
            _ => anyhow::bail!("Cannot save an estimator that has seen no samples"),
        };
        state.insert(format!("{prefix}.m"), m.clone());
        state.insert(format!("{prefix}.s"), s.clone());
        state.insert(format!("{prefix}.neuron_nonzero"), nz.clone());
        state.insert(
            format!("{prefix}.n_samples"),
            Tensor::new(&[self.n_samples as f64], m.device())?,
        );
        Ok(state)
    }

    /// Restore state saved by [`WelfordEstimator::state_dict`]
    pub fn load_state_dict(
        state: &HashMap<String, Tensor>,
        prefix: &str,
        device: &Device,
    ) -> Result<Self> {
        let get = |key: &str| -> Result<Tensor> {
            let name = format!("{prefix}.{key}");
            let t = state
                .get(&name)
                .with_context(|| format!("Missing '{name}' in estimator state"))?;
            Ok(t.to_device(device)?.to_dtype(DType::F64)?)
        };
        let n: Vec<f64> = get("n_samples")?.to_vec1()?;
        let n_samples = n.first().copied().context("Empty n_samples")? as usize;

        Ok(Self {
            m: Some(get("m")?),
            s: Some(get("s")?),
            n_samples,
            neuron_nonzero: Some(get("neuron_nonzero")?),
        })
    }
}

/// Finished statistics of one layer, ready to use inside the bottleneck
#[derive(Debug, Clone)]
pub struct LayerStats {
    pub mean: Tensor,
    /// Standard deviation clamped below at `min_std`
    pub std: Tensor,
    /// 1.0 for active units, 0.0 otherwise
    pub active: Tensor,
}

impl LayerStats {
    pub fn from_estimator(
        estimator: &WelfordEstimator,
        min_std: f64,
        active_threshold: f64,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            mean: estimator.mean()?.to_device(device)?,
            std: estimator.std()?.maximum(min_std)?.to_device(device)?,
            active: estimator.active_neurons(active_threshold)?.to_device(device)?,
        })
    }

    /// `(x - mean) / std`, broadcasting over the batch dimension
    pub fn normalize(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.broadcast_sub(&self.mean)?.broadcast_div(&self.std)?)
    }
}

/// Run the classifier over the loader and fit one estimator per layer
///
/// Stops after `n_samples` samples; the last batch is truncated to fit.
pub fn estimate_layers(
    model: &IbaModel,
    loader: &DataLoader,
    layers: &[LayerId],
    n_samples: usize,
    progress: bool,
) -> Result<Vec<WelfordEstimator>> {
    anyhow::ensure!(n_samples >= 2, "Need at least 2 samples to estimate, got {n_samples}");
    anyhow::ensure!(!layers.is_empty(), "No layers to estimate");

    let mut estimators = vec![WelfordEstimator::new(); layers.len()];
    let bar = if progress {
        let bar = ProgressBar::new(n_samples as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{elapsed_precise}] [{wide_bar}] {pos}/{len} ({eta})")?
                .progress_chars("#>-"),
        );
        bar.set_message("Estimating activation statistics");
        bar
    } else {
        ProgressBar::hidden()
    };

    let device = model.device();
    let mut seen = 0usize;
    info!(
        "Estimating statistics for {:?} over {} samples",
        layers, n_samples
    );

    // A single pass: a dataset smaller than the budget is used once
    for batch in loader.iter(0) {
        let batch = batch?;
        let take = batch.len().min(n_samples - seen);
        let images = batch.images.narrow(0, 0, take)?.to_device(device)?;

        let (_, cache) = model.forward_with_cache(&images, layers)?;
        for (layer, estimator) in layers.iter().zip(estimators.iter_mut()) {
            estimator.fit(cache.require(*layer)?)?;
        }

        seen += take;
        bar.inc(take as u64);
        debug!("Estimator: {}/{} samples", seen, n_samples);
        if seen >= n_samples {
            break;
        }
    }

    bar.finish_with_message("Statistics estimated");
    anyhow::ensure!(
        seen >= 2,
        "Estimation saw {seen} samples; at least 2 are required"
    );
    if seen < n_samples {
        tracing::warn!(
            "Dataset exhausted after {} of {} requested samples",
            seen,
            n_samples
        );
    }
    info!("Estimated statistics from {} samples", seen);
    Ok(estimators)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> Tensor {
        // 4 samples of shape (2,): unit 0 = [1,2,3,4], unit 1 = [0,0,0,5]
        Tensor::new(
            &[[1f32, 0.], [2., 0.], [3., 0.], [4., 5.]],
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn test_mean_and_std() {
        let mut est = WelfordEstimator::new();
        est.fit(&data()).unwrap();
        assert_eq!(est.n_samples(), 4);

        let mean: Vec<f32> = est.mean().unwrap().to_vec1().unwrap();
        assert!((mean[0] - 2.5).abs() < 1e-6);
        assert!((mean[1] - 1.25).abs() < 1e-6);

        // Sample std of [1,2,3,4] is sqrt(5/3); of [0,0,0,5] is sqrt(6.25)
        let std: Vec<f32> = est.std().unwrap().to_vec1().unwrap();
        assert!((std[0] - (5.0f32 / 3.0).sqrt()).abs() < 1e-5);
        assert!((std[1] - 2.5).abs() < 1e-5);
    }

    #[test]
    fn test_split_batches_match_single_batch() {
        let mut whole = WelfordEstimator::new();
        whole.fit(&data()).unwrap();

        let mut split = WelfordEstimator::new();
        split.fit(&data().narrow(0, 0, 1).unwrap()).unwrap();
        split.fit(&data().narrow(0, 1, 3).unwrap()).unwrap();

        let a: Vec<f32> = whole.std().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = split.std().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_active_neurons() {
        let mut est = WelfordEstimator::new();
        est.fit(&data()).unwrap();
        let active: Vec<f32> = est.active_neurons(0.5).unwrap().to_vec1().unwrap();
        // unit 1 is non-zero in 1/4 of samples
        assert_eq!(active, vec![1.0, 0.0]);
        let active: Vec<f32> = est.active_neurons(0.01).unwrap().to_vec1().unwrap();
        assert_eq!(active, vec![1.0, 1.0]);
    }

    #[test]
    fn test_std_needs_two_samples() {
        let mut est = WelfordEstimator::new();
        assert!(est.mean().is_err());
        est.fit(&data().narrow(0, 0, 1).unwrap()).unwrap();
        assert!(est.std().is_err());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let mut est = WelfordEstimator::new();
        est.fit(&data()).unwrap();
        let other = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(est.fit(&other).is_err());
    }

    #[test]
    fn test_state_dict_roundtrip() {
        let mut est = WelfordEstimator::new();
        est.fit(&data()).unwrap();
        let state = est.state_dict("layer2").unwrap();
        assert!(state.contains_key("layer2.m"));

        let restored = WelfordEstimator::load_state_dict(&state, "layer2", &Device::Cpu).unwrap();
        assert_eq!(restored.n_samples(), 4);
        let a: Vec<f32> = est.std().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = restored.std().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_layer_stats_clamps_std() {
        let mut est = WelfordEstimator::new();
        let constant = Tensor::new(&[[1f32, 2.], [1., 2.], [1., 2.]], &Device::Cpu).unwrap();
        est.fit(&constant).unwrap();
        let stats = LayerStats::from_estimator(&est, 0.01, 0.01, &Device::Cpu).unwrap();
        let std: Vec<f32> = stats.std.to_vec1().unwrap();
        assert_eq!(std, vec![0.01, 0.01]);
    }
}
