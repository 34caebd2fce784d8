//! Information bottleneck primitives shared by the readout and
//! per-sample analyzers
//!
//! Given a layer activation `R` with per-unit statistics `(mu, sigma)` and a
//! suppression mask `lambda` in `[0, 1]`, the bottleneck emits
//!
//! ```text
//! Z = lambda * R + (1 - lambda) * eps,    eps ~ N(mu, sigma^2)
//! ```
//!
//! and its capacity is the per-unit KL divergence between `Q(Z | R)` and the
//! noise prior, computed on normalized activations `r = (R - mu) / sigma`:
//!
//! ```text
//! KL( N(lambda * r, (1 - lambda)^2) || N(0, 1) )
//!   = 0.5 * ((lambda * r)^2 + (1 - lambda)^2 - ln (1 - lambda)^2 - 1)
//! ```

use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, Normal};

use crate::estimator::LayerStats;

/// Floor for `(1 - lambda)^2` so that a saturated mask gives a large but
/// finite capacity
const MIN_VARIANCE: f64 = 1e-12;

/// Knobs shared by both bottleneck flavours
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BottleneckConfig {
    /// Gaussian smoothing of the mask; `None` or `0.0` disables it
    pub sigma: Option<f64>,
    /// Lower bound on the estimated standard deviation
    pub min_std: f64,
    /// Units active in at most this fraction of samples get zero capacity
    pub active_neurons_threshold: f64,
    /// Apply ReLU to the bottleneck output
    pub relu: bool,
    /// Noise draws averaged when analyzing a single image
    pub analysis_samples: usize,
}

impl Default for BottleneckConfig {
    fn default() -> Self {
        Self {
            sigma: Some(1.0),
            min_std: 0.01,
            active_neurons_threshold: 0.01,
            relu: false,
            analysis_samples: 10,
        }
    }
}

/// Depthwise Gaussian blur over the spatial dimensions of `(B, C, H, W)`
///
/// Edges are padded by replication.
#[derive(Debug, Clone)]
pub struct GaussianSmoothing {
    kernel: Tensor,
    pad: usize,
}

impl GaussianSmoothing {
    /// Kernel width is `round(6 * sigma)`, bumped to the next odd number
    pub fn new(sigma: f64, device: &Device) -> Result<Self> {
        anyhow::ensure!(sigma > 0.0, "Smoothing sigma must be positive, got {sigma}");
        let mut size = (2.0 * sigma * 3.0).round() as usize;
        if size % 2 == 0 {
            size += 1;
        }
        let center = (size / 2) as f64;
        let normal = Normal::new(0.0, sigma)?;
        let weights_1d: Vec<f64> = (0..size).map(|i| normal.pdf(i as f64 - center)).collect();

        let mut weights = Vec::with_capacity(size * size);
        for wy in &weights_1d {
            for wx in &weights_1d {
                weights.push(wy * wx);
            }
        }
        let total: f64 = weights.iter().sum();
        let weights: Vec<f32> = weights.iter().map(|w| (w / total) as f32).collect();

        Ok(Self {
            kernel: Tensor::from_vec(weights, (1, 1, size, size), device)?,
            pad: size / 2,
        })
    }

    pub fn kernel_size(&self) -> usize {
        self.pad * 2 + 1
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = x.dims4()?;
        let flat = x
            .reshape((b * c, 1, h, w))?
            .pad_with_same(D::Minus1, self.pad, self.pad)?
            .pad_with_same(D::Minus2, self.pad, self.pad)?;
        let kernel = self.kernel.to_dtype(x.dtype())?;
        let blurred = flat.conv2d(&kernel, 0, 1, 1, 1)?;
        Ok(blurred.reshape((b, c, h, w))?)
    }
}

/// Build the optional smoothing stage from a config
pub fn smoothing_from_config(
    config: &BottleneckConfig,
    device: &Device,
) -> Result<Option<GaussianSmoothing>> {
    match config.sigma {
        Some(sigma) if sigma > 0.0 => Ok(Some(GaussianSmoothing::new(sigma, device)?)),
        _ => Ok(None),
    }
}

/// Per-unit capacity in nats, shape of `r`
///
/// `lambda` must broadcast against `r`; the result is masked by the
/// layer's active units.
pub fn kl_capacity(r: &Tensor, lambda: &Tensor, stats: &LayerStats) -> Result<Tensor> {
    let r_norm = stats.normalize(r)?;
    let var_z = lambda.affine(-1.0, 1.0)?.sqr()?.maximum(MIN_VARIANCE)?;
    let mu_z = r_norm.broadcast_mul(lambda)?;
    let log_var_z = var_z.log()?;

    let kl = ((mu_z.sqr()?.broadcast_add(&var_z)? - log_var_z.broadcast_as(mu_z.shape())?)?
        - 1.0)?
        .affine(0.5, 0.0)?;
    // KL >= 0; relu only absorbs rounding near lambda = 0
    Ok(kl.relu()?.broadcast_mul(&stats.active)?)
}

/// Replace suppressed information in `r` with noise from the layer prior
pub fn restrict(r: &Tensor, lambda: &Tensor, stats: &LayerStats, relu: bool) -> Result<Tensor> {
    let noise = r
        .randn_like(0.0, 1.0)?
        .broadcast_mul(&stats.std)?
        .broadcast_add(&stats.mean)?;
    let keep = r.broadcast_mul(lambda)?;
    let inject = noise.broadcast_mul(&lambda.affine(-1.0, 1.0)?)?;
    let z = (keep + inject)?;
    if relu {
        Ok(z.relu()?)
    } else {
        Ok(z)
    }
}

/// `sigmoid(alpha)`, optionally smoothed
pub fn mask_from_alpha(alpha: &Tensor, smoothing: Option<&GaussianSmoothing>) -> Result<Tensor> {
    let lambda = candle_nn::ops::sigmoid(alpha)?;
    match smoothing {
        Some(smooth) if lambda.rank() == 4 => smooth.forward(&lambda),
        Some(smooth) => {
            let expanded = lambda.unsqueeze(0)?;
            Ok(smooth.forward(&expanded)?.squeeze(0)?)
        }
        None => Ok(lambda),
    }
}

/// Capacity averaged over the batch dimension, as `(C, H, W)` on the host
pub fn mean_capacity(capacity: &Tensor) -> Result<ndarray::Array3<f32>> {
    let mean = capacity.mean(0)?.to_dtype(DType::F32)?;
    let (c, h, w) = mean.dims3()?;
    let values: Vec<f32> = mean.flatten_all()?.to_vec1()?;
    Ok(ndarray::Array3::from_shape_vec((c, h, w), values)?)
}
