//! Per-sample bottleneck: optimize a free mask for a single image
//!
//! Instead of predicting alpha with a readout network, alpha is a tensor of
//! shape `(C, H, W)` fitted from scratch for every image with a few Adam
//! steps on `loss_fn(logits) + beta * information_loss`. The image is
//! replicated `batch_size` times so each step averages over several noise
//! draws. Slower than the readout bottleneck per image, but needs no
//! training beyond the statistics estimate.

use std::cell::RefCell;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bottleneck::{
    kl_capacity, mask_from_alpha, mean_capacity, restrict, smoothing_from_config,
    BottleneckConfig, GaussianSmoothing,
};
use crate::estimator::{estimate_layers, LayerStats, WelfordEstimator};
use crate::hooks::LayerId;
use crate::loader::DataLoader;
use crate::model::IbaModel;
use crate::readout::{single_image, Analysis, ReadoutBottleneck};
use crate::saliency::{to_saliency_map, Heatmap};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerSampleConfig {
    pub beta: f64,
    pub optimization_steps: usize,
    pub lr: f64,
    /// Noise copies of the image per step
    pub batch_size: usize,
    /// Starting alpha; `sigmoid(5) ~ 0.993` lets almost everything through
    pub initial_alpha: f64,
    pub bottleneck: BottleneckConfig,
}

impl Default for PerSampleConfig {
    fn default() -> Self {
        Self {
            beta: 10.0,
            optimization_steps: 10,
            lr: 1.0,
            batch_size: 10,
            initial_alpha: 5.0,
            bottleneck: BottleneckConfig::default(),
        }
    }
}

pub struct PerSampleIba {
    layer: LayerId,
    config: PerSampleConfig,
    stats: LayerStats,
    smoothing: Option<GaussianSmoothing>,
}

impl PerSampleIba {
    pub fn new(
        layer: LayerId,
        estimator: &WelfordEstimator,
        config: PerSampleConfig,
        device: &Device,
    ) -> Result<Self> {
        anyhow::ensure!(
            layer.is_spatial(),
            "Per-sample bottleneck needs a feature map, got {layer}"
        );
        anyhow::ensure!(
            config.optimization_steps > 0 && config.batch_size > 0,
            "optimization_steps and batch_size must be positive"
        );
        let stats = LayerStats::from_estimator(
            estimator,
            config.bottleneck.min_std,
            config.bottleneck.active_neurons_threshold,
            device,
        )?;
        let smoothing = smoothing_from_config(&config.bottleneck, device)?;
        Ok(Self {
            layer,
            config,
            stats,
            smoothing,
        })
    }

    /// Reuse the target-layer statistics of an estimated readout bottleneck
    pub fn from_readout(
        bottleneck: &ReadoutBottleneck,
        config: PerSampleConfig,
        device: &Device,
    ) -> Result<Self> {
        let estimator = bottleneck
            .target_estimator()
            .context("Readout bottleneck is not estimated")?;
        Self::new(bottleneck.target(), estimator, config, device)
    }

    /// Estimate statistics for `layer` and build the analyzer
    pub fn estimate(
        model: &IbaModel,
        loader: &DataLoader,
        layer: LayerId,
        n_samples: usize,
        config: PerSampleConfig,
        progress: bool,
    ) -> Result<Self> {
        let estimators = estimate_layers(model, loader, &[layer], n_samples, progress)?;
        let estimator = estimators
            .first()
            .context("Estimation returned no statistics")?;
        Self::new(layer, estimator, config, model.device())
    }

    pub fn layer(&self) -> LayerId {
        self.layer
    }

    pub fn config(&self) -> &PerSampleConfig {
        &self.config
    }

    /// Fit alpha for one image `(3, H, W)` and return its heatmap
    pub fn analyze<F>(&self, model: &IbaModel, image: &Tensor, loss_fn: F) -> Result<Analysis>
    where
        F: Fn(&Tensor) -> Result<Tensor>,
    {
        let device = model.device();
        let single = single_image(image)?.to_device(device)?;
        let (_, _, h, w) = single.dims4()?;
        let shape = model.layer_shape(&single, self.layer)?;
        anyhow::ensure!(shape.len() == 4, "Layer {} is not a feature map", self.layer);
        let (c, lh, lw) = (shape[1], shape[2], shape[3]);

        let batch = single.repeat((self.config.batch_size, 1, 1, 1))?;
        let alpha = Var::from_tensor(&Tensor::full(
            self.config.initial_alpha as f32,
            (c, lh, lw),
            device,
        )?)?;
        let mut optimizer = AdamW::new(
            vec![alpha.clone()],
            ParamsAdamW {
                lr: self.config.lr,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;

        let capacity: RefCell<Option<Tensor>> = RefCell::new(None);
        let hook = |_layer: LayerId, r: &Tensor| -> Result<Tensor> {
            let lambda = mask_from_alpha(alpha.as_tensor(), self.smoothing.as_ref())?;
            capacity.replace(Some(kl_capacity(r, &lambda, &self.stats)?));
            restrict(r, &lambda, &self.stats, self.config.bottleneck.relu)
        };

        let mut model_loss = 0f32;
        let mut information_loss = 0f32;
        for step in 0..self.config.optimization_steps {
            let logits = model.forward_with_hook(&batch, self.layer, &hook)?;
            let task = loss_fn(&logits)?;
            let info = capacity
                .borrow()
                .as_ref()
                .context("Bottleneck recorded no capacity")?
                .mean_all()?;
            let loss = (task.mean_all()? + (&info * self.config.beta)?)?;
            optimizer.backward_step(&loss)?;

            model_loss = task.mean_all()?.to_scalar::<f32>()?;
            information_loss = info.to_scalar::<f32>()?;
            debug!(
                "Per-sample step {}: model loss {:.4}, information loss {:.4}",
                step, model_loss, information_loss
            );
        }

        let capacity = capacity
            .into_inner()
            .context("Bottleneck recorded no capacity")?
            .detach();
        let saliency = to_saliency_map(&mean_capacity(&capacity)?, Some((h, w)));
        let heatmap = Heatmap::new(saliency);
        info!(
            "Per-sample analysis at {}: {:.2} bits total",
            self.layer,
            heatmap.total()
        );

        Ok(Analysis {
            heatmap,
            model_loss,
            information_loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::target_class_loss;
    use crate::readout::tests::{calibrated, tiny_model};

    fn fitted_estimator(model: &IbaModel) -> WelfordEstimator {
        let mut est = WelfordEstimator::new();
        for _ in 0..3 {
            let x = Tensor::randn(0f32, 1f32, (4, 3, 32, 32), &Device::Cpu).unwrap();
            let (_, cache) = model.forward_with_cache(&x, &[LayerId::Layer(3)]).unwrap();
            est.fit(cache.require(LayerId::Layer(3)).unwrap()).unwrap();
        }
        est
    }

    fn quick_config() -> PerSampleConfig {
        PerSampleConfig {
            optimization_steps: 3,
            batch_size: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_heatmap_matches_image() {
        let model = tiny_model();
        let est = fitted_estimator(&model);
        let iba = PerSampleIba::new(LayerId::Layer(3), &est, quick_config(), &Device::Cpu).unwrap();
        let image = Tensor::randn(0f32, 1f32, (3, 32, 32), &Device::Cpu).unwrap();

        let analysis = iba.analyze(&model, &image, target_class_loss(2)).unwrap();
        assert_eq!(analysis.heatmap.height(), 32);
        assert_eq!(analysis.heatmap.width(), 32);
        assert!(analysis.information_loss >= 0.0);
        assert!(analysis.heatmap.total().is_finite());
    }

    #[test]
    fn test_information_pressure_lowers_capacity() {
        let model = tiny_model();
        let est = fitted_estimator(&model);
        let image = Tensor::randn(0f32, 1f32, (3, 32, 32), &Device::Cpu).unwrap();
        let zero_loss = |logits: &Tensor| -> Result<Tensor> { Ok(logits.zeros_like()?.sum_all()?) };

        let one_step = PerSampleIba::new(
            LayerId::Layer(3),
            &est,
            PerSampleConfig {
                optimization_steps: 1,
                batch_size: 2,
                ..Default::default()
            },
            &Device::Cpu,
        )
        .unwrap();
        let many_steps = PerSampleIba::new(
            LayerId::Layer(3),
            &est,
            PerSampleConfig {
                optimization_steps: 10,
                batch_size: 2,
                ..Default::default()
            },
            &Device::Cpu,
        )
        .unwrap();

        let first = one_step.analyze(&model, &image, zero_loss).unwrap();
        let last = many_steps.analyze(&model, &image, zero_loss).unwrap();
        assert!(last.information_loss < first.information_loss);
    }

    #[test]
    fn test_rejects_vector_layers() {
        let model = tiny_model();
        let (_, cache) = model
            .forward_with_cache(
                &Tensor::randn(0f32, 1f32, (2, 3, 32, 32), &Device::Cpu).unwrap(),
                &[LayerId::Fc],
            )
            .unwrap();
        let mut est = WelfordEstimator::new();
        est.fit(cache.require(LayerId::Fc).unwrap()).unwrap();
        assert!(PerSampleIba::new(LayerId::Fc, &est, quick_config(), &Device::Cpu).is_err());
    }

    #[test]
    fn test_from_readout_shares_statistics() {
        let model = tiny_model();
        let readout = calibrated(&model);
        let iba = PerSampleIba::from_readout(&readout, quick_config(), &Device::Cpu).unwrap();
        assert_eq!(iba.layer(), LayerId::Layer(2));
    }
}
