//! Readout bottleneck: a trainable network predicts the suppression mask
//!
//! ## Mechanism
//!
//! Inside a [`RestrictFlow`] scope, [`ReadoutBottleneck::forward`] runs the
//! classifier twice:
//!
//! 1. A clean pass captures the readout layers. Each readout activation is
//!    normalized by its estimated statistics and brought to the target
//!    layer's spatial size (nearest-neighbour resize for feature maps,
//!    broadcast for vectors such as `avgpool` or `fc`).
//! 2. The concatenated readouts go through three 1x1 convolutions that
//!    output alpha, one value per target unit. `lambda = sigmoid(alpha)`,
//!    smoothed, gates the target activation and the rest of the network
//!    runs on the restricted activation.
//!
//! Outside a scope, `forward` is the unmodified classifier.
//!
//! ## Example
//!
//! ```ignore
//! use iba_rs::{LayerId, ReadoutBottleneck, BottleneckConfig};
//!
//! let mut iba = ReadoutBottleneck::new(
//!     &model,
//!     LayerId::Layer(2),
//!     &[LayerId::Layer(2), LayerId::Layer(3), LayerId::Layer(4), LayerId::Fc],
//!     BottleneckConfig::default(),
//! )?;
//! iba.estimate(&model, &loader, 1000, true)?;
//!
//! {
//!     let _flow = iba.restrict_flow();
//!     let logits = iba.forward(&model, &images)?;
//!     let info_loss = iba.information_loss()?;
//! }
//! ```

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Conv2d, Conv2dConfig, Init, VarBuilder, VarMap};
use serde::Serialize;
use tracing::{debug, info};

use crate::bottleneck::{
    kl_capacity, mask_from_alpha, mean_capacity, restrict, smoothing_from_config,
    BottleneckConfig, GaussianSmoothing,
};
use crate::estimator::{estimate_layers, LayerStats, WelfordEstimator};
use crate::hooks::LayerId;
use crate::loader::DataLoader;
use crate::model::IbaModel;
use crate::saliency::{to_saliency_map, Heatmap};

/// Bias of the last readout convolution: the untrained mask starts almost
/// fully open (`sigmoid(5) ~ 0.993`)
const INITIAL_ALPHA_BIAS: f64 = 5.0;
/// Scale of the last readout convolution's initial weights
const INITIAL_WEIGHT_SCALE: f64 = 1e-3;
/// Checkpoint entry holding the layer depth codes
const LAYERS_KEY: &str = "layers";

/// Three 1x1 convolutions: `in -> in/2 -> in/4 -> out`
struct ReadoutNet {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
}

impl ReadoutNet {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let hidden1 = (in_channels / 2).max(1);
        let hidden2 = (in_channels / 4).max(1);
        let cfg = Conv2dConfig::default();

        let conv1 = candle_nn::conv2d(in_channels, hidden1, 1, cfg, vb.pp("conv1"))?;
        let conv2 = candle_nn::conv2d(hidden1, hidden2, 1, cfg, vb.pp("conv2"))?;

        // Default conv init, scaled down
        let bound = INITIAL_WEIGHT_SCALE / (hidden2 as f64).sqrt();
        let weight = vb.pp("conv3").get_with_hints(
            (out_channels, hidden2, 1, 1),
            "weight",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let bias = vb.pp("conv3").get_with_hints(
            out_channels,
            "bias",
            Init::Const(INITIAL_ALPHA_BIAS),
        )?;
        let conv3 = Conv2d::new(weight, Some(bias), cfg);

        Ok(Self {
            conv1,
            conv2,
            conv3,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.conv1.forward(x)?.relu()?;
        let h = self.conv2.forward(&h)?.relu()?;
        Ok(self.conv3.forward(&h)?)
    }
}

/// Statistics of the target and every readout layer
#[derive(Debug, Clone)]
struct Calibration {
    target: LayerStats,
    readouts: Vec<LayerStats>,
}

/// Output of a single-image analysis
#[derive(Debug, Clone)]
pub struct Analysis {
    pub heatmap: Heatmap,
    /// Value of the caller's loss on the restricted output (mean over noise samples)
    pub model_loss: f32,
    /// Mean capacity in nats
    pub information_loss: f32,
}

/// Serializable summary of an [`Analysis`]
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSummary {
    pub height: usize,
    pub width: usize,
    pub total_bits: f32,
    pub max_bits_per_pixel: f32,
    pub model_loss: f32,
    pub information_loss: f32,
}

impl Analysis {
    pub fn summary(&self) -> AnalysisSummary {
        AnalysisSummary {
            height: self.heatmap.height(),
            width: self.heatmap.width(),
            total_bits: self.heatmap.total(),
            max_bits_per_pixel: self.heatmap.max(),
            model_loss: self.model_loss,
            information_loss: self.information_loss,
        }
    }
}

/// Guard for the restricted-flow scope; gating stops when the last guard drops
pub struct RestrictFlow<'a> {
    bottleneck: &'a ReadoutBottleneck,
}

impl Drop for RestrictFlow<'_> {
    fn drop(&mut self) {
        let depth = self.bottleneck.scopes.get();
        self.bottleneck.scopes.set(depth.saturating_sub(1));
        if depth <= 1 {
            debug!("Bottleneck at {} disabled", self.bottleneck.target);
        }
    }
}

/// Trainable bottleneck whose mask is read out from several layers
pub struct ReadoutBottleneck {
    target: LayerId,
    readout_layers: Vec<LayerId>,
    config: BottleneckConfig,
    varmap: VarMap,
    net: ReadoutNet,
    smoothing: Option<GaussianSmoothing>,
    estimators: Vec<WelfordEstimator>,
    calibration: Option<Calibration>,
    scopes: Cell<usize>,
    capacity: RefCell<Option<Tensor>>,
    alpha: RefCell<Option<Tensor>>,
    device: Device,
}

impl ReadoutBottleneck {
    /// Attach a bottleneck at `target`, reading out from `readout_layers`
    pub fn new(
        model: &IbaModel,
        target: LayerId,
        readout_layers: &[LayerId],
        config: BottleneckConfig,
    ) -> Result<Self> {
        anyhow::ensure!(
            target.is_spatial(),
            "Bottleneck target must be a feature map, got {target}"
        );
        anyhow::ensure!(!readout_layers.is_empty(), "At least one readout layer is required");
        let mut seen = Vec::with_capacity(readout_layers.len());
        for layer in readout_layers {
            anyhow::ensure!(!seen.contains(layer), "Readout layer {layer} listed twice");
            seen.push(*layer);
        }

        let device = model.device().clone();
        let in_channels = readout_layers
            .iter()
            .map(|l| model.layer_channels(*l))
            .sum::<Result<usize>>()?;
        let out_channels = model.layer_channels(target)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let net = ReadoutNet::new(in_channels, out_channels, vb)?;
        let smoothing = smoothing_from_config(&config, &device)?;

        info!(
            "Readout bottleneck at {} from {:?}: {} -> {} channels",
            target, readout_layers, in_channels, out_channels
        );

        Ok(Self {
            target,
            readout_layers: readout_layers.to_vec(),
            config,
            varmap,
            net,
            smoothing,
            estimators: Vec::new(),
            calibration: None,
            scopes: Cell::new(0),
            capacity: RefCell::new(None),
            alpha: RefCell::new(None),
            device,
        })
    }

    pub fn target(&self) -> LayerId {
        self.target
    }

    pub fn readout_layers(&self) -> &[LayerId] {
        &self.readout_layers
    }

    pub fn config(&self) -> &BottleneckConfig {
        &self.config
    }

    /// Layers whose statistics are estimated: the target, then each readout
    fn estimated_layers(&self) -> Vec<LayerId> {
        let mut layers = vec![self.target];
        layers.extend(self.readout_layers.iter().copied());
        layers
    }

    /// Estimate activation statistics for the target and readout layers
    pub fn estimate(
        &mut self,
        model: &IbaModel,
        loader: &DataLoader,
        n_samples: usize,
        progress: bool,
    ) -> Result<()> {
        let layers = self.estimated_layers();
        let estimators = estimate_layers(model, loader, &layers, n_samples, progress)?;
        self.set_estimators(estimators)
    }

    fn set_estimators(&mut self, estimators: Vec<WelfordEstimator>) -> Result<()> {
        self.calibration = Some(self.calibrate(&estimators)?);
        self.estimators = estimators;
        Ok(())
    }

    fn calibrate(&self, estimators: &[WelfordEstimator]) -> Result<Calibration> {
        anyhow::ensure!(
            estimators.len() == self.readout_layers.len() + 1,
            "Expected {} estimators, got {}",
            self.readout_layers.len() + 1,
            estimators.len()
        );
        let stats = |est: &WelfordEstimator| {
            LayerStats::from_estimator(
                est,
                self.config.min_std,
                self.config.active_neurons_threshold,
                &self.device,
            )
        };
        let target = stats(&estimators[0])?;
        let readouts = estimators[1..]
            .iter()
            .map(stats)
            .collect::<Result<Vec<_>>>()?;
        Ok(Calibration { target, readouts })
    }

    /// Depth codes of the target followed by the ordered readouts
    fn layer_codes(&self) -> Vec<u32> {
        self.estimated_layers()
            .iter()
            .map(|layer| layer.depth() as u32)
            .collect()
    }

    /// Whether [`ReadoutBottleneck::estimate`] has run
    pub fn is_estimated(&self) -> bool {
        self.calibration.is_some()
    }

    /// Estimator of the target layer (shared with per-sample analysis)
    pub fn target_estimator(&self) -> Option<&WelfordEstimator> {
        self.estimators.first()
    }

    fn calibration(&self) -> Result<&Calibration> {
        self.calibration.as_ref().context(
            "Bottleneck statistics are not estimated; call estimate() before training or analysis",
        )
    }

    /// Enable gating until the returned guard is dropped
    pub fn restrict_flow(&self) -> RestrictFlow<'_> {
        let depth = self.scopes.get();
        if depth == 0 {
            debug!("Bottleneck at {} enabled", self.target);
        }
        self.scopes.set(depth + 1);
        RestrictFlow { bottleneck: self }
    }

    /// Whether a restrict-flow scope is active
    pub fn is_active(&self) -> bool {
        self.scopes.get() > 0
    }

    /// Trainable parameters of the readout network
    pub fn parameters(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Readout parameters sorted by name
    pub fn named_parameters(&self) -> Result<Vec<(String, Var)>> {
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Readout parameters lock poisoned"))?;
        let mut named: Vec<(String, Var)> =
            vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(named)
    }

    /// Classifier forward pass, gated when inside a restrict-flow scope
    pub fn forward(&self, model: &IbaModel, input: &Tensor) -> Result<Tensor> {
        if !self.is_active() {
            return model.forward(input);
        }
        let calibration = self.calibration()?;

        let (_, cache) = model.forward_with_cache(input, &self.readout_layers)?;
        let cache = cache.detached();
        let readouts = self
            .readout_layers
            .iter()
            .zip(calibration.readouts.iter())
            .map(|(layer, stats)| stats.normalize(cache.require(*layer)?))
            .collect::<Result<Vec<_>>>()?;

        let hook = |_layer: LayerId, r: &Tensor| -> Result<Tensor> {
            let (b, _c, h, w) = r.dims4()?;
            anyhow::ensure!(
                &r.dims()[1..] == calibration.target.mean.dims(),
                "Activation {:?} at {} does not match the estimated shape {:?}; \
                 inputs must have the size used for estimation",
                r.dims(),
                self.target,
                calibration.target.mean.dims()
            );
            let aligned = readouts
                .iter()
                .map(|f| align_readout(f, b, h, w))
                .collect::<Result<Vec<_>>>()?;
            let features = Tensor::cat(&aligned, 1)?;

            let alpha = self.net.forward(&features)?;
            let lambda = mask_from_alpha(&alpha, self.smoothing.as_ref())?;
            let capacity = kl_capacity(r, &lambda, &calibration.target)?;
            let z = restrict(r, &lambda, &calibration.target, self.config.relu)?;

            self.capacity.replace(Some(capacity));
            self.alpha.replace(Some(alpha));
            Ok(z)
        };
        model.forward_with_hook(input, self.target, &hook)
    }

    /// Per-unit capacity of the last restricted forward, `(B, C, H, W)` in nats
    pub fn capacity(&self) -> Option<Tensor> {
        self.capacity.borrow().clone()
    }

    /// Alpha produced by the last restricted forward
    pub fn alpha(&self) -> Option<Tensor> {
        self.alpha.borrow().clone()
    }

    /// Mean capacity of the last restricted forward (scalar tensor, differentiable)
    pub fn information_loss(&self) -> Result<Tensor> {
        let capacity = self.capacity.borrow();
        let capacity = capacity
            .as_ref()
            .context("No capacity recorded; run forward() inside restrict_flow() first")?;
        Ok(capacity.mean_all()?)
    }

    /// Heatmap for one image `(3, H, W)` or `(1, 3, H, W)`
    ///
    /// The image is replicated `analysis_samples` times so the capacity is
    /// averaged over independent noise draws.
    pub fn analyze<F>(&self, model: &IbaModel, image: &Tensor, loss_fn: F) -> Result<Analysis>
    where
        F: Fn(&Tensor) -> Result<Tensor>,
    {
        self.calibration()?;
        let single = single_image(image)?.to_device(&self.device)?;
        let (_, _, h, w) = single.dims4()?;
        let batch = single.repeat((self.config.analysis_samples.max(1), 1, 1, 1))?;

        let (model_loss, information_loss, capacity) = {
            let _flow = self.restrict_flow();
            let logits = self.forward(model, &batch)?;
            let loss = loss_fn(&logits)?.detach();
            let info_loss = self.information_loss()?.detach();
            let capacity = self.capacity().context("Bottleneck recorded no capacity")?;
            (loss, info_loss, capacity.detach())
        };

        let saliency = to_saliency_map(&mean_capacity(&capacity)?, Some((h, w)));
        Ok(Analysis {
            heatmap: Heatmap::new(saliency),
            model_loss: model_loss.mean_all()?.to_scalar::<f32>()?,
            information_loss: information_loss.to_scalar::<f32>()?,
        })
    }

    /// Save readout weights and estimator state to one safetensors file
    ///
    /// The target and the ordered readout layers are stored under `layers`.
    pub fn save(&self, path: &Path) -> Result<()> {
        anyhow::ensure!(
            self.is_estimated(),
            "Refusing to save a bottleneck without estimated statistics"
        );
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        {
            let vars = self
                .varmap
                .data()
                .lock()
                .map_err(|_| anyhow::anyhow!("Readout parameters lock poisoned"))?;
            for (name, var) in vars.iter() {
                tensors.insert(format!("readout.{name}"), var.as_tensor().clone());
            }
        }
        for (layer, est) in self.estimated_layers().iter().zip(self.estimators.iter()) {
            tensors.extend(est.state_dict(&format!("stats.{layer}"))?);
        }
        let codes = self.layer_codes();
        tensors.insert(
            LAYERS_KEY.to_string(),
            Tensor::from_vec(codes.clone(), codes.len(), &Device::Cpu)?,
        );
        candle_core::safetensors::save(&tensors, path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Saved bottleneck to {}", path.display());
        Ok(())
    }

    /// Restore a bottleneck saved with [`ReadoutBottleneck::save`]
    ///
    /// The target and readout layers, in order, must match the ones used when
    /// saving. Nothing is modified unless the whole checkpoint is valid.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let tensors = candle_core::safetensors::load(path, &self.device)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let saved_codes = tensors
            .get(LAYERS_KEY)
            .with_context(|| format!("Checkpoint is missing '{LAYERS_KEY}'"))?
            .to_dtype(DType::U32)?
            .to_vec1::<u32>()?;
        anyhow::ensure!(
            saved_codes == self.layer_codes(),
            "Checkpoint layers {saved_codes:?} do not match bottleneck layers {:?} \
             (target {} with readouts {:?})",
            self.layer_codes(),
            self.target,
            self.readout_layers
        );

        let mut updates = Vec::new();
        {
            let vars = self
                .varmap
                .data()
                .lock()
                .map_err(|_| anyhow::anyhow!("Readout parameters lock poisoned"))?;
            for (name, var) in vars.iter() {
                let key = format!("readout.{name}");
                let saved = tensors
                    .get(&key)
                    .with_context(|| format!("Checkpoint is missing '{key}'"))?;
                anyhow::ensure!(
                    saved.dims() == var.dims(),
                    "Shape mismatch for '{key}': checkpoint {:?}, bottleneck {:?}",
                    saved.dims(),
                    var.dims()
                );
                updates.push((var.clone(), saved.to_dtype(var.dtype())?));
            }
        }
        let estimators = self
            .estimated_layers()
            .iter()
            .map(|layer| {
                WelfordEstimator::load_state_dict(&tensors, &format!("stats.{layer}"), &self.device)
            })
            .collect::<Result<Vec<_>>>()?;
        let calibration = self.calibrate(&estimators)?;

        for (var, value) in &updates {
            var.set(value)?;
        }
        self.calibration = Some(calibration);
        self.estimators = estimators;
        info!("Loaded bottleneck from {}", path.display());
        Ok(())
    }
}

/// Bring a normalized readout to `(b, C, h, w)`
fn align_readout(feature: &Tensor, b: usize, h: usize, w: usize) -> Result<Tensor> {
    match feature.rank() {
        4 => {
            let (_, _, fh, fw) = feature.dims4()?;
            if (fh, fw) == (h, w) {
                Ok(feature.clone())
            } else {
                Ok(feature.upsample_nearest2d(h, w)?)
            }
        }
        2 => {
            let (_, c) = feature.dims2()?;
            Ok(feature
                .reshape((b, c, 1, 1))?
                .broadcast_as((b, c, h, w))?
                .contiguous()?)
        }
        r => anyhow::bail!("Unsupported readout rank {r}"),
    }
}

/// Accept `(3, H, W)` or `(1, 3, H, W)` and return `(1, 3, H, W)`
pub(crate) fn single_image(image: &Tensor) -> Result<Tensor> {
    match image.rank() {
        3 => Ok(image.unsqueeze(0)?),
        4 => {
            anyhow::ensure!(
                image.dim(0)? == 1,
                "Analysis takes a single image, got a batch of {}",
                image.dim(0)?
            );
            Ok(image.clone())
        }
        r => anyhow::bail!("Expected an image tensor of rank 3 or 4, got rank {r}"),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::forward_resnet::tests::tiny_resnet;
    use crate::loss::target_class_loss;
    use crate::model::ModelArchitecture;

    pub(crate) fn tiny_model() -> IbaModel {
        let (resnet, _vm) = tiny_resnet(4);
        IbaModel::from_backend(Box::new(resnet), ModelArchitecture::ResNet18, &Device::Cpu)
    }

    /// Bottleneck calibrated on random inputs without a data loader
    pub(crate) fn calibrated(model: &IbaModel) -> ReadoutBottleneck {
        let mut iba = ReadoutBottleneck::new(
            model,
            LayerId::Layer(2),
            &[LayerId::Layer(2), LayerId::Layer(3), LayerId::Fc],
            BottleneckConfig::default(),
        )
        .unwrap();
        let layers = iba.estimated_layers();
        let mut estimators = vec![WelfordEstimator::new(); layers.len()];
        for _ in 0..3 {
            let x = Tensor::randn(0f32, 1f32, (4, 3, 32, 32), &Device::Cpu).unwrap();
            let (_, cache) = model.forward_with_cache(&x, &layers).unwrap();
            for (layer, est) in layers.iter().zip(estimators.iter_mut()) {
                est.fit(cache.require(*layer).unwrap()).unwrap();
            }
        }
        iba.set_estimators(estimators).unwrap();
        iba
    }

    #[test]
    fn test_rejects_non_spatial_target() {
        let model = tiny_model();
        let result = ReadoutBottleneck::new(
            &model,
            LayerId::Fc,
            &[LayerId::Fc],
            BottleneckConfig::default(),
        );
        assert!(result.is_err());
        let result = ReadoutBottleneck::new(
            &model,
            LayerId::Layer(2),
            &[LayerId::Layer(3), LayerId::Layer(3)],
            BottleneckConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_guard_scoping() {
        let model = tiny_model();
        let iba = calibrated(&model);
        assert!(!iba.is_active());
        {
            let _outer = iba.restrict_flow();
            assert!(iba.is_active());
            {
                let _inner = iba.restrict_flow();
                assert!(iba.is_active());
            }
            assert!(iba.is_active());
        }
        assert!(!iba.is_active());
    }

    #[test]
    fn test_guard_released_on_error() {
        let model = tiny_model();
        let iba = calibrated(&model);
        let bad = Tensor::zeros((1, 1, 32, 32), DType::F32, &Device::Cpu).unwrap();
        let run = || -> Result<Tensor> {
            let _flow = iba.restrict_flow();
            iba.forward(&model, &bad)
        };
        assert!(run().is_err());
        assert!(!iba.is_active());
    }

    #[test]
    fn test_outside_scope_is_bit_identical() {
        let model = tiny_model();
        let iba = calibrated(&model);
        let x = Tensor::randn(0f32, 1f32, (2, 3, 32, 32), &Device::Cpu).unwrap();

        let plain: Vec<Vec<f32>> = model.forward(&x).unwrap().to_vec2().unwrap();
        let gated: Vec<Vec<f32>> = {
            let _flow = iba.restrict_flow();
            iba.forward(&model, &x).unwrap().to_vec2().unwrap()
        };
        let after: Vec<Vec<f32>> = iba.forward(&model, &x).unwrap().to_vec2().unwrap();

        assert_eq!(plain, after);
        assert_ne!(plain, gated);
    }

    #[test]
    fn test_forward_requires_estimation() {
        let model = tiny_model();
        let iba = ReadoutBottleneck::new(
            &model,
            LayerId::Layer(2),
            &[LayerId::Layer(3)],
            BottleneckConfig::default(),
        )
        .unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu).unwrap();

        // Outside the scope the classifier still runs
        assert!(iba.forward(&model, &x).is_ok());
        let _flow = iba.restrict_flow();
        assert!(iba.forward(&model, &x).is_err());
        assert!(iba.information_loss().is_err());
    }

    #[test]
    fn test_capacity_shape_and_sign() {
        let model = tiny_model();
        let iba = calibrated(&model);
        let x = Tensor::randn(0f32, 1f32, (3, 3, 32, 32), &Device::Cpu).unwrap();
        {
            let _flow = iba.restrict_flow();
            iba.forward(&model, &x).unwrap();
        }
        let capacity = iba.capacity().unwrap();
        assert_eq!(capacity.dims(), &[3, 8, 4, 4]);
        assert_eq!(iba.alpha().unwrap().dims(), &[3, 8, 4, 4]);
        let loss: f32 = iba.information_loss().unwrap().to_scalar().unwrap();
        assert!(loss >= 0.0);
    }

    #[test]
    fn test_initial_mask_is_open() {
        let model = tiny_model();
        let iba = calibrated(&model);
        let x = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu).unwrap();
        {
            let _flow = iba.restrict_flow();
            iba.forward(&model, &x).unwrap();
        }
        let alpha = iba.alpha().unwrap();
        let min: f32 = alpha.min_all().unwrap().to_scalar().unwrap();
        assert!(min > 4.0, "initial alpha should sit near the bias, got {min}");
    }

    #[test]
    fn test_analyze_heatmap_matches_input() {
        let model = tiny_model();
        let iba = calibrated(&model);
        let image = Tensor::randn(0f32, 1f32, (3, 32, 32), &Device::Cpu).unwrap();
        let analysis = iba
            .analyze(&model, &image, target_class_loss(1))
            .unwrap();
        assert_eq!(analysis.heatmap.height(), 32);
        assert_eq!(analysis.heatmap.width(), 32);
        assert!(analysis.information_loss >= 0.0);
        assert!(!iba.is_active());

        let summary = analysis.summary();
        assert_eq!((summary.height, summary.width), (32, 32));
    }

    #[test]
    fn test_analyze_rejects_batches() {
        let model = tiny_model();
        let iba = calibrated(&model);
        let images = Tensor::randn(0f32, 1f32, (2, 3, 32, 32), &Device::Cpu).unwrap();
        assert!(iba.analyze(&model, &images, target_class_loss(0)).is_err());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let model = tiny_model();
        let iba = calibrated(&model);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iba.safetensors");
        iba.save(&path).unwrap();

        let mut restored = ReadoutBottleneck::new(
            &model,
            LayerId::Layer(2),
            &[LayerId::Layer(2), LayerId::Layer(3), LayerId::Fc],
            BottleneckConfig::default(),
        )
        .unwrap();
        assert!(!restored.is_estimated());
        restored.load(&path).unwrap();
        assert!(restored.is_estimated());

        let x = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu).unwrap();
        let alpha_a = {
            let _flow = iba.restrict_flow();
            iba.forward(&model, &x).unwrap();
            iba.alpha().unwrap()
        };
        let alpha_b = {
            let _flow = restored.restrict_flow();
            restored.forward(&model, &x).unwrap();
            restored.alpha().unwrap()
        };
        let diff: f32 = (alpha_a - alpha_b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_load_rejects_mismatched_layers() {
        let model = tiny_model();
        let iba = calibrated(&model);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iba.safetensors");
        iba.save(&path).unwrap();

        let mut other = ReadoutBottleneck::new(
            &model,
            LayerId::Layer(2),
            &[LayerId::Layer(4)],
            BottleneckConfig::default(),
        )
        .unwrap();
        assert!(other.load(&path).is_err());
    }
    fn alpha_for(iba: &ReadoutBottleneck, model: &IbaModel, x: &Tensor) -> Tensor {
        let _flow = iba.restrict_flow();
        iba.forward(model, x).unwrap();
        iba.alpha().unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn test_load_rejects_reordered_readouts() {
        let model = tiny_model();
        let iba = calibrated(&model);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iba.safetensors");
        iba.save(&path).unwrap();

        // Same channel total, different concatenation order
        let mut reordered = ReadoutBottleneck::new(
            &model,
            LayerId::Layer(2),
            &[LayerId::Layer(3), LayerId::Layer(2), LayerId::Fc],
            BottleneckConfig::default(),
        )
        .unwrap();
        let err = reordered.load(&path).unwrap_err();
        assert!(err.to_string().contains("do not match"), "{err}");
        assert!(!reordered.is_estimated());
    }

    #[test]
    fn test_failed_load_leaves_bottleneck_unchanged() {
        let model = tiny_model();
        let source = calibrated(&model);
        let mut iba = calibrated(&model);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iba.safetensors");
        source.save(&path).unwrap();

        let mut tensors = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
        tensors.remove("stats.fc.m").unwrap();
        let broken = dir.path().join("broken.safetensors");
        candle_core::safetensors::save(&tensors, &broken).unwrap();

        let x = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu).unwrap();
        let before = alpha_for(&iba, &model, &x);
        assert!(max_abs_diff(&before, &alpha_for(&source, &model, &x)) > 0.0);

        assert!(iba.load(&broken).is_err());
        assert!(iba.is_estimated());
        let after = alpha_for(&iba, &model, &x);
        assert_eq!(max_abs_diff(&before, &after), 0.0);
    }
}

