//! IbaModel wrapper around a frozen, pretrained classifier
//!
//! Exposes a unified interface for plain inference, activation capture and
//! activation replacement at named layers. The classifier's own weights are
//! never handed to an optimizer.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use safetensors::tensor::SafeTensors;
use tracing::info;

use crate::cache::ActivationCache;
use crate::forward_resnet::{BlockKind, IbaResNet, ResNetConfig};
use crate::hooks::{ActivationHook, LayerId};

/// Default pretrained classifier (torchvision ResNet-50 weights on the hub)
pub const DEFAULT_MODEL_ID: &str = "timm/resnet50.tv_in1k";

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    ResNet18,
    ResNet34,
    ResNet50,
    ResNet101,
    ResNet152,
}

impl ModelArchitecture {
    /// Parse a bare architecture name such as `resnet50`
    pub fn from_name(name: &str) -> Option<Self> {
        // "resnet-18" style ids name the same layouts
        let lower = name.to_lowercase().replace('-', "");
        // Longest names first so "resnet101" is not taken for "resnet10"
        [
            ("resnet152", ModelArchitecture::ResNet152),
            ("resnet101", ModelArchitecture::ResNet101),
            ("resnet50", ModelArchitecture::ResNet50),
            ("resnet34", ModelArchitecture::ResNet34),
            ("resnet18", ModelArchitecture::ResNet18),
        ]
        .into_iter()
        .find(|(key, _)| lower.contains(key))
        .map(|(_, arch)| arch)
    }

    /// Detect architecture from model ID
    pub fn from_model_id(model_id: &str) -> Self {
        Self::from_name(model_id).unwrap_or_else(|| {
            info!(
                "Unknown model architecture for '{}', defaulting to ResNet50",
                model_id
            );
            ModelArchitecture::ResNet50
        })
    }

    /// Infer the architecture from the tensor names of a safetensors file
    ///
    /// Counts the blocks of each residual stage and checks for `conv3`,
    /// which only bottleneck blocks have.
    pub fn detect_from_weights(bytes: &[u8]) -> Result<(Self, usize)> {
        let tensors = SafeTensors::deserialize(bytes).context("Invalid safetensors file")?;
        let names = tensors.names();

        let mut blocks = [0usize; 4];
        for (s, count) in blocks.iter_mut().enumerate() {
            let prefix = format!("layer{}.", s + 1);
            *count = names
                .iter()
                .filter_map(|n| n.strip_prefix(&prefix))
                .filter_map(|rest| rest.split('.').next()?.parse::<usize>().ok())
                .max()
                .map_or(0, |m| m + 1);
        }
        let bottleneck = names.iter().any(|n| n.contains(".conv3."));
        let num_classes = tensors
            .tensor("fc.bias")
            .context("Missing fc.bias")?
            .shape()
            .first()
            .copied()
            .unwrap_or(0);

        let arch = match (bottleneck, blocks) {
            (false, [2, 2, 2, 2]) => ModelArchitecture::ResNet18,
            (false, [3, 4, 6, 3]) => ModelArchitecture::ResNet34,
            (true, [3, 4, 6, 3]) => ModelArchitecture::ResNet50,
            (true, [3, 4, 23, 3]) => ModelArchitecture::ResNet101,
            (true, [3, 8, 36, 3]) => ModelArchitecture::ResNet152,
            other => anyhow::bail!("Unrecognised ResNet layout {other:?}"),
        };
        Ok((arch, num_classes))
    }

    pub fn block_kind(&self) -> BlockKind {
        match self {
            ModelArchitecture::ResNet18 | ModelArchitecture::ResNet34 => BlockKind::Basic,
            _ => BlockKind::Bottleneck,
        }
    }
}

/// Unified backend trait for classifier architectures.
///
/// Implementing this trait is the only requirement for plugging a new
/// classifier into the bottleneck machinery.
pub trait ClassifierBackend {
    // --- Metadata ---
    fn num_classes(&self) -> usize;
    /// All tap points in forward order
    fn layers(&self) -> Vec<LayerId>;
    /// Channel (or feature) count of the activation at `layer`
    fn layer_channels(&self, layer: LayerId) -> Result<usize>;

    // --- Forward passes ---
    fn forward_with_cache(
        &self,
        input: &Tensor,
        layers: &[LayerId],
    ) -> Result<(Tensor, ActivationCache)>;
    fn forward_with_hook(
        &self,
        input: &Tensor,
        layer: LayerId,
        hook: &dyn ActivationHook,
    ) -> Result<Tensor>;

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        Ok(self.forward_with_cache(input, &[])?.0)
    }
}

/// High-level classifier wrapper used by the bottleneck, trainer and analyzer
pub struct IbaModel {
    model: Box<dyn ClassifierBackend>,
    device: Device,
    architecture: ModelArchitecture,
    model_id: String,
}

impl IbaModel {
    /// Load a model from HuggingFace on an explicit device
    pub fn from_pretrained(model_id: &str, device: &Device) -> Result<Self> {
        info!("Loading model: {}", model_id);
        info!("Device: {:?}", device);

        let resnet = IbaResNet::load(model_id, device, DType::F32)?;
        let architecture = resnet
            .config()
            .architecture()
            .context("Loaded ResNet does not match a standard layout")?;
        Ok(Self {
            model: Box::new(resnet),
            device: device.clone(),
            architecture,
            model_id: model_id.to_string(),
        })
    }

    /// Load a ResNet from a local safetensors file, detecting its layout
    pub fn from_safetensors(path: &Path, device: &Device) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read weights {}", path.display()))?;
        let (architecture, num_classes) = ModelArchitecture::detect_from_weights(&bytes)?;
        info!(
            "Detected {:?} with {} classes in {}",
            architecture,
            num_classes,
            path.display()
        );

        let config = ResNetConfig::for_architecture(architecture, num_classes);
        let vb = VarBuilder::from_buffered_safetensors(bytes, DType::F32, device)?;
        let resnet = IbaResNet::new(config, vb)?;
        Ok(Self {
            model: Box::new(resnet),
            device: device.clone(),
            architecture,
            model_id: path.display().to_string(),
        })
    }

    /// Wrap an already constructed backend
    pub fn from_backend(
        backend: Box<dyn ClassifierBackend>,
        architecture: ModelArchitecture,
        device: &Device,
    ) -> Self {
        Self {
            model: backend,
            device: device.clone(),
            architecture,
            model_id: "custom".to_string(),
        }
    }

    pub fn architecture(&self) -> ModelArchitecture {
        self.architecture
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn num_classes(&self) -> usize {
        self.model.num_classes()
    }

    pub fn layers(&self) -> Vec<LayerId> {
        self.model.layers()
    }

    pub fn layer_channels(&self, layer: LayerId) -> Result<usize> {
        self.model.layer_channels(layer)
    }

    /// Unmodified classifier forward pass, returning logits
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.model.forward(input)
    }

    /// Forward pass that also captures activations at `layers`
    pub fn forward_with_cache(
        &self,
        input: &Tensor,
        layers: &[LayerId],
    ) -> Result<(Tensor, ActivationCache)> {
        self.model.forward_with_cache(input, layers)
    }

    /// Forward pass with the activation at `layer` replaced by `hook`
    pub fn forward_with_hook(
        &self,
        input: &Tensor,
        layer: LayerId,
        hook: &dyn ActivationHook,
    ) -> Result<Tensor> {
        self.model.forward_with_hook(input, layer, hook)
    }

    /// Spatial size of the activation at `layer` for a given input
    pub fn layer_shape(&self, input: &Tensor, layer: LayerId) -> Result<Vec<usize>> {
        let (_, cache) = self.forward_with_cache(input, &[layer])?;
        Ok(cache.require(layer)?.dims().to_vec())
    }

    /// Top-k class predictions (index, probability) for a single image
    pub fn predict_top_k(&self, image: &Tensor, k: usize) -> Result<Vec<(usize, f32)>> {
        let input = if image.rank() == 3 {
            image.unsqueeze(0)?
        } else {
            image.clone()
        };
        let logits = self.forward(&input.to_device(&self.device)?)?;
        let probs = candle_nn::ops::softmax_last_dim(&logits)?;
        let probs: Vec<f32> = probs.get(0)?.to_vec1()?;

        let mut ranked: Vec<(usize, f32)> = probs.into_iter().enumerate().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(k);
        Ok(ranked)
    }
}

/// Pick the compute device from a spec such as `cpu`, `cuda` or `cuda:1`
///
/// `None` tries CUDA device 0 and falls back to CPU.
pub fn select_device(spec: Option<&str>) -> Result<Device> {
    match spec.map(|s| s.trim().to_lowercase()) {
        Some(s) if s == "cpu" => {
            info!("Forcing CPU mode");
            Ok(Device::Cpu)
        }
        Some(s) if s.starts_with("cuda") => {
            let ordinal = match s.strip_prefix("cuda").unwrap_or("") {
                "" => 0,
                rest => rest
                    .trim_start_matches(':')
                    .parse::<usize>()
                    .with_context(|| format!("Invalid CUDA ordinal in '{s}'"))?,
            };
            info!("Using CUDA device {}", ordinal);
            Ok(Device::new_cuda(ordinal)?)
        }
        Some(other) => anyhow::bail!("Unknown device '{other}' (expected cpu, cuda or cuda:N)"),
        None => match Device::cuda_if_available(0) {
            Ok(dev) if dev.is_cuda() => {
                info!("Using CUDA device");
                Ok(dev)
            }
            _ => {
                info!("CUDA not available, using CPU");
                Ok(Device::Cpu)
            }
        },
    }
}
