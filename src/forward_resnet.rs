//! ResNet forward pass with named tap points
//!
//! Custom implementation that runs stage-by-stage so that activations at
//! `stem`, `layer1`..`layer4`, `avgpool` and `fc` can be captured or
//! replaced by an [`ActivationHook`].
//!
//! Weight names follow the torchvision / timm layout:
//! - `conv1.weight`, `bn1.{weight,bias,running_mean,running_var}`
//! - `layer{s}.{b}.conv{1,2,3}.weight`, `layer{s}.{b}.bn{1,2,3}.*`
//! - `layer{s}.{b}.downsample.0.weight`, `layer{s}.{b}.downsample.1.*`
//! - `fc.weight`, `fc.bias`
//!
//! Batch norm always runs in inference mode with its running statistics
//! folded into a per-channel scale and shift.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{conv2d_no_bias, linear, Conv2d, Conv2dConfig, Init, Linear, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::info;

use crate::cache::ActivationCache;
use crate::hooks::{ActivationHook, LayerId};
use crate::model::{ClassifierBackend, ModelArchitecture};

const BN_EPS: f64 = 1e-5;

/// Residual block flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Two 3x3 convolutions (ResNet-18/34)
    Basic,
    /// 1x1 -> 3x3 -> 1x1 with 4x expansion (ResNet-50 and deeper)
    Bottleneck,
}

impl BlockKind {
    pub fn expansion(&self) -> usize {
        match self {
            BlockKind::Basic => 1,
            BlockKind::Bottleneck => 4,
        }
    }
}

/// Structural configuration of a ResNet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResNetConfig {
    pub block: BlockKind,
    /// Number of blocks in `layer1`..`layer4`
    pub layers: [usize; 4],
    /// Channel count of the stem and of `layer1`'s inner convolutions
    pub base_width: usize,
    pub num_classes: usize,
}

impl ResNetConfig {
    pub fn resnet18(num_classes: usize) -> Self {
        Self {
            block: BlockKind::Basic,
            layers: [2, 2, 2, 2],
            base_width: 64,
            num_classes,
        }
    }

    pub fn resnet34(num_classes: usize) -> Self {
        Self {
            block: BlockKind::Basic,
            layers: [3, 4, 6, 3],
            base_width: 64,
            num_classes,
        }
    }

    pub fn resnet50(num_classes: usize) -> Self {
        Self {
            block: BlockKind::Bottleneck,
            layers: [3, 4, 6, 3],
            base_width: 64,
            num_classes,
        }
    }

    pub fn resnet101(num_classes: usize) -> Self {
        Self {
            block: BlockKind::Bottleneck,
            layers: [3, 4, 23, 3],
            base_width: 64,
            num_classes,
        }
    }

    pub fn resnet152(num_classes: usize) -> Self {
        Self {
            block: BlockKind::Bottleneck,
            layers: [3, 8, 36, 3],
            base_width: 64,
            num_classes,
        }
    }

    /// Configuration for a given architecture
    pub fn for_architecture(arch: ModelArchitecture, num_classes: usize) -> Self {
        match arch {
            ModelArchitecture::ResNet18 => Self::resnet18(num_classes),
            ModelArchitecture::ResNet34 => Self::resnet34(num_classes),
            ModelArchitecture::ResNet50 => Self::resnet50(num_classes),
            ModelArchitecture::ResNet101 => Self::resnet101(num_classes),
            ModelArchitecture::ResNet152 => Self::resnet152(num_classes),
        }
    }

    /// Standard architecture with this block layout, if any
    pub fn architecture(&self) -> Option<ModelArchitecture> {
        [
            ModelArchitecture::ResNet18,
            ModelArchitecture::ResNet34,
            ModelArchitecture::ResNet50,
            ModelArchitecture::ResNet101,
            ModelArchitecture::ResNet152,
        ]
        .into_iter()
        .find(|arch| {
            let standard = Self::for_architecture(*arch, self.num_classes);
            standard.block == self.block
                && standard.layers == self.layers
                && standard.base_width == self.base_width
        })
    }

    /// Output channels of residual stage `stage` (1-based)
    pub fn stage_channels(&self, stage: usize) -> usize {
        self.base_width * (1 << (stage - 1)) * self.block.expansion()
    }
}

/// Subset of timm's `config.json` that matters for loading
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TimmConfig {
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
}

fn default_num_classes() -> usize {
    1000
}

/// Batch norm in inference mode, folded to `x * scale + shift`
struct FrozenBatchNorm {
    scale: Tensor,
    shift: Tensor,
}

impl FrozenBatchNorm {
    fn load(channels: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(channels, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(channels, "bias", Init::Const(0.0))?;
        let running_mean = vb.get_with_hints(channels, "running_mean", Init::Const(0.0))?;
        let running_var = vb.get_with_hints(channels, "running_var", Init::Const(1.0))?;

        let scale = (weight / (running_var + BN_EPS)?.sqrt()?)?;
        let shift = (bias - (running_mean * &scale)?)?;

        Ok(Self {
            scale: scale.reshape((1, channels, 1, 1))?.detach(),
            shift: shift.reshape((1, channels, 1, 1))?.detach(),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.broadcast_mul(&self.scale)?.broadcast_add(&self.shift)?)
    }
}

/// Convolution followed by frozen batch norm
struct ConvBn {
    conv: Conv2d,
    bn: FrozenBatchNorm,
}

impl ConvBn {
    #[allow(clippy::too_many_arguments)]
    fn load(
        in_c: usize,
        out_c: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        conv_vb: VarBuilder,
        bn_vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding,
            stride,
            ..Default::default()
        };
        let conv = conv2d_no_bias(in_c, out_c, kernel, cfg, conv_vb)?;
        let bn = FrozenBatchNorm::load(out_c, bn_vb)?;
        Ok(Self { conv, bn })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.bn.forward(&self.conv.forward(x)?)
    }
}

/// A residual block (basic or bottleneck) with optional projection shortcut
struct ResidualBlock {
    convs: Vec<ConvBn>,
    downsample: Option<ConvBn>,
}

impl ResidualBlock {
    fn load(
        kind: BlockKind,
        in_c: usize,
        planes: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let out_c = planes * kind.expansion();
        let convs = match kind {
            BlockKind::Basic => vec![
                ConvBn::load(in_c, planes, 3, stride, 1, vb.pp("conv1"), vb.pp("bn1"))?,
                ConvBn::load(planes, planes, 3, 1, 1, vb.pp("conv2"), vb.pp("bn2"))?,
            ],
            BlockKind::Bottleneck => vec![
                ConvBn::load(in_c, planes, 1, 1, 0, vb.pp("conv1"), vb.pp("bn1"))?,
                ConvBn::load(planes, planes, 3, stride, 1, vb.pp("conv2"), vb.pp("bn2"))?,
                ConvBn::load(planes, out_c, 1, 1, 0, vb.pp("conv3"), vb.pp("bn3"))?,
            ],
        };

        let downsample = if stride != 1 || in_c != out_c {
            let ds = vb.pp("downsample");
            Some(ConvBn::load(in_c, out_c, 1, stride, 0, ds.pp("0"), ds.pp("1"))?)
        } else {
            None
        };

        Ok(Self { convs, downsample })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = x.clone();
        let last = self.convs.len() - 1;
        for (i, conv) in self.convs.iter().enumerate() {
            h = conv.forward(&h)?;
            if i != last {
                h = h.relu()?;
            }
        }
        let shortcut = match &self.downsample {
            Some(ds) => ds.forward(x)?,
            None => x.clone(),
        };
        Ok((h + shortcut)?.relu()?)
    }
}

/// ResNet classifier with per-stage activation capture
pub struct IbaResNet {
    stem: ConvBn,
    stages: Vec<Vec<ResidualBlock>>,
    fc: Linear,
    config: ResNetConfig,
}

impl IbaResNet {
    /// Build the network from a VarBuilder (safetensors or VarMap backed)
    pub fn new(config: ResNetConfig, vb: VarBuilder) -> Result<Self> {
        let width = config.base_width;
        let stem = ConvBn::load(3, width, 7, 2, 3, vb.pp("conv1"), vb.pp("bn1"))?;

        let mut stages = Vec::with_capacity(4);
        let mut in_c = width;
        for (s, &n_blocks) in config.layers.iter().enumerate() {
            let planes = width * (1 << s);
            let stride = if s == 0 { 1 } else { 2 };
            let stage_vb = vb.pp(format!("layer{}", s + 1));
            let mut blocks = Vec::with_capacity(n_blocks);
            for b in 0..n_blocks {
                let block_stride = if b == 0 { stride } else { 1 };
                blocks.push(ResidualBlock::load(
                    config.block,
                    in_c,
                    planes,
                    block_stride,
                    stage_vb.pp(b.to_string()),
                )?);
                in_c = planes * config.block.expansion();
            }
            stages.push(blocks);
        }

        let fc = linear(in_c, config.num_classes, vb.pp("fc"))?;

        Ok(Self {
            stem,
            stages,
            fc,
            config,
        })
    }

    /// Load a ResNet from HuggingFace (timm / torchvision weight layout)
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading ResNet from: {}", model_id);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let timm_config = match repo.get("config.json") {
            Ok(path) => {
                let config_str =
                    std::fs::read_to_string(&path).context("Failed to read config")?;
                serde_json::from_str::<TimmConfig>(&config_str)?
            }
            Err(_) => TimmConfig {
                architecture: None,
                num_classes: default_num_classes(),
            },
        };

        let architecture = timm_config
            .architecture
            .as_deref()
            .and_then(ModelArchitecture::from_name)
            .unwrap_or_else(|| ModelArchitecture::from_model_id(model_id));

        let weights_path = repo
            .get("model.safetensors")
            .context("Failed to download model.safetensors")?;

        let config = ResNetConfig::for_architecture(architecture, timm_config.num_classes);
        info!(
            "ResNet config: {:?}, blocks={:?}, classes={}",
            architecture, config.layers, config.num_classes
        );

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, device)? };
        Self::new(config, vb)
    }

    pub fn config(&self) -> &ResNetConfig {
        &self.config
    }

    fn stem_forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.stem.forward(x)?.relu()?;
        // 3x3/2 max pool with one pixel of padding
        let h = h
            .pad_with_same(D::Minus1, 1, 1)?
            .pad_with_same(D::Minus2, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;
        Ok(h)
    }

    /// Run the network, applying `hook` at its layer and capturing `capture`
    fn run(
        &self,
        x: &Tensor,
        capture: &[LayerId],
        hook: Option<(LayerId, &dyn ActivationHook)>,
    ) -> Result<(Tensor, ActivationCache)> {
        let (_b, c, _h, _w) = x.dims4()?;
        anyhow::ensure!(c == 3, "Expected RGB input (B, 3, H, W), got {c} channels");

        let mut cache = ActivationCache::new();
        let tap = |layer: LayerId, t: Tensor, cache: &mut ActivationCache| -> Result<Tensor> {
            let t = match hook {
                Some((target, h)) if target == layer => {
                    let replaced = h.apply(layer, &t)?;
                    anyhow::ensure!(
                        replaced.dims() == t.dims(),
                        "Hook at {layer} changed shape {:?} -> {:?}",
                        t.dims(),
                        replaced.dims()
                    );
                    replaced
                }
                _ => t,
            };
            if capture.contains(&layer) {
                cache.insert(layer, t.clone());
            }
            Ok(t)
        };

        let mut h = tap(LayerId::Stem, self.stem_forward(x)?, &mut cache)?;
        for (s, blocks) in self.stages.iter().enumerate() {
            for block in blocks {
                h = block.forward(&h)?;
            }
            h = tap(LayerId::Layer(s + 1), h, &mut cache)?;
        }
        let pooled = tap(LayerId::AvgPool, h.mean((2, 3))?, &mut cache)?;
        let logits = tap(LayerId::Fc, self.fc.forward(&pooled)?, &mut cache)?;

        Ok((logits, cache))
    }
}

impl ClassifierBackend for IbaResNet {
    fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    fn layers(&self) -> Vec<LayerId> {
        let mut layers = vec![LayerId::Stem];
        layers.extend((1..=4).map(LayerId::Layer));
        layers.push(LayerId::AvgPool);
        layers.push(LayerId::Fc);
        layers
    }

    fn layer_channels(&self, layer: LayerId) -> Result<usize> {
        Ok(match layer {
            LayerId::Stem => self.config.base_width,
            LayerId::Layer(s) => {
                anyhow::ensure!((1..=4).contains(&s), "No residual stage layer{s}");
                self.config.stage_channels(s)
            }
            LayerId::AvgPool => self.config.stage_channels(4),
            LayerId::Fc => self.config.num_classes,
        })
    }

    fn forward_with_cache(
        &self,
        input: &Tensor,
        layers: &[LayerId],
    ) -> Result<(Tensor, ActivationCache)> {
        self.run(input, layers, None)
    }

    fn forward_with_hook(
        &self,
        input: &Tensor,
        layer: LayerId,
        hook: &dyn ActivationHook,
    ) -> Result<Tensor> {
        Ok(self.run(input, &[], Some((layer, hook)))?.0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_nn::VarMap;

    /// Small randomly initialised ResNet used across unit tests
    pub(crate) fn tiny_resnet(num_classes: usize) -> (IbaResNet, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = ResNetConfig {
            block: BlockKind::Basic,
            layers: [1, 1, 1, 1],
            base_width: 4,
            num_classes,
        };
        let model = IbaResNet::new(config, vb).unwrap();
        (model, varmap)
    }

    #[test]
    fn test_stage_channels() {
        let r50 = ResNetConfig::resnet50(1000);
        assert_eq!(r50.stage_channels(1), 256);
        assert_eq!(r50.stage_channels(2), 512);
        assert_eq!(r50.stage_channels(4), 2048);

        let r18 = ResNetConfig::resnet18(1000);
        assert_eq!(r18.stage_channels(2), 128);
    }

    #[test]
    fn test_forward_shapes() {
        let (model, _vm) = tiny_resnet(5);
        let x = Tensor::randn(0f32, 1f32, (2, 3, 32, 32), &Device::Cpu).unwrap();
        let layers = model.layers();
        let (logits, cache) = model.forward_with_cache(&x, &layers).unwrap();

        assert_eq!(logits.dims(), &[2, 5]);
        assert_eq!(cache.n_layers(), 7);
        assert_eq!(cache.get_layer(LayerId::Stem).unwrap().dims(), &[2, 4, 8, 8]);
        assert_eq!(
            cache.get_layer(LayerId::Layer(2)).unwrap().dims(),
            &[2, 8, 4, 4]
        );
        assert_eq!(
            cache.get_layer(LayerId::Layer(4)).unwrap().dims(),
            &[2, 32, 1, 1]
        );
        assert_eq!(cache.get_layer(LayerId::AvgPool).unwrap().dims(), &[2, 32]);
        assert_eq!(model.layer_channels(LayerId::Layer(3)).unwrap(), 16);
    }

    #[test]
    fn test_identity_hook_is_noop() {
        let (model, _vm) = tiny_resnet(3);
        let x = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu).unwrap();
        let plain = model.forward(&x).unwrap();
        let identity = |_: LayerId, t: &Tensor| -> Result<Tensor> { Ok(t.clone()) };
        let hooked = model
            .forward_with_hook(&x, LayerId::Layer(2), &identity)
            .unwrap();

        let a: Vec<Vec<f32>> = plain.to_vec2().unwrap();
        let b: Vec<Vec<f32>> = hooked.to_vec2().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_hook_changes_output() {
        let (model, _vm) = tiny_resnet(3);
        let x = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu).unwrap();
        let plain = model.forward(&x).unwrap();
        let zero = |_: LayerId, t: &Tensor| -> Result<Tensor> { Ok(t.zeros_like()?) };
        let hooked = model.forward_with_hook(&x, LayerId::Layer(4), &zero).unwrap();

        // With layer4 zeroed the logits collapse to the fc bias
        let bias: Vec<f32> = model.fc.bias().unwrap().to_vec1().unwrap();
        let out: Vec<f32> = hooked.squeeze(0).unwrap().to_vec1().unwrap();
        for (o, b) in out.iter().zip(bias.iter()) {
            assert!((o - b).abs() < 1e-6);
        }
        let diff = (plain - hooked).unwrap().abs().unwrap().sum_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() > 0.0);
    }

    #[test]
    fn test_hook_shape_change_is_rejected() {
        let (model, _vm) = tiny_resnet(3);
        let x = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu).unwrap();
        let shrink = |_: LayerId, t: &Tensor| -> Result<Tensor> { Ok(t.narrow(1, 0, 1)?) };
        assert!(model
            .forward_with_hook(&x, LayerId::Layer(1), &shrink)
            .is_err());
    }

    #[test]
    fn test_rejects_non_rgb_input() {
        let (model, _vm) = tiny_resnet(3);
        let x = Tensor::zeros((1, 1, 32, 32), DType::F32, &Device::Cpu).unwrap();
        assert!(model.forward(&x).is_err());
    }
}
