//! Named layers and activation hooks
//!
//! A classifier exposes a fixed set of tap points. A forward pass can
//! capture the activations at any of them (see [`ActivationCache`]) or
//! hand one of them to an [`ActivationHook`] that replaces the tensor
//! before the rest of the network sees it.
//!
//! [`ActivationCache`]: crate::cache::ActivationCache

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// A tap point inside a ResNet-style classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LayerId {
    /// Output of conv1 + bn1 + relu + maxpool, shape (B, C, H/4, W/4)
    Stem,
    /// Output of residual stage `layer1`..`layer4`
    Layer(usize),
    /// Global average pool, shape (B, C)
    AvgPool,
    /// Classifier logits, shape (B, n_classes)
    Fc,
}

impl LayerId {
    /// Whether the activation at this layer carries spatial dimensions
    pub fn is_spatial(&self) -> bool {
        matches!(self, LayerId::Stem | LayerId::Layer(_))
    }

    /// Position of the layer in forward order
    pub fn depth(&self) -> usize {
        match self {
            LayerId::Stem => 0,
            LayerId::Layer(i) => *i,
            LayerId::AvgPool => 5,
            LayerId::Fc => 6,
        }
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerId::Stem => write!(f, "stem"),
            LayerId::Layer(i) => write!(f, "layer{i}"),
            LayerId::AvgPool => write!(f, "avgpool"),
            LayerId::Fc => write!(f, "fc"),
        }
    }
}

impl FromStr for LayerId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "stem" | "maxpool" => Ok(LayerId::Stem),
            "avgpool" => Ok(LayerId::AvgPool),
            "fc" => Ok(LayerId::Fc),
            other => {
                let idx = other
                    .strip_prefix("layer")
                    .and_then(|n| n.parse::<usize>().ok())
                    .ok_or_else(|| anyhow::anyhow!("Unknown layer '{s}'"))?;
                anyhow::ensure!(
                    (1..=4).contains(&idx),
                    "Residual stage must be layer1..layer4, got '{s}'"
                );
                Ok(LayerId::Layer(idx))
            }
        }
    }
}

impl TryFrom<String> for LayerId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<LayerId> for String {
    fn from(layer: LayerId) -> Self {
        layer.to_string()
    }
}

/// Parse a comma-separated layer list such as `"layer2,layer3,fc"`
pub fn parse_layer_list(spec: &str) -> Result<Vec<LayerId>> {
    spec.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// Replaces the activation at a tap point during a forward pass
pub trait ActivationHook {
    fn apply(&self, layer: LayerId, activation: &Tensor) -> Result<Tensor>;
}

impl<F> ActivationHook for F
where
    F: Fn(LayerId, &Tensor) -> Result<Tensor>,
{
    fn apply(&self, layer: LayerId, activation: &Tensor) -> Result<Tensor> {
        self(layer, activation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_parse_roundtrip() {
        for name in ["stem", "layer1", "layer2", "layer3", "layer4", "avgpool", "fc"] {
            let layer: LayerId = name.parse().unwrap();
            assert_eq!(layer.to_string(), name);
        }
        assert_eq!("Layer3".parse::<LayerId>().unwrap(), LayerId::Layer(3));
    }

    #[test]
    fn test_layer_parse_rejects_unknown() {
        assert!("layer5".parse::<LayerId>().is_err());
        assert!("layer0".parse::<LayerId>().is_err());
        assert!("conv9".parse::<LayerId>().is_err());
    }

    #[test]
    fn test_parse_layer_list() {
        let layers = parse_layer_list("layer2, layer3,layer4,fc").unwrap();
        assert_eq!(
            layers,
            vec![
                LayerId::Layer(2),
                LayerId::Layer(3),
                LayerId::Layer(4),
                LayerId::Fc
            ]
        );
    }

    #[test]
    fn test_spatial_and_depth() {
        assert!(LayerId::Layer(2).is_spatial());
        assert!(!LayerId::Fc.is_spatial());
        assert!(LayerId::Layer(4).depth() < LayerId::AvgPool.depth());
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&LayerId::Layer(2)).unwrap();
        assert_eq!(json, "\"layer2\"");
        let back: LayerId = serde_json::from_str("\"fc\"").unwrap();
        assert_eq!(back, LayerId::Fc);
    }
}
