//! Activation cache for storing intermediate classifier states

use std::collections::BTreeMap;

use anyhow::Result;
use candle_core::Tensor;

use crate::hooks::LayerId;

/// Stores activations captured during a forward pass, keyed by layer
#[derive(Debug, Default, Clone)]
pub struct ActivationCache {
    activations: BTreeMap<LayerId, Tensor>,
}

impl ActivationCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a layer's activation, replacing any previous one
    pub fn insert(&mut self, layer: LayerId, tensor: Tensor) {
        self.activations.insert(layer, tensor);
    }

    /// Get activation for a specific layer
    pub fn get_layer(&self, layer: LayerId) -> Option<&Tensor> {
        self.activations.get(&layer)
    }

    /// Get activation for a layer, failing if it was not captured
    pub fn require(&self, layer: LayerId) -> Result<&Tensor> {
        self.activations
            .get(&layer)
            .ok_or_else(|| anyhow::anyhow!("Layer {layer} not in cache"))
    }

    /// Number of cached layers
    pub fn n_layers(&self) -> usize {
        self.activations.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    /// Cached layers in forward order
    pub fn layers(&self) -> impl Iterator<Item = LayerId> + '_ {
        self.activations.keys().copied()
    }

    /// Detach every cached tensor from the autodiff graph
    pub fn detached(&self) -> Self {
        Self {
            activations: self
                .activations
                .iter()
                .map(|(layer, t)| (*layer, t.detach()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_cache_basic() {
        let device = Device::Cpu;
        let t1 = Tensor::zeros((2, 8, 4, 4), DType::F32, &device).unwrap();
        let t2 = Tensor::zeros((2, 10), DType::F32, &device).unwrap();

        let mut cache = ActivationCache::new();
        assert!(cache.is_empty());
        cache.insert(LayerId::Fc, t2);
        cache.insert(LayerId::Layer(2), t1);

        assert_eq!(cache.n_layers(), 2);
        assert!(cache.get_layer(LayerId::Layer(2)).is_some());
        assert!(cache.get_layer(LayerId::Layer(3)).is_none());
        assert!(cache.require(LayerId::Stem).is_err());

        let order: Vec<LayerId> = cache.layers().collect();
        assert_eq!(order, vec![LayerId::Layer(2), LayerId::Fc]);
    }
}
