//! Task losses on classifier logits

use anyhow::Result;
use candle_core::{DType, Tensor, D};

/// Mean negative log-likelihood of `labels` under `softmax(logits)`
///
/// `logits`: `(B, num_classes)`, `labels`: `(B,)` of integer class indices.
pub fn classification_loss(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let labels = labels.to_device(logits.device())?.to_dtype(DType::U32)?;
    Ok(candle_nn::loss::nll(&log_probs, &labels)?)
}

/// Loss closure that explains one target class for every row of a batch
pub fn target_class_loss(target: usize) -> impl Fn(&Tensor) -> Result<Tensor> {
    move |logits: &Tensor| {
        let (batch, num_classes) = logits.dims2()?;
        anyhow::ensure!(
            target < num_classes,
            "Target class {target} out of range for {num_classes} classes"
        );
        let labels = Tensor::full(target as u32, batch, logits.device())?;
        classification_loss(logits, &labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_uniform_logits() {
        let logits = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0u32, 1, 3], &Device::Cpu).unwrap();
        let loss: f32 = classification_loss(&logits, &labels)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_confident_prediction_has_low_loss() {
        let logits = Tensor::new(&[[10f32, 0., 0.]], &Device::Cpu).unwrap();
        let right: f32 = target_class_loss(0)(&logits).unwrap().to_scalar().unwrap();
        let wrong: f32 = target_class_loss(2)(&logits).unwrap().to_scalar().unwrap();
        assert!(right < 1e-3);
        assert!(wrong > 9.0);
    }

    #[test]
    fn test_label_out_of_range_fails() {
        let logits = Tensor::zeros((1, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(target_class_loss(5)(&logits).is_err());
    }
}
