//! Bottleneck training
//!
//! Only the readout network is optimized. The classifier runs inside the
//! restrict-flow scope for the whole training run, and its weights are
//! never passed to the optimizer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::loader::DataLoader;
use crate::loss::classification_loss;
use crate::model::IbaModel;
use crate::readout::ReadoutBottleneck;

/// Training hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub lr: f64,
    /// Weight of the information loss
    pub beta: f64,
    /// Log every n steps at debug level (0 disables)
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 5,
            lr: 1e-5,
            beta: 10.0,
            log_every: 50,
        }
    }
}

/// Loss averages over one epoch
#[derive(Debug, Clone, Serialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub steps: usize,
    pub samples: usize,
    pub loss: f32,
    pub model_loss: f32,
    pub information_loss: f32,
    pub seconds: f64,
}

/// Outcome of [`Trainer::train`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainingReport {
    pub epochs: Vec<EpochStats>,
    pub total_steps: usize,
    /// Stopped through the stop flag before the last epoch finished
    pub interrupted: bool,
}

impl TrainingReport {
    pub fn last(&self) -> Option<&EpochStats> {
        self.epochs.last()
    }
}

#[derive(Default)]
struct Accumulator {
    steps: usize,
    samples: usize,
    loss: f64,
    model_loss: f64,
    information_loss: f64,
}

impl Accumulator {
    fn finish(&self, epoch: usize, seconds: f64) -> EpochStats {
        let n = self.steps.max(1) as f64;
        EpochStats {
            epoch,
            steps: self.steps,
            samples: self.samples,
            loss: (self.loss / n) as f32,
            model_loss: (self.model_loss / n) as f32,
            information_loss: (self.information_loss / n) as f32,
            seconds,
        }
    }
}

/// Optimizes a [`ReadoutBottleneck`] against `task_loss + beta * information_loss`
pub struct Trainer {
    config: TrainConfig,
    stop: Arc<AtomicBool>,
}

impl Trainer {
    pub fn new(config: TrainConfig) -> Self {
        Self {
            config,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an existing stop flag (e.g. one set from a signal handler)
    pub fn with_stop_flag(config: TrainConfig, stop: Arc<AtomicBool>) -> Self {
        Self { config, stop }
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Setting this flag stops training before the next step
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Train for `config.epochs` epochs or until the stop flag is set
    ///
    /// Updates applied before an interruption are kept.
    pub fn train(
        &self,
        bottleneck: &ReadoutBottleneck,
        model: &IbaModel,
        loader: &DataLoader,
        progress: bool,
    ) -> Result<TrainingReport> {
        self.train_with(bottleneck, model, loader, progress, |_| {})
    }

    /// [`Trainer::train`], calling `after_step` with the total step count
    /// after every optimizer step
    fn train_with<F>(
        &self,
        bottleneck: &ReadoutBottleneck,
        model: &IbaModel,
        loader: &DataLoader,
        progress: bool,
        mut after_step: F,
    ) -> Result<TrainingReport>
    where
        F: FnMut(usize),
    {
        anyhow::ensure!(
            bottleneck.is_estimated(),
            "Bottleneck statistics are not estimated; call estimate() before training"
        );
        anyhow::ensure!(!loader.dataset().is_empty(), "Training dataset is empty");

        let params = ParamsAdamW {
            lr: self.config.lr,
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut optimizer = AdamW::new(bottleneck.parameters(), params)?;
        let device = model.device();
        let beta = self.config.beta;

        info!(
            "Training bottleneck at {}: {} epochs, lr {}, beta {}",
            bottleneck.target(),
            self.config.epochs,
            self.config.lr,
            beta
        );

        let _flow = bottleneck.restrict_flow();
        let mut report = TrainingReport::default();

        'epochs: for epoch in 0..self.config.epochs {
            let started = Instant::now();
            let bar = if progress {
                let bar = ProgressBar::new(loader.n_batches() as u64);
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("{msg} [{elapsed_precise}] [{wide_bar}] {pos}/{len} {prefix}")?
                        .progress_chars("#>-"),
                );
                bar.set_message(format!("Epoch {}/{}", epoch + 1, self.config.epochs));
                bar
            } else {
                ProgressBar::hidden()
            };

            let mut acc = Accumulator::default();
            for batch in loader.iter(epoch as u64) {
                if self.should_stop() {
                    bar.abandon_with_message("Interrupted");
                    report.interrupted = true;
                    if acc.steps > 0 {
                        report
                            .epochs
                            .push(acc.finish(epoch, started.elapsed().as_secs_f64()));
                    }
                    break 'epochs;
                }

                let batch = batch?;
                let (images, labels) = batch.to_device(device)?;

                let logits = bottleneck.forward(model, &images)?;
                let model_loss = classification_loss(&logits, &labels)?;
                let information_loss = bottleneck.information_loss()?;
                let loss = (&model_loss + (&information_loss * beta)?)?;
                optimizer.backward_step(&loss)?;

                let loss_value = loss.to_scalar::<f32>()?;
                if !loss_value.is_finite() {
                    warn!("Non-finite loss at epoch {} step {}", epoch, acc.steps);
                }
                acc.steps += 1;
                acc.samples += batch.len();
                acc.loss += loss_value as f64;
                acc.model_loss += model_loss.to_scalar::<f32>()? as f64;
                acc.information_loss += information_loss.to_scalar::<f32>()? as f64;
                report.total_steps += 1;
                after_step(report.total_steps);

                bar.inc(1);
                bar.set_prefix(format!("loss {loss_value:.4}"));
                if self.config.log_every > 0 && report.total_steps % self.config.log_every == 0 {
                    debug!(
                        "step {}: loss {:.4} (model {:.4}, info {:.4})",
                        report.total_steps,
                        loss_value,
                        acc.model_loss / acc.steps as f64,
                        acc.information_loss / acc.steps as f64
                    );
                }
            }

            let stats = acc.finish(epoch, started.elapsed().as_secs_f64());
            bar.finish_and_clear();
            info!(
                "Epoch {}: loss {:.4}, model loss {:.4}, information loss {:.4} ({} steps, {:.1}s)",
                epoch + 1,
                stats.loss,
                stats.model_loss,
                stats.information_loss,
                stats.steps,
                stats.seconds
            );
            report.epochs.push(stats);
        }

        if report.interrupted {
            info!("Training interrupted after {} steps", report.total_steps);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bottleneck::BottleneckConfig;
    use crate::hooks::LayerId;
    use crate::loader::tests::noise_loader;
    use crate::readout::tests::tiny_model;
    use candle_core::Tensor;

    fn snapshot(iba: &ReadoutBottleneck) -> Vec<Vec<f32>> {
        iba.named_parameters()
            .unwrap()
            .into_iter()
            .map(|(_, v)| v.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
            .collect()
    }

    fn bottleneck(model: &IbaModel) -> ReadoutBottleneck {
        ReadoutBottleneck::new(
            model,
            LayerId::Layer(2),
            &[LayerId::Layer(2), LayerId::Layer(3), LayerId::Fc],
            BottleneckConfig::default(),
        )
        .unwrap()
    }

    fn fast_config() -> TrainConfig {
        TrainConfig {
            epochs: 1,
            lr: 1e-2,
            ..Default::default()
        }
    }

    fn probe_logits(model: &IbaModel) -> Vec<Vec<f32>> {
        let x = Tensor::ones((1, 3, 32, 32), candle_core::DType::F32, model.device()).unwrap();
        model.forward(&x).unwrap().to_vec2().unwrap()
    }

    #[test]
    fn test_training_requires_estimation() {
        let dir = tempfile::tempdir().unwrap();
        let loader = noise_loader(dir.path(), 3, 32, 2);
        let model = tiny_model();
        let iba = bottleneck(&model);
        let before = snapshot(&iba);
        let logits_before = probe_logits(&model);

        let result = Trainer::new(fast_config()).train(&iba, &model, &loader, false);
        assert!(result.is_err());
        assert_eq!(snapshot(&iba), before);
        assert_eq!(probe_logits(&model), logits_before);
        assert!(!iba.is_active());
    }

    #[test]
    fn test_training_updates_only_the_readout() {
        let dir = tempfile::tempdir().unwrap();
        let loader = noise_loader(dir.path(), 4, 32, 4);
        let model = tiny_model();
        let mut iba = bottleneck(&model);
        iba.estimate(&model, &loader, 8, false).unwrap();

        let params_before = snapshot(&iba);
        let logits_before = probe_logits(&model);

        let report = Trainer::new(fast_config())
            .train(&iba, &model, &loader, false)
            .unwrap();

        assert!(!report.interrupted);
        assert_eq!(report.epochs.len(), 1);
        assert_eq!(report.total_steps, 2);
        assert_eq!(report.last().unwrap().samples, 8);
        assert!(report.last().unwrap().information_loss >= 0.0);

        assert_ne!(snapshot(&iba), params_before);
        assert_eq!(probe_logits(&model), logits_before);
        assert!(!iba.is_active());
    }

    #[test]
    fn test_interruption_keeps_completed_updates() {
        let dir = tempfile::tempdir().unwrap();
        let loader = noise_loader(dir.path(), 4, 32, 4);
        let model = tiny_model();
        let mut iba = bottleneck(&model);
        iba.estimate(&model, &loader, 8, false).unwrap();

        let trainer = Trainer::new(fast_config());
        trainer.train(&iba, &model, &loader, false).unwrap();
        let trained = snapshot(&iba);

        trainer.stop_flag().store(true, Ordering::Relaxed);
        let report = trainer.train(&iba, &model, &loader, false).unwrap();
        assert!(report.interrupted);
        assert_eq!(report.total_steps, 0);
        assert!(report.epochs.is_empty());
        assert_eq!(snapshot(&iba), trained);
    }

    #[test]
    fn test_stop_mid_epoch_keeps_first_step() {
        let dir = tempfile::tempdir().unwrap();
        let loader = noise_loader(dir.path(), 4, 32, 2);
        let model = tiny_model();
        let mut iba = bottleneck(&model);
        iba.estimate(&model, &loader, 8, false).unwrap();
        let params_before = snapshot(&iba);

        let trainer = Trainer::new(TrainConfig {
            epochs: 3,
            ..fast_config()
        });
        let stop = trainer.stop_flag();
        let report = trainer
            .train_with(&iba, &model, &loader, false, |step| {
                if step == 1 {
                    stop.store(true, Ordering::SeqCst);
                }
            })
            .unwrap();

        assert!(report.interrupted);
        assert_eq!(report.total_steps, 1);
        assert_eq!(report.epochs.len(), 1);
        assert_eq!(report.epochs[0].steps, 1);
        assert_eq!(report.epochs[0].samples, 2);
        assert_ne!(snapshot(&iba), params_before);
        assert!(!iba.is_active());
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: TrainConfig = serde_json::from_str(r#"{"epochs": 2}"#).unwrap();
        assert_eq!(config.epochs, 2);
        assert_eq!(config.beta, 10.0);
    }
}
