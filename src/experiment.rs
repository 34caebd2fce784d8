//! Experiment runner for readout-bottleneck attribution
//!
//! Coordinates dataset loading, statistics estimation, training, and the
//! analysis and rendering of one image.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::Tensor;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bottleneck::BottleneckConfig;
use crate::dataset::{load_image, ClassIndex, ImageFolder};
use crate::hooks::LayerId;
use crate::loader::{DataLoader, LoaderConfig};
use crate::loss::target_class_loss;
use crate::model::{IbaModel, DEFAULT_MODEL_ID};
use crate::readout::{Analysis, AnalysisSummary, ReadoutBottleneck};
use crate::render::{load_font, render_overlay, save_png, OverlayOptions};
use crate::saliency::HeatmapExport;
use crate::trainer::{TrainConfig, Trainer, TrainingReport};
use crate::transforms::Preprocess;

/// Configuration for an attribution experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// HuggingFace model id, ignored when `weights` is set
    pub model_id: String,
    /// Local safetensors weights
    pub weights: Option<PathBuf>,
    /// Dataset root with `train` and `validation` image folders
    pub data_root: PathBuf,
    /// Class-index JSON; class directories are then WordNet ids
    pub class_index: Option<PathBuf>,
    /// Image to explain; the first validation image when unset
    pub image: Option<PathBuf>,
    /// Class to explain; the top-1 prediction when unset
    pub target_class: Option<usize>,
    pub target_layer: LayerId,
    pub readout_layers: Vec<LayerId>,
    /// Samples drawn for the statistics estimate
    pub estimation_samples: usize,
    pub preprocess: Preprocess,
    pub loader: LoaderConfig,
    pub train: TrainConfig,
    pub bottleneck: BottleneckConfig,
    pub overlay: OverlayOptions,
    pub output_dir: PathBuf,
    /// Restore a trained bottleneck instead of estimating and training
    pub load_checkpoint: Option<PathBuf>,
    pub save_checkpoint: Option<PathBuf>,
    /// Font for heatmap labels
    pub font: Option<PathBuf>,
    pub progress: bool,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            weights: None,
            data_root: PathBuf::from("imagenet"),
            class_index: None,
            image: None,
            target_class: None,
            target_layer: LayerId::Layer(2),
            readout_layers: vec![
                LayerId::Layer(2),
                LayerId::Layer(3),
                LayerId::Layer(4),
                LayerId::Fc,
            ],
            estimation_samples: 1000,
            preprocess: Preprocess::default(),
            loader: LoaderConfig::default(),
            train: TrainConfig::default(),
            bottleneck: BottleneckConfig::default(),
            overlay: OverlayOptions::default(),
            output_dir: PathBuf::from("outputs"),
            load_checkpoint: None,
            save_checkpoint: None,
            font: None,
            progress: true,
        }
    }
}

impl ExperimentConfig {
    /// Load from JSON; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid experiment config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn train_dir(&self) -> PathBuf {
        self.data_root.join("train")
    }

    pub fn validation_dir(&self) -> PathBuf {
        self.data_root.join("validation")
    }
}

/// A ranked class prediction
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub class: usize,
    pub name: Option<String>,
    pub probability: f32,
}

/// Results from a full experiment
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentResults {
    pub model_id: String,
    pub image: PathBuf,
    pub target_class: usize,
    pub target_name: Option<String>,
    pub predictions: Vec<Prediction>,
    pub analysis: AnalysisSummary,
    /// `None` when the bottleneck came from a checkpoint
    pub training: Option<TrainingReport>,
    pub heatmap_png: PathBuf,
    pub heatmap_json: PathBuf,
}

/// Main experiment runner
pub struct Experiment {
    config: ExperimentConfig,
    model: IbaModel,
    stop: Arc<AtomicBool>,
}

impl Experiment {
    pub fn new(model: IbaModel, config: ExperimentConfig) -> Self {
        Self {
            config,
            model,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn model(&self) -> &IbaModel {
        &self.model
    }

    /// Setting this flag ends training early; the experiment then continues
    /// with the partially trained bottleneck
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    fn class_index(&self) -> Result<Option<ClassIndex>> {
        self.config
            .class_index
            .as_deref()
            .map(ClassIndex::load)
            .transpose()
    }

    fn load_folder(&self, root: &Path, class_index: Option<&ClassIndex>) -> Result<ImageFolder> {
        let preprocess = self.config.preprocess.clone();
        match class_index {
            Some(index) => ImageFolder::load_with_class_index(root, preprocess, index),
            None => ImageFolder::load(root, preprocess),
        }
    }

    /// Build the bottleneck and either restore it or estimate and train it
    pub fn prepare_bottleneck(
        &self,
        class_index: Option<&ClassIndex>,
    ) -> Result<(ReadoutBottleneck, Option<TrainingReport>)> {
        let mut bottleneck = ReadoutBottleneck::new(
            &self.model,
            self.config.target_layer,
            &self.config.readout_layers,
            self.config.bottleneck.clone(),
        )?;

        if let Some(path) = &self.config.load_checkpoint {
            bottleneck.load(path)?;
            return Ok((bottleneck, None));
        }

        let train = Arc::new(self.load_folder(&self.config.train_dir(), class_index)?);
        anyhow::ensure!(
            !train.is_empty(),
            "No training images under {}",
            self.config.train_dir().display()
        );
        let loader = DataLoader::new(train, self.config.loader.clone())?;

        bottleneck.estimate(
            &self.model,
            &loader,
            self.config.estimation_samples,
            self.config.progress,
        )?;
        let trainer = Trainer::with_stop_flag(self.config.train.clone(), self.stop_flag());
        let report = trainer.train(&bottleneck, &self.model, &loader, self.config.progress)?;

        if let Some(path) = &self.config.save_checkpoint {
            bottleneck.save(path)?;
        }
        Ok((bottleneck, Some(report)))
    }

    /// The configured image, or the first validation image
    fn pick_image(&self, class_index: Option<&ClassIndex>) -> Result<PathBuf> {
        if let Some(path) = &self.config.image {
            return Ok(path.clone());
        }
        let validation = self.load_folder(&self.config.validation_dir(), class_index)?;
        validation
            .samples()
            .first()
            .map(|s| s.path.clone())
            .context("No image given and the validation folder is empty")
    }

    /// Analyze one preprocessed image and render its overlay
    pub fn explain(
        &self,
        bottleneck: &ReadoutBottleneck,
        image: &Tensor,
        target_class: usize,
        label: Option<&str>,
    ) -> Result<(Analysis, RgbaImage)> {
        anyhow::ensure!(
            target_class < self.model.num_classes(),
            "Target class {} out of range for {} classes",
            target_class,
            self.model.num_classes()
        );
        let analysis = bottleneck.analyze(&self.model, image, target_class_loss(target_class))?;

        let font = match &self.config.font {
            Some(path) => Some(load_font(path)?),
            None => None,
        };
        let underlay = self.config.preprocess.to_image(image)?;
        let overlay = render_overlay(
            &analysis.heatmap,
            Some(&underlay),
            label,
            font.as_ref(),
            &self.config.overlay,
        )?;
        Ok((analysis, overlay))
    }

    /// Run the full pipeline
    pub fn run(&mut self) -> Result<ExperimentResults> {
        info!("Starting IBA experiment");
        info!("Config: {:?}", self.config);

        let class_index = self.class_index()?;
        if let Some(index) = &class_index {
            info!("Class index: {} classes", index.len());
            if index.len() != self.model.num_classes() {
                warn!(
                    "Class index has {} entries but the model predicts {} classes",
                    index.len(),
                    self.model.num_classes()
                );
            }
        }
        let name_of = |class: usize| {
            class_index
                .as_ref()
                .and_then(|index| index.name(class))
                .map(str::to_string)
        };

        let (bottleneck, training) = self.prepare_bottleneck(class_index.as_ref())?;

        let image_path = self.pick_image(class_index.as_ref())?;
        info!("Explaining {}", image_path.display());
        let image = load_image(&image_path, &self.config.preprocess)?;

        let predictions: Vec<Prediction> = self
            .model
            .predict_top_k(&image, 5)?
            .into_iter()
            .map(|(class, probability)| Prediction {
                class,
                name: name_of(class),
                probability,
            })
            .collect();
        let target_class = match self.config.target_class {
            Some(class) => class,
            None => predictions
                .first()
                .map(|p| p.class)
                .context("Model produced no predictions")?,
        };
        let target_name = name_of(target_class);
        let label = target_name
            .clone()
            .unwrap_or_else(|| format!("class {target_class}"));

        let (analysis, overlay) = self.explain(&bottleneck, &image, target_class, Some(&label))?;
        info!(
            "Heatmap for {}: {:.2} bits total, max {:.4} bits/pixel",
            label,
            analysis.heatmap.total(),
            analysis.heatmap.max()
        );

        std::fs::create_dir_all(&self.config.output_dir)?;
        let heatmap_png = self.config.output_dir.join("heatmap.png");
        save_png(&overlay, &heatmap_png)?;
        let heatmap_json = self.config.output_dir.join("heatmap.json");
        std::fs::write(
            &heatmap_json,
            serde_json::to_string(&HeatmapExport::from(&analysis.heatmap))?,
        )?;

        let results = ExperimentResults {
            model_id: self.model.model_id().to_string(),
            image: image_path,
            target_class,
            target_name,
            predictions,
            analysis: analysis.summary(),
            training,
            heatmap_png,
            heatmap_json,
        };
        let summary_path = self.config.output_dir.join("summary.json");
        std::fs::write(&summary_path, serde_json::to_string_pretty(&results)?)?;
        info!("Results saved to {}", summary_path.display());

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ExperimentConfig::default();
        assert_eq!(config.model_id, "timm/resnet50.tv_in1k");
        assert_eq!(config.target_layer, LayerId::Layer(2));
        assert_eq!(config.readout_layers.len(), 4);
        assert_eq!(config.estimation_samples, 1000);
        assert_eq!(config.train.epochs, 5);
        assert_eq!(config.loader.batch_size, 16);
        assert_eq!(config.train_dir(), PathBuf::from("imagenet/train"));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = ExperimentConfig {
            readout_layers: vec![LayerId::Layer(3), LayerId::AvgPool],
            target_class: Some(7),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = ExperimentConfig::load(&path).unwrap();
        assert_eq!(loaded.readout_layers, config.readout_layers);
        assert_eq!(loaded.target_class, Some(7));
        assert!(std::fs::read_to_string(&path).unwrap().contains("\"avgpool\""));
    }

    #[test]
    fn test_partial_config() {
        let config: ExperimentConfig = serde_json::from_str(
            r#"{"target_layer": "layer3", "train": {"epochs": 1}, "loader": {"workers": 1}}"#,
        )
        .unwrap();
        assert_eq!(config.target_layer, LayerId::Layer(3));
        assert_eq!(config.train.epochs, 1);
        assert_eq!(config.train.lr, 1e-5);
        assert_eq!(config.loader.workers, 1);
        assert_eq!(config.loader.batch_size, 16);

        let bad: Result<ExperimentConfig, _> =
            serde_json::from_str(r#"{"target_layer": "layer9"}"#);
        assert!(bad.is_err());
    }
}
