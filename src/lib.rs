// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // f32→u8 pixels, usize→u32 image sizes
#![allow(clippy::cast_possible_wrap)] // u32→i32 drawing coordinates
#![allow(clippy::many_single_char_names)] // b, c, h, w standard in tensor code
#![allow(clippy::similar_names)] // related variables like `lh`/`lw`
#![allow(clippy::module_name_repetitions)] // IbaModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::unused_self)] // &self for API consistency
#![allow(clippy::trivially_copy_pass_by_ref)] // &LayerId for API consistency
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f32→usize when value is known positive

//! IBA-rs: Information Bottleneck Attribution
//!
//! Explains the predictions of convolutional image classifiers by inserting
//! a trainable stochastic bottleneck at an inner layer and measuring how much
//! information each image region must pass through it.
//!
//! ## Architecture
//!
//! - `model`: High-level IbaModel wrapper and the ClassifierBackend trait
//! - `forward_resnet`: ResNet forward pass with activation capture and replacement
//! - `hooks`: Layer identifiers and activation hooks
//! - `cache`: ActivationCache for storing layer activations
//! - `transforms`: ImageNet preprocessing and its inverse
//! - `dataset`: Image-folder datasets and the class index
//! - `loader`: Shuffled batch iteration with parallel decoding
//! - `estimator`: Welford estimation of per-unit activation statistics
//! - `bottleneck`: Noise injection, KL capacity and mask smoothing
//! - `readout`: Readout bottleneck with the restrict-flow scope guard
//! - `per_sample`: Per-image bottleneck optimization
//! - `loss`: Classification losses on logits
//! - `trainer`: Readout training loop
//! - `saliency`: Capacity to bits-per-pixel heatmaps
//! - `render`: Heatmap overlays and colorbars
//! - `experiment`: Experiment runner coordinating the full pipeline

pub mod bottleneck;
pub mod cache;
pub mod dataset;
pub mod estimator;
pub mod experiment;
pub mod forward_resnet;
pub mod hooks;
pub mod loader;
pub mod loss;
pub mod model;
pub mod per_sample;
pub mod readout;
pub mod render;
pub mod saliency;
pub mod trainer;
pub mod transforms;

pub use bottleneck::{BottleneckConfig, GaussianSmoothing};
pub use cache::ActivationCache;
pub use dataset::{load_image, ClassIndex, ImageFolder, ImageSample};
pub use estimator::{estimate_layers, LayerStats, WelfordEstimator};
pub use experiment::{Experiment, ExperimentConfig, ExperimentResults, Prediction};
pub use forward_resnet::{BlockKind, IbaResNet, ResNetConfig};
pub use hooks::{parse_layer_list, ActivationHook, LayerId};
pub use loader::{Batch, DataLoader, LoaderConfig};
pub use loss::{classification_loss, target_class_loss};
pub use model::{select_device, ClassifierBackend, IbaModel, ModelArchitecture, DEFAULT_MODEL_ID};
pub use per_sample::{PerSampleConfig, PerSampleIba};
pub use readout::{Analysis, AnalysisSummary, ReadoutBottleneck, RestrictFlow};
pub use render::{half_seismic, load_font, render_overlay, save_png, OverlayOptions};
pub use saliency::{resize_bilinear, to_saliency_map, Heatmap, HeatmapExport};
pub use trainer::{EpochStats, TrainConfig, Trainer, TrainingReport};
pub use transforms::{Preprocess, IMAGENET_MEAN, IMAGENET_STD};
