//! IBA-rs CLI: Information Bottleneck Attribution

use anyhow::{Context, Result};
use clap::Parser;
use iba_rs::{parse_layer_list, select_device, Experiment, ExperimentConfig, IbaModel, LayerId};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "iba-rs")]
#[command(about = "Information Bottleneck Attribution for image classifiers")]
#[command(version)]
struct Cli {
    /// JSON experiment config; command-line flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model ID from `HuggingFace` (e.g., "timm/resnet50.tv_in1k")
    #[arg(short, long)]
    model: Option<String>,

    /// Local safetensors weights (architecture detected from tensor names)
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Dataset root containing `train` and `validation` image folders
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// Class-index JSON mapping class indices to [wnid, name]
    #[arg(long)]
    class_index: Option<PathBuf>,

    /// Image to explain (default: first validation image)
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Class to explain (default: top-1 prediction)
    #[arg(long)]
    target_class: Option<usize>,

    /// Layer carrying the bottleneck
    #[arg(long)]
    layer: Option<LayerId>,

    /// Comma-separated readout layers, e.g. "layer2,layer3,layer4,fc"
    #[arg(long)]
    readouts: Option<String>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Image decoding threads
    #[arg(long)]
    workers: Option<usize>,

    /// Samples used to estimate activation statistics
    #[arg(long)]
    estimation_samples: Option<usize>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,

    /// Weight of the information loss
    #[arg(long)]
    beta: Option<f64>,

    /// Shuffling seed
    #[arg(long)]
    seed: Option<u64>,

    /// Output directory for the heatmap and summary
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Save the trained bottleneck to this safetensors file
    #[arg(long)]
    save_checkpoint: Option<PathBuf>,

    /// Skip estimation and training, restoring the bottleneck from this file
    #[arg(long)]
    load_checkpoint: Option<PathBuf>,

    /// TrueType font for heatmap labels
    #[arg(long)]
    font: Option<PathBuf>,

    /// Compute device: cpu, cuda or cuda:N
    #[arg(long, env = "IBA_DEVICE")]
    device: Option<String>,

    /// Force CPU mode (overrides --device)
    #[arg(long)]
    cpu: bool,

    /// Hide progress bars
    #[arg(long)]
    no_progress: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn experiment_config(&self) -> Result<ExperimentConfig> {
        let mut config = match &self.config {
            Some(path) => ExperimentConfig::load(path)?,
            None => ExperimentConfig::default(),
        };

        if let Some(model) = &self.model {
            config.model_id = model.clone();
        }
        if let Some(weights) = &self.weights {
            config.weights = Some(weights.clone());
        }
        if let Some(data) = &self.data {
            config.data_root = data.clone();
        }
        if let Some(path) = &self.class_index {
            config.class_index = Some(path.clone());
        }
        if let Some(image) = &self.image {
            config.image = Some(image.clone());
        }
        if let Some(class) = self.target_class {
            config.target_class = Some(class);
        }
        if let Some(layer) = self.layer {
            config.target_layer = layer;
        }
        if let Some(readouts) = &self.readouts {
            config.readout_layers = parse_layer_list(readouts)?;
        }
        if let Some(batch_size) = self.batch_size {
            config.loader.batch_size = batch_size;
        }
        if let Some(workers) = self.workers {
            config.loader.workers = workers;
        }
        if let Some(n) = self.estimation_samples {
            config.estimation_samples = n;
        }
        if let Some(epochs) = self.epochs {
            config.train.epochs = epochs;
        }
        if let Some(lr) = self.lr {
            config.train.lr = lr;
        }
        if let Some(beta) = self.beta {
            config.train.beta = beta;
        }
        if let Some(seed) = self.seed {
            config.loader.seed = seed;
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if let Some(path) = &self.save_checkpoint {
            config.save_checkpoint = Some(path.clone());
        }
        if let Some(path) = &self.load_checkpoint {
            config.load_checkpoint = Some(path.clone());
        }
        if let Some(font) = &self.font {
            config.font = Some(font.clone());
        }
        if self.no_progress {
            config.progress = false;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = cli.experiment_config()?;
    let device = if cli.cpu {
        select_device(Some("cpu"))?
    } else {
        select_device(cli.device.as_deref())?
    };

    println!("=== IBA-rs: Information Bottleneck Attribution ===");
    match &config.weights {
        Some(path) => println!("Weights: {}", path.display()),
        None => println!("Model:   {}", config.model_id),
    }
    println!("Data:    {}", config.data_root.display());
    println!(
        "Layers:  bottleneck {}, readouts {:?}",
        config.target_layer, config.readout_layers
    );
    println!("Output:  {}", config.output_dir.display());

    // Load model
    info!("Loading model...");
    let model = match &config.weights {
        Some(path) => IbaModel::from_safetensors(path, &device)?,
        None => IbaModel::from_pretrained(&config.model_id, &device)?,
    };
    info!(
        "Model: {:?}, {} classes",
        model.architecture(),
        model.num_classes()
    );

    let mut experiment = Experiment::new(model, config);

    // First Ctrl-C stops training after the current step; the second exits
    let stop = experiment.stop_flag();
    ctrlc::set_handler(move || {
        if stop.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        warn!("Interrupt received: training will stop after the current step (Ctrl-C again to abort)");
    })
    .context("Failed to install the Ctrl-C handler")?;

    let results = experiment.run()?;

    // Print results
    println!("\n=== Predictions ===");
    for p in &results.predictions {
        println!(
            "{:5} {:<30} {:.2}%",
            p.class,
            p.name.as_deref().unwrap_or("-"),
            p.probability * 100.0
        );
    }

    if let Some(training) = &results.training {
        if let Some(last) = training.last() {
            println!(
                "\nTraining: {} steps, final loss {:.4} (model {:.4}, information {:.4}){}",
                training.total_steps,
                last.loss,
                last.model_loss,
                last.information_loss,
                if training.interrupted {
                    " [interrupted]"
                } else {
                    ""
                }
            );
        }
    }

    println!(
        "\nExplained class {} ({}): {:.2} bits total, max {:.4} bits/pixel",
        results.target_class,
        results.target_name.as_deref().unwrap_or("unnamed"),
        results.analysis.total_bits,
        results.analysis.max_bits_per_pixel
    );
    println!("Heatmap: {}", results.heatmap_png.display());

    Ok(())
}
