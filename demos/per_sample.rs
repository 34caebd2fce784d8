//! Per-Sample Example: fit a bottleneck mask for a single image
//!
//! Estimates activation statistics on an image folder, then optimizes a
//! free mask for one image. No readout training is needed.
//!
//! Usage:
//!   cargo run --release --example per_sample -- --data imagenet/train --image dog.jpg
//!   cargo run --release --example per_sample -- --data imagenet/train --image dog.jpg --layer layer3 --steps 20

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use iba_rs::{
    load_image, render_overlay, save_png, select_device, target_class_loss, DataLoader,
    IbaModel, ImageFolder, LayerId, LoaderConfig, OverlayOptions, PerSampleConfig, PerSampleIba,
    Preprocess, DEFAULT_MODEL_ID,
};

#[derive(Parser)]
#[command(name = "per_sample")]
#[command(about = "Per-sample information bottleneck attribution")]
struct Args {
    /// HuggingFace model ID
    #[arg(short, long, default_value = DEFAULT_MODEL_ID)]
    model: String,

    /// Image folder used to estimate activation statistics
    #[arg(short, long)]
    data: PathBuf,

    /// Image to explain
    #[arg(short, long)]
    image: PathBuf,

    #[arg(long, default_value = "layer2")]
    layer: LayerId,

    /// Class to explain (default: top-1 prediction)
    #[arg(long)]
    target_class: Option<usize>,

    /// Samples for the statistics estimate
    #[arg(long, default_value = "1000")]
    samples: usize,

    /// Optimization steps per image
    #[arg(long, default_value = "10")]
    steps: usize,

    #[arg(long, default_value = "10.0")]
    beta: f64,

    #[arg(short, long, default_value = "per_sample.png")]
    output: PathBuf,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let device = if args.cpu {
        select_device(Some("cpu"))?
    } else {
        select_device(std::env::var("IBA_DEVICE").ok().as_deref())?
    };

    println!("=== Per-Sample IBA ===\n");
    println!("Loading {}...", args.model);
    let model = IbaModel::from_pretrained(&args.model, &device)?;

    let preprocess = Preprocess::default();
    let dataset = Arc::new(ImageFolder::load(&args.data, preprocess.clone())?);
    let loader = DataLoader::new(dataset, LoaderConfig::default())?;

    let config = PerSampleConfig {
        optimization_steps: args.steps,
        beta: args.beta,
        ..Default::default()
    };
    let iba = PerSampleIba::estimate(&model, &loader, args.layer, args.samples, config, true)?;

    let image = load_image(&args.image, &preprocess)?;
    let target = match args.target_class {
        Some(class) => class,
        None => model
            .predict_top_k(&image, 1)?
            .first()
            .map(|(c, _)| *c)
            .unwrap_or(0),
    };

    let analysis = iba.analyze(&model, &image, target_class_loss(target))?;
    println!(
        "Class {}: {:.2} bits total, model loss {:.4}, information loss {:.4}",
        target,
        analysis.heatmap.total(),
        analysis.model_loss,
        analysis.information_loss
    );

    let overlay = render_overlay(
        &analysis.heatmap,
        Some(&preprocess.to_image(&image)?),
        None,
        None,
        &OverlayOptions::default(),
    )?;
    save_png(&overlay, &args.output)?;
    println!("Heatmap saved to {}", args.output.display());

    Ok(())
}
