//! Explain Image Example: heatmap for one image from a trained bottleneck
//!
//! Restores a readout bottleneck saved with `iba-rs --save-checkpoint` and
//! renders the bits-per-pixel heatmap of one image.
//!
//! Usage:
//!   cargo run --release --example explain_image -- --checkpoint iba.safetensors --image dog.jpg
//!   cargo run --release --example explain_image -- --checkpoint iba.safetensors --image dog.jpg \
//!       --class-index imagenet_class_index.json --font DejaVuSans.ttf --target-class 243

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use iba_rs::{
    load_font, load_image, parse_layer_list, render_overlay, save_png, select_device,
    target_class_loss, BottleneckConfig, ClassIndex, IbaModel, LayerId, OverlayOptions,
    Preprocess, ReadoutBottleneck, DEFAULT_MODEL_ID,
};

#[derive(Parser)]
#[command(name = "explain_image")]
#[command(about = "Explain one prediction with a trained readout bottleneck")]
struct Args {
    /// HuggingFace model ID
    #[arg(short, long, default_value = DEFAULT_MODEL_ID)]
    model: String,

    /// Bottleneck checkpoint
    #[arg(long)]
    checkpoint: PathBuf,

    /// Image to explain
    #[arg(short, long)]
    image: PathBuf,

    /// Layer the checkpoint's bottleneck sits on
    #[arg(long, default_value = "layer2")]
    layer: LayerId,

    /// Readout layers the checkpoint was trained with
    #[arg(long, default_value = "layer2,layer3,layer4,fc")]
    readouts: String,

    /// Class to explain (default: top-1 prediction)
    #[arg(long)]
    target_class: Option<usize>,

    #[arg(long)]
    class_index: Option<PathBuf>,

    /// Font for the label and colorbar
    #[arg(long)]
    font: Option<PathBuf>,

    #[arg(short, long, default_value = "heatmap.png")]
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

    println!("=== Explain Image ===\n");
    println!("Loading {}...", args.model);
    let model = IbaModel::from_pretrained(&args.model, &device)?;

    let mut iba = ReadoutBottleneck::new(
        &model,
        args.layer,
        &parse_layer_list(&args.readouts)?,
        BottleneckConfig::default(),
    )?;
    iba.load(&args.checkpoint)?;

    let preprocess = Preprocess::default();
    let image = load_image(&args.image, &preprocess)?;
    let class_index = args.class_index.as_deref().map(ClassIndex::load).transpose()?;
    let name = |class: usize| {
        class_index
            .as_ref()
            .and_then(|index| index.name(class))
            .map_or_else(|| format!("class {class}"), str::to_string)
    };

    println!("Top predictions:");
    let top = model.predict_top_k(&image, 5)?;
    for (class, p) in &top {
        println!("  {:5} {:<30} {:.2}%", class, name(*class), p * 100.0);
    }

    let target = match args.target_class {
        Some(class) => class,
        None => top.first().map(|(c, _)| *c).unwrap_or(0),
    };
    let analysis = iba.analyze(&model, &image, target_class_loss(target))?;
    println!(
        "\nExplaining {}: {:.2} bits total, max {:.4} bits/pixel",
        name(target),
        analysis.heatmap.total(),
        analysis.heatmap.max()
    );

    let font = args.font.as_deref().map(load_font).transpose()?;
    let overlay = render_overlay(
        &analysis.heatmap,
        Some(&preprocess.to_image(&image)?),
        Some(&name(target)),
        font.as_ref(),
        &OverlayOptions::default(),
    )?;
    save_png(&overlay, &args.output)?;
    println!("Heatmap saved to {}", args.output.display());

    Ok(())
}
