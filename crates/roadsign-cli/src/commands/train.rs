use std::path::PathBuf;

use anyhow::Context;
use burn::{
    backend::{Autodiff, NdArray},
    data::dataset::Dataset,
    optim::AdamConfig,
};
use clap::Args;
use roadsign::{
    ModelConfig,
    data::AnnotationDataset,
    logging::install_logger,
    training::{self, TrainingConfig},
};

type Backend = Autodiff<NdArray>;

/// Log file written into the artifact directory.
const LOG_FILE: &str = "training.log";

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Annotation file, one `<image> x1,y1,x2,y2,class_id` line per image.
    #[arg(long, default_value = "dataset/train/_annotations.txt")]
    annotations: PathBuf,

    /// Directory containing the annotated images.
    #[arg(long, default_value = "dataset/train")]
    images: PathBuf,

    /// Output directory for `config.json`, `model.mpk` and the training log.
    #[arg(long, default_value = "models")]
    artifact_dir: PathBuf,

    /// Number of output classes; must match the dataset.
    #[arg(long, default_value_t = 29)]
    num_classes: usize,

    /// Side of the square network input, in pixels.
    #[arg(long, default_value_t = 30)]
    input_size: usize,

    #[arg(long, default_value_t = 10)]
    epochs: usize,

    #[arg(long, default_value_t = 64)]
    batch_size: usize,

    #[arg(long, default_value_t = 1)]
    workers: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value_t = 1e-3)]
    learning_rate: f64,
}

pub fn run(args: TrainArgs) -> anyhow::Result<()> {
    std::fs::create_dir_all(&args.artifact_dir)
        .with_context(|| format!("Unable to create {}", args.artifact_dir.display()))?;
    install_logger(Some(&args.artifact_dir.join(LOG_FILE)));

    let dataset = AnnotationDataset::load(&args.annotations, &args.images, args.input_size)
        .context("Unable to load the training set")?;
    log::info!(
        "Loaded {} images with {} classes from {}",
        dataset.len(),
        dataset.num_classes(),
        args.annotations.display()
    );

    let config = TrainingConfig::new(
        ModelConfig::new()
            .with_num_classes(args.num_classes)
            .with_input_size(args.input_size),
        AdamConfig::new(),
    )
    .with_num_epochs(args.epochs)
    .with_batch_size(args.batch_size)
    .with_num_workers(args.workers)
    .with_seed(args.seed)
    .with_learning_rate(args.learning_rate);

    let outcome = training::train::<Backend>(&args.artifact_dir, dataset, config, Default::default())?;

    if let Some(last) = outcome.epochs.last() {
        println!(
            "Final epoch {}: loss {:.4}, accuracy {:.2}%",
            last.epoch, last.loss, last.accuracy
        );
    }
    println!(
        "Model saved to {}",
        args.artifact_dir.join(training::MODEL_FILE).with_extension("mpk").display()
    );

    Ok(())
}
