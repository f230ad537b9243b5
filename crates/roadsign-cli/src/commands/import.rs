use std::path::PathBuf;

use anyhow::Context;
use burn::{backend::NdArray, config::Config, optim::AdamConfig};
use clap::Args;
use roadsign::{
    ModelConfig, checkpoint,
    logging::install_logger,
    training::{CONFIG_FILE, MODEL_FILE, TrainingConfig},
};

type Backend = NdArray;

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// PyTorch `state_dict` file (`conv1.weight`, ..., `fc2.bias`).
    checkpoint: PathBuf,

    /// Output directory for `config.json` and `model.mpk`.
    #[arg(long, default_value = "models")]
    artifact_dir: PathBuf,

    #[arg(long, default_value_t = 29)]
    num_classes: usize,

    #[arg(long, default_value_t = 30)]
    input_size: usize,
}

pub fn run(args: ImportArgs) -> anyhow::Result<()> {
    install_logger(None);

    let model_config = ModelConfig::new()
        .with_num_classes(args.num_classes)
        .with_input_size(args.input_size);
    let model = checkpoint::import_pytorch::<Backend>(&model_config, &args.checkpoint, &Default::default())
        .with_context(|| format!("Unable to import {}", args.checkpoint.display()))?;

    std::fs::create_dir_all(&args.artifact_dir)?;
    TrainingConfig::new(model_config, AdamConfig::new()).save(args.artifact_dir.join(CONFIG_FILE))?;
    checkpoint::save_model(&model, &args.artifact_dir.join(MODEL_FILE))?;

    println!(
        "Imported {} into {}",
        args.checkpoint.display(),
        args.artifact_dir.display()
    );
    Ok(())
}
