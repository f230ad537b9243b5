pub mod convert;
#[cfg(feature = "pytorch")]
pub mod import;
pub mod inspect;
pub mod predict;
pub mod train;

use std::path::Path;

use anyhow::Context;
use burn::config::Config;
use roadsign::training::{CONFIG_FILE, TrainingConfig};

/// Reads the `config.json` written next to a checkpoint.
pub fn load_training_config(artifact_dir: &Path) -> anyhow::Result<TrainingConfig> {
    let path = artifact_dir.join(CONFIG_FILE);
    TrainingConfig::load(&path).with_context(|| format!("Unable to read {}", path.display()))
}
