use std::path::PathBuf;

use anyhow::Context;
use burn::{backend::NdArray, config::Config};
use clap::Parser;
use roadsign::{
    Classifier,
    logging::install_logger,
    training::{CONFIG_FILE, MODEL_FILE, TrainingConfig},
};
use roadsign_server::AppState;

type Backend = NdArray;

/// Serves traffic-sign predictions over HTTP.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Directory holding `config.json` and `model.mpk` written by training.
    #[arg(long, default_value = "models")]
    artifact_dir: PathBuf,

    /// Newline-delimited class names, one per model output.
    #[arg(long, default_value = "dataset/valid/_classes.txt")]
    labels: PathBuf,

    #[arg(long, env = "ROADSIGN_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "ROADSIGN_PORT", default_value_t = 5000)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    install_logger(None);

    let config_path = args.artifact_dir.join(CONFIG_FILE);
    let config = TrainingConfig::load(&config_path)
        .with_context(|| format!("Unable to read {}", config_path.display()))?;

    let classifier = Classifier::<Backend>::load(
        &config.model,
        &args.artifact_dir.join(MODEL_FILE),
        &args.labels,
        Default::default(),
    )
    .context("Unable to load the classifier")?;

    roadsign_server::serve(AppState::new(classifier), (args.host.as_str(), args.port))
        .await
        .with_context(|| format!("Unable to serve on {}:{}", args.host, args.port))?;
    Ok(())
}
