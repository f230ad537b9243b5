use std::path::PathBuf;

use anyhow::Context;
use burn::backend::NdArray;
use clap::{Args, ValueEnum};
use roadsign::{checkpoint, logging::install_logger, training::MODEL_FILE};
use roadsign_convert::{ConversionConfig, ConversionRoute, Converter};

type Backend = NdArray;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Route {
    /// Remapped weights go straight into the channel-last graph.
    Direct,
    /// Remapped weights go through a safetensors file written next to the artifact.
    Interchange,
}

impl From<Route> for ConversionRoute {
    fn from(route: Route) -> Self {
        match route {
            Route::Direct => ConversionRoute::Direct,
            Route::Interchange => ConversionRoute::Interchange,
        }
    }
}

#[derive(Args, Debug)]
pub struct ConvertArgs {
    /// Directory holding `config.json` and `model.mpk`.
    #[arg(long, default_value = "models")]
    artifact_dir: PathBuf,

    /// Path of the quantized artifact.
    #[arg(long, default_value = "models/traffic_sign_model.rsq")]
    output: PathBuf,

    #[arg(long, value_enum, default_value_t = Route::Direct)]
    route: Route,

    /// Maximum logit difference between the checkpoint and the channel-last graph.
    #[arg(long, default_value_t = 1e-4)]
    tolerance: f32,

    /// Maximum logit difference between the channel-last graph and the int8 artifact.
    #[arg(long, default_value_t = 5e-2)]
    quantized_tolerance: f32,

    /// Seed of the validation input.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Also write the conversion report as JSON.
    #[arg(long)]
    report: Option<PathBuf>,
}

pub fn run(args: ConvertArgs) -> anyhow::Result<()> {
    install_logger(None);

    let config = super::load_training_config(&args.artifact_dir)?;
    let device = Default::default();
    let model = checkpoint::load_model::<Backend>(
        &config.model,
        &args.artifact_dir.join(MODEL_FILE),
        &device,
    )
    .context("Unable to load the checkpoint")?;

    let conversion = ConversionConfig::new()
        .with_equivalence_tolerance(args.tolerance)
        .with_quantized_tolerance(args.quantized_tolerance)
        .with_seed(args.seed)
        .with_route(args.route.into());

    let report = Converter::new(conversion)
        .run(&model, &config.model, &args.output, &device)
        .context("Conversion failed, no artifact was written")?;

    for tensor in &report.tensors {
        log::info!(
            "{:<14} {:?} -> {:?}",
            tensor.name,
            tensor.source_shape,
            tensor.target_shape
        );
    }
    log::info!(
        "Max abs diff: float {:e}, quantized {:e}",
        report.float_max_diff,
        report.quantized_max_diff
    );
    log::info!(
        "Validation class: checkpoint {}, channel-last {}, quantized {}",
        report.reference_class,
        report.converted_class,
        report.quantized_class
    );
    println!(
        "Artifact saved to {} ({:.1} KB, {} parameters)",
        report.artifact_path.display(),
        report.artifact_bytes as f64 / 1024.0,
        report.num_params
    );
    if let Some(path) = &report.interchange_path {
        println!("Interchange file saved to {}", path.display());
    }

    if let Some(path) = &args.report {
        std::fs::write(path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Unable to write {}", path.display()))?;
    }

    Ok(())
}
