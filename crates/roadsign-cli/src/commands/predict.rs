use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use burn::backend::NdArray;
use clap::Args;
use rand::seq::IndexedRandom;
use roadsign::{
    ClassLabels, Classifier, data::IMAGE_EXTENSIONS, logging::install_logger, preprocess,
    training::MODEL_FILE,
};
use roadsign_convert::{Artifact, ArtifactInterpreter, graph::argmax_rows, validate};

type Backend = NdArray;

#[derive(Args, Debug)]
pub struct PredictArgs {
    /// Image to classify.
    #[arg(long, conflicts_with = "image_dir", required_unless_present = "image_dir")]
    image: Option<PathBuf>,

    /// Classify a random image from this directory instead.
    #[arg(long)]
    image_dir: Option<PathBuf>,

    /// Directory holding `config.json` and `model.mpk`.
    #[arg(long, default_value = "models")]
    artifact_dir: PathBuf,

    /// Newline-delimited class names.
    #[arg(long, default_value = "dataset/valid/_classes.txt")]
    labels: PathBuf,

    /// Run a quantized `.rsq` artifact instead of the checkpoint.
    #[arg(long)]
    quantized: Option<PathBuf>,
}

pub fn run(args: PredictArgs) -> anyhow::Result<()> {
    install_logger(None);

    let image_path = match (&args.image, &args.image_dir) {
        (Some(image), _) => image.clone(),
        (None, Some(dir)) => random_image(dir)?,
        (None, None) => bail!("Either --image or --image-dir is required"),
    };
    println!("Selected image: {}", image_path.display());

    let image = preprocess::open_oriented(&image_path)
        .with_context(|| format!("Unable to read {}", image_path.display()))?;
    let labels = ClassLabels::from_file(&args.labels)
        .with_context(|| format!("Unable to read {}", args.labels.display()))?;

    match &args.quantized {
        Some(path) => {
            let artifact = Artifact::read_file(path)
                .with_context(|| format!("Unable to read {}", path.display()))?;
            let interpreter = ArtifactInterpreter::new(&artifact)?;
            let [input_size, _, _] = interpreter.input_shape();
            labels.ensure_matches(artifact.header().output.shape.last().copied().unwrap_or(0))?;

            let pixels = preprocess::resize_rgb(&image, input_size);
            let input = validate::images_to_nhwc(&[pixels.as_slice()], input_size)?;
            let probabilities = interpreter.probabilities(input.view())?;
            let class_id = argmax_rows(probabilities.view())[0];

            println!("Predicted class ID: {class_id}");
            println!("Predicted label: {}", labels.get(class_id).unwrap_or_default());
            println!("Class probabilities: {:?}", probabilities.row(0).to_vec());
        }
        None => {
            let config = super::load_training_config(&args.artifact_dir)?;
            let classifier = Classifier::<Backend>::new(
                roadsign::checkpoint::load_model(
                    &config.model,
                    &args.artifact_dir.join(MODEL_FILE),
                    &Default::default(),
                )?,
                labels,
                config.model.input_size,
                Default::default(),
            )?;
            let prediction = classifier.predict_image(&image)?;

            println!("Predicted class ID: {}", prediction.class_id);
            println!("Predicted label: {}", prediction.label);
            println!("Confidence: {:.2}", prediction.confidence);
        }
    }

    Ok(())
}

fn random_image(dir: &Path) -> anyhow::Result<PathBuf> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Unable to list {}", dir.display()))? {
        let path = entry?.path();
        let supported = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if supported {
            images.push(path);
        }
    }

    images
        .choose(&mut rand::rng())
        .cloned()
        .with_context(|| format!("No images found in {}", dir.display()))
}
