use std::{path::Path, time::Instant};

use burn::{
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    nn::loss::CrossEntropyLossConfig,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use serde::Serialize;

use crate::{
    Error, checkpoint,
    data::{AnnotationDataset, TrafficSignBatcher},
    model::{ModelConfig, TrafficSignCnn},
};

/// File name of the training config inside the artifact directory.
pub const CONFIG_FILE: &str = "config.json";
/// Checkpoint stem inside the artifact directory; the recorder adds `.mpk`.
pub const MODEL_FILE: &str = "model";

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub optimizer: AdamConfig,
    #[config(default = 10)]
    pub num_epochs: usize,
    #[config(default = 64)]
    pub batch_size: usize,
    #[config(default = 1)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1e-3)]
    pub learning_rate: f64,
}

/// Metrics of one pass over the training set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochSummary {
    pub epoch: usize,
    /// Mean cross-entropy over the batches of the epoch.
    pub loss: f32,
    /// Percentage of correctly classified samples.
    pub accuracy: f32,
}

pub struct TrainingOutcome<B: AutodiffBackend> {
    pub model: TrafficSignCnn<B>,
    pub epochs: Vec<EpochSummary>,
}

/// Trains the classifier and writes `config.json` and `model.mpk` into `artifact_dir`.
pub fn train<B: AutodiffBackend>(
    artifact_dir: &Path,
    dataset: AnnotationDataset,
    config: TrainingConfig,
    device: B::Device,
) -> Result<TrainingOutcome<B>, Error> {
    config.model.check()?;
    if dataset.num_classes() != config.model.num_classes {
        return Err(Error::DatasetClassMismatch {
            dataset: dataset.num_classes(),
            model: config.model.num_classes,
        });
    }

    std::fs::create_dir_all(artifact_dir)?;
    config.save(artifact_dir.join(CONFIG_FILE))?;

    B::seed(config.seed);

    let mut model = config.model.init::<B>(&device);
    let mut optim = config.optimizer.init::<B, TrafficSignCnn<B>>();
    let loss_fn = CrossEntropyLossConfig::new().init::<B>(&device);

    let num_items = dataset.len();
    let dataloader = DataLoaderBuilder::new(TrafficSignBatcher::<B>::new(config.model.input_size))
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(dataset);

    log::info!(
        "Training on {num_items} images for {} epochs",
        config.num_epochs
    );
    let start = Instant::now();
    let mut epochs = Vec::with_capacity(config.num_epochs);

    for epoch in 1..config.num_epochs + 1 {
        let mut running_loss = 0.0;
        let mut num_batches = 0;
        let mut correct = 0;
        let mut total = 0;

        for batch in dataloader.iter() {
            let output = model.forward(batch.images);
            let loss = loss_fn.forward(output.clone(), batch.targets.clone());

            running_loss += loss.clone().into_scalar().elem::<f32>();
            num_batches += 1;

            total += batch.targets.dims()[0];
            correct += output
                .argmax(1)
                .squeeze::<1>(1)
                .equal(batch.targets)
                .int()
                .sum()
                .into_scalar()
                .elem::<i64>() as usize;

            // Gradients for the current backward pass
            let grads = loss.backward();
            // Gradients linked to each parameter of the model
            let grads = GradientsParams::from_grads(grads, &model);
            // Update the model using the optimizer
            model = optim.step(config.learning_rate, model, grads);
        }

        let summary = EpochSummary {
            epoch,
            loss: running_loss / num_batches.max(1) as f32,
            accuracy: 100.0 * correct as f32 / total.max(1) as f32,
        };
        log::info!(
            "Epoch {}, Loss: {:.4}, Accuracy: {:.2}%",
            summary.epoch,
            summary.loss,
            summary.accuracy
        );
        epochs.push(summary);
    }

    let elapsed = start.elapsed().as_secs();
    log::info!("Training completed in {}m{}s", elapsed / 60, elapsed % 60);

    let model_path = artifact_dir.join(MODEL_FILE);
    checkpoint::save_model(&model, &model_path)?;
    log::info!("Model saved to {}.mpk", model_path.display());

    Ok(TrainingOutcome { model, epochs })
}
