use std::path::Path;

use burn::prelude::*;
use image::DynamicImage;
use serde::Serialize;

use crate::{
    Error, checkpoint,
    data::images_to_tensor,
    labels::ClassLabels,
    model::{ModelConfig, TrafficSignCnn},
    preprocess,
};

/// Top-1 prediction for one image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub class_id: usize,
    pub label: String,
    /// Softmax probability of `class_id`.
    pub confidence: f32,
}

/// A trained model paired with its class list, loaded once and reused.
#[derive(Debug)]
pub struct Classifier<B: Backend> {
    model: TrafficSignCnn<B>,
    labels: ClassLabels,
    input_size: usize,
    device: B::Device,
}

impl<B: Backend> Classifier<B> {
    /// Fails when the class list does not have one label per model output.
    pub fn new(
        model: TrafficSignCnn<B>,
        labels: ClassLabels,
        input_size: usize,
        device: B::Device,
    ) -> Result<Self, Error> {
        labels.ensure_matches(model.num_classes())?;

        Ok(Self {
            model,
            labels,
            input_size,
            device,
        })
    }

    /// Loads a checkpoint and a class list file.
    pub fn load(
        config: &ModelConfig,
        checkpoint: &Path,
        labels: &Path,
        device: B::Device,
    ) -> Result<Self, Error> {
        let labels = ClassLabels::from_file(labels)?;
        // Checked before touching the checkpoint so a wrong class list fails fast.
        labels.ensure_matches(config.num_classes)?;

        let model = checkpoint::load_model::<B>(config, checkpoint, &device)?;
        log::info!(
            "Loaded model from {} with {} classes",
            checkpoint.display(),
            labels.len()
        );

        Self::new(model, labels, config.input_size, device)
    }

    /// Decodes an encoded image (any supported format) and classifies it.
    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<Prediction, Error> {
        let image = preprocess::decode_oriented(bytes)?;
        self.predict_image(&image)
    }

    pub fn predict_image(&self, image: &DynamicImage) -> Result<Prediction, Error> {
        let pixels = preprocess::resize_rgb(image, self.input_size);
        let images = images_to_tensor::<B>(&[pixels.as_slice()], self.input_size, &self.device);

        let probabilities = self
            .model
            .probabilities(images)
            .into_data()
            .to_vec::<f32>()
            .map_err(|err| Error::TensorData(format!("{err:?}")))?;

        let (class_id, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, (index, value)| {
                if value > best.1 { (index, value) } else { best }
            });

        Ok(Prediction {
            class_id,
            label: self.labels.get(class_id).unwrap_or_default().to_string(),
            confidence,
        })
    }

    pub fn labels(&self) -> &ClassLabels {
        &self.labels
    }

    pub fn model(&self) -> &TrafficSignCnn<B> {
        &self.model
    }
}
