use std::path::PathBuf;

use burn::{config::ConfigError, record::RecorderError};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error(
        "Class list has {labels} labels but the model produces {outputs} outputs, \
         one label per output is required"
    )]
    ClassCountMismatch { labels: usize, outputs: usize },

    #[error(
        "Dataset class count ({dataset}) does not match model class count ({model}), \
         set `num_classes` to {dataset} and restart"
    )]
    DatasetClassMismatch { dataset: usize, model: usize },

    #[error("No labelled images found in annotation file {0}")]
    EmptyDataset(PathBuf),

    #[error("Invalid model config: {0}")]
    InvalidModelConfig(String),

    #[error("Invalid tensor data: {0}")]
    TensorData(String),
}
