//! Traffic-sign classifier built on Burn.
//!
//! The network, its dataset pipeline, the training loop and the inference
//! entry point used by the HTTP service and the weight converter.

pub mod checkpoint;
pub mod data;
pub mod inference;
pub mod labels;
pub mod logging;
pub mod model;
pub mod preprocess;
pub mod training;

mod error;

pub use error::Error;
pub use inference::{Classifier, Prediction};
pub use labels::ClassLabels;
pub use model::{ModelConfig, TrafficSignCnn};
