use ndarray::{Array2, ArrayView4};

use crate::{
    ConversionError,
    graph::ChannelLastModel,
    state_dict::{Layout, StateDict},
};

use super::{format::Artifact, quantize::load_tensor};

/// Runs a decoded artifact: int8 weights are dequantized once at load time,
/// the forward pass is the channel-last graph.
#[derive(Debug, Clone)]
pub struct ArtifactInterpreter {
    graph: ChannelLastModel,
}

impl ArtifactInterpreter {
    pub fn new(artifact: &Artifact) -> Result<Self, ConversionError> {
        let header = artifact.header();

        let mut params = StateDict::new(Layout::ChannelLast);
        for entry in &header.tensors {
            params.insert(entry.name.clone(), load_tensor(artifact, entry)?);
        }

        let input_shape = match header.input.shape.as_slice() {
            [_, height, width, channels] => [*height, *width, *channels],
            shape => {
                return Err(ConversionError::Graph(format!(
                    "artifact input must be NHWC, found shape {shape:?}"
                )));
            }
        };

        let graph = ChannelLastModel::from_parts(header.ops.clone(), params, input_shape)?;
        Ok(Self { graph })
    }

    /// `[height, width, channels]` of one input sample.
    pub fn input_shape(&self) -> [usize; 3] {
        self.graph.input_shape()
    }

    /// # Shapes
    ///   - Images [batch_size, height, width, channels]
    ///   - Output [batch_size, num_classes]
    pub fn forward(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>, ConversionError> {
        self.graph.forward(images)
    }

    pub fn probabilities(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>, ConversionError> {
        self.graph.probabilities(images)
    }
}
