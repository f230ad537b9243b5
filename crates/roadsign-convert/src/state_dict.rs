use std::collections::BTreeMap;

use burn::prelude::*;
use ndarray::{ArrayD, IxDyn};
use roadsign::TrafficSignCnn;
use serde::{Deserialize, Serialize};

use crate::{ConversionError, layout};

/// Memory convention of the tensors held by a [`StateDict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// `(O, I, H, W)` kernels, `(out, in)` dense weights, NCHW activations.
    ChannelFirst,
    /// `(H, W, I, O)` kernels, `(in, out)` dense weights, NHWC activations.
    ChannelLast,
}

/// Named parameter tensors of one model in one layout.
#[derive(Debug, Clone, PartialEq)]
pub struct StateDict {
    tensors: BTreeMap<String, ArrayD<f32>>,
    layout: Layout,
}

impl StateDict {
    pub fn new(layout: Layout) -> Self {
        Self {
            tensors: BTreeMap::new(),
            layout,
        }
    }

    /// Extracts the parameters of a Burn model in the channel-first layout.
    ///
    /// Burn stores linear weights as `(in, out)`; they are transposed back to
    /// `(out, in)` so the result follows PyTorch's `state_dict` conventions.
    pub fn from_model<B: Backend>(model: &TrafficSignCnn<B>) -> Result<Self, ConversionError> {
        let mut state = Self::new(Layout::ChannelFirst);

        for (name, conv) in [("conv1", model.conv1()), ("conv2", model.conv2())] {
            state.insert(format!("{name}.weight"), to_array(conv.weight.val())?);
            if let Some(bias) = &conv.bias {
                state.insert(format!("{name}.bias"), to_array(bias.val())?);
            }
        }

        for (name, linear) in [("fc1", model.fc1()), ("fc2", model.fc2())] {
            // Transposing `(in, out)` is the same permutation as `(out, in)` -> `(in, out)`.
            let weight = layout::dense_to_channel_last(&to_array(linear.weight.val())?)?;
            state.insert(format!("{name}.weight"), weight);
            if let Some(bias) = &linear.bias {
                state.insert(format!("{name}.bias"), to_array(bias.val())?);
            }
        }

        Ok(state)
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) -> Option<ArrayD<f32>> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn remove(&mut self, name: &str) -> Option<ArrayD<f32>> {
        self.tensors.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    /// Same as [`StateDict::get`], but a missing name is an error.
    pub fn tensor(&self, name: &str) -> Result<&ArrayD<f32>, ConversionError> {
        self.get(name).ok_or_else(|| ConversionError::NameMismatch {
            missing: vec![name.to_string()],
            unexpected: Vec::new(),
        })
    }

    /// Parameter names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.tensors.iter().map(|(name, tensor)| (name.as_str(), tensor))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of scalar parameters.
    pub fn num_params(&self) -> usize {
        self.tensors.values().map(ArrayD::len).sum()
    }
}

fn to_array<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<ArrayD<f32>, ConversionError> {
    let data = tensor.into_data();
    let shape = data.shape.clone();
    let values = data
        .to_vec::<f32>()
        .map_err(|err| ConversionError::TensorData(format!("{err:?}")))?;

    Ok(ArrayD::from_shape_vec(IxDyn(&shape), values)?)
}
