use ndarray::{ArrayD, Axis, IxDyn};

use crate::{
    ArtifactError, ConversionError,
    graph::{ChannelLastModel, GraphOp},
};

use super::format::{Artifact, ArtifactHeader, DType, TensorEntry, TensorSpec};

/// Range of the symmetric int8 values; `-128` is never produced.
const QMAX: f32 = 127.0;

/// Int8 tensor with one symmetric scale per entry of its last axis.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor {
    pub shape: Vec<usize>,
    pub values: Vec<i8>,
    pub scales: Vec<f32>,
}

/// Quantizes `tensor` per output channel, the last axis in the channel-last layout.
///
/// `scale = max(|x|) / 127` over each channel and `q = clamp(round(x / scale), -127, 127)`.
pub fn quantize_per_channel(tensor: &ArrayD<f32>) -> QuantizedTensor {
    let last_axis = Axis(tensor.ndim().saturating_sub(1));

    let scales: Vec<f32> = tensor
        .axis_iter(last_axis)
        .map(|channel| valid_scale(channel.fold(0.0f32, |acc, v| acc.max(v.abs())) / QMAX))
        .collect();

    let channels = scales.len();
    let values = tensor
        .as_standard_layout()
        .iter()
        .enumerate()
        .map(|(index, value)| {
            let scale = scales[index % channels];
            (value / scale).round().clamp(-QMAX, QMAX) as i8
        })
        .collect();

    QuantizedTensor {
        shape: tensor.shape().to_vec(),
        values,
        scales,
    }
}

/// `x = scale * q`.
pub fn dequantize(tensor: &QuantizedTensor) -> Result<ArrayD<f32>, ConversionError> {
    let channels = tensor.shape.last().copied().unwrap_or(1);
    if tensor.scales.len() != channels {
        return Err(ConversionError::TensorData(format!(
            "{} scales for {channels} channels",
            tensor.scales.len()
        )));
    }

    let values = tensor
        .values
        .iter()
        .enumerate()
        .map(|(index, value)| tensor.scales[index % channels] * f32::from(*value))
        .collect();

    Ok(ArrayD::from_shape_vec(IxDyn(&tensor.shape), values)?)
}

// A channel full of zeros would give a zero scale.
fn valid_scale(scale: f32) -> f32 {
    if scale == 0.0 { 0.1 } else { scale }
}

/// Builds an artifact from a float channel-last graph.
///
/// Tensors read as op weights are quantized, every other tensor (biases) is
/// stored as `f32`.
pub fn quantize_model(graph: &ChannelLastModel) -> Result<Artifact, ConversionError> {
    let weights: Vec<&str> = graph
        .ops()
        .iter()
        .filter_map(|op| match op {
            GraphOp::Conv2d { weight, .. } | GraphOp::Dense { weight, .. } => Some(weight.as_str()),
            _ => None,
        })
        .collect();

    let mut tensors = Vec::with_capacity(graph.params().len());
    let mut data = Vec::new();

    for (name, tensor) in graph.params().iter() {
        let offset = data.len();
        let entry = if weights.contains(&name) {
            let quantized = quantize_per_channel(tensor);
            data.extend(quantized.values.iter().map(|v| *v as u8));
            TensorEntry {
                name: name.to_string(),
                dtype: DType::I8,
                shape: quantized.shape,
                scales: quantized.scales,
                offset,
                length: data.len() - offset,
            }
        } else {
            let values = tensor.as_standard_layout();
            let values = values.iter().copied().collect::<Vec<f32>>();
            data.extend_from_slice(bytemuck::cast_slice(&values));
            TensorEntry {
                name: name.to_string(),
                dtype: DType::F32,
                shape: tensor.shape().to_vec(),
                scales: Vec::new(),
                offset,
                length: data.len() - offset,
            }
        };
        tensors.push(entry);
    }

    let [height, width, channels] = graph.input_shape();
    let num_classes = output_features(graph)?;
    let header = ArtifactHeader {
        input: TensorSpec {
            name: "images".into(),
            shape: vec![1, height, width, channels],
            dtype: DType::F32,
            layout: "nhwc".into(),
        },
        output: TensorSpec {
            name: "logits".into(),
            shape: vec![1, num_classes],
            dtype: DType::F32,
            layout: "nc".into(),
        },
        ops: graph.ops().to_vec(),
        tensors,
    };

    Ok(Artifact::new(header, data)?)
}

/// Reads a stored tensor back as `f32`, dequantizing `i8` tensors.
pub fn load_tensor(artifact: &Artifact, entry: &TensorEntry) -> Result<ArrayD<f32>, ConversionError> {
    let bytes = artifact.tensor_bytes(entry);
    match entry.dtype {
        DType::F32 => {
            let values: Vec<f32> = bytemuck::pod_collect_to_vec(bytes);
            Ok(ArrayD::from_shape_vec(IxDyn(&entry.shape), values)?)
        }
        DType::I8 => dequantize(&QuantizedTensor {
            shape: entry.shape.clone(),
            values: bytemuck::cast_slice::<u8, i8>(bytes).to_vec(),
            scales: entry.scales.clone(),
        }),
    }
}

fn output_features(graph: &ChannelLastModel) -> Result<usize, ConversionError> {
    let last_weight = graph
        .ops()
        .iter()
        .rev()
        .find_map(|op| match op {
            GraphOp::Dense { weight, .. } => Some(weight.as_str()),
            _ => None,
        })
        .ok_or_else(|| ConversionError::Graph("the graph has no dense output layer".into()))?;
    let shape = graph.params().tensor(last_weight)?.shape();

    shape.last().copied().ok_or_else(|| {
        ConversionError::Artifact(ArtifactError::InvalidTensor {
            name: last_weight.to_string(),
            reason: "scalar dense weight".into(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn scales_are_computed_per_last_axis_channel() {
        let tensor = array![[-1.8f32, 0.5], [0.0, -0.2], [0.5, 0.1]].into_dyn();

        let quantized = quantize_per_channel(&tensor);

        assert_eq!(quantized.scales, [1.8 / 127.0, 0.5 / 127.0]);
        assert_eq!(quantized.values, [-127, 127, 0, -51, 35, 25]);
    }

    #[test]
    fn dequantized_values_are_within_half_a_step() {
        let tensor = ArrayD::from_shape_fn(IxDyn(&[3, 3, 2, 4]), |index| {
            ((index[0] * 7 + index[1] * 3 + index[2] * 5 + index[3]) as f32).sin()
        });

        let quantized = quantize_per_channel(&tensor);
        let restored = dequantize(&quantized).unwrap();

        for (index, (original, restored)) in tensor.iter().zip(restored.iter()).enumerate() {
            let scale = quantized.scales[index % 4];
            assert!((original - restored).abs() <= scale / 2.0 + 1e-7);
        }
    }

    #[test]
    fn zero_channel_keeps_a_usable_scale() {
        let tensor = array![[0.0f32, 1.0], [0.0, -1.0]].into_dyn();

        let quantized = quantize_per_channel(&tensor);

        assert_eq!(quantized.scales[0], 0.1);
        assert_eq!(dequantize(&quantized).unwrap()[[1, 0]], 0.0);
    }
}
