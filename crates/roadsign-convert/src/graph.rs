//! Channel-last reference graph: NHWC activations, HWIO kernels, `(in, out)`
//! dense weights.

use ndarray::{
    Array1, Array2, Array4, ArrayView, ArrayView2, ArrayView4, Axis, Dimension, Ix1, Ix2, Ix4, s,
};
use serde::{Deserialize, Serialize};

use crate::{
    ConversionError,
    arch::Architecture,
    remap,
    state_dict::{Layout, StateDict},
};

/// One step of the channel-last forward pass. Parameter tensors are referenced by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GraphOp {
    /// Stride 1, no padding.
    Conv2d {
        weight: String,
        bias: Option<String>,
    },
    Relu,
    /// Floor mode, no padding.
    MaxPool2d { size: usize, stride: usize },
    /// `(N, H, W, C)` to `(N, H * W * C)`.
    Flatten,
    Dense {
        weight: String,
        bias: Option<String>,
    },
}

impl GraphOp {
    pub fn conv2d(layer: &str) -> Self {
        Self::Conv2d {
            weight: format!("{layer}.weight"),
            bias: Some(format!("{layer}.bias")),
        }
    }

    pub fn dense(layer: &str) -> Self {
        Self::Dense {
            weight: format!("{layer}.weight"),
            bias: Some(format!("{layer}.bias")),
        }
    }

    /// Names of the parameter tensors the op reads.
    pub fn parameters(&self) -> impl Iterator<Item = &str> {
        let (weight, bias) = match self {
            Self::Conv2d { weight, bias } | Self::Dense { weight, bias } => {
                (Some(weight.as_str()), bias.as_deref())
            }
            _ => (None, None),
        };
        weight.into_iter().chain(bias)
    }
}

enum Activation {
    Spatial(Array4<f32>),
    Flat(Array2<f32>),
}

/// Channel-last model: op list plus channel-last parameters.
#[derive(Debug, Clone)]
pub struct ChannelLastModel {
    ops: Vec<GraphOp>,
    params: StateDict,
    input_shape: [usize; 3],
}

impl ChannelLastModel {
    /// Builds the graph of `arch`, checking `params` against its expected names and shapes.
    pub fn new(arch: &Architecture, params: StateDict) -> Result<Self, ConversionError> {
        if params.layout() != Layout::ChannelLast {
            return Err(ConversionError::LayoutMismatch {
                expected: Layout::ChannelLast,
                actual: params.layout(),
            });
        }
        remap::check_parameters(arch, &params)?;

        Self::from_parts(arch.ops().to_vec(), params, arch.input_shape_hwc())
    }

    /// Builds a graph from an explicit op list, e.g. one read back from an artifact.
    ///
    /// Only the presence of the referenced tensors is checked here; their
    /// shapes are checked when the ops run.
    pub fn from_parts(
        ops: Vec<GraphOp>,
        params: StateDict,
        input_shape: [usize; 3],
    ) -> Result<Self, ConversionError> {
        for op in &ops {
            for name in op.parameters() {
                params.tensor(name)?;
            }
        }

        Ok(Self {
            ops,
            params,
            input_shape,
        })
    }

    pub fn ops(&self) -> &[GraphOp] {
        &self.ops
    }

    pub fn params(&self) -> &StateDict {
        &self.params
    }

    /// `[height, width, channels]` of one input sample.
    pub fn input_shape(&self) -> [usize; 3] {
        self.input_shape
    }

    pub fn into_params(self) -> StateDict {
        self.params
    }

    /// # Shapes
    ///   - Images [batch_size, height, width, channels]
    ///   - Output [batch_size, num_classes]
    pub fn forward(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>, ConversionError> {
        let (_, height, width, channels) = images.dim();
        if [height, width, channels] != self.input_shape {
            return Err(ConversionError::Graph(format!(
                "input sample shape {:?} does not match {:?}",
                [height, width, channels],
                self.input_shape
            )));
        }

        let mut x = Activation::Spatial(images.to_owned());
        for op in &self.ops {
            x = match (op, x) {
                (GraphOp::Conv2d { weight, bias }, Activation::Spatial(x)) => {
                    let kernel = self.param::<Ix4>(weight)?;
                    let bias = self.bias(bias.as_deref())?;
                    Activation::Spatial(conv2d(x.view(), kernel.view(), bias.as_ref())?)
                }
                (GraphOp::MaxPool2d { size, stride }, Activation::Spatial(x)) => {
                    Activation::Spatial(max_pool2d(x.view(), *size, *stride)?)
                }
                (GraphOp::Flatten, Activation::Spatial(x)) => Activation::Flat(flatten(x)?),
                (GraphOp::Dense { weight, bias }, Activation::Flat(x)) => {
                    let weight = self.param::<Ix2>(weight)?;
                    let bias = self.bias(bias.as_deref())?;
                    Activation::Flat(dense(x.view(), weight.view(), bias.as_ref())?)
                }
                (GraphOp::Relu, Activation::Spatial(mut x)) => {
                    x.mapv_inplace(relu);
                    Activation::Spatial(x)
                }
                (GraphOp::Relu, Activation::Flat(mut x)) => {
                    x.mapv_inplace(relu);
                    Activation::Flat(x)
                }
                (op, _) => {
                    return Err(ConversionError::Graph(format!(
                        "{op:?} cannot be applied to an activation of this rank"
                    )));
                }
            };
        }

        match x {
            Activation::Flat(output) => Ok(output),
            Activation::Spatial(_) => Err(ConversionError::Graph(
                "the graph must end with a flattened output".into(),
            )),
        }
    }

    /// Softmax over the classes of every sample.
    pub fn probabilities(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>, ConversionError> {
        Ok(softmax(self.forward(images)?))
    }

    fn param<D: Dimension>(&self, name: &str) -> Result<ArrayView<'_, f32, D>, ConversionError> {
        Ok(self.params.tensor(name)?.view().into_dimensionality::<D>()?)
    }

    fn bias(&self, name: Option<&str>) -> Result<Option<Array1<f32>>, ConversionError> {
        match name {
            Some(name) => Ok(Some(self.param::<Ix1>(name)?.to_owned())),
            None => Ok(None),
        }
    }
}

fn relu(value: f32) -> f32 {
    value.max(0.0)
}

fn conv2d(
    input: ArrayView4<'_, f32>,
    kernel: ArrayView4<'_, f32>,
    bias: Option<&Array1<f32>>,
) -> Result<Array4<f32>, ConversionError> {
    let (batch_size, height, width, channels_in) = input.dim();
    let (kernel_h, kernel_w, kernel_in, channels_out) = kernel.dim();
    if kernel_in != channels_in || kernel_h > height || kernel_w > width {
        return Err(ConversionError::Graph(format!(
            "kernel {:?} does not fit input {:?}",
            kernel.shape(),
            input.shape()
        )));
    }

    check_bias(bias, channels_out)?;

    // HWIO flattens to the same (ky, kx, ci) order as an NHWC input patch.
    let patch_len = kernel_h * kernel_w * channels_in;
    let kernel = kernel
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((patch_len, channels_out))?;

    let out_h = height - kernel_h + 1;
    let out_w = width - kernel_w + 1;
    let mut output = Array4::<f32>::zeros((batch_size, out_h, out_w, channels_out));

    for b in 0..batch_size {
        for y in 0..out_h {
            for x in 0..out_w {
                let patch = input
                    .slice(s![b, y..y + kernel_h, x..x + kernel_w, ..])
                    .as_standard_layout()
                    .into_owned()
                    .into_shape_with_order(patch_len)?;
                let mut values = patch.dot(&kernel);
                if let Some(bias) = bias {
                    values += bias;
                }
                output.slice_mut(s![b, y, x, ..]).assign(&values);
            }
        }
    }

    Ok(output)
}

fn max_pool2d(
    input: ArrayView4<'_, f32>,
    size: usize,
    stride: usize,
) -> Result<Array4<f32>, ConversionError> {
    let (batch_size, height, width, channels) = input.dim();
    if size == 0 || stride == 0 || size > height || size > width {
        return Err(ConversionError::Graph(format!(
            "pool size {size} with stride {stride} does not fit input {:?}",
            input.shape()
        )));
    }

    let out_h = (height - size) / stride + 1;
    let out_w = (width - size) / stride + 1;
    let mut output = Array4::<f32>::from_elem((batch_size, out_h, out_w, channels), f32::NEG_INFINITY);

    for b in 0..batch_size {
        for y in 0..out_h {
            for x in 0..out_w {
                let window = input.slice(s![
                    b,
                    y * stride..y * stride + size,
                    x * stride..x * stride + size,
                    ..
                ]);
                let mut cell = output.slice_mut(s![b, y, x, ..]);
                for row in window.outer_iter() {
                    for pixel in row.outer_iter() {
                        cell.zip_mut_with(&pixel, |acc, &value| *acc = acc.max(value));
                    }
                }
            }
        }
    }

    Ok(output)
}

fn flatten(input: Array4<f32>) -> Result<Array2<f32>, ConversionError> {
    let (batch_size, height, width, channels) = input.dim();
    Ok(input
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((batch_size, height * width * channels))?)
}

fn dense(
    input: ArrayView2<'_, f32>,
    weight: ArrayView2<'_, f32>,
    bias: Option<&Array1<f32>>,
) -> Result<Array2<f32>, ConversionError> {
    if input.ncols() != weight.nrows() {
        return Err(ConversionError::Graph(format!(
            "dense weight {:?} does not fit input {:?}",
            weight.shape(),
            input.shape()
        )));
    }

    check_bias(bias, weight.ncols())?;

    let mut output = input.dot(&weight);
    if let Some(bias) = bias {
        output += bias;
    }
    Ok(output)
}

fn check_bias(bias: Option<&Array1<f32>>, channels_out: usize) -> Result<(), ConversionError> {
    match bias {
        Some(bias) if bias.len() != channels_out => Err(ConversionError::Graph(format!(
            "bias of length {} does not match {channels_out} output channels",
            bias.len()
        ))),
        _ => Ok(()),
    }
}

/// Row-wise softmax.
pub fn softmax(mut logits: Array2<f32>) -> Array2<f32> {
    for mut row in logits.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    logits
}

/// Index of the largest value of every row.
pub fn argmax_rows(values: ArrayView2<'_, f32>) -> Vec<usize> {
    values
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (index, &value)| {
                    if value > best.1 { (index, value) } else { best }
                })
                .0
        })
        .collect()
}
