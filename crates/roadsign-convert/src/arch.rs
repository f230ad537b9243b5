use std::collections::BTreeMap;

use roadsign::ModelConfig;
use serde::{Deserialize, Serialize};

use crate::{graph::GraphOp, state_dict::Layout};

/// How the weight of a parametrised layer moves between layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerKind {
    Conv2d,
    Dense,
    /// Dense layer consuming a flattened `(channels, height, width)` feature map.
    DenseAfterFlatten {
        channels: usize,
        height: usize,
        width: usize,
    },
}

/// One parametrised layer: its name, kind and channel-first weight shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerMapping {
    pub name: String,
    pub kind: LayerKind,
    /// `(O, I, H, W)` for convolutions, `(out, in)` for dense layers.
    pub weight_shape: Vec<usize>,
}

impl LayerMapping {
    pub fn weight_name(&self) -> String {
        format!("{}.weight", self.name)
    }

    pub fn bias_name(&self) -> String {
        format!("{}.bias", self.name)
    }

    /// Number of output channels (convolutions) or output features (dense).
    pub fn out_features(&self) -> usize {
        self.weight_shape[0]
    }

    pub fn weight_shape(&self, layout: Layout) -> Vec<usize> {
        let shape = &self.weight_shape;
        match (layout, self.kind) {
            (Layout::ChannelFirst, _) => shape.clone(),
            (Layout::ChannelLast, LayerKind::Conv2d) => vec![shape[2], shape[3], shape[1], shape[0]],
            (Layout::ChannelLast, _) => vec![shape[1], shape[0]],
        }
    }
}

/// Parametrised layers and op sequence of the classifier, derived from its config.
#[derive(Debug, Clone, PartialEq)]
pub struct Architecture {
    layers: Vec<LayerMapping>,
    ops: Vec<GraphOp>,
    input_size: usize,
    in_channels: usize,
    num_classes: usize,
}

impl Architecture {
    pub fn from_config(config: &ModelConfig) -> Self {
        let [channels, height, width] = config.feature_map_shape();

        let layers = vec![
            LayerMapping {
                name: "conv1".into(),
                kind: LayerKind::Conv2d,
                weight_shape: vec![
                    config.conv1_channels,
                    config.in_channels,
                    config.conv1_kernel,
                    config.conv1_kernel,
                ],
            },
            LayerMapping {
                name: "conv2".into(),
                kind: LayerKind::Conv2d,
                weight_shape: vec![
                    config.conv2_channels,
                    config.conv1_channels,
                    config.conv2_kernel,
                    config.conv2_kernel,
                ],
            },
            LayerMapping {
                name: "fc1".into(),
                kind: LayerKind::DenseAfterFlatten {
                    channels,
                    height,
                    width,
                },
                weight_shape: vec![config.hidden_size, channels * height * width],
            },
            LayerMapping {
                name: "fc2".into(),
                kind: LayerKind::Dense,
                weight_shape: vec![config.num_classes, config.hidden_size],
            },
        ];

        let pool = GraphOp::MaxPool2d {
            size: config.pool_size,
            stride: config.pool_size,
        };
        // Dropout is the identity at inference time and has no op.
        let ops = vec![
            GraphOp::conv2d("conv1"),
            GraphOp::Relu,
            pool.clone(),
            GraphOp::conv2d("conv2"),
            GraphOp::Relu,
            pool,
            GraphOp::Flatten,
            GraphOp::dense("fc1"),
            GraphOp::Relu,
            GraphOp::dense("fc2"),
        ];

        Self {
            layers,
            ops,
            input_size: config.input_size,
            in_channels: config.in_channels,
            num_classes: config.num_classes,
        }
    }

    pub fn layers(&self) -> &[LayerMapping] {
        &self.layers
    }

    pub fn ops(&self) -> &[GraphOp] {
        &self.ops
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Input shape of one channel-last sample, `[height, width, channels]`.
    pub fn input_shape_hwc(&self) -> [usize; 3] {
        [self.input_size, self.input_size, self.in_channels]
    }

    /// Every parameter name with the shape it must have in `layout`.
    pub fn expected_parameters(&self, layout: Layout) -> BTreeMap<String, Vec<usize>> {
        self.layers
            .iter()
            .flat_map(|layer| {
                [
                    (layer.weight_name(), layer.weight_shape(layout)),
                    (layer.bias_name(), vec![layer.out_features()]),
                ]
            })
            .collect()
    }
}
