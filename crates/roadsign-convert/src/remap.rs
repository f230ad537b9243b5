use std::collections::BTreeSet;

use crate::{
    ConversionError,
    arch::{Architecture, LayerKind},
    layout,
    state_dict::{Layout, StateDict},
};

/// Converts a channel-first state dict into the channel-last layout expected by
/// the graph of `arch`.
///
/// The source is checked against the architecture first, and the result is
/// checked against the channel-last shapes, so both a foreign checkpoint and a
/// wrong permutation are reported before anything else uses the tensors.
pub fn to_channel_last(arch: &Architecture, source: &StateDict) -> Result<StateDict, ConversionError> {
    if source.layout() != Layout::ChannelFirst {
        return Err(ConversionError::LayoutMismatch {
            expected: Layout::ChannelFirst,
            actual: source.layout(),
        });
    }
    check_parameters(arch, source)?;

    let mut target = StateDict::new(Layout::ChannelLast);
    for layer in arch.layers() {
        let weight = source.tensor(&layer.weight_name())?;
        let weight = match layer.kind {
            LayerKind::Conv2d => layout::conv_oihw_to_hwio(weight)?,
            LayerKind::Dense => layout::dense_to_channel_last(weight)?,
            LayerKind::DenseAfterFlatten {
                channels,
                height,
                width,
            } => layout::dense_after_flatten_to_channel_last(weight, [channels, height, width])?,
        };
        log::debug!(
            "{}: {:?} -> {:?}",
            layer.weight_name(),
            layer.weight_shape,
            weight.shape()
        );

        target.insert(layer.weight_name(), weight);
        target.insert(layer.bias_name(), source.tensor(&layer.bias_name())?.clone());
    }

    check_parameters(arch, &target)?;
    Ok(target)
}

/// Checks names and shapes of `state` against what `arch` expects in the
/// layout of `state`.
pub fn check_parameters(arch: &Architecture, state: &StateDict) -> Result<(), ConversionError> {
    let expected = arch.expected_parameters(state.layout());

    let actual: BTreeSet<&str> = state.names().collect();
    let missing: Vec<String> = expected
        .keys()
        .filter(|name| !actual.contains(name.as_str()))
        .cloned()
        .collect();
    let unexpected: Vec<String> = actual
        .iter()
        .filter(|name| !expected.contains_key(**name))
        .map(|name| name.to_string())
        .collect();

    if !missing.is_empty() || !unexpected.is_empty() {
        return Err(ConversionError::NameMismatch {
            missing,
            unexpected,
        });
    }

    for (name, shape) in expected {
        let tensor = state.tensor(&name)?;
        if tensor.shape() != shape.as_slice() {
            return Err(ConversionError::ShapeMismatch {
                name,
                expected: shape,
                actual: tensor.shape().to_vec(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use ndarray::ArrayD;
    use roadsign::ModelConfig;

    type TestBackend = NdArray;

    fn setup() -> (Architecture, StateDict) {
        let config = ModelConfig::new().with_num_classes(6);
        let model = config.init::<TestBackend>(&Default::default());
        (
            Architecture::from_config(&config),
            StateDict::from_model(&model).unwrap(),
        )
    }

    #[test]
    fn remapped_state_dict_has_channel_last_shapes() {
        let (arch, source) = setup();

        let target = to_channel_last(&arch, &source).unwrap();

        assert_eq!(target.layout(), Layout::ChannelLast);
        assert_eq!(target.get("conv1.weight").unwrap().shape(), &[5, 5, 3, 32]);
        assert_eq!(target.get("fc1.weight").unwrap().shape(), &[1600, 128]);
        assert_eq!(target.get("fc2.weight").unwrap().shape(), &[128, 6]);
        assert_eq!(target.get("conv2.bias"), source.get("conv2.bias"));
    }

    #[test]
    fn missing_and_unexpected_names_are_reported() {
        let (arch, mut source) = setup();
        source.remove("fc2.bias");
        source.insert("fc3.weight", ArrayD::zeros(vec![2, 2]));

        match to_channel_last(&arch, &source) {
            Err(ConversionError::NameMismatch {
                missing,
                unexpected,
            }) => {
                assert_eq!(missing, ["fc2.bias"]);
                assert_eq!(unexpected, ["fc3.weight"]);
            }
            other => panic!("Expected a name mismatch, got {other:?}"),
        }
    }

    #[test]
    fn wrong_shape_is_reported() {
        let (arch, mut source) = setup();
        source.insert("conv2.weight", ArrayD::zeros(vec![64, 32, 5, 5]));

        match to_channel_last(&arch, &source) {
            Err(ConversionError::ShapeMismatch {
                name,
                expected,
                actual,
            }) => {
                assert_eq!(name, "conv2.weight");
                assert_eq!(expected, [64, 32, 3, 3]);
                assert_eq!(actual, [64, 32, 5, 5]);
            }
            other => panic!("Expected a shape mismatch, got {other:?}"),
        }
    }

    #[test]
    fn channel_last_input_is_rejected() {
        let (arch, source) = setup();
        let target = to_channel_last(&arch, &source).unwrap();

        assert!(matches!(
            to_channel_last(&arch, &target),
            Err(ConversionError::LayoutMismatch { .. })
        ));
    }
}
