//! Safetensors interchange file holding a channel-last state dict.

use std::{collections::HashMap, path::Path};

use ndarray::{ArrayD, IxDyn};
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::{
    ConversionError,
    state_dict::{Layout, StateDict},
};

/// Value of the `format` metadata entry.
pub const FORMAT: &str = "roadsign-interchange";
/// Value of the `layout` metadata entry.
pub const LAYOUT: &str = "nhwc";

/// Model facts stored next to the tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterchangeMetadata {
    pub input_size: usize,
    pub num_classes: usize,
}

impl InterchangeMetadata {
    fn to_map(self) -> HashMap<String, String> {
        HashMap::from([
            ("format".to_string(), FORMAT.to_string()),
            ("layout".to_string(), LAYOUT.to_string()),
            ("input_size".to_string(), self.input_size.to_string()),
            ("num_classes".to_string(), self.num_classes.to_string()),
        ])
    }

    fn from_map(map: &HashMap<String, String>) -> Result<Self, ConversionError> {
        let entry = |key: &str| {
            map.get(key)
                .ok_or_else(|| ConversionError::Interchange(format!("missing `{key}` metadata")))
        };

        let format = entry("format")?;
        if format != FORMAT {
            return Err(ConversionError::Interchange(format!(
                "unknown format `{format}`"
            )));
        }
        let layout = entry("layout")?;
        if layout != LAYOUT {
            return Err(ConversionError::Interchange(format!(
                "expected the `{LAYOUT}` layout, found `{layout}`"
            )));
        }

        let number = |key: &str| -> Result<usize, ConversionError> {
            let value = entry(key)?;
            value.parse().map_err(|_| {
                ConversionError::Interchange(format!("`{key}` is not a number: `{value}`"))
            })
        };

        Ok(Self {
            input_size: number("input_size")?,
            num_classes: number("num_classes")?,
        })
    }
}

/// Serializes a channel-last state dict to safetensors bytes.
pub fn encode(state: &StateDict, metadata: InterchangeMetadata) -> Result<Vec<u8>, ConversionError> {
    if state.layout() != Layout::ChannelLast {
        return Err(ConversionError::LayoutMismatch {
            expected: Layout::ChannelLast,
            actual: state.layout(),
        });
    }

    let buffers: Vec<(&str, Vec<usize>, Vec<u8>)> = state
        .iter()
        .map(|(name, tensor)| {
            let values = tensor.as_standard_layout();
            let bytes = values
                .as_slice()
                .map(|values| bytemuck::cast_slice::<f32, u8>(values).to_vec())
                .unwrap_or_default();
            (name, tensor.shape().to_vec(), bytes)
        })
        .collect();

    let views = buffers
        .iter()
        .map(|(name, shape, bytes)| {
            Ok((*name, TensorView::new(Dtype::F32, shape.clone(), bytes)?))
        })
        .collect::<Result<Vec<_>, ConversionError>>()?;

    Ok(safetensors::serialize(views, Some(metadata.to_map()))?)
}

/// Reads back a state dict written by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<(StateDict, InterchangeMetadata), ConversionError> {
    let (_, header) = SafeTensors::read_metadata(bytes)?;
    let metadata = header
        .metadata()
        .as_ref()
        .ok_or_else(|| ConversionError::Interchange("no metadata".into()))
        .and_then(InterchangeMetadata::from_map)?;

    let tensors = SafeTensors::deserialize(bytes)?;
    let mut state = StateDict::new(Layout::ChannelLast);
    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(ConversionError::Interchange(format!(
                "tensor `{name}` has dtype {:?}, expected F32",
                view.dtype()
            )));
        }
        let values: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());
        let tensor = ArrayD::from_shape_vec(IxDyn(view.shape()), values)?;
        state.insert(name, tensor);
    }

    Ok((state, metadata))
}

pub fn write_file(path: &Path, bytes: &[u8]) -> Result<(), ConversionError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    Ok(())
}

pub fn read_file(path: &Path) -> Result<(StateDict, InterchangeMetadata), ConversionError> {
    decode(&std::fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn state() -> StateDict {
        let mut state = StateDict::new(Layout::ChannelLast);
        state.insert(
            "conv1.weight",
            Array::from_iter((0..24).map(|v| v as f32 * 0.5))
                .into_shape_with_order(IxDyn(&[2, 2, 3, 2]))
                .unwrap(),
        );
        state.insert("conv1.bias", ArrayD::from_elem(IxDyn(&[2]), -1.25));
        state
    }

    const METADATA: InterchangeMetadata = InterchangeMetadata {
        input_size: 30,
        num_classes: 29,
    };

    #[test]
    fn tensors_and_metadata_survive_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");

        write_file(&path, &encode(&state(), METADATA).unwrap()).unwrap();
        let (decoded, metadata) = read_file(&path).unwrap();

        assert_eq!(decoded, state());
        assert_eq!(metadata, METADATA);
    }

    #[test]
    fn metadata_is_stored_as_strings() {
        let bytes = encode(&state(), METADATA).unwrap();
        let (_, header) = SafeTensors::read_metadata(&bytes).unwrap();
        let map = header.metadata().clone().unwrap();

        assert_eq!(map["format"], FORMAT);
        assert_eq!(map["layout"], "nhwc");
        assert_eq!(map["num_classes"], "29");
    }

    #[test]
    fn foreign_safetensors_file_is_rejected() {
        let data = vec![0u8; 8];
        let view = TensorView::new(Dtype::F32, vec![2], &data).unwrap();
        let bytes = safetensors::serialize([("x", view)], None).unwrap();

        assert!(matches!(
            decode(&bytes),
            Err(ConversionError::Interchange(_))
        ));
    }

    #[test]
    fn channel_first_state_is_not_written() {
        assert!(matches!(
            encode(&StateDict::new(Layout::ChannelFirst), METADATA),
            Err(ConversionError::LayoutMismatch { .. })
        ));
    }
}
