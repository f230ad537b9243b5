use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{ArtifactError, graph::GraphOp};

/// Leading bytes of every artifact.
pub const MAGIC: [u8; 4] = *b"RSQ1";
/// Magic plus the header length.
const PREAMBLE_LEN: usize = MAGIC.len() + size_of::<u64>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    I8,
}

impl DType {
    pub fn size(self) -> usize {
        match self {
            DType::F32 => size_of::<f32>(),
            DType::I8 => size_of::<i8>(),
        }
    }
}

/// Model input or output description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    /// Leading batch dimension of `1`.
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub layout: String,
}

/// A parameter tensor stored in the data section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorEntry {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    /// One scale per entry of the last axis, for `i8` tensors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scales: Vec<f32>,
    /// Byte offset inside the data section.
    pub offset: usize,
    /// Byte length inside the data section.
    pub length: usize,
}

impl TensorEntry {
    /// `None` when the element count does not fit in `usize`.
    pub fn num_elements(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |count, &dim| count.checked_mul(dim))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub input: TensorSpec,
    pub output: TensorSpec,
    pub ops: Vec<GraphOp>,
    pub tensors: Vec<TensorEntry>,
}

impl ArtifactHeader {
    pub fn tensor(&self, name: &str) -> Result<&TensorEntry, ArtifactError> {
        self.tensors
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| ArtifactError::MissingTensor(name.to_string()))
    }
}

/// Header plus data section.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    header: ArtifactHeader,
    data: Vec<u8>,
}

impl Artifact {
    /// Validates that every tensor entry is consistent with the data section.
    pub fn new(header: ArtifactHeader, data: Vec<u8>) -> Result<Self, ArtifactError> {
        for entry in &header.tensors {
            validate_entry(entry, data.len())?;
        }
        for name in header.ops.iter().flat_map(GraphOp::parameters) {
            header.tensor(name)?;
        }
        for op in &header.ops {
            if let GraphOp::Conv2d {
                weight,
                bias: Some(bias),
            }
            | GraphOp::Dense {
                weight,
                bias: Some(bias),
            } = op
            {
                validate_bias(header.tensor(weight)?, header.tensor(bias)?)?;
            }
        }

        Ok(Self { header, data })
    }

    pub fn header(&self) -> &ArtifactHeader {
        &self.header
    }

    /// Raw bytes of a stored tensor.
    pub fn tensor_bytes(&self, entry: &TensorEntry) -> &[u8] {
        &self.data[entry.offset..entry.offset + entry.length]
    }

    /// Size of the encoded artifact in bytes.
    pub fn encoded_len(&self) -> Result<usize, ArtifactError> {
        Ok(PREAMBLE_LEN + serde_json::to_vec(&self.header)?.len() + self.data.len())
    }

    pub fn encode(&self) -> Result<Vec<u8>, ArtifactError> {
        let header = serde_json::to_vec(&self.header)?;

        let mut bytes = Vec::with_capacity(PREAMBLE_LEN + header.len() + self.data.len());
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&(header.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&self.data);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ArtifactError> {
        if bytes.len() < PREAMBLE_LEN {
            return Err(ArtifactError::Truncated {
                needed: PREAMBLE_LEN,
                available: bytes.len(),
            });
        }

        let (magic, rest) = bytes.split_at(MAGIC.len());
        if magic != MAGIC {
            let mut found = [0; 4];
            found.copy_from_slice(magic);
            return Err(ArtifactError::BadMagic(found));
        }

        let (length, rest) = rest.split_at(size_of::<u64>());
        let mut length_bytes = [0; 8];
        length_bytes.copy_from_slice(length);
        let header_len = usize::try_from(u64::from_le_bytes(length_bytes)).unwrap_or(usize::MAX);
        if rest.len() < header_len {
            return Err(ArtifactError::Truncated {
                needed: PREAMBLE_LEN.saturating_add(header_len),
                available: bytes.len(),
            });
        }

        let (header, data) = rest.split_at(header_len);
        let header: ArtifactHeader = serde_json::from_slice(header)?;

        Self::new(header, data.to_vec())
    }

    pub fn write_file(&self, path: &Path) -> Result<(), ArtifactError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.encode()?)?;
        Ok(())
    }

    pub fn read_file(path: &Path) -> Result<Self, ArtifactError> {
        Self::decode(&std::fs::read(path)?)
    }
}

fn validate_entry(entry: &TensorEntry, data_len: usize) -> Result<(), ArtifactError> {
    let invalid = |reason: String| ArtifactError::InvalidTensor {
        name: entry.name.clone(),
        reason,
    };

    let end = entry.offset.saturating_add(entry.length);
    if end > data_len {
        return Err(ArtifactError::Truncated {
            needed: end,
            available: data_len,
        });
    }

    let expected = entry
        .num_elements()
        .and_then(|count| count.checked_mul(entry.dtype.size()))
        .ok_or_else(|| invalid(format!("shape {:?} is too large", entry.shape)))?;
    if entry.length != expected {
        return Err(invalid(format!(
            "{} bytes stored, shape {:?} needs {expected}",
            entry.length, entry.shape
        )));
    }

    match entry.dtype {
        DType::I8 => {
            let channels = entry.shape.last().copied().unwrap_or(1);
            if entry.scales.len() != channels {
                return Err(invalid(format!(
                    "{} scales for {channels} channels",
                    entry.scales.len()
                )));
            }
            if entry.scales.iter().any(|scale| !scale.is_finite() || *scale <= 0.0) {
                return Err(invalid("scales must be finite and positive".into()));
            }
        }
        DType::F32 if !entry.scales.is_empty() => {
            return Err(invalid("f32 tensors carry no scales".into()));
        }
        DType::F32 => {}
    }

    Ok(())
}

/// A bias holds one value per output channel, the last axis of its weight.
fn validate_bias(weight: &TensorEntry, bias: &TensorEntry) -> Result<(), ArtifactError> {
    let channels = weight.shape.last().copied();
    if bias.dtype != DType::F32 || bias.shape.len() != 1 || bias.shape.first().copied() != channels {
        return Err(ArtifactError::InvalidTensor {
            name: bias.name.clone(),
            reason: format!(
                "{:?} bias of shape {:?} does not fit weight {} of shape {:?}",
                bias.dtype, bias.shape, weight.name, weight.shape
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact() -> Artifact {
        let header = ArtifactHeader {
            input: TensorSpec {
                name: "images".into(),
                shape: vec![1, 2, 2, 1],
                dtype: DType::F32,
                layout: "nhwc".into(),
            },
            output: TensorSpec {
                name: "logits".into(),
                shape: vec![1, 2],
                dtype: DType::F32,
                layout: "nc".into(),
            },
            ops: vec![GraphOp::Flatten, GraphOp::dense("fc")],
            tensors: vec![
                TensorEntry {
                    name: "fc.weight".into(),
                    dtype: DType::I8,
                    shape: vec![4, 2],
                    scales: vec![0.5, 0.25],
                    offset: 0,
                    length: 8,
                },
                TensorEntry {
                    name: "fc.bias".into(),
                    dtype: DType::F32,
                    shape: vec![2],
                    scales: Vec::new(),
                    offset: 8,
                    length: 8,
                },
            ],
        };
        let mut data: Vec<u8> = [1i8, -2, 3, -4, 5, -6, 7, -127]
            .iter()
            .map(|v| *v as u8)
            .collect();
        data.extend_from_slice(bytemuck::cast_slice(&[0.5f32, -1.0]));

        Artifact::new(header, data).unwrap()
    }

    #[test]
    fn encoded_artifact_decodes_to_the_same_header_and_data() {
        let artifact = artifact();
        let bytes = artifact.encode().unwrap();

        assert_eq!(&bytes[..4], b"RSQ1");
        assert_eq!(bytes.len(), artifact.encoded_len().unwrap());

        let decoded = Artifact::decode(&bytes).unwrap();
        assert_eq!(decoded, artifact);
        let bias = decoded.header().tensor("fc.bias").unwrap();
        assert_eq!(
            bytemuck::pod_collect_to_vec::<u8, f32>(decoded.tensor_bytes(bias)),
            [0.5, -1.0]
        );
    }

    #[test]
    fn header_is_json_with_op_tags() {
        let bytes = artifact().encode().unwrap();
        let header_len = u64::from_le_bytes(bytes[4..12].try_into().unwrap()) as usize;
        let header: serde_json::Value = serde_json::from_slice(&bytes[12..12 + header_len]).unwrap();

        assert_eq!(header["ops"][1]["op"], "dense");
        assert_eq!(header["tensors"][0]["dtype"], "i8");
        assert!(header["tensors"][1].get("scales").is_none());
    }

    #[test]
    fn corrupt_magic_is_rejected() {
        let mut bytes = artifact().encode().unwrap();
        bytes[0] = b'X';

        assert!(matches!(
            Artifact::decode(&bytes),
            Err(ArtifactError::BadMagic(magic)) if &magic == b"XSQ1"
        ));
    }

    #[test]
    fn truncated_artifact_is_rejected() {
        let bytes = artifact().encode().unwrap();

        for len in [0, 6, 20, bytes.len() - 1] {
            let result = Artifact::decode(&bytes[..len]);
            assert!(
                matches!(
                    result,
                    Err(ArtifactError::Truncated { .. }) | Err(ArtifactError::Header(_))
                ),
                "length {len}: {result:?}"
            );
        }
    }

    #[test]
    fn missing_scales_are_rejected() {
        let artifact = artifact();
        let mut header = artifact.header().clone();
        header.tensors[0].scales.pop();

        assert!(matches!(
            Artifact::new(header, artifact.data.clone()),
            Err(ArtifactError::InvalidTensor { .. })
        ));
    }

    #[test]
    fn bias_must_match_the_output_channels() {
        let artifact = artifact();
        let mut header = artifact.header().clone();
        header.tensors[1].shape = vec![3];
        header.tensors[1].length = 12;
        let mut data = artifact.data.clone();
        data.extend_from_slice(bytemuck::cast_slice(&[2.0f32]));
        let bytes = Artifact { header, data }.encode().unwrap();

        assert!(matches!(
            Artifact::decode(&bytes),
            Err(ArtifactError::InvalidTensor { name, .. }) if name == "fc.bias"
        ));
    }

    #[test]
    fn overflowing_shape_is_rejected() {
        let artifact = artifact();
        let mut header = artifact.header().clone();
        header.tensors[0].shape = vec![usize::MAX, 2];

        assert!(matches!(
            Artifact::new(header, artifact.data.clone()),
            Err(ArtifactError::InvalidTensor { name, .. }) if name == "fc.weight"
        ));
    }

    #[test]
    fn ops_must_reference_stored_tensors() {
        let artifact = artifact();
        let mut header = artifact.header().clone();
        header.ops.push(GraphOp::dense("fc2"));

        assert!(matches!(
            Artifact::new(header, artifact.data.clone()),
            Err(ArtifactError::MissingTensor(name)) if name == "fc2.weight"
        ));
    }
}
