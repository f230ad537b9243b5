use std::path::{Path, PathBuf};

use burn::prelude::*;
use ndarray::Array2;
use roadsign::{ModelConfig, TrafficSignCnn};
use serde::{Deserialize, Serialize};

use crate::{
    ConversionError, Stage,
    arch::Architecture,
    artifact::{Artifact, ArtifactInterpreter, quantize_model},
    graph::{ChannelLastModel, argmax_rows},
    interchange::{self, InterchangeMetadata},
    remap,
    state_dict::StateDict,
    validate,
};

/// How the remapped parameters reach the channel-last graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversionRoute {
    /// The remapped state dict is transplanted into the graph.
    #[default]
    Direct,
    /// The remapped state dict goes through a safetensors interchange file
    /// written next to the artifact, and the graph is rebuilt from it.
    Interchange,
}

#[derive(Config, Debug)]
pub struct ConversionConfig {
    /// Maximum absolute logit difference between the Burn model and the channel-last graph.
    #[config(default = 1e-4)]
    pub equivalence_tolerance: f32,
    /// Maximum absolute logit difference between the channel-last graph and the artifact.
    #[config(default = 5e-2)]
    pub quantized_tolerance: f32,
    /// Seed of the validation input.
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = "ConversionRoute::Direct")]
    pub route: ConversionRoute,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TensorReport {
    pub name: String,
    pub source_shape: Vec<usize>,
    pub target_shape: Vec<usize>,
}

/// Outcome of a successful conversion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionReport {
    pub route: ConversionRoute,
    pub tensors: Vec<TensorReport>,
    pub num_params: usize,
    pub float_max_diff: f32,
    pub quantized_max_diff: f32,
    /// Predicted class of the validation input for the Burn model, the
    /// channel-last graph and the artifact.
    pub reference_class: usize,
    pub converted_class: usize,
    pub quantized_class: usize,
    pub artifact_path: PathBuf,
    pub artifact_bytes: usize,
    pub interchange_path: Option<PathBuf>,
}

impl ConversionReport {
    pub fn classes_agree(&self) -> bool {
        self.reference_class == self.converted_class && self.converted_class == self.quantized_class
    }
}

/// Converts a trained channel-first model into a validated int8 artifact.
pub struct Converter {
    config: ConversionConfig,
}

impl Converter {
    pub fn new(config: ConversionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    /// Runs the conversion and writes the artifact to `output`.
    ///
    /// The model must run in inference mode (a backend without autodiff) so
    /// dropout is disabled. Nothing is written unless every check passes;
    /// the interchange route also writes `output` with a `.safetensors` extension.
    pub fn run<B: Backend>(
        &self,
        model: &TrafficSignCnn<B>,
        model_config: &ModelConfig,
        output: &Path,
        device: &B::Device,
    ) -> Result<ConversionReport, ConversionError> {
        let source = StateDict::from_model(model)?;
        self.convert_state_dict(&source, model_config, output, |input| {
            validate::reference_output(model, input, device)
        })
    }

    /// Same as [`Converter::run`], with the reference forward pass supplied by the caller.
    pub fn convert_state_dict<F>(
        &self,
        source: &StateDict,
        model_config: &ModelConfig,
        output: &Path,
        reference: F,
    ) -> Result<ConversionReport, ConversionError>
    where
        F: FnOnce(ndarray::ArrayView4<'_, f32>) -> Result<Array2<f32>, ConversionError>,
    {
        let arch = Architecture::from_config(model_config);
        let target = remap::to_channel_last(&arch, source)?;

        let tensors = arch
            .layers()
            .iter()
            .flat_map(|layer| [layer.weight_name(), layer.bias_name()])
            .map(|name| {
                Ok(TensorReport {
                    source_shape: source.tensor(&name)?.shape().to_vec(),
                    target_shape: target.tensor(&name)?.shape().to_vec(),
                    name,
                })
            })
            .collect::<Result<Vec<_>, ConversionError>>()?;
        let num_params = target.num_params();

        let (graph, interchange_bytes) = match self.config.route {
            ConversionRoute::Direct => (ChannelLastModel::new(&arch, target)?, None),
            ConversionRoute::Interchange => {
                let metadata = InterchangeMetadata {
                    input_size: arch.input_size(),
                    num_classes: arch.num_classes(),
                };
                let bytes = interchange::encode(&target, metadata)?;
                let (restored, restored_metadata) = interchange::decode(&bytes)?;
                if restored_metadata != metadata {
                    return Err(ConversionError::Interchange(format!(
                        "metadata changed on read back: {restored_metadata:?}"
                    )));
                }
                (ChannelLastModel::new(&arch, restored)?, Some(bytes))
            }
        };

        let input = validate::seeded_input(self.config.seed, arch.input_shape_hwc());
        let expected = reference(input.view())?;
        let converted = graph.forward(input.view())?;
        let float_max_diff = check(
            Stage::Float,
            &expected,
            &converted,
            self.config.equivalence_tolerance,
        )?;

        let artifact = quantize_model(&graph)?;
        let encoded = artifact.encode()?;
        let decoded = Artifact::decode(&encoded)?;
        let quantized = ArtifactInterpreter::new(&decoded)?.forward(input.view())?;
        let quantized_max_diff = check(
            Stage::Quantized,
            &converted,
            &quantized,
            self.config.quantized_tolerance,
        )?;

        let report = ConversionReport {
            route: self.config.route,
            tensors,
            num_params,
            float_max_diff,
            quantized_max_diff,
            reference_class: top_class(&expected),
            converted_class: top_class(&converted),
            quantized_class: top_class(&quantized),
            artifact_path: output.to_path_buf(),
            artifact_bytes: encoded.len(),
            interchange_path: interchange_bytes
                .as_ref()
                .map(|_| output.with_extension("safetensors")),
        };
        if !report.classes_agree() {
            log::warn!(
                "Predicted classes differ on the validation input: reference {}, converted {}, quantized {}",
                report.reference_class,
                report.converted_class,
                report.quantized_class
            );
        }

        if let (Some(path), Some(bytes)) = (&report.interchange_path, &interchange_bytes) {
            interchange::write_file(path, bytes)?;
            log::info!("Interchange file written to {}", path.display());
        }
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(output, &encoded)?;
        log::info!(
            "Artifact written to {} ({} bytes)",
            output.display(),
            encoded.len()
        );

        Ok(report)
    }
}

fn check(
    stage: Stage,
    expected: &Array2<f32>,
    actual: &Array2<f32>,
    tolerance: f32,
) -> Result<f32, ConversionError> {
    let max_diff = validate::max_abs_diff(expected.view(), actual.view())?;
    log::info!("{stage}: max abs diff {max_diff:e} (tolerance {tolerance:e})");

    if max_diff.is_nan() || max_diff > tolerance {
        return Err(ConversionError::Equivalence {
            stage,
            max_diff,
            tolerance,
        });
    }
    Ok(max_diff)
}

fn top_class(logits: &Array2<f32>) -> usize {
    argmax_rows(logits.view()).first().copied().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn model(num_classes: usize) -> (ModelConfig, TrafficSignCnn<TestBackend>) {
        let config = ModelConfig::new().with_num_classes(num_classes);
        let model = config.init::<TestBackend>(&Default::default());
        (config, model)
    }

    #[test]
    fn direct_route_writes_a_validated_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out").join("model.rsq");
        let (config, model) = model(29);

        let report = Converter::new(ConversionConfig::new())
            .run(&model, &config, &output, &Default::default())
            .unwrap();

        assert!(report.float_max_diff < 1e-4);
        assert!(report.quantized_max_diff < 5e-2);
        assert_eq!(report.reference_class, report.converted_class);
        assert_eq!(report.tensors.len(), 8);
        assert_eq!(report.artifact_bytes as u64, std::fs::metadata(&output).unwrap().len());
        assert_eq!(report.interchange_path, None);
        assert!(!dir.path().join("out").join("model.safetensors").exists());

        let artifact = Artifact::read_file(&output).unwrap();
        assert_eq!(artifact.header().output.shape, [1, 29]);
    }

    #[test]
    fn interchange_route_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("model.rsq");
        let (config, model) = model(5);

        let report = Converter::new(ConversionConfig::new().with_route(ConversionRoute::Interchange))
            .run(&model, &config, &output, &Default::default())
            .unwrap();

        let interchange_path = dir.path().join("model.safetensors");
        assert_eq!(report.interchange_path.as_deref(), Some(interchange_path.as_path()));
        let (state, metadata) = interchange::read_file(&interchange_path).unwrap();
        assert_eq!(metadata.num_classes, 5);
        assert_eq!(state.get("fc1.weight").unwrap().shape(), &[1600, 128]);
        assert!(output.exists());
    }

    #[test]
    fn skipping_the_flatten_correction_fails_validation() {
        let (config, model) = model(29);
        let arch = Architecture::from_config(&config);
        let source = StateDict::from_model(&model).unwrap();

        // Plain transpose of fc1, as if it did not follow a flatten.
        let mut naive = remap::to_channel_last(&arch, &source).unwrap();
        let fc1 = layout::dense_to_channel_last(source.get("fc1.weight").unwrap()).unwrap();
        naive.insert("fc1.weight", fc1);

        let graph = ChannelLastModel::new(&arch, naive).unwrap();
        let input = validate::seeded_input(42, arch.input_shape_hwc());
        let expected = validate::reference_output(&model, input.view(), &Default::default()).unwrap();
        let actual = graph.forward(input.view()).unwrap();

        assert!(matches!(
            check(Stage::Float, &expected, &actual, 1e-4),
            Err(ConversionError::Equivalence {
                stage: Stage::Float,
                ..
            })
        ));
    }

    #[test]
    fn shape_mismatch_aborts_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("model.rsq");
        let (config, model) = model(29);
        let mut source = StateDict::from_model(&model).unwrap();
        source.insert("fc2.weight", ndarray::ArrayD::zeros(vec![28, 128]));

        let result = Converter::new(ConversionConfig::new()).convert_state_dict(
            &source,
            &config,
            &output,
            |input| validate::reference_output(&model, input, &Default::default()),
        );

        assert!(matches!(result, Err(ConversionError::ShapeMismatch { .. })));
        assert!(!output.exists());
    }

    #[test]
    fn extra_parameter_aborts_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("model.rsq");
        let (config, model) = model(29);
        let mut source = StateDict::from_model(&model).unwrap();
        source.insert("fc3.bias", ndarray::ArrayD::zeros(vec![3]));

        let result = Converter::new(ConversionConfig::new()).convert_state_dict(
            &source,
            &config,
            &output,
            |input| validate::reference_output(&model, input, &Default::default()),
        );

        assert!(matches!(result, Err(ConversionError::NameMismatch { .. })));
        assert!(!output.exists());
    }

    #[test]
    fn tolerance_violation_aborts_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("model.rsq");
        let (config, model) = model(29);
        let source = StateDict::from_model(&model).unwrap();

        // A reference that disagrees with the converted graph.
        let result = Converter::new(ConversionConfig::new()).convert_state_dict(
            &source,
            &config,
            &output,
            |input| Ok(validate::reference_output(&model, input, &Default::default())? + 1.0),
        );

        assert!(matches!(
            result,
            Err(ConversionError::Equivalence {
                stage: Stage::Float,
                ..
            })
        ));
        assert!(!output.exists());
    }

    #[test]
    fn nan_reference_output_aborts_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("model.rsq");
        let (config, model) = model(29);
        let source = StateDict::from_model(&model).unwrap();

        let result = Converter::new(ConversionConfig::new()).convert_state_dict(
            &source,
            &config,
            &output,
            |input| Ok(validate::reference_output(&model, input, &Default::default())? * f32::NAN),
        );

        match result {
            Err(ConversionError::Equivalence {
                stage: Stage::Float,
                max_diff,
                ..
            }) => assert!(max_diff.is_nan()),
            other => panic!("Expected an equivalence failure, got {other:?}"),
        }
        assert!(!output.exists());
    }

    #[test]
    fn diverged_weights_abort_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("model.rsq");
        let (config, model) = model(29);
        let mut source = StateDict::from_model(&model).unwrap();
        source.insert("fc2.bias", ndarray::ArrayD::from_elem(vec![29], f32::NAN));

        // NaN logits on both sides, as produced by a checkpoint of a diverged run.
        let result = Converter::new(ConversionConfig::new().with_route(ConversionRoute::Interchange))
            .convert_state_dict(&source, &config, &output, |input| {
                Ok(validate::reference_output(&model, input, &Default::default())? + f32::NAN)
            });

        assert!(matches!(
            result,
            Err(ConversionError::Equivalence {
                stage: Stage::Float,
                ..
            })
        ));
        assert!(!output.exists());
        assert!(!dir.path().join("model.safetensors").exists());
    }

    #[test]
    fn conversion_config_defaults() {
        let config = ConversionConfig::new();

        assert_eq!(config.equivalence_tolerance, 1e-4);
        assert_eq!(config.quantized_tolerance, 5e-2);
        assert_eq!(config.seed, 42);
        assert_eq!(config.route, ConversionRoute::Direct);
    }
}
