use std::path::Path;

use burn::{
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
};

use crate::{
    Error,
    model::{ModelConfig, TrafficSignCnn},
};

/// Recorder used for trained checkpoints (`.mpk`, full precision, named fields).
pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Saves the model weights. The recorder appends the `.mpk` extension.
pub fn save_model<B: Backend>(model: &TrafficSignCnn<B>, path: &Path) -> Result<(), Error> {
    model
        .clone()
        .save_file(path.to_path_buf(), &CheckpointRecorder::new())?;
    Ok(())
}

/// Loads a checkpoint written by [`save_model`] into a freshly initialized model.
pub fn load_model<B: Backend>(
    config: &ModelConfig,
    path: &Path,
    device: &B::Device,
) -> Result<TrafficSignCnn<B>, Error> {
    config.check()?;
    let model = config
        .init::<B>(device)
        .load_file(path.to_path_buf(), &CheckpointRecorder::new(), device)?;
    Ok(model)
}

/// Imports a PyTorch `state_dict` (`conv1.weight`, ..., `fc2.bias`).
///
/// Linear weights are stored `(out, in)` by PyTorch and are transposed by the
/// recorder; convolution kernels share the `(O, I, H, W)` layout.
#[cfg(feature = "pytorch")]
pub fn import_pytorch<B: Backend>(
    config: &ModelConfig,
    path: &Path,
    device: &B::Device,
) -> Result<TrafficSignCnn<B>, Error> {
    use burn::record::Recorder;
    use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

    use crate::model::TrafficSignCnnRecord;

    config.check()?;

    let record: TrafficSignCnnRecord<B> = PyTorchFileRecorder::<FullPrecisionSettings>::default()
        .load(LoadArgs::new(path.to_path_buf()), device)?;

    Ok(config.init::<B>(device).load_record(record))
}
