//! Channel-first to channel-last conversion of trained roadsign models.
//!
//! The parameters of a [`roadsign::TrafficSignCnn`] (`(O, I, H, W)` kernels,
//! `(out, in)` dense weights, NCHW activations) are permuted into the
//! channel-last convention (`(H, W, I, O)` kernels, `(in, out)` dense weights,
//! NHWC activations), checked against the original forward pass and written as
//! an int8 artifact that the [`ArtifactInterpreter`] can run.

pub mod arch;
pub mod artifact;
pub mod graph;
pub mod interchange;
pub mod layout;
pub mod pipeline;
pub mod remap;
pub mod state_dict;
pub mod validate;

mod error;

pub use artifact::{Artifact, ArtifactInterpreter};
pub use error::{ArtifactError, ConversionError, Stage};
pub use graph::ChannelLastModel;
pub use pipeline::{ConversionConfig, ConversionReport, ConversionRoute, Converter};
pub use state_dict::{Layout, StateDict};
