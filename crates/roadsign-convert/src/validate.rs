use burn::{prelude::*, tensor::TensorData};
use ndarray::{Array2, Array4, ArrayView2, ArrayView4};
use rand::{Rng, SeedableRng, rngs::StdRng};
use roadsign::TrafficSignCnn;

use crate::ConversionError;

/// Seeded NHWC batch of one sample with values in `[0, 1)`.
pub fn seeded_input(seed: u64, [height, width, channels]: [usize; 3]) -> Array4<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array4::from_shape_simple_fn((1, height, width, channels), || rng.random::<f32>())
}

/// HWC `u8` images (as produced by [`roadsign::preprocess::resize_rgb`]) to an
/// NHWC batch scaled to `[0, 1]`.
pub fn images_to_nhwc(images: &[&[u8]], input_size: usize) -> Result<Array4<f32>, ConversionError> {
    let values = images
        .iter()
        .flat_map(|image| image.iter().map(|&v| f32::from(v) / 255.0))
        .collect();

    Ok(Array4::from_shape_vec(
        (images.len(), input_size, input_size, 3),
        values,
    )?)
}

/// Logits of the Burn model for an NHWC batch, permuted to NCHW first.
pub fn reference_output<B: Backend>(
    model: &TrafficSignCnn<B>,
    images: ArrayView4<'_, f32>,
    device: &B::Device,
) -> Result<Array2<f32>, ConversionError> {
    let (batch_size, height, width, channels) = images.dim();
    let nchw: Vec<f32> = images
        .permuted_axes([0, 3, 1, 2])
        .as_standard_layout()
        .iter()
        .copied()
        .collect();

    let images = Tensor::<B, 4>::from_data(
        TensorData::new(nchw, [batch_size, channels, height, width]),
        device,
    );
    let output = model.forward(images);
    let [_, num_classes] = output.dims();
    let values = output
        .into_data()
        .to_vec::<f32>()
        .map_err(|err| ConversionError::TensorData(format!("{err:?}")))?;

    Ok(Array2::from_shape_vec((batch_size, num_classes), values)?)
}

/// Largest element-wise absolute difference, NaN as soon as either side holds a
/// non-finite value.
pub fn max_abs_diff(
    expected: ArrayView2<'_, f32>,
    actual: ArrayView2<'_, f32>,
) -> Result<f32, ConversionError> {
    if expected.dim() != actual.dim() {
        return Err(ConversionError::Graph(format!(
            "output shapes differ: {:?} and {:?}",
            expected.shape(),
            actual.shape()
        )));
    }

    Ok(expected
        .iter()
        .zip(actual.iter())
        .fold(0.0f32, |acc, (a, b)| {
            let diff = if a.is_finite() && b.is_finite() {
                (a - b).abs()
            } else {
                f32::NAN
            };
            if acc.is_nan() || diff <= acc { acc } else { diff }
        }))
}
