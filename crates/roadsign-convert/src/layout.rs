//! Tensor permutations between the channel-first and channel-last conventions.
//!
//! Every function returns arrays in standard (row-major) memory order so the
//! results can be reshaped, serialized or compared element by element.

use ndarray::{Array2, Array4, ArrayD, ArrayView2, Ix2, Ix4};

use crate::ConversionError;

/// `(O, I, H, W)` convolution kernel to `(H, W, I, O)`.
pub fn conv_oihw_to_hwio(kernel: &ArrayD<f32>) -> Result<ArrayD<f32>, ConversionError> {
    let kernel = kernel.view().into_dimensionality::<Ix4>()?;
    Ok(kernel
        .permuted_axes([2, 3, 1, 0])
        .as_standard_layout()
        .into_owned()
        .into_dyn())
}

/// `(H, W, I, O)` convolution kernel back to `(O, I, H, W)`.
pub fn conv_hwio_to_oihw(kernel: &ArrayD<f32>) -> Result<ArrayD<f32>, ConversionError> {
    let kernel = kernel.view().into_dimensionality::<Ix4>()?;
    Ok(kernel
        .permuted_axes([3, 2, 0, 1])
        .as_standard_layout()
        .into_owned()
        .into_dyn())
}

/// `(out, in)` dense weight to `(in, out)`. The transpose is its own inverse.
pub fn dense_to_channel_last(weight: &ArrayD<f32>) -> Result<ArrayD<f32>, ConversionError> {
    let weight = weight.view().into_dimensionality::<Ix2>()?;
    Ok(transpose(weight).into_dyn())
}

/// Reorders the input columns of a `(out, in)` dense weight that consumes a
/// flattened `(C, H, W)` feature map so it consumes a flattened `(H, W, C)` one.
///
/// The weight is viewed as `(out, C, H, W)`, permuted to `(out, H, W, C)` and
/// flattened back to `(out, in)`.
pub fn reorder_flattened_chw_to_hwc(
    weight: &ArrayD<f32>,
    [channels, height, width]: [usize; 3],
) -> Result<ArrayD<f32>, ConversionError> {
    let weight = weight.view().into_dimensionality::<Ix2>()?;
    let (out_features, in_features) = weight.dim();

    let grouped: Array4<f32> = weight
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((out_features, channels, height, width))?;
    let reordered: Array2<f32> = grouped
        .permuted_axes([0, 2, 3, 1])
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((out_features, in_features))?;

    Ok(reordered.into_dyn())
}

/// Inverse of [`reorder_flattened_chw_to_hwc`].
pub fn reorder_flattened_hwc_to_chw(
    weight: &ArrayD<f32>,
    [channels, height, width]: [usize; 3],
) -> Result<ArrayD<f32>, ConversionError> {
    let weight = weight.view().into_dimensionality::<Ix2>()?;
    let (out_features, in_features) = weight.dim();

    let grouped: Array4<f32> = weight
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((out_features, height, width, channels))?;
    let reordered: Array2<f32> = grouped
        .permuted_axes([0, 3, 1, 2])
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((out_features, in_features))?;

    Ok(reordered.into_dyn())
}

/// `(out, in)` weight of the dense layer right after the flatten to the
/// channel-last `(in, out)` layout: column reorder, then transpose.
pub fn dense_after_flatten_to_channel_last(
    weight: &ArrayD<f32>,
    feature_map: [usize; 3],
) -> Result<ArrayD<f32>, ConversionError> {
    let reordered = reorder_flattened_chw_to_hwc(weight, feature_map)?;
    dense_to_channel_last(&reordered)
}

fn transpose(weight: ArrayView2<'_, f32>) -> Array2<f32> {
    weight.t().as_standard_layout().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};

    fn sequential(shape: &[usize]) -> ArrayD<f32> {
        let len = shape.iter().product::<usize>();
        Array::from_iter((0..len).map(|v| v as f32))
            .into_shape_with_order(IxDyn(shape))
            .unwrap()
    }

    #[test]
    fn conv_kernel_round_trip_is_exact() {
        let kernel = sequential(&[32, 3, 5, 5]);

        let hwio = conv_oihw_to_hwio(&kernel).unwrap();
        assert_eq!(hwio.shape(), &[5, 5, 3, 32]);

        let back = conv_hwio_to_oihw(&hwio).unwrap();
        assert_eq!(back, kernel);
    }

    #[test]
    fn conv_kernel_elements_move_to_their_channel_last_position() {
        let kernel = sequential(&[4, 3, 2, 2]);
        let hwio = conv_oihw_to_hwio(&kernel).unwrap();

        for o in 0..4 {
            for i in 0..3 {
                for h in 0..2 {
                    for w in 0..2 {
                        assert_eq!(hwio[[h, w, i, o]], kernel[[o, i, h, w]]);
                    }
                }
            }
        }
    }

    #[test]
    fn dense_weight_is_transposed() {
        let weight = sequential(&[3, 4]);
        let converted = dense_to_channel_last(&weight).unwrap();

        assert_eq!(converted.shape(), &[4, 3]);
        assert_eq!(converted[[2, 1]], weight[[1, 2]]);
        assert_eq!(dense_to_channel_last(&converted).unwrap(), weight);
    }

    #[test]
    fn flatten_reorder_round_trip_is_exact() {
        for feature_map in [[64, 5, 5], [2, 3, 4], [1, 1, 1], [3, 1, 7], [5, 2, 1]] {
            let in_features = feature_map.iter().product::<usize>();
            let weight = sequential(&[6, in_features]);

            let reordered = reorder_flattened_chw_to_hwc(&weight, feature_map).unwrap();
            let back = reorder_flattened_hwc_to_chw(&reordered, feature_map).unwrap();

            assert_eq!(back, weight, "feature map {feature_map:?}");
        }
    }

    #[test]
    fn flatten_reorder_matches_channel_last_indexing() {
        let [c, h, w] = [2, 3, 4];
        let weight = sequential(&[5, c * h * w]);
        let reordered = reorder_flattened_chw_to_hwc(&weight, [c, h, w]).unwrap();

        for out in 0..5 {
            for ci in 0..c {
                for y in 0..h {
                    for x in 0..w {
                        let chw = ci * h * w + y * w + x;
                        let hwc = y * w * c + x * c + ci;
                        assert_eq!(reordered[[out, hwc]], weight[[out, chw]]);
                    }
                }
            }
        }
    }

    #[test]
    fn dense_after_flatten_is_reorder_then_transpose() {
        let weight = sequential(&[8, 2 * 2 * 3]);
        let converted = dense_after_flatten_to_channel_last(&weight, [3, 2, 2]).unwrap();

        assert_eq!(converted.shape(), &[12, 8]);
        let back = reorder_flattened_hwc_to_chw(&dense_to_channel_last(&converted).unwrap(), [3, 2, 2])
            .unwrap();
        assert_eq!(back, weight);
    }

    #[test]
    fn incompatible_feature_map_is_rejected() {
        let weight = sequential(&[4, 10]);

        assert!(matches!(
            reorder_flattened_chw_to_hwc(&weight, [3, 2, 2]),
            Err(ConversionError::Layout(_))
        ));
        assert!(matches!(
            conv_oihw_to_hwio(&weight),
            Err(ConversionError::Layout(_))
        ));
    }
}
