use burn::{
    nn::{
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
    },
    prelude::*,
};

use crate::Error;

/// Architecture hyper-parameters of the traffic-sign classifier.
///
/// The layer sizes that depend on the input resolution (the flattened feature
/// map feeding `fc1`) are derived from this config instead of being fixed.
#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 29)]
    pub num_classes: usize,
    #[config(default = 30)]
    pub input_size: usize,
    #[config(default = 3)]
    pub in_channels: usize,
    #[config(default = 32)]
    pub conv1_channels: usize,
    #[config(default = 5)]
    pub conv1_kernel: usize,
    #[config(default = 64)]
    pub conv2_channels: usize,
    #[config(default = 3)]
    pub conv2_kernel: usize,
    #[config(default = 2)]
    pub pool_size: usize,
    #[config(default = 128)]
    pub hidden_size: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
}

#[derive(Module, Debug)]
pub struct TrafficSignCnn<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    pool: MaxPool2d,
    dropout: Dropout,
    fc1: Linear<B>,
    fc2: Linear<B>,
    activation: Relu,
}

impl ModelConfig {
    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> TrafficSignCnn<B> {
        let [channels, height, width] = self.feature_map_shape();

        TrafficSignCnn {
            conv1: Conv2dConfig::new(
                [self.in_channels, self.conv1_channels],
                [self.conv1_kernel, self.conv1_kernel],
            )
            .init(device),
            conv2: Conv2dConfig::new(
                [self.conv1_channels, self.conv2_channels],
                [self.conv2_kernel, self.conv2_kernel],
            )
            .init(device),
            pool: MaxPool2dConfig::new([self.pool_size, self.pool_size])
                .with_strides([self.pool_size, self.pool_size])
                .init(),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc1: LinearConfig::new(channels * height * width, self.hidden_size).init(device),
            fc2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }

    /// Shape `[channels, height, width]` of the feature map right before the flatten.
    ///
    /// Spatial sizes saturate at zero for inputs smaller than the kernels; see
    /// [`ModelConfig::check`].
    pub fn feature_map_shape(&self) -> [usize; 3] {
        let size = self.spatial_size().unwrap_or_default();
        [self.conv2_channels, size, size]
    }

    /// Rejects configs whose layers cannot be stacked on an `input_size` image.
    pub fn check(&self) -> Result<(), Error> {
        let size = self.spatial_size().ok_or_else(|| {
            Error::InvalidModelConfig(format!(
                "input size {} is too small for kernels {} and {} with pooling {}",
                self.input_size, self.conv1_kernel, self.conv2_kernel, self.pool_size
            ))
        })?;
        if size == 0 || self.in_channels == 0 || self.conv2_channels == 0 || self.num_classes == 0 {
            return Err(Error::InvalidModelConfig(format!(
                "empty feature map {:?} or no classes ({})",
                [self.conv2_channels, size, size],
                self.num_classes
            )));
        }
        Ok(())
    }

    // Valid convolutions followed by floor-mode pooling.
    fn spatial_size(&self) -> Option<usize> {
        let after_conv1 = (self.input_size + 1).checked_sub(self.conv1_kernel)?;
        let after_pool1 = after_conv1.checked_div(self.pool_size)?;
        let after_conv2 = (after_pool1 + 1).checked_sub(self.conv2_kernel)?;
        after_conv2.checked_div(self.pool_size)
    }

    /// Number of features produced by the flatten, i.e. the input width of `fc1`.
    pub fn flattened_features(&self) -> usize {
        self.feature_map_shape().iter().product()
    }
}

impl<B: Backend> TrafficSignCnn<B> {
    /// # Shapes
    ///   - Images [batch_size, channels, height, width]
    ///   - Output [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.conv1.forward(images);
        let x = self.pool.forward(self.activation.forward(x));

        let x = self.conv2.forward(x);
        let x = self.pool.forward(self.activation.forward(x));

        // Channel-first flatten: (channel, height, width) element order.
        let x: Tensor<B, 2> = x.flatten(1, 3);

        let x = self.dropout.forward(x);
        let x = self.activation.forward(self.fc1.forward(x));

        self.fc2.forward(x)
    }

    /// Softmax probabilities over the classes.
    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        burn::tensor::activation::softmax(self.forward(images), 1)
    }

    pub fn conv1(&self) -> &Conv2d<B> {
        &self.conv1
    }

    pub fn conv2(&self) -> &Conv2d<B> {
        &self.conv2
    }

    pub fn fc1(&self) -> &Linear<B> {
        &self.fc1
    }

    pub fn fc2(&self) -> &Linear<B> {
        &self.fc2
    }

    /// Number of classes produced by the output layer.
    pub fn num_classes(&self) -> usize {
        self.fc2.weight.dims()[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn feature_map_shape_matches_reference_architecture() {
        let config = ModelConfig::new();

        assert_eq!(config.feature_map_shape(), [64, 5, 5]);
        assert_eq!(config.flattened_features(), 1600);
    }

    #[test]
    fn feature_map_shape_follows_input_size() {
        let config = ModelConfig::new().with_input_size(32);

        // 32 -> conv5 -> 28 -> pool -> 14 -> conv3 -> 12 -> pool -> 6
        assert_eq!(config.feature_map_shape(), [64, 6, 6]);
    }

    #[test]
    fn too_small_input_is_a_config_error() {
        for config in [
            ModelConfig::new().with_input_size(6),
            ModelConfig::new().with_input_size(3),
            ModelConfig::new().with_pool_size(0),
        ] {
            assert_eq!(config.feature_map_shape()[1..], [0, 0]);
            assert!(matches!(config.check(), Err(Error::InvalidModelConfig(_))));
        }

        // 12 -> conv5 -> 8 -> pool -> 4 -> conv3 -> 2 -> pool -> 1
        let smallest = ModelConfig::new().with_input_size(12);
        assert!(smallest.check().is_ok());
        assert_eq!(smallest.feature_map_shape(), [64, 1, 1]);
        assert!(ModelConfig::new().check().is_ok());
    }

    #[test]
    fn forward_produces_one_logit_per_class() {
        let device = Default::default();
        let model = ModelConfig::new()
            .with_num_classes(7)
            .init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 30, 30], &device);
        let output = model.forward(images);

        assert_eq!(output.dims(), [2, 7]);
        assert_eq!(model.num_classes(), 7);
    }

    #[test]
    fn probabilities_sum_to_one() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 4>::ones([1, 3, 30, 30], &device);
        let total = model
            .probabilities(images)
            .sum()
            .into_scalar()
            .elem::<f32>();

        assert!((total - 1.0).abs() < 1e-5);
    }
}
