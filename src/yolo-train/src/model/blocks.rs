use crate::config::darknet::Activation;

use burn::{
    module::{Ignored, Param, RunningState},
    nn::{
        BatchNorm, BatchNormConfig, PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
    },
    prelude::*,
    tensor::activation,
};

/// Darknet `[convolutional]`: convolution, optional batch norm, activation.
///
/// The convolution carries a bias only when there is no batch norm.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: Option<BatchNorm<B, 2>>,
    activation: Ignored<Activation>,
}

/// Parameters of one block in Darknet file order.
pub struct DarknetConvWeights {
    /// `[beta, gamma, running_mean, running_var]`, present with batch norm.
    pub norm: Option<[Vec<f32>; 4]>,
    pub bias: Option<Vec<f32>>,
    pub weight: Vec<f32>,
}

impl<B: Backend> ConvBlock<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        size: usize,
        stride: usize,
        padding: usize,
        batch_normalize: bool,
        activation: Activation,
        device: &Device<B>,
    ) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [size, size])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_bias(!batch_normalize)
            .init(device);
        let norm = batch_normalize.then(|| {
            BatchNormConfig::new(out_channels)
                .with_momentum(0.1)
                .with_epsilon(1e-5)
                .init(device)
        });

        ConvBlock {
            conv,
            norm,
            activation: Ignored(activation),
        }
    }

    pub fn out_channels(&self) -> usize {
        self.conv.weight.dims()[0]
    }

    /// Number of `f32` values this block occupies in a `.weights` file.
    pub fn darknet_len(&self) -> usize {
        let [out, inp, kh, kw] = self.conv.weight.dims();
        let extra = if self.norm.is_some() { 4 * out } else { out };
        out * inp * kh * kw + extra
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        match *self.activation {
            Activation::Leaky => activation::leaky_relu(x, 0.1),
            Activation::Relu => activation::relu(x),
            Activation::Mish => activation::mish(x),
            Activation::Logistic => activation::sigmoid(x),
            Activation::Linear => x,
        }
    }

    /// Replaces the parameters with values read from a Darknet weights file.
    pub fn with_darknet_weights(mut self, weights: DarknetConvWeights) -> Self {
        let device = self.conv.weight.device();
        let dims = self.conv.weight.dims();
        let vector = |values: Vec<f32>| {
            let len = values.len();
            Tensor::<B, 1>::from_data(TensorData::new(values, [len]), &device)
        };

        if let (Some(norm), Some([beta, gamma, mean, var])) = (self.norm.as_mut(), weights.norm) {
            norm.beta = Param::from_tensor(vector(beta));
            norm.gamma = Param::from_tensor(vector(gamma));
            norm.running_mean = RunningState::new(vector(mean));
            norm.running_var = RunningState::new(vector(var));
        }
        if let (Some(_), Some(bias)) = (&self.conv.bias, weights.bias) {
            self.conv.bias = Some(Param::from_tensor(vector(bias)));
        }
        self.conv.weight = Param::from_tensor(Tensor::from_data(
            TensorData::new(weights.weight, dims),
            &device,
        ));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn bias_only_without_batch_norm() {
        let device = Default::default();
        let with_bn =
            ConvBlock::<TestBackend>::new(3, 8, 3, 1, 1, true, Activation::Leaky, &device);
        assert!(with_bn.conv.bias.is_none());
        assert!(with_bn.norm.is_some());
        assert_eq!(with_bn.darknet_len(), 8 * 3 * 3 * 3 + 4 * 8);

        let plain = ConvBlock::<TestBackend>::new(8, 4, 1, 1, 0, false, Activation::Linear, &device);
        assert!(plain.conv.bias.is_some());
        assert_eq!(plain.darknet_len(), 4 * 8 + 4);
    }

    #[test]
    fn stride_and_padding_set_output_size() {
        let device = Default::default();
        let block = ConvBlock::<TestBackend>::new(3, 6, 3, 2, 1, true, Activation::Mish, &device);
        let out = block.forward(Tensor::zeros([2, 3, 16, 16], &device));
        assert_eq!(out.dims(), [2, 6, 8, 8]);
    }

    #[test]
    fn darknet_weights_replace_parameters() {
        let device = Default::default();
        let block = ConvBlock::<TestBackend>::new(1, 2, 1, 1, 0, false, Activation::Linear, &device)
            .with_darknet_weights(DarknetConvWeights {
                norm: None,
                bias: Some(vec![1.0, -1.0]),
                weight: vec![2.0, 3.0],
            });
        let input = Tensor::<TestBackend, 4>::ones([1, 1, 1, 1], &device);
        let out = block.forward(input).into_data().to_vec::<f32>().unwrap();
        assert_eq!(out, vec![3.0, 2.0]);
    }

    #[test]
    fn darknet_weights_fill_batch_norm_running_stats() {
        let device = Default::default();
        let block = ConvBlock::<TestBackend>::new(1, 1, 1, 1, 0, true, Activation::Linear, &device)
            .with_darknet_weights(DarknetConvWeights {
                norm: Some([vec![0.5], vec![3.0], vec![1.0], vec![1.0]]),
                bias: None,
                weight: vec![2.0],
            });
        let norm = block.norm.as_ref().unwrap();
        let mean = norm.running_mean.value().into_data().to_vec::<f32>().unwrap();
        assert_eq!(mean, vec![1.0]);

        // (2 - 1) / sqrt(1 + eps) * 3 + 0.5
        let input = Tensor::<TestBackend, 4>::ones([1, 1, 1, 1], &device);
        let out = block.forward(input).into_data().to_vec::<f32>().unwrap();
        assert!((out[0] - 3.5).abs() < 1e-3, "{out:?}");
    }
}
