use std::str::FromStr;

use burn::{
    nn::{
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
    },
    prelude::*,
    tensor::{
        activation::{sigmoid, softmax},
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use super::ModelError;

#[derive(Module, Debug)]
pub struct ConvBnRelu<B: Backend> {
    conv: Conv2d<B>,
    norm: Option<BatchNorm<B, 2>>,
    activation: Relu,
}

impl<B: Backend> ConvBnRelu<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };

        self.activation.forward(x)
    }
}

#[derive(Config, Debug)]
pub struct ConvBnReluConfig {
    input_channels: usize,
    num_filters: usize,
    #[config(default = "3")]
    kernel_size: usize,
    #[config(default = "true")]
    use_batchnorm: bool,
}

impl ConvBnReluConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBnRelu<B> {
        ConvBnRelu {
            conv: Conv2dConfig::new(
                [self.input_channels, self.num_filters],
                [self.kernel_size, self.kernel_size],
            )
            .with_padding(PaddingConfig2d::Same)
            .with_bias(!self.use_batchnorm)
            .init(device),
            norm: self
                .use_batchnorm
                .then(|| BatchNormConfig::new(self.num_filters).init(device)),
            activation: Relu::new(),
        }
    }
}

/// Channel attention: global average pool, bottleneck dense layers and a
/// sigmoid gate multiplied back onto the input.
#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    pool: AdaptiveAvgPool2d,
    reduce: Linear<B>,
    expand: Linear<B>,
    activation: Relu,
}

impl<B: Backend> SqueezeExcite<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch_size, channels, _, _] = x.dims();

        let se = self.pool.forward(x.clone()).reshape([batch_size, channels]);
        let se = self.activation.forward(self.reduce.forward(se));
        let se = sigmoid(self.expand.forward(se)).reshape([batch_size, channels, 1, 1]);

        x.mul(se)
    }
}

#[derive(Config, Debug)]
pub struct SqueezeExciteConfig {
    channels: usize,
    #[config(default = "8")]
    ratio: usize,
}

impl SqueezeExciteConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SqueezeExcite<B> {
        let reduced = (self.channels / self.ratio).max(1);

        SqueezeExcite {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            reduce: LinearConfig::new(self.channels, reduced)
                .with_bias(false)
                .init(device),
            expand: LinearConfig::new(reduced, self.channels)
                .with_bias(false)
                .init(device),
            activation: Relu::new(),
        }
    }
}

/// Two conv / batch-norm / ReLU layers followed by squeeze-excitation.
#[derive(Module, Debug)]
pub struct ConvBlockSe<B: Backend> {
    conv_1: ConvBnRelu<B>,
    conv_2: ConvBnRelu<B>,
    squeeze_excite: SqueezeExcite<B>,
}

impl<B: Backend> ConvBlockSe<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv_1.forward(x);
        let x = self.conv_2.forward(x);

        self.squeeze_excite.forward(x)
    }
}

#[derive(Config, Debug)]
pub struct ConvBlockSeConfig {
    input_channels: usize,
    num_filters: usize,
    #[config(default = "true")]
    use_batchnorm: bool,
}

impl ConvBlockSeConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBlockSe<B> {
        ConvBlockSe {
            conv_1: ConvBnReluConfig::new(self.input_channels, self.num_filters)
                .with_use_batchnorm(self.use_batchnorm)
                .init(device),
            conv_2: ConvBnReluConfig::new(self.num_filters, self.num_filters)
                .with_use_batchnorm(self.use_batchnorm)
                .init(device),
            squeeze_excite: SqueezeExciteConfig::new(self.num_filters).init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    conv_block: ConvBlockSe<B>,
    max_pool: MaxPool2d,
}

impl<B: Backend> EncoderBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let skip_features = self.conv_block.forward(x);
        let x = self.max_pool.forward(skip_features.clone());

        (x, skip_features)
    }
}

#[derive(Config, Debug)]
pub struct EncoderBlockConfig {
    conv_block: ConvBlockSeConfig,
}

impl EncoderBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> EncoderBlock<B> {
        EncoderBlock {
            conv_block: self.conv_block.init(device),
            max_pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }
}

/// Up-sampling strategy of a decoder block.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum DecoderBlockType {
    /// Nearest x2 up-sampling followed by two 3x3 convolutions.
    Upsampling,
    /// 4x4 stride-2 transposed convolution followed by one 3x3 convolution.
    Transpose,
}

impl FromStr for DecoderBlockType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upsampling" => Ok(DecoderBlockType::Upsampling),
            "transpose" => Ok(DecoderBlockType::Transpose),
            other => Err(ModelError::UnknownBlockType {
                which: "decoder",
                got: other.to_string(),
            }),
        }
    }
}

pub fn upsample_nearest<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, height, width] = x.dims();

    interpolate(
        x,
        [height * 2, width * 2],
        InterpolateOptions::new(InterpolateMode::Nearest),
    )
}

fn concat_skips<B: Backend>(x: Tensor<B, 4>, skips: Vec<Tensor<B, 4>>) -> Tensor<B, 4> {
    if skips.is_empty() {
        return x;
    }

    let mut tensors = Vec::with_capacity(skips.len() + 1);
    tensors.push(x);
    tensors.extend(skips);

    Tensor::cat(tensors, 1)
}

#[derive(Module, Debug)]
pub struct UpsamplingDecoder<B: Backend> {
    conv_1: ConvBnRelu<B>,
    conv_2: ConvBnRelu<B>,
}

#[derive(Module, Debug)]
pub struct TransposeDecoder<B: Backend> {
    conv_transpose: ConvTranspose2d<B>,
    norm: Option<BatchNorm<B, 2>>,
    activation: Relu,
    conv: ConvBnRelu<B>,
}

#[derive(Module, Debug)]
pub enum DecoderStage<B: Backend> {
    Upsampling(UpsamplingDecoder<B>),
    Transpose(TransposeDecoder<B>),
}

/// Doubles the resolution of `x`, concatenates the skips and refines.
#[derive(Module, Debug)]
pub struct DecoderBlock<B: Backend> {
    stage: DecoderStage<B>,
    squeeze_excite: Option<SqueezeExcite<B>>,
}

impl<B: Backend> DecoderBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>, skips: Vec<Tensor<B, 4>>) -> Tensor<B, 4> {
        let x = match &self.stage {
            DecoderStage::Upsampling(block) => {
                let x = concat_skips(upsample_nearest(x), skips);
                let x = block.conv_1.forward(x);
                block.conv_2.forward(x)
            }
            DecoderStage::Transpose(block) => {
                let x = block.conv_transpose.forward(x);
                let x = match &block.norm {
                    Some(norm) => norm.forward(x),
                    None => x,
                };
                let x = concat_skips(block.activation.forward(x), skips);
                block.conv.forward(x)
            }
        };

        match &self.squeeze_excite {
            Some(se) => se.forward(x),
            None => x,
        }
    }
}

#[derive(Config, Debug)]
pub struct DecoderBlockConfig {
    input_channels: usize,
    /// Sum of the channels of every concatenated skip.
    skip_channels: usize,
    num_filters: usize,
    #[config(default = "DecoderBlockType::Upsampling")]
    block_type: DecoderBlockType,
    #[config(default = "true")]
    use_batchnorm: bool,
    #[config(default = "false")]
    squeeze_excite: bool,
}

impl DecoderBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DecoderBlock<B> {
        let merged = self.num_filters + self.skip_channels;

        let stage = match self.block_type {
            DecoderBlockType::Upsampling => DecoderStage::Upsampling(UpsamplingDecoder {
                conv_1: ConvBnReluConfig::new(self.input_channels + self.skip_channels, self.num_filters)
                    .with_use_batchnorm(self.use_batchnorm)
                    .init(device),
                conv_2: ConvBnReluConfig::new(self.num_filters, self.num_filters)
                    .with_use_batchnorm(self.use_batchnorm)
                    .init(device),
            }),
            DecoderBlockType::Transpose => DecoderStage::Transpose(TransposeDecoder {
                conv_transpose: ConvTranspose2dConfig::new(
                    [self.input_channels, self.num_filters],
                    [4, 4],
                )
                .with_stride([2, 2])
                .with_padding([1, 1])
                .with_bias(!self.use_batchnorm)
                .init(device),
                norm: self
                    .use_batchnorm
                    .then(|| BatchNormConfig::new(self.num_filters).init(device)),
                activation: Relu::new(),
                conv: ConvBnReluConfig::new(merged, self.num_filters)
                    .with_use_batchnorm(self.use_batchnorm)
                    .init(device),
            }),
        };

        DecoderBlock {
            stage,
            squeeze_excite: self
                .squeeze_excite
                .then(|| SqueezeExciteConfig::new(self.num_filters).init(device)),
        }
    }
}

/// Final activation of a segmentation or classification head.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum OutputActivation {
    Sigmoid,
    Softmax,
    Linear,
}

impl OutputActivation {
    pub fn apply<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            OutputActivation::Sigmoid => sigmoid(x),
            OutputActivation::Softmax => softmax(x, 1),
            OutputActivation::Linear => x,
        }
    }
}

impl FromStr for OutputActivation {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sigmoid" => Ok(OutputActivation::Sigmoid),
            "softmax" => Ok(OutputActivation::Softmax),
            "linear" => Ok(OutputActivation::Linear),
            other => Err(ModelError::InvalidConfig(format!(
                "unknown activation `{other}`"
            ))),
        }
    }
}

#[derive(Module, Debug)]
pub struct OutputBlock<B: Backend> {
    conv: Conv2d<B>,
    use_softmax: bool,
    use_sigmoid: bool,
}

impl<B: Backend> OutputBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);

        if self.use_softmax {
            softmax(x, 1)
        } else if self.use_sigmoid {
            sigmoid(x)
        } else {
            x
        }
    }
}

#[derive(Config, Debug)]
pub struct OutputBlockConfig {
    input_channels: usize,
    num_classes: usize,
    #[config(default = "1")]
    kernel_size: usize,
    #[config(default = "OutputActivation::Sigmoid")]
    activation: OutputActivation,
}

impl OutputBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> OutputBlock<B> {
        OutputBlock {
            conv: Conv2dConfig::new(
                [self.input_channels, self.num_classes],
                [self.kernel_size, self.kernel_size],
            )
            .with_padding(PaddingConfig2d::Same)
            .init(device),
            use_softmax: self.activation == OutputActivation::Softmax,
            use_sigmoid: self.activation == OutputActivation::Sigmoid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn squeeze_excite_keeps_shape() {
        let device = Default::default();
        let se = SqueezeExciteConfig::new(16).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::ones([2, 16, 8, 8], &device);

        assert_eq!(se.forward(x).dims(), [2, 16, 8, 8]);
    }

    #[test]
    fn encoder_block_returns_pooled_and_skip() {
        let device = Default::default();
        let block = EncoderBlockConfig::new(ConvBlockSeConfig::new(3, 16)).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::ones([1, 3, 16, 16], &device);

        let (pooled, skip) = block.forward(x);
        assert_eq!(pooled.dims(), [1, 16, 8, 8]);
        assert_eq!(skip.dims(), [1, 16, 16, 16]);
    }

    #[test]
    fn decoder_blocks_double_resolution() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 32, 4, 4], &device);
        let skip_a = Tensor::<TestBackend, 4>::ones([1, 8, 8, 8], &device);
        let skip_b = Tensor::<TestBackend, 4>::ones([1, 4, 8, 8], &device);

        for block_type in [DecoderBlockType::Upsampling, DecoderBlockType::Transpose] {
            let block = DecoderBlockConfig::new(32, 12, 16)
                .with_block_type(block_type)
                .with_squeeze_excite(true)
                .init::<TestBackend>(&device);
            let out = block.forward(x.clone(), vec![skip_a.clone(), skip_b.clone()]);
            assert_eq!(out.dims(), [1, 16, 8, 8]);

            let plain = DecoderBlockConfig::new(32, 0, 16)
                .with_block_type(DecoderBlockType::Transpose)
                .init::<TestBackend>(&device);
            assert_eq!(plain.forward(x.clone(), Vec::new()).dims(), [1, 16, 8, 8]);
        }
    }

    #[test]
    fn softmax_output_sums_to_one() {
        let device = Default::default();
        let block = OutputBlockConfig::new(8, 3)
            .with_activation(OutputActivation::Softmax)
            .init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::random([1, 8, 4, 4], burn::tensor::Distribution::Default, &device);

        let sums = block.forward(x).sum_dim(1).into_data().to_vec::<f32>().unwrap();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
    }

    #[test]
    fn parse_block_types() {
        assert_eq!("transpose".parse::<DecoderBlockType>(), Ok(DecoderBlockType::Transpose));
        assert!(matches!(
            "pixelshuffle".parse::<DecoderBlockType>(),
            Err(ModelError::UnknownBlockType { which: "decoder", .. })
        ));
    }
}
