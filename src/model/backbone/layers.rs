use burn::{
    nn::{
        BatchNorm, BatchNormConfig, PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
    },
    prelude::*,
    tensor::activation::{relu, sigmoid, silu},
};

/// Intermediate state threaded through the backbone layers.
///
/// Pre-activation and expansion layers stash the raw input in `residual` so
/// that the following block body can close the shortcut.
#[derive(Clone, Debug)]
pub struct Features<B: Backend> {
    pub x: Tensor<B, 4>,
    pub residual: Option<Tensor<B, 4>>,
}

impl<B: Backend> Features<B> {
    pub fn new(x: Tensor<B, 4>) -> Self {
        Self { x, residual: None }
    }

    pub fn detach(self) -> Self {
        Self {
            x: self.x.detach(),
            residual: self.residual.map(|r| r.detach()),
        }
    }
}

/// How batch-norm layers behave inside a backbone.
///
/// `Frozen` normalizes with the running statistics and stops gradients to
/// the affine parameters, matching a non-trainable normalization layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormMode {
    Batch,
    Frozen,
}

pub fn normalize<B: Backend>(norm: &BatchNorm<B, 2>, x: Tensor<B, 4>, mode: NormMode) -> Tensor<B, 4> {
    match mode {
        NormMode::Batch => norm.forward(x),
        NormMode::Frozen => {
            let channels = x.dims()[1];
            let shape = [1, channels, 1, 1];

            let mean = norm.running_mean.value().reshape(shape);
            let var = norm.running_var.value().reshape(shape);
            let gamma = norm.gamma.val().detach().reshape(shape);
            let beta = norm.beta.val().detach().reshape(shape);

            x.sub(mean)
                .div(var.add_scalar(norm.epsilon).sqrt())
                .mul(gamma)
                .add(beta)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Swish,
}

impl Activation {
    fn apply<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Activation::Relu => relu(x),
            Activation::Swish => silu(x),
        }
    }
}

fn same_padding(kernel: usize) -> PaddingConfig2d {
    PaddingConfig2d::Explicit(kernel / 2, kernel / 2)
}

/// Hyper-parameters of a single backbone layer.
#[derive(Clone, Debug, PartialEq)]
pub enum LayerOp {
    Conv {
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        input_norm: bool,
        norm: bool,
        activation: Activation,
    },
    MaxPool {
        kernel: usize,
        stride: usize,
        padding: usize,
    },
    PreActivation {
        channels: usize,
    },
    Residual {
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        projection: bool,
    },
    Expand {
        in_channels: usize,
        out_channels: usize,
    },
    MbConv {
        in_channels: usize,
        expanded: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        se_channels: usize,
    },
}

impl LayerOp {
    pub fn init<B: Backend>(&self, device: &B::Device) -> BackboneLayer<B> {
        match *self {
            LayerOp::Conv {
                in_channels,
                out_channels,
                kernel,
                stride,
                input_norm,
                norm,
                activation,
            } => BackboneLayer::Conv(ConvLayer {
                input_norm: input_norm.then(|| BatchNormConfig::new(in_channels).init(device)),
                conv: Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
                    .with_stride([stride, stride])
                    .with_padding(same_padding(kernel))
                    .with_bias(!norm)
                    .init(device),
                norm: norm.then(|| BatchNormConfig::new(out_channels).init(device)),
                swish: activation == Activation::Swish,
            }),
            LayerOp::MaxPool {
                kernel,
                stride,
                padding,
            } => BackboneLayer::MaxPool(
                MaxPool2dConfig::new([kernel, kernel])
                    .with_strides([stride, stride])
                    .with_padding(PaddingConfig2d::Explicit(padding, padding))
                    .init(),
            ),
            LayerOp::PreActivation { channels } => BackboneLayer::PreActivation(PreActivation {
                norm: BatchNormConfig::new(channels).init(device),
            }),
            LayerOp::Residual {
                in_channels,
                out_channels,
                stride,
                projection,
            } => BackboneLayer::Residual(ResidualUnit {
                conv_1: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                    .with_stride([stride, stride])
                    .with_padding(same_padding(3))
                    .with_bias(false)
                    .init(device),
                norm_2: BatchNormConfig::new(out_channels).init(device),
                conv_2: Conv2dConfig::new([out_channels, out_channels], [3, 3])
                    .with_padding(same_padding(3))
                    .with_bias(false)
                    .init(device),
                shortcut: projection.then(|| {
                    Conv2dConfig::new([in_channels, out_channels], [1, 1])
                        .with_stride([stride, stride])
                        .with_bias(false)
                        .init(device)
                }),
            }),
            LayerOp::Expand {
                in_channels,
                out_channels,
            } => BackboneLayer::Expand(ExpandLayer {
                conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                    .with_bias(false)
                    .init(device),
                norm: BatchNormConfig::new(out_channels).init(device),
            }),
            LayerOp::MbConv {
                in_channels,
                expanded,
                out_channels,
                kernel,
                stride,
                se_channels,
            } => BackboneLayer::MbConv(MbConvLayer {
                depthwise: Conv2dConfig::new([expanded, expanded], [kernel, kernel])
                    .with_stride([stride, stride])
                    .with_padding(same_padding(kernel))
                    .with_groups(expanded)
                    .with_bias(false)
                    .init(device),
                norm_1: BatchNormConfig::new(expanded).init(device),
                se_reduce: Conv2dConfig::new([expanded, se_channels], [1, 1]).init(device),
                se_expand: Conv2dConfig::new([se_channels, expanded], [1, 1]).init(device),
                project: Conv2dConfig::new([expanded, out_channels], [1, 1])
                    .with_bias(false)
                    .init(device),
                norm_2: BatchNormConfig::new(out_channels).init(device),
                residual: stride == 1 && in_channels == out_channels,
            }),
        }
    }
}

#[derive(Module, Debug)]
pub enum BackboneLayer<B: Backend> {
    Conv(ConvLayer<B>),
    MaxPool(MaxPool2d),
    PreActivation(PreActivation<B>),
    Residual(ResidualUnit<B>),
    Expand(ExpandLayer<B>),
    MbConv(MbConvLayer<B>),
}

impl<B: Backend> BackboneLayer<B> {
    pub fn forward(&self, features: Features<B>, mode: NormMode) -> Features<B> {
        match self {
            BackboneLayer::Conv(layer) => Features::new(layer.forward(features.x, mode)),
            BackboneLayer::MaxPool(pool) => Features::new(pool.forward(features.x)),
            BackboneLayer::PreActivation(layer) => layer.forward(features, mode),
            BackboneLayer::Residual(layer) => Features::new(layer.forward(features, mode)),
            BackboneLayer::Expand(layer) => layer.forward(features, mode),
            BackboneLayer::MbConv(layer) => Features::new(layer.forward(features, mode)),
        }
    }
}

#[derive(Module, Debug)]
pub struct ConvLayer<B: Backend> {
    input_norm: Option<BatchNorm<B, 2>>,
    conv: Conv2d<B>,
    norm: Option<BatchNorm<B, 2>>,
    swish: bool,
}

impl<B: Backend> ConvLayer<B> {
    fn forward(&self, x: Tensor<B, 4>, mode: NormMode) -> Tensor<B, 4> {
        let x = match &self.input_norm {
            Some(norm) => normalize(norm, x, mode),
            None => x,
        };
        let x = self.conv.forward(x);
        let x = match &self.norm {
            Some(norm) => normalize(norm, x, mode),
            None => x,
        };

        if self.swish {
            Activation::Swish.apply(x)
        } else {
            Activation::Relu.apply(x)
        }
    }
}

/// Batch-norm + ReLU ahead of a pre-activation residual unit.
#[derive(Module, Debug)]
pub struct PreActivation<B: Backend> {
    norm: BatchNorm<B, 2>,
}

impl<B: Backend> PreActivation<B> {
    fn forward(&self, features: Features<B>, mode: NormMode) -> Features<B> {
        let x = relu(normalize(&self.norm, features.x.clone(), mode));

        Features {
            x,
            residual: Some(features.x),
        }
    }
}

#[derive(Module, Debug)]
pub struct ResidualUnit<B: Backend> {
    conv_1: Conv2d<B>,
    norm_2: BatchNorm<B, 2>,
    conv_2: Conv2d<B>,
    shortcut: Option<Conv2d<B>>,
}

impl<B: Backend> ResidualUnit<B> {
    fn forward(&self, features: Features<B>, mode: NormMode) -> Tensor<B, 4> {
        let Features { x, residual } = features;

        let shortcut = match &self.shortcut {
            Some(conv) => conv.forward(x.clone()),
            None => residual.unwrap_or_else(|| x.clone()),
        };

        let y = self.conv_1.forward(x);
        let y = relu(normalize(&self.norm_2, y, mode));
        let y = self.conv_2.forward(y);

        y + shortcut
    }
}

#[derive(Module, Debug)]
pub struct ExpandLayer<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
}

impl<B: Backend> ExpandLayer<B> {
    fn forward(&self, features: Features<B>, mode: NormMode) -> Features<B> {
        let x = self.conv.forward(features.x.clone());
        let x = silu(normalize(&self.norm, x, mode));

        Features {
            x,
            residual: Some(features.x),
        }
    }
}

/// Depthwise conv, squeeze-excitation and projection of an MBConv block.
#[derive(Module, Debug)]
pub struct MbConvLayer<B: Backend> {
    depthwise: Conv2d<B>,
    norm_1: BatchNorm<B, 2>,
    se_reduce: Conv2d<B>,
    se_expand: Conv2d<B>,
    project: Conv2d<B>,
    norm_2: BatchNorm<B, 2>,
    residual: bool,
}

impl<B: Backend> MbConvLayer<B> {
    fn forward(&self, features: Features<B>, mode: NormMode) -> Tensor<B, 4> {
        let Features { x, residual } = features;
        let input = residual.unwrap_or_else(|| x.clone());

        let x = self.depthwise.forward(x);
        let x = silu(normalize(&self.norm_1, x, mode));

        let [batch_size, channels, _, _] = x.dims();
        let se = x.clone().mean_dim(3).mean_dim(2);
        let se = silu(self.se_reduce.forward(se));
        let se = sigmoid(self.se_expand.forward(se)).reshape([batch_size, channels, 1, 1]);
        let x = x.mul(se);

        let x = self.project.forward(x);
        let x = normalize(&self.norm_2, x, mode);

        if self.residual { x + input } else { x }
    }
}
