use burn::{
    nn::{
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
    },
    prelude::*,
};

const DILATIONS: [usize; 3] = [6, 12, 18];

#[derive(Module, Debug)]
pub struct AsppBranch<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    activation: Relu,
}

impl<B: Backend> AsppBranch<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.activation.forward(self.norm.forward(self.conv.forward(x)))
    }
}

fn branch<B: Backend>(conv: Conv2dConfig, filters: usize, device: &B::Device) -> AsppBranch<B> {
    AsppBranch {
        conv: conv.init(device),
        norm: BatchNormConfig::new(filters).init(device),
        activation: Relu::new(),
    }
}

/// Atrous spatial pyramid pooling.
///
/// Five parallel branches (image pooling, 1x1 and three dilated 3x3
/// convolutions) are concatenated and projected back to `filters` channels.
/// The spatial size is preserved.
#[derive(Module, Debug)]
pub struct Aspp<B: Backend> {
    pool: AdaptiveAvgPool2d,
    image_branch: AsppBranch<B>,
    pointwise: AsppBranch<B>,
    dilated: Vec<AsppBranch<B>>,
    projection: AsppBranch<B>,
}

impl<B: Backend> Aspp<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = x.dims();

        let pooled = self.image_branch.forward(self.pool.forward(x.clone()));
        let pooled = pooled.repeat_dim(2, height).repeat_dim(3, width);

        let mut branches = Vec::with_capacity(self.dilated.len() + 2);
        branches.push(pooled);
        branches.push(self.pointwise.forward(x.clone()));
        for conv in &self.dilated {
            branches.push(conv.forward(x.clone()));
        }

        self.projection.forward(Tensor::cat(branches, 1))
    }
}

#[derive(Config, Debug)]
pub struct AsppConfig {
    input_channels: usize,
    #[config(default = "64")]
    filters: usize,
}

impl AsppConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Aspp<B> {
        let channels = [self.input_channels, self.filters];

        let dilated = DILATIONS
            .iter()
            .map(|&rate| {
                let conv = Conv2dConfig::new(channels, [3, 3])
                    .with_dilation([rate, rate])
                    .with_padding(PaddingConfig2d::Explicit(rate, rate))
                    .with_bias(false);
                branch(conv, self.filters, device)
            })
            .collect();

        Aspp {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            image_branch: branch(Conv2dConfig::new(channels, [1, 1]), self.filters, device),
            pointwise: branch(
                Conv2dConfig::new(channels, [1, 1]).with_bias(false),
                self.filters,
                device,
            ),
            dilated,
            projection: branch(
                Conv2dConfig::new([self.filters * (DILATIONS.len() + 2), self.filters], [1, 1])
                    .with_bias(false),
                self.filters,
                device,
            ),
        }
    }
}
