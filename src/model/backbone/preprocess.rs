use burn::prelude::*;

const CAFFE_MEAN_BGR: [f32; 3] = [103.939, 116.779, 123.68];
const TORCH_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const TORCH_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Input normalization expected by a backbone, applied to RGB images in the
/// `0..=255` range laid out as `[batch, channels, height, width]`.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum Preprocessing {
    Identity,
    /// RGB to BGR, then per-channel mean subtraction.
    Caffe,
    /// Scale to `0..=1`, then ImageNet mean / std normalization.
    Torch,
}

impl Preprocessing {
    pub fn apply<B: Backend>(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let channels = images.dims()[1];
        if channels != 3 {
            return match self {
                Preprocessing::Torch => images.div_scalar(255.0),
                _ => images,
            };
        }

        let device = images.device();
        let per_channel =
            |values: [f32; 3]| Tensor::<B, 1>::from_floats(values, &device).reshape([1, 3, 1, 1]);

        match self {
            Preprocessing::Identity => images,
            Preprocessing::Caffe => images.flip([1]).sub(per_channel(CAFFE_MEAN_BGR)),
            Preprocessing::Torch => images
                .div_scalar(255.0)
                .sub(per_channel(TORCH_MEAN))
                .div(per_channel(TORCH_STD)),
        }
    }
}
