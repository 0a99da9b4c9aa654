use std::sync::Mutex;

use burn::{config::Config, data::dataset::transform::Mapper};
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::{
    ClassificationItem, SegmentationItem,
    raster::{Affine, BorderMode, Interpolation, Raster},
};

/// A random spatial transform, applied identically to an image and its mask.
#[derive(Config, Debug, PartialEq)]
pub enum Transform {
    /// Rotation by an angle drawn from `[-limit, limit]` degrees.
    Rotate {
        limit: f32,
        border: BorderMode,
        p: f64,
    },
    /// Horizontal, vertical or both, with equal odds.
    Flip { p: f64 },
    HorizontalFlip { p: f64 },
    ShiftScaleRotate {
        /// Fraction of the width / height.
        shift_limit: f32,
        /// Scale drawn from `[1 - scale_limit, 1 + scale_limit]`.
        scale_limit: f32,
        rotate_limit: f32,
        border: BorderMode,
        p: f64,
    },
}

impl Transform {
    pub fn rotate(limit: f32) -> Self {
        Transform::Rotate {
            limit,
            border: BorderMode::Reflect101,
            p: 0.5,
        }
    }

    pub fn flip() -> Self {
        Transform::Flip { p: 0.5 }
    }

    pub fn horizontal_flip(p: f64) -> Self {
        Transform::HorizontalFlip { p }
    }

    pub fn shift_scale_rotate() -> Self {
        Transform::ShiftScaleRotate {
            shift_limit: 0.1,
            scale_limit: 0.5,
            rotate_limit: 0.0,
            border: BorderMode::Constant,
            p: 0.5,
        }
    }

    fn probability(&self) -> f64 {
        match self {
            Transform::Rotate { p, .. }
            | Transform::Flip { p }
            | Transform::HorizontalFlip { p }
            | Transform::ShiftScaleRotate { p, .. } => *p,
        }
    }

    fn sample_affine<R: Rng>(&self, rng: &mut R, height: usize, width: usize) -> Option<(Affine, BorderMode)> {
        let symmetric = |rng: &mut R, limit: f32| {
            if limit > 0.0 {
                rng.gen_range(-limit..=limit)
            } else {
                0.0
            }
        };

        match self {
            Transform::Rotate { limit, border, .. } => {
                let degrees = symmetric(rng, *limit);
                Some((
                    Affine::inverse_similarity(height, width, degrees, 1.0, 0.0, 0.0),
                    *border,
                ))
            }
            Transform::ShiftScaleRotate {
                shift_limit,
                scale_limit,
                rotate_limit,
                border,
                ..
            } => {
                let degrees = symmetric(rng, *rotate_limit);
                let scale = 1.0 + symmetric(rng, *scale_limit);
                let shift_x = symmetric(rng, *shift_limit) * width as f32;
                let shift_y = symmetric(rng, *shift_limit) * height as f32;
                Some((
                    Affine::inverse_similarity(height, width, degrees, scale, shift_x, shift_y),
                    *border,
                ))
            }
            _ => None,
        }
    }

    /// Applies the transform to `image` and, when given, `mask`.
    pub fn apply<R: Rng>(&self, rng: &mut R, image: &mut Raster<u8>, mut mask: Option<&mut Raster<f32>>) {
        if !rng.gen_bool(self.probability().clamp(0.0, 1.0)) {
            return;
        }

        match self {
            Transform::Flip { .. } => {
                let (horizontal, vertical) = match rng.gen_range(0..3) {
                    0 => (true, false),
                    1 => (false, true),
                    _ => (true, true),
                };
                if horizontal {
                    *image = image.flip_horizontal();
                    if let Some(mask) = mask.as_deref_mut() {
                        *mask = mask.flip_horizontal();
                    }
                }
                if vertical {
                    *image = image.flip_vertical();
                    if let Some(mask) = mask.as_deref_mut() {
                        *mask = mask.flip_vertical();
                    }
                }
            }
            Transform::HorizontalFlip { .. } => {
                *image = image.flip_horizontal();
                if let Some(mask) = mask {
                    *mask = mask.flip_horizontal();
                }
            }
            other => {
                if let Some((affine, border)) = other.sample_affine(rng, image.height, image.width) {
                    *image = image.warp(&affine, border, Interpolation::Bilinear);
                    if let Some(mask) = mask {
                        *mask = mask.warp(&affine, border, Interpolation::Nearest);
                    }
                }
            }
        }
    }
}

#[derive(Config, Debug)]
pub struct AugmentationConfig {
    pub transforms: Vec<Transform>,
    /// Seeds the sampler; entropy when absent.
    #[config(default = "None")]
    pub seed: Option<u64>,
}

impl AugmentationConfig {
    /// Rotation up to 40 degrees followed by a random flip.
    pub fn segmentation() -> Self {
        Self::new(vec![Transform::rotate(40.0), Transform::flip()])
    }

    /// Horizontal flip and rotation up to 72 degrees.
    pub fn classification() -> Self {
        Self::new(vec![Transform::horizontal_flip(0.5), Transform::rotate(72.0)])
    }

    pub fn init(&self) -> AugmentationPipeline {
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        AugmentationPipeline {
            transforms: self.transforms.clone(),
            rng: Mutex::new(rng),
        }
    }
}

/// Transforms applied in order; usable as a dataset [`Mapper`].
pub struct AugmentationPipeline {
    transforms: Vec<Transform>,
    rng: Mutex<StdRng>,
}

impl AugmentationPipeline {
    pub fn apply(&self, image: &mut Raster<u8>, mut mask: Option<&mut Raster<f32>>) {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for transform in &self.transforms {
            transform.apply(&mut *rng, image, mask.as_deref_mut());
        }
    }
}

impl Mapper<SegmentationItem, SegmentationItem> for AugmentationPipeline {
    fn map(&self, item: &SegmentationItem) -> SegmentationItem {
        let mut item = item.clone();
        self.apply(&mut item.image, Some(&mut item.mask));
        item
    }
}

impl Mapper<ClassificationItem, ClassificationItem> for AugmentationPipeline {
    fn map(&self, item: &ClassificationItem) -> ClassificationItem {
        let mut item = item.clone();
        self.apply(&mut item.image, None);
        item
    }
}
