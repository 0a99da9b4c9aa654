//! Channel and scale bookkeeping shared by the decoder-based networks.
//!
//! Scales are tracked as levels, `log2` of the down-sampling factor relative
//! to the network input, so a decoder stage always moves from level `l` to
//! `l - 1` and can only merge skips that sit at `l - 1`.

use super::{ModelError, backbone::LayerTable};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeatureShape {
    pub channels: usize,
    pub level: i32,
}

impl FeatureShape {
    pub fn new(channels: usize, level: i32) -> Self {
        Self { channels, level }
    }

    pub fn of_layer(table: &LayerTable, index: usize) -> Self {
        let info = &table.layers()[index];
        Self::new(info.channels, info.level())
    }
}

/// One x2 up-sampling decoder stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagePlan {
    pub input_channels: usize,
    pub skip_channels: usize,
    pub filters: usize,
    /// Level of the stage output.
    pub level: i32,
}

impl StagePlan {
    pub fn output(&self) -> FeatureShape {
        FeatureShape::new(self.filters, self.level)
    }
}

/// Plans a decoder stage up-sampling `input` and merging `skips`.
pub fn upsample_stage(
    stage: &str,
    input: FeatureShape,
    skips: &[FeatureShape],
    filters: usize,
) -> Result<StagePlan, ModelError> {
    let level = input.level - 1;

    for skip in skips {
        if skip.level != level {
            return Err(ModelError::ScaleMismatch {
                stage: stage.to_string(),
                expected: level,
                found: skip.level,
            });
        }
    }

    Ok(StagePlan {
        input_channels: input.channels,
        skip_channels: skips.iter().map(|skip| skip.channels).sum(),
        filters,
        level,
    })
}

/// Checks that a decoder brings its features back to the input resolution.
pub fn ensure_full_resolution(model: &'static str, output: FeatureShape) -> Result<(), ModelError> {
    if output.level == 0 {
        Ok(())
    } else {
        Err(ModelError::OutputScale {
            model,
            level: output.level,
        })
    }
}

/// Indexes `len` elements the way a negative Python index does.
pub fn wrap_index(index: isize, len: usize) -> Result<usize, ModelError> {
    let wrapped = if index < 0 { index + len as isize } else { index };

    if wrapped >= 0 && (wrapped as usize) < len {
        Ok(wrapped as usize)
    } else {
        Err(ModelError::WrappedIndex { index, len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_merges_matching_skips() {
        let plan = upsample_stage(
            "decoder",
            FeatureShape::new(64, 3),
            &[FeatureShape::new(32, 2), FeatureShape::new(16, 2)],
            48,
        )
        .unwrap();

        assert_eq!(plan.skip_channels, 48);
        assert_eq!(plan.output(), FeatureShape::new(48, 2));
    }

    #[test]
    fn stage_rejects_mismatched_skip() {
        let err = upsample_stage("decoder", FeatureShape::new(64, 3), &[FeatureShape::new(32, 3)], 48)
            .unwrap_err();

        assert_eq!(
            err,
            ModelError::ScaleMismatch {
                stage: "decoder".to_string(),
                expected: 2,
                found: 3,
            }
        );
    }

    #[test]
    fn python_style_wrapping() {
        assert_eq!(wrap_index(-1, 5), Ok(4));
        assert_eq!(wrap_index(3, 5), Ok(3));
        assert!(wrap_index(-6, 5).is_err());
        assert!(wrap_index(5, 5).is_err());
    }

    #[test]
    fn full_resolution_check() {
        assert!(ensure_full_resolution("unet", FeatureShape::new(16, 0)).is_ok());
        assert_eq!(
            ensure_full_resolution("unet", FeatureShape::new(16, 1)),
            Err(ModelError::OutputScale {
                model: "unet",
                level: 1
            })
        );
    }
}
