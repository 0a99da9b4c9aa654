use std::marker::PhantomData;

use burn::prelude::*;

use crate::model::ModelError;

const EPSILON: f32 = 1e-7;

/// Dice weights of the two stroke classes and the background channel.
pub const STROKE_CLASS_WEIGHTS: [f32; 3] = [0.45, 0.45, 0.1];

/// Sums `x` over every axis but the channel axis.
fn per_class_sum<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 1> {
    let channels = x.dims()[1];
    x.sum_dim(0).sum_dim(2).sum_dim(3).reshape([channels])
}

/// Mean of per-class scores, each scaled by its class weight when given.
fn weighted_mean<B: Backend>(scores: Tensor<B, 1>, class_weights: &[f32]) -> Tensor<B, 1> {
    if class_weights.is_empty() {
        return scores.mean();
    }

    let weights = Tensor::<B, 1>::from_data(
        TensorData::new(class_weights.to_vec(), [class_weights.len()]).convert::<B::FloatElem>(),
        &scores.device(),
    );
    scores.mul(weights).mean()
}

fn check_shapes<B: Backend>(inputs: &Tensor<B, 4>, targets: &Tensor<B, 4>) {
    assert!(
        inputs.dims() == targets.dims(),
        "Predictions and one-hot targets must have the same shape: {:?} vs {:?}",
        inputs.dims(),
        targets.dims()
    );
}

fn check_class_weights(class_weights: &[f32], channels: usize) {
    assert!(
        class_weights.is_empty() || class_weights.len() == channels,
        "Expected {} class weights, got {}",
        channels,
        class_weights.len()
    );
}

#[derive(Config, Debug)]
pub struct DiceLossConfig {
    #[config(default = 1.0)]
    pub beta: f32,

    #[config(default = 1e-5)]
    pub smooth: f32,

    /// Per-class weights; an empty list weighs every class equally. See
    /// [`STROKE_CLASS_WEIGHTS`] for the three-channel stroke masks.
    #[config(default = "Vec::new()")]
    pub class_weights: Vec<f32>,
}

impl DiceLossConfig {
    pub fn init<B: Backend>(&self, _device: &B::Device) -> DiceLoss<B> {
        assert!(self.beta > 0., "Beta must be positive. Got {}", self.beta);
        assert!(
            self.smooth >= 0.,
            "Smoothing factor must be non-negative. Got {}",
            self.smooth
        );

        DiceLoss {
            beta: self.beta,
            smooth: self.smooth,
            class_weights: self.class_weights.clone(),
            _b: PhantomData,
        }
    }
}

/// `1 - F-score`, computed per class over the whole batch.
#[derive(Module, Debug)]
pub struct DiceLoss<B: Backend> {
    pub beta: f32,
    pub smooth: f32,
    pub class_weights: Vec<f32>,
    _b: PhantomData<B>,
}

impl<B: Backend> DiceLoss<B> {
    pub fn forward(&self, inputs: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
        check_shapes(&inputs, &targets);
        check_class_weights(&self.class_weights, inputs.dims()[1]);

        let beta2 = self.beta * self.beta;
        let true_pos = per_class_sum(inputs.clone() * targets.clone());
        let false_pos = per_class_sum(inputs) - true_pos.clone();
        let false_neg = per_class_sum(targets) - true_pos.clone();

        let numerator = true_pos.clone().mul_scalar(1.0 + beta2).add_scalar(self.smooth);
        let denominator = true_pos
            .mul_scalar(1.0 + beta2)
            .add(false_neg.mul_scalar(beta2))
            .add(false_pos)
            .add_scalar(self.smooth);

        let score = weighted_mean(numerator / denominator, &self.class_weights);
        score.neg().add_scalar(1.0)
    }
}

#[derive(Config, Debug)]
pub struct JaccardLossConfig {
    #[config(default = 1e-5)]
    pub smooth: f32,

    #[config(default = "Vec::new()")]
    pub class_weights: Vec<f32>,
}

impl JaccardLossConfig {
    pub fn init<B: Backend>(&self, _device: &B::Device) -> JaccardLoss<B> {
        assert!(
            self.smooth >= 0.,
            "Smoothing factor must be non-negative. Got {}",
            self.smooth
        );

        JaccardLoss {
            smooth: self.smooth,
            class_weights: self.class_weights.clone(),
            _b: PhantomData,
        }
    }
}

/// `1 - IoU`, computed per class over the whole batch.
#[derive(Module, Debug)]
pub struct JaccardLoss<B: Backend> {
    pub smooth: f32,
    pub class_weights: Vec<f32>,
    _b: PhantomData<B>,
}

impl<B: Backend> JaccardLoss<B> {
    pub fn forward(&self, inputs: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
        check_shapes(&inputs, &targets);
        check_class_weights(&self.class_weights, inputs.dims()[1]);

        let intersection = per_class_sum(inputs.clone() * targets.clone());
        let union = per_class_sum(inputs) + per_class_sum(targets) - intersection.clone();

        let iou = intersection.add_scalar(self.smooth) / union.add_scalar(self.smooth);
        weighted_mean(iou, &self.class_weights).neg().add_scalar(1.0)
    }
}

#[derive(Config, Debug)]
pub struct CategoricalFocalLossConfig {
    #[config(default = 0.25)]
    pub alpha: f32,

    #[config(default = 2.0)]
    pub gamma: f32,
}

impl CategoricalFocalLossConfig {
    pub fn init<B: Backend>(&self, _device: &B::Device) -> CategoricalFocalLoss<B> {
        assert!(self.gamma >= 0., "Gamma must be non-negative. Got {}", self.gamma);

        CategoricalFocalLoss {
            alpha: self.alpha,
            gamma: self.gamma,
            _b: PhantomData,
        }
    }
}

/// `-alpha * (1 - p)^gamma * log(p)` on the target class, averaged over
/// every element.
#[derive(Module, Debug)]
pub struct CategoricalFocalLoss<B: Backend> {
    pub alpha: f32,
    pub gamma: f32,
    _b: PhantomData<B>,
}

impl<B: Backend> CategoricalFocalLoss<B> {
    pub fn forward(&self, inputs: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
        check_shapes(&inputs, &targets);

        let probs = inputs.clamp(EPSILON, 1.0 - EPSILON);
        let modulation = probs.clone().neg().add_scalar(1.0).powf_scalar(self.gamma);

        let loss = targets * modulation * probs.log();
        loss.mean().mul_scalar(-self.alpha)
    }
}

#[derive(Config, Debug)]
pub struct FocalTverskyLossConfig {
    /// Weight of false negatives; false positives get `1 - alpha`.
    #[config(default = 0.5)]
    pub alpha: f32,

    #[config(default = "4.0 / 3.0")]
    pub gamma: f32,
}

impl FocalTverskyLossConfig {
    pub fn init<B: Backend>(&self, _device: &B::Device) -> FocalTverskyLoss<B> {
        assert!(
            (0.0..=1.0).contains(&self.alpha),
            "Alpha must be in [0, 1]. Got {}",
            self.alpha
        );
        assert!(self.gamma > 0., "Gamma must be positive. Got {}", self.gamma);

        FocalTverskyLoss {
            alpha: self.alpha,
            gamma: self.gamma,
            _b: PhantomData,
        }
    }
}

/// `(1 - tversky)^(1 / gamma)` over the flattened batch.
#[derive(Module, Debug)]
pub struct FocalTverskyLoss<B: Backend> {
    pub alpha: f32,
    pub gamma: f32,
    _b: PhantomData<B>,
}

impl<B: Backend> FocalTverskyLoss<B> {
    pub fn forward(&self, inputs: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
        check_shapes(&inputs, &targets);

        let true_pos = (inputs.clone() * targets.clone()).sum();
        let false_neg = (targets.clone() * inputs.clone().neg().add_scalar(1.0)).sum();
        let false_pos = (targets.neg().add_scalar(1.0) * inputs).sum();

        let tversky = true_pos.clone().add_scalar(EPSILON)
            / true_pos
                .add(false_neg.mul_scalar(self.alpha))
                .add(false_pos.mul_scalar(1.0 - self.alpha))
                .add_scalar(EPSILON);

        tversky
            .neg()
            .add_scalar(1.0)
            .clamp_min(0.0)
            .powf_scalar(1.0 / self.gamma)
    }
}

#[derive(Config, Debug)]
pub struct ComboLossConfig {
    /// Below 0.5 penalizes false positives more, above 0.5 false negatives.
    #[config(default = 0.5)]
    pub ce_w: f32,

    /// Share of the cross-entropy term in the total.
    #[config(default = 0.5)]
    pub ce_d_w: f32,

    #[config(default = 1.0)]
    pub smooth: f32,
}

impl ComboLossConfig {
    pub fn init<B: Backend>(&self, _device: &B::Device) -> ComboLoss<B> {
        assert!(
            (0.0..=1.0).contains(&self.ce_w) && (0.0..=1.0).contains(&self.ce_d_w),
            "Combo weights must be in [0, 1]. Got ce_w={} ce_d_w={}",
            self.ce_w,
            self.ce_d_w
        );

        ComboLoss {
            ce_w: self.ce_w,
            ce_d_w: self.ce_d_w,
            smooth: self.smooth,
            _b: PhantomData,
        }
    }
}

/// Weighted cross-entropy summed over every element, minus the global dice
/// coefficient.
#[derive(Module, Debug)]
pub struct ComboLoss<B: Backend> {
    pub ce_w: f32,
    pub ce_d_w: f32,
    pub smooth: f32,
    _b: PhantomData<B>,
}

impl<B: Backend> ComboLoss<B> {
    pub fn forward(&self, inputs: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
        check_shapes(&inputs, &targets);

        let intersection = (inputs.clone() * targets.clone()).sum();
        let dice = intersection.mul_scalar(2.0).add_scalar(self.smooth)
            / (targets.clone().sum() + inputs.clone().sum()).add_scalar(self.smooth);

        let probs = inputs.clamp(EPSILON, 1.0 - EPSILON);
        let positive = targets.clone() * probs.clone().log();
        let negative = targets.neg().add_scalar(1.0) * probs.neg().add_scalar(1.0).log();
        let cross_entropy = (positive.mul_scalar(self.ce_w) + negative.mul_scalar(1.0 - self.ce_w))
            .sum()
            .neg();

        cross_entropy.mul_scalar(self.ce_d_w) - dice.mul_scalar(1.0 - self.ce_d_w)
    }
}

/// Which terms make up the segmentation objective.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum SegmentationLossKind {
    Dice,
    Focal,
    DiceFocal,
    Jaccard,
    FocalTversky,
    DiceFocalTversky,
    Combo,
}

impl SegmentationLossKind {
    fn uses_dice(&self) -> bool {
        matches!(
            self,
            Self::Dice | Self::DiceFocal | Self::DiceFocalTversky
        )
    }

    fn uses_focal(&self) -> bool {
        matches!(self, Self::Focal | Self::DiceFocal)
    }

    fn uses_focal_tversky(&self) -> bool {
        matches!(self, Self::FocalTversky | Self::DiceFocalTversky)
    }
}

/// Segmentation objective, dice plus focal by default.
///
/// `SegmentationLossKind::Focal` trains on the categorical focal loss
/// alone.
#[derive(Config, Debug)]
pub struct SegmentationLossConfig {
    #[config(default = "SegmentationLossKind::DiceFocal")]
    pub kind: SegmentationLossKind,

    #[config(default = "DiceLossConfig::new()")]
    pub dice: DiceLossConfig,

    #[config(default = "CategoricalFocalLossConfig::new()")]
    pub focal: CategoricalFocalLossConfig,

    #[config(default = "JaccardLossConfig::new()")]
    pub jaccard: JaccardLossConfig,

    #[config(default = "FocalTverskyLossConfig::new()")]
    pub focal_tversky: FocalTverskyLossConfig,

    #[config(default = "ComboLossConfig::new()")]
    pub combo: ComboLossConfig,
}

impl SegmentationLossConfig {
    /// Checks the class weights of the selected terms against the number of
    /// output channels.
    pub fn check_classes(&self, num_classes: usize) -> Result<(), ModelError> {
        let weighted = [
            ("dice", self.kind.uses_dice(), &self.dice.class_weights),
            (
                "jaccard",
                self.kind == SegmentationLossKind::Jaccard,
                &self.jaccard.class_weights,
            ),
        ];

        for (loss, used, weights) in weighted {
            if used && !weights.is_empty() && weights.len() != num_classes {
                return Err(ModelError::ClassWeights {
                    loss,
                    expected: num_classes,
                    got: weights.len(),
                });
            }
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> SegmentationLoss<B> {
        let kind = &self.kind;

        SegmentationLoss {
            dice: kind.uses_dice().then(|| self.dice.init(device)),
            focal: kind.uses_focal().then(|| self.focal.init(device)),
            jaccard: (*kind == SegmentationLossKind::Jaccard).then(|| self.jaccard.init(device)),
            focal_tversky: kind
                .uses_focal_tversky()
                .then(|| self.focal_tversky.init(device)),
            combo: (*kind == SegmentationLossKind::Combo).then(|| self.combo.init(device)),
        }
    }
}

/// Sum of the configured loss terms.
#[derive(Module, Debug)]
pub struct SegmentationLoss<B: Backend> {
    dice: Option<DiceLoss<B>>,
    focal: Option<CategoricalFocalLoss<B>>,
    jaccard: Option<JaccardLoss<B>>,
    focal_tversky: Option<FocalTverskyLoss<B>>,
    combo: Option<ComboLoss<B>>,
}

impl<B: Backend> SegmentationLoss<B> {
    pub fn forward(&self, inputs: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
        let mut terms = Vec::with_capacity(2);

        if let Some(loss) = &self.dice {
            terms.push(loss.forward(inputs.clone(), targets.clone()));
        }
        if let Some(loss) = &self.focal {
            terms.push(loss.forward(inputs.clone(), targets.clone()));
        }
        if let Some(loss) = &self.jaccard {
            terms.push(loss.forward(inputs.clone(), targets.clone()));
        }
        if let Some(loss) = &self.focal_tversky {
            terms.push(loss.forward(inputs.clone(), targets.clone()));
        }
        if let Some(loss) = &self.combo {
            terms.push(loss.forward(inputs.clone(), targets.clone()));
        }

        terms
            .into_iter()
            .reduce(|total, term| total + term)
            .unwrap_or_else(|| Tensor::zeros([1], &inputs.device()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn tensor(values: Vec<f32>, shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::from_data(TensorData::new(values, shape), &Default::default())
    }

    fn scalar(loss: Tensor<TestBackend, 1>) -> f32 {
        loss.into_scalar()
    }

    /// Two pixels, two classes, one-hot.
    fn one_hot() -> Tensor<TestBackend, 4> {
        tensor(vec![1.0, 0.0, 0.0, 1.0], [1, 2, 1, 2])
    }

    #[test]
    fn dice_is_zero_for_a_perfect_prediction() {
        let loss = DiceLossConfig::new()
            .with_class_weights(Vec::new())
            .init::<TestBackend>(&Default::default());

        assert!(scalar(loss.forward(one_hot(), one_hot())).abs() < 1e-5);
    }

    #[test]
    fn dice_class_weights_scale_scores() {
        let loss = DiceLossConfig::new()
            .with_class_weights(vec![1.0, 0.0])
            .init::<TestBackend>(&Default::default());

        // Mean over classes of weighted scores: (1 * 1 + 0 * 1) / 2.
        assert!((scalar(loss.forward(one_hot(), one_hot())) - 0.5).abs() < 1e-5);
    }

    #[test]
    fn dice_penalizes_a_wrong_prediction() {
        let loss = DiceLossConfig::new()
            .with_class_weights(Vec::new())
            .init::<TestBackend>(&Default::default());
        let wrong = tensor(vec![0.0, 1.0, 1.0, 0.0], [1, 2, 1, 2]);

        assert!((scalar(loss.forward(wrong, one_hot())) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn jaccard_on_half_overlap() {
        let loss = JaccardLossConfig::new()
            .with_smooth(0.0)
            .init::<TestBackend>(&Default::default());
        let inputs = tensor(vec![1.0, 1.0], [1, 1, 1, 2]);
        let targets = tensor(vec![1.0, 0.0], [1, 1, 1, 2]);

        assert!((scalar(loss.forward(inputs, targets)) - 0.5).abs() < 1e-5);
    }

    #[test]
    fn focal_matches_closed_form() {
        let loss = CategoricalFocalLossConfig::new().init::<TestBackend>(&Default::default());
        let inputs = tensor(vec![0.5, 0.5], [1, 2, 1, 1]);
        let targets = tensor(vec![1.0, 0.0], [1, 2, 1, 1]);

        let expected = 0.25 * 0.25 * 2.0f32.ln() / 2.0;
        assert!((scalar(loss.forward(inputs, targets)) - expected).abs() < 1e-5);
    }

    #[test]
    fn focal_tversky_is_zero_for_a_perfect_prediction() {
        let loss = FocalTverskyLossConfig::new().init::<TestBackend>(&Default::default());
        assert!(scalar(loss.forward(one_hot(), one_hot())).abs() < 1e-3);
    }

    #[test]
    fn combo_rewards_overlap() {
        let loss = ComboLossConfig::new().init::<TestBackend>(&Default::default());
        let good = scalar(loss.forward(one_hot(), one_hot()));
        let bad = scalar(loss.forward(tensor(vec![0.0, 1.0, 1.0, 0.0], [1, 2, 1, 2]), one_hot()));

        assert!(good < 0.0);
        assert!(bad > good);
    }

    #[test]
    fn default_objective_sums_dice_and_focal() {
        let device = Default::default();
        let config = SegmentationLossConfig::new();
        let combined = config.init::<TestBackend>(&device);
        let dice = config.dice.init::<TestBackend>(&device);
        let focal = config.focal.init::<TestBackend>(&device);

        let inputs = tensor(vec![0.7, 0.2, 0.3, 0.8], [1, 2, 1, 2]);
        let total = scalar(combined.forward(inputs.clone(), one_hot()));
        let expected = scalar(dice.forward(inputs.clone(), one_hot()))
            + scalar(focal.forward(inputs, one_hot()));

        assert!((total - expected).abs() < 1e-5);
    }

    #[test]
    fn default_objective_fits_a_single_class() {
        let loss = SegmentationLossConfig::new().init::<TestBackend>(&Default::default());
        let inputs = tensor(vec![0.2, 0.9, 0.6, 0.1], [1, 1, 2, 2]);
        let targets = tensor(vec![0.0, 1.0, 1.0, 0.0], [1, 1, 2, 2]);

        assert!(SegmentationLossConfig::new().check_classes(1).is_ok());
        assert!(scalar(loss.forward(inputs, targets)).is_finite());
    }

    #[test]
    fn class_weights_are_checked_against_the_output() {
        let config = SegmentationLossConfig::new()
            .with_dice(DiceLossConfig::new().with_class_weights(STROKE_CLASS_WEIGHTS.to_vec()));

        assert!(config.check_classes(3).is_ok());
        assert_eq!(
            config.check_classes(1),
            Err(ModelError::ClassWeights {
                loss: "dice",
                expected: 1,
                got: 3,
            })
        );

        let focal_only = config.with_kind(SegmentationLossKind::Focal);
        assert!(focal_only.check_classes(1).is_ok());
    }

    #[test]
    #[should_panic(expected = "class weights")]
    fn mismatched_class_weights_panic() {
        let loss = DiceLossConfig::new()
            .with_class_weights(STROKE_CLASS_WEIGHTS.to_vec())
            .init::<TestBackend>(&Default::default());
        loss.forward(one_hot(), one_hot());
    }
}
