use std::marker::PhantomData;

use burn::prelude::*;
use burn::train::metric::state::{FormatOptions, NumericMetricState};
use burn::train::metric::{Metric, MetricEntry, MetricMetadata, Numeric};
use derive_new::new;

const SMOOTH: f64 = 1e-5;

/// Per-class true positives, prediction mass and target mass over the batch.
fn class_totals<B: Backend>(
    outputs: &Tensor<B, 4>,
    targets: &Tensor<B, 4>,
    threshold: Option<f64>,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    assert!(
        outputs.dims() == targets.dims(),
        "Outputs and targets must have the same shape: {:?} vs {:?}",
        outputs.dims(),
        targets.dims()
    );
    let channels = outputs.dims()[1];
    let outputs = match threshold {
        Some(threshold) => outputs.clone().greater_elem(threshold).float(),
        None => outputs.clone(),
    };

    let totals = |x: Tensor<B, 4>| -> Vec<f64> {
        x.sum_dim(0)
            .sum_dim(2)
            .sum_dim(3)
            .reshape([channels])
            .into_data()
            .convert::<f64>()
            .to_vec::<f64>()
            .unwrap_or_default()
    };

    (
        totals(outputs.clone() * targets.clone()),
        totals(outputs),
        totals(targets.clone()),
    )
}

/// Mean over classes of `(intersection + smooth) / (union + smooth)`.
pub fn iou_score<B: Backend>(
    outputs: &Tensor<B, 4>,
    targets: &Tensor<B, 4>,
    threshold: Option<f64>,
) -> f64 {
    let (true_pos, predicted, actual) = class_totals(outputs, targets, threshold);
    let scores = true_pos
        .iter()
        .zip(predicted.iter().zip(&actual))
        .map(|(tp, (p, a))| (tp + SMOOTH) / (p + a - tp + SMOOTH));

    mean(scores, true_pos.len())
}

/// Mean over classes of the F-score with the given `beta`.
pub fn f_score<B: Backend>(
    outputs: &Tensor<B, 4>,
    targets: &Tensor<B, 4>,
    beta: f64,
    threshold: Option<f64>,
) -> f64 {
    let beta2 = beta * beta;
    let (true_pos, predicted, actual) = class_totals(outputs, targets, threshold);
    let scores = true_pos
        .iter()
        .zip(predicted.iter().zip(&actual))
        .map(|(tp, (p, a))| {
            let false_pos = p - tp;
            let false_neg = a - tp;
            ((1.0 + beta2) * tp + SMOOTH)
                / ((1.0 + beta2) * tp + beta2 * false_neg + false_pos + SMOOTH)
        });

    mean(scores, true_pos.len())
}

fn mean(scores: impl Iterator<Item = f64>, count: usize) -> f64 {
    if count == 0 {
        return 0.0;
    }
    scores.sum::<f64>() / count as f64
}

#[derive(new)]
pub struct IoUScoreInput<B: Backend> {
    outputs: Tensor<B, 4>,
    targets: Tensor<B, 4>,
}

/// Intersection over union on soft (or thresholded) predictions.
#[derive(Default)]
pub struct IoUScoreMetric<B: Backend> {
    state: NumericMetricState,
    threshold: Option<f64>,
    _b: PhantomData<B>,
}

impl<B: Backend> IoUScoreMetric<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }
}

impl<B: Backend> Metric for IoUScoreMetric<B> {
    type Input = IoUScoreInput<B>;
    const NAME: &'static str = "IoU Score";

    fn update(&mut self, input: &IoUScoreInput<B>, _metadata: &MetricMetadata) -> MetricEntry {
        let batch_size = input.outputs.dims()[0];
        let iou = iou_score(&input.outputs, &input.targets, self.threshold);

        self.state.update(
            100.0 * iou,
            batch_size,
            FormatOptions::new(Self::NAME).unit("%").precision(2),
        )
    }

    fn clear(&mut self) {
        self.state.reset()
    }
}

impl<B: Backend> Numeric for IoUScoreMetric<B> {
    fn value(&self) -> f64 {
        self.state.value()
    }
}

#[derive(new)]
pub struct FScoreInput<B: Backend> {
    outputs: Tensor<B, 4>,
    targets: Tensor<B, 4>,
}

pub struct FScoreMetric<B: Backend> {
    state: NumericMetricState,
    beta: f64,
    threshold: Option<f64>,
    _b: PhantomData<B>,
}

impl<B: Backend> Default for FScoreMetric<B> {
    fn default() -> Self {
        Self {
            state: NumericMetricState::default(),
            beta: 1.0,
            threshold: None,
            _b: PhantomData,
        }
    }
}

impl<B: Backend> FScoreMetric<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_beta(mut self, beta: f64) -> Self {
        self.beta = beta;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }
}

impl<B: Backend> Metric for FScoreMetric<B> {
    type Input = FScoreInput<B>;
    const NAME: &'static str = "F-Score";

    fn update(&mut self, input: &FScoreInput<B>, _metadata: &MetricMetadata) -> MetricEntry {
        let batch_size = input.outputs.dims()[0];
        let score = f_score(&input.outputs, &input.targets, self.beta, self.threshold);

        self.state.update(
            100.0 * score,
            batch_size,
            FormatOptions::new(Self::NAME).unit("%").precision(2),
        )
    }

    fn clear(&mut self) {
        self.state.reset()
    }
}

impl<B: Backend> Numeric for FScoreMetric<B> {
    fn value(&self) -> f64 {
        self.state.value()
    }
}

#[derive(new)]
pub struct BinaryAccuracyInput<B: Backend> {
    probabilities: Tensor<B, 1>,
    targets: Tensor<B, 1>,
}

/// Share of images whose thresholded probability matches the label.
pub struct BinaryAccuracyMetric<B: Backend> {
    state: NumericMetricState,
    threshold: f64,
    _b: PhantomData<B>,
}

impl<B: Backend> Default for BinaryAccuracyMetric<B> {
    fn default() -> Self {
        Self {
            state: NumericMetricState::default(),
            threshold: 0.5,
            _b: PhantomData,
        }
    }
}

impl<B: Backend> BinaryAccuracyMetric<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

/// Fraction of correct thresholded predictions.
pub fn binary_accuracy<B: Backend>(
    probabilities: &Tensor<B, 1>,
    targets: &Tensor<B, 1>,
    threshold: f64,
) -> f64 {
    let [batch_size] = probabilities.dims();
    if batch_size == 0 {
        return 0.0;
    }

    let predictions = probabilities.clone().greater_elem(threshold);
    let labels = targets.clone().greater_elem(0.5);
    let correct = predictions
        .equal(labels)
        .int()
        .sum()
        .into_scalar()
        .elem::<f64>();

    correct / batch_size as f64
}

impl<B: Backend> Metric for BinaryAccuracyMetric<B> {
    type Input = BinaryAccuracyInput<B>;
    const NAME: &'static str = "Binary Accuracy";

    fn update(
        &mut self,
        input: &BinaryAccuracyInput<B>,
        _metadata: &MetricMetadata,
    ) -> MetricEntry {
        let [batch_size] = input.probabilities.dims();
        let accuracy = binary_accuracy(&input.probabilities, &input.targets, self.threshold);

        self.state.update(
            100.0 * accuracy,
            batch_size,
            FormatOptions::new(Self::NAME).unit("%").precision(2),
        )
    }

    fn clear(&mut self) {
        self.state.reset()
    }
}

impl<B: Backend> Numeric for BinaryAccuracyMetric<B> {
    fn value(&self) -> f64 {
        self.state.value()
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

    #[test]
    fn perfect_prediction_scores_one() {
        let targets = tensor(vec![1.0, 0.0, 0.0, 1.0], [1, 2, 1, 2]);

        assert!((iou_score(&targets, &targets, None) - 1.0).abs() < 1e-6);
        assert!((f_score(&targets, &targets, 1.0, None) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_on_half_overlap() {
        let outputs = tensor(vec![1.0, 1.0], [1, 1, 1, 2]);
        let targets = tensor(vec![1.0, 0.0], [1, 1, 1, 2]);

        assert!((iou_score(&outputs, &targets, None) - 0.5).abs() < 1e-4);
        // F1 = 2 * 1 / (2 * 1 + 0 + 1)
        assert!((f_score(&outputs, &targets, 1.0, None) - 2.0 / 3.0).abs() < 1e-4);
    }

    #[test]
    fn threshold_binarizes_outputs() {
        let outputs = tensor(vec![0.6, 0.4], [1, 1, 1, 2]);
        let targets = tensor(vec![1.0, 0.0], [1, 1, 1, 2]);

        assert!((iou_score(&outputs, &targets, Some(0.5)) - 1.0).abs() < 1e-6);
        assert!(iou_score(&outputs, &targets, None) < 1.0);
    }

    #[test]
    fn binary_accuracy_counts_matches() {
        let device = Default::default();
        let probabilities =
            Tensor::<TestBackend, 1>::from_floats([0.9, 0.2, 0.7, 0.4], &device);
        let targets = Tensor::<TestBackend, 1>::from_floats([1.0, 0.0, 0.0, 0.0], &device);

        assert!((binary_accuracy(&probabilities, &targets, 0.5) - 0.75).abs() < 1e-6);
    }
}
