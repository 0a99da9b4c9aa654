use burn::{
    backend::NdArray,
    prelude::*,
    tensor::Transaction,
    train::metric::{Adaptor, ItemLazy, LossInput},
};
use derive_new::new;

use super::metrics::{BinaryAccuracyInput, FScoreInput, IoUScoreInput};

/// Learner item of a segmentation step: probabilities of the evaluated head
/// and the one-hot targets.
#[derive(new)]
pub struct SegmentationOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub output: Tensor<B, 4>,
    pub targets: Tensor<B, 4>,
}

impl<B: Backend> ItemLazy for SegmentationOutput<B> {
    type ItemSync = SegmentationOutput<NdArray>;

    fn sync(self) -> Self::ItemSync {
        let [output, loss, targets] = Transaction::default()
            .register(self.output)
            .register(self.loss)
            .register(self.targets)
            .execute()
            .try_into()
            .expect("Correct amount of tensor data");

        let device = &Default::default();

        SegmentationOutput {
            output: Tensor::from_data(output, device),
            loss: Tensor::from_data(loss, device),
            targets: Tensor::from_data(targets, device),
        }
    }
}

impl<B: Backend> Adaptor<LossInput<B>> for SegmentationOutput<B> {
    fn adapt(&self) -> LossInput<B> {
        LossInput::new(self.loss.clone())
    }
}

impl<B: Backend> Adaptor<IoUScoreInput<B>> for SegmentationOutput<B> {
    fn adapt(&self) -> IoUScoreInput<B> {
        IoUScoreInput::new(self.output.clone(), self.targets.clone())
    }
}

impl<B: Backend> Adaptor<FScoreInput<B>> for SegmentationOutput<B> {
    fn adapt(&self) -> FScoreInput<B> {
        FScoreInput::new(self.output.clone(), self.targets.clone())
    }
}

/// Learner item of a classification step.
#[derive(new)]
pub struct ClassificationOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    /// Probability of the positive class, one per image.
    pub output: Tensor<B, 1>,
    pub targets: Tensor<B, 1>,
}

impl<B: Backend> ItemLazy for ClassificationOutput<B> {
    type ItemSync = ClassificationOutput<NdArray>;

    fn sync(self) -> Self::ItemSync {
        let [output, loss, targets] = Transaction::default()
            .register(self.output)
            .register(self.loss)
            .register(self.targets)
            .execute()
            .try_into()
            .expect("Correct amount of tensor data");

        let device = &Default::default();

        ClassificationOutput {
            output: Tensor::from_data(output, device),
            loss: Tensor::from_data(loss, device),
            targets: Tensor::from_data(targets, device),
        }
    }
}

impl<B: Backend> Adaptor<LossInput<B>> for ClassificationOutput<B> {
    fn adapt(&self) -> LossInput<B> {
        LossInput::new(self.loss.clone())
    }
}

impl<B: Backend> Adaptor<BinaryAccuracyInput<B>> for ClassificationOutput<B> {
    fn adapt(&self) -> BinaryAccuracyInput<B> {
        BinaryAccuracyInput::new(self.output.clone(), self.targets.clone())
    }
}
