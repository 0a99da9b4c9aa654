use std::{fmt, sync::Arc};

use burn::{data::dataloader::DataLoader, prelude::*};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::metrics::{binary_accuracy, f_score, iou_score};
use crate::{
    dataset::{ClassificationBatch, SegmentationBatch},
    model::{Classifier, SegmentationModel},
};

/// Scores averaged over every image of a loader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub loss: f64,
    /// IoU score for segmentation, binary accuracy for classification.
    pub score: f64,
    pub f_score: Option<f64>,
    pub items: usize,
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loss {:.4}, score {:.4}", self.loss, self.score)?;
        if let Some(f_score) = self.f_score {
            write!(f, ", f-score {f_score:.4}")?;
        }
        write!(f, " over {} items", self.items)
    }
}

#[derive(Default)]
struct Running {
    loss: f64,
    score: f64,
    f_score: f64,
    items: usize,
}

impl Running {
    fn update(&mut self, batch_size: usize, loss: f64, score: f64, f_score: f64) {
        let weight = batch_size as f64;
        self.loss += loss * weight;
        self.score += score * weight;
        self.f_score += f_score * weight;
        self.items += batch_size;
    }

    fn report(self, with_f_score: bool) -> EvaluationReport {
        if self.items == 0 {
            return EvaluationReport::default();
        }

        let items = self.items as f64;
        EvaluationReport {
            loss: self.loss / items,
            score: self.score / items,
            f_score: with_f_score.then(|| self.f_score / items),
            items: self.items,
        }
    }
}

/// Runs `model` over `loader` and reports the mean loss, IoU score and
/// F-score of the evaluated head.
pub fn evaluate<B: Backend>(
    model: &SegmentationModel<B>,
    loader: Arc<dyn DataLoader<SegmentationBatch<B>>>,
) -> EvaluationReport {
    let mut running = Running::default();

    for batch in loader.iter() {
        let batch_size = batch.images.dims()[0];
        let item = model.forward_segmentation(batch);
        let loss = item.loss.into_scalar().elem::<f64>();

        running.update(
            batch_size,
            loss,
            iou_score(&item.output, &item.targets, None),
            f_score(&item.output, &item.targets, 1.0, None),
        );
    }

    let report = running.report(true);
    info!("Evaluation: {report}");
    report
}

/// Runs `model` over `loader` and reports the mean loss and binary accuracy.
pub fn evaluate_classifier<B: Backend>(
    model: &Classifier<B>,
    loader: Arc<dyn DataLoader<ClassificationBatch<B>>>,
) -> EvaluationReport {
    let mut running = Running::default();

    for batch in loader.iter() {
        let [batch_size] = batch.targets.dims();
        let item = model.forward_classification(batch);
        let loss = item.loss.into_scalar().elem::<f64>();

        running.update(
            batch_size,
            loss,
            binary_accuracy(&item.output, &item.targets, 0.5),
            0.0,
        );
    }

    let report = running.report(false);
    info!("Evaluation: {report}");
    report
}
