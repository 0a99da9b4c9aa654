use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use burn::{
    backend::{Autodiff, Wgpu, wgpu::WgpuDevice},
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::{Dataset, transform::MapperDataset},
    },
    module::AutodiffModule,
    optim::AdamConfig,
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
    train::{LearnerBuilder, metric::LossMetric},
};
use clap::Args;
use stroke_seg::{
    BackboneKind, Classifier, ClassifierConfig, ClassifierPhase,
    dataset::{
        AugmentationConfig, ClassificationBatch, ClassificationBatcher,
        ClassificationRecordDataset, Compression, RecordSet, Transform,
    },
    model::{LayerRef, load_weights},
    training::{BinaryAccuracyMetric, evaluate_classifier},
};
use tracing::info;

use super::{create_artifact_dir, timestamp};

#[derive(Args)]
pub struct ClassifyArgs {
    #[arg(short, long)]
    pub train_data_dir: PathBuf,

    #[arg(short, long)]
    pub valid_data_dir: PathBuf,

    #[arg(long, default_value = "efficientnetb4")]
    pub backbone: BackboneKind,

    /// First backbone layer trained by the fine-tuning phases.
    #[arg(long, default_value = "block6a_project_bn")]
    pub fine_tune_from: String,

    /// JSON training configuration; overrides the flags above.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(short, long, default_value_t = 16)]
    pub batch_size: usize,

    #[arg(short, long, default_value_t = 0.0001)]
    pub lr: f64,

    #[arg(long, default_value_t = 4)]
    pub num_workers: usize,

    #[arg(long, default_value = "zlib")]
    pub compression: Compression,

    #[arg(long)]
    pub weights: Option<PathBuf>,

    #[arg(short, long, default_value = "artifacts/classifier")]
    pub artifact_dir: PathBuf,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

#[derive(Config)]
pub struct ClassifierTrainingConfig {
    pub model: ClassifierConfig,
    #[config(default = "AdamConfig::new()")]
    pub optimizer: AdamConfig,
    /// Epochs of the frozen, fine-tuning and full phases; zero skips a phase.
    #[config(default = "[10, 30, 30]")]
    pub phase_epochs: [usize; 3],
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 1.0e-4)]
    pub learning_rate: f64,
    #[config(default = "Compression::Zlib")]
    pub compression: Compression,
    #[config(default = 42)]
    pub seed: u64,
}

impl ClassifierTrainingConfig {
    fn from_args(args: &ClassifyArgs) -> Self {
        let model = ClassifierConfig::new()
            .with_backbone(args.backbone.clone())
            .with_fine_tune_from(LayerRef::from(args.fine_tune_from.as_str()));

        ClassifierTrainingConfig::new(model)
            .with_batch_size(args.batch_size)
            .with_num_workers(args.num_workers)
            .with_learning_rate(args.lr)
            .with_compression(args.compression)
            .with_seed(args.seed)
    }
}

fn load_split(dir: &Path, config: &ClassifierTrainingConfig) -> Result<ClassificationRecordDataset> {
    let dataset = RecordSet::discover(dir, Some(config.seed))
        .and_then(|records| records.with_compression(config.compression).open())
        .with_context(|| format!("loading records from {}", dir.display()))?;
    info!("Loaded {} samples from {}", dataset.len(), dir.display());
    Ok(dataset)
}

/// Flip and rotation on every phase; the full phase adds a stronger
/// rotation and flips on both axes.
fn train_loader<B: AutodiffBackend>(
    dataset: ClassificationRecordDataset,
    batcher: ClassificationBatcher<B>,
    phase: &ClassifierPhase,
    config: &ClassifierTrainingConfig,
) -> Arc<dyn DataLoader<ClassificationBatch<B>>> {
    let mut augmentation = AugmentationConfig::classification().with_seed(Some(config.seed));
    if phase.augments() {
        augmentation
            .transforms
            .extend([Transform::rotate(40.0), Transform::flip()]);
    }

    DataLoaderBuilder::new(batcher)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .shuffle(config.seed)
        .build(MapperDataset::new(dataset, augmentation.init()))
}

pub fn run(args: &ClassifyArgs) -> Result<()> {
    type MyBackend = Wgpu<f32, i32>;
    type MyAutodiffBackend = Autodiff<MyBackend>;

    create_artifact_dir(&args.artifact_dir, args.weights.is_none())?;

    let config = match &args.config {
        Some(path) => ClassifierTrainingConfig::load(path)
            .map_err(|err| anyhow!("reading {}: {err:?}", path.display()))?,
        None => ClassifierTrainingConfig::from_args(args),
    };
    config
        .save(args.artifact_dir.join("config.json"))
        .context("saving config.json")?;

    let device = WgpuDevice::default();
    MyAutodiffBackend::seed(config.seed);

    let preprocessing = config.model.preprocessing.clone();
    let batcher_train =
        ClassificationBatcher::<MyAutodiffBackend>::new(device.clone(), preprocessing.clone());
    let batcher_valid = ClassificationBatcher::<MyBackend>::new(device.clone(), preprocessing);

    let mut model: Classifier<MyAutodiffBackend> = config
        .model
        .init(&device)
        .context("building the classifier")?;
    if let Some(weights) = &args.weights {
        info!("Resuming from {}", weights.display());
        model = load_weights(model, &weights.to_string_lossy(), &device)?;
    }

    for (index, (phase, &epochs)) in ClassifierPhase::ALL
        .iter()
        .zip(&config.phase_epochs)
        .enumerate()
    {
        if epochs == 0 {
            info!("Skipping phase {phase:?}");
            continue;
        }
        info!("Phase {}: {phase:?} for {epochs} epochs", index + 1);
        model = model.into_phase(phase);

        let phase_dir = args.artifact_dir.join(format!("phase-{}", index + 1));
        create_artifact_dir(&phase_dir, false)?;

        let dataloader_train = train_loader(
            load_split(&args.train_data_dir, &config)?,
            batcher_train.clone(),
            phase,
            &config,
        );
        let dataloader_valid = DataLoaderBuilder::new(batcher_valid.clone())
            .batch_size(config.batch_size)
            .num_workers(config.num_workers)
            .build(load_split(&args.valid_data_dir, &config)?);

        let learner = LearnerBuilder::new(&phase_dir)
            .metric_train_numeric(LossMetric::new())
            .metric_valid_numeric(LossMetric::new())
            .metric_train_numeric(BinaryAccuracyMetric::new())
            .metric_valid_numeric(BinaryAccuracyMetric::new())
            .with_file_checkpointer(CompactRecorder::new())
            .devices(vec![device.clone()])
            .num_epochs(epochs)
            .summary()
            .build(model, config.optimizer.init(), config.learning_rate);

        model = learner.fit(dataloader_train, dataloader_valid);
    }

    let dataloader_eval = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .build(load_split(&args.valid_data_dir, &config)?);
    let report = evaluate_classifier(&model.valid(), dataloader_eval);

    let path = args
        .artifact_dir
        .join(format!("{:.4}acc_{}", report.score, timestamp()));
    model
        .save_file(&path, &CompactRecorder::new())
        .map_err(|err| anyhow!("saving {}: {err:?}", path.display()))?;

    info!("Classifier saved to {}", path.display());
    Ok(())
}
