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
    train::{
        LearnerBuilder,
        checkpoint::{
            ComposedCheckpointingStrategy, KeepLastNCheckpoints, MetricCheckpointingStrategy,
        },
        metric::{
            LossMetric,
            store::{Aggregate, Direction, Split},
        },
    },
};
use clap::{Args, ValueEnum};
use stroke_seg::{
    BackboneKind, DoubleUNetConfig, SegmentationModel, SegmentationModelConfig,
    SegmentationNetConfig, UNetConfig, XNetConfig,
    dataset::{
        AugmentationConfig, Compression, RecordSet, SegmentationBatch, SegmentationBatcher,
        SegmentationRecordDataset,
    },
    model::{OutputActivation, load_weights},
    training::{
        DiceLossConfig, FScoreMetric, IoUScoreMetric, STROKE_CLASS_WEIGHTS, SegmentationLossConfig,
        SegmentationLossKind, evaluate,
    },
};
use tracing::info;

use super::{create_artifact_dir, timestamp};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Architecture {
    Unet,
    DoubleUnet,
    Xnet,
}

#[derive(Args)]
pub struct TrainArgs {
    /// Directory with the training `.tfrecords` shards.
    #[arg(short, long)]
    pub train_data_dir: PathBuf,

    #[arg(short, long)]
    pub valid_data_dir: PathBuf,

    #[arg(short, long, value_enum, default_value_t = Architecture::Unet)]
    pub model: Architecture,

    #[arg(long, default_value = "efficientnetb3")]
    pub backbone: BackboneKind,

    /// Foreground classes; a background channel is added when more than one.
    #[arg(long, default_value_t = 2)]
    pub classes: usize,

    /// JSON training configuration; overrides the model flags.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(short, long, default_value_t = 100)]
    pub epochs: usize,

    #[arg(short, long, default_value_t = 2)]
    pub batch_size: usize,

    #[arg(short, long, default_value_t = 0.0001)]
    pub lr: f64,

    #[arg(long, default_value_t = 4)]
    pub num_workers: usize,

    #[arg(long, default_value = "zlib")]
    pub compression: Compression,

    /// Resume from weights saved by a previous run.
    #[arg(long)]
    pub weights: Option<PathBuf>,

    #[arg(short, long, default_value = "artifacts")]
    pub artifact_dir: PathBuf,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

#[derive(Config)]
pub struct SegmentationTrainingConfig {
    pub model: SegmentationModelConfig,
    #[config(default = "AdamConfig::new()")]
    pub optimizer: AdamConfig,
    #[config(default = 100)]
    pub num_epochs: usize,
    #[config(default = 2)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 1.0e-4)]
    pub learning_rate: f64,
    #[config(default = true)]
    pub augment: bool,
    #[config(default = "Compression::Zlib")]
    pub compression: Compression,
    #[config(default = 42)]
    pub seed: u64,
}

impl SegmentationTrainingConfig {
    fn from_args(args: &TrainArgs) -> Self {
        let num_classes = if args.classes == 1 { 1 } else { args.classes + 1 };
        let activation = if num_classes == 1 {
            OutputActivation::Sigmoid
        } else {
            OutputActivation::Softmax
        };
        let backbone = args.backbone.clone();

        let net = match args.model {
            Architecture::Unet => SegmentationNetConfig::UNet(
                UNetConfig::new()
                    .with_backbone(backbone)
                    .with_num_classes(num_classes)
                    .with_activation(activation),
            ),
            Architecture::DoubleUnet => SegmentationNetConfig::DoubleUNet(
                DoubleUNetConfig::new()
                    .with_backbone(backbone)
                    .with_num_classes(num_classes)
                    .with_activation(activation),
            ),
            Architecture::Xnet => SegmentationNetConfig::XNet(
                XNetConfig::new()
                    .with_backbone(backbone)
                    .with_num_classes(num_classes)
                    .with_activation(activation),
            ),
        };

        let mut dice = DiceLossConfig::new();
        if num_classes == STROKE_CLASS_WEIGHTS.len() {
            dice = dice.with_class_weights(STROKE_CLASS_WEIGHTS.to_vec());
        }
        let loss = SegmentationLossConfig::new()
            .with_kind(SegmentationLossKind::DiceFocal)
            .with_dice(dice);

        SegmentationTrainingConfig::new(SegmentationModelConfig::new(net).with_loss(loss))
            .with_num_epochs(args.epochs)
            .with_batch_size(args.batch_size)
            .with_num_workers(args.num_workers)
            .with_learning_rate(args.lr)
            .with_compression(args.compression)
            .with_seed(args.seed)
    }
}

fn load_split(dir: &Path, config: &SegmentationTrainingConfig) -> Result<SegmentationRecordDataset> {
    let dataset = RecordSet::discover(dir, Some(config.seed))
        .and_then(|records| records.with_compression(config.compression).open())
        .with_context(|| format!("loading records from {}", dir.display()))?;
    info!("Loaded {} samples from {}", dataset.len(), dir.display());
    Ok(dataset)
}

fn train_loader<B: AutodiffBackend>(
    dataset: SegmentationRecordDataset,
    batcher: SegmentationBatcher<B>,
    config: &SegmentationTrainingConfig,
) -> Arc<dyn DataLoader<SegmentationBatch<B>>> {
    let builder = DataLoaderBuilder::new(batcher)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .shuffle(config.seed);

    if config.augment {
        let augmentation = AugmentationConfig::segmentation()
            .with_seed(Some(config.seed))
            .init();
        builder.build(MapperDataset::new(dataset, augmentation))
    } else {
        builder.build(dataset)
    }
}

pub fn run(args: &TrainArgs) -> Result<()> {
    type MyBackend = Wgpu<f32, i32>;
    type MyAutodiffBackend = Autodiff<MyBackend>;

    create_artifact_dir(&args.artifact_dir, args.weights.is_none())?;

    let config = match &args.config {
        Some(path) => SegmentationTrainingConfig::load(path)
            .map_err(|err| anyhow!("reading {}: {err:?}", path.display()))?,
        None => SegmentationTrainingConfig::from_args(args),
    };
    config
        .save(args.artifact_dir.join("config.json"))
        .context("saving config.json")?;

    info!("Initializing device...");
    let device = WgpuDevice::default();
    MyAutodiffBackend::seed(config.seed);

    let train_dataset = load_split(&args.train_data_dir, &config)?;
    let valid_dataset = load_split(&args.valid_data_dir, &config)?;

    let preprocessing = config.model.net.backbone().preprocessing();
    let batcher_train =
        SegmentationBatcher::<MyAutodiffBackend>::new(device.clone(), preprocessing.clone());
    let batcher_valid = SegmentationBatcher::<MyBackend>::new(device.clone(), preprocessing);

    info!("Building dataloaders with batch size {}...", config.batch_size);
    let dataloader_train = train_loader(train_dataset, batcher_train, &config);
    let dataloader_valid = DataLoaderBuilder::new(batcher_valid.clone())
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(valid_dataset);

    let mut model: SegmentationModel<MyAutodiffBackend> = config
        .model
        .init(&device)
        .context("building the segmentation model")?;
    if let Some(weights) = &args.weights {
        info!("Resuming from {}", weights.display());
        model = load_weights(model, &weights.to_string_lossy(), &device)?;
    }

    let checkpointing = ComposedCheckpointingStrategy::builder()
        .add(KeepLastNCheckpoints::new(2))
        .add(MetricCheckpointingStrategy::new(
            &LossMetric::<MyBackend>::new(),
            Aggregate::Mean,
            Direction::Lowest,
            Split::Valid,
        ))
        .build();

    info!("Building learner...");
    let learner = LearnerBuilder::new(&args.artifact_dir)
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .metric_train_numeric(IoUScoreMetric::new())
        .metric_valid_numeric(IoUScoreMetric::new())
        .metric_valid_numeric(FScoreMetric::new())
        .with_file_checkpointer(CompactRecorder::new())
        .with_checkpointing_strategy(checkpointing)
        .devices(vec![device.clone()])
        .num_epochs(config.num_epochs)
        .summary()
        .build(model, config.optimizer.init(), config.learning_rate);

    let model_trained = learner.fit(dataloader_train, dataloader_valid);

    let valid_dataset = load_split(&args.valid_data_dir, &config)?;
    let dataloader_eval = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .build(valid_dataset);
    let report = evaluate(&model_trained.valid(), dataloader_eval);

    let models_dir = args.artifact_dir.join("models");
    create_artifact_dir(&models_dir, false)?;
    let path = models_dir.join(format!("{:.4}iou_{}", report.score, timestamp()));
    model_trained
        .save_file(&path, &CompactRecorder::new())
        .map_err(|err| anyhow!("saving {}: {err:?}", path.display()))?;

    info!("Training completed, model saved to {}", path.display());
    Ok(())
}
