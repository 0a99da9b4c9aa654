use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, ValueEnum};
use stroke_seg::dataset::{
    ClassificationRecordsConfig, Compression, SegmentationRecordsConfig,
    create_classification_records, create_segmentation_records,
};
use tracing::info;

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum RecordKind {
    Segmentation,
    Classification,
}

#[derive(Args)]
pub struct RecordsArgs {
    #[arg(long, value_enum, default_value_t = RecordKind::Segmentation)]
    pub kind: RecordKind,

    /// Segmentation: input images. Classification: images with a stroke.
    #[arg(short, long)]
    pub image_dir: PathBuf,

    /// Segmentation: label images. Classification: images without a stroke.
    #[arg(short, long)]
    pub label_dir: PathBuf,

    #[arg(short, long, default_value = "outdata/tfrecord")]
    pub output_dir: PathBuf,

    #[arg(short, long, default_value = "teknofest")]
    pub name: String,

    #[arg(long, default_value_t = 200)]
    pub max_files: usize,

    /// Label values mapped to mask channels.
    #[arg(long, value_delimiter = ',', default_value = "1,2")]
    pub class_values: Vec<u8>,

    #[arg(long, default_value = "png")]
    pub extension: String,

    #[arg(long, default_value = "none")]
    pub compression: Compression,

    #[arg(long)]
    pub seed: Option<u64>,
}

pub fn run(args: &RecordsArgs) -> Result<()> {
    if args.max_files == 0 {
        bail!("--max-files must be positive");
    }

    info!(
        "Creating {:?} records from {} and {}",
        args.kind,
        args.image_dir.display(),
        args.label_dir.display()
    );

    let summary = match args.kind {
        RecordKind::Segmentation => {
            let config = SegmentationRecordsConfig::new(
                args.image_dir.clone(),
                args.label_dir.clone(),
                args.output_dir.clone(),
            )
            .with_name(args.name.clone())
            .with_class_values(args.class_values.clone())
            .with_max_files(args.max_files)
            .with_extension(args.extension.clone())
            .with_compression(args.compression)
            .with_seed(args.seed);
            create_segmentation_records(&config)
        }
        RecordKind::Classification => {
            let config = ClassificationRecordsConfig::new(
                args.image_dir.clone(),
                args.label_dir.clone(),
                args.output_dir.clone(),
            )
            .with_name(args.name.clone())
            .with_max_files(args.max_files)
            .with_extension(args.extension.clone())
            .with_compression(args.compression)
            .with_seed(args.seed);
            create_classification_records(&config)
        }
    }
    .context("writing records")?;

    info!(
        "Wrote {} examples into {} shard(s) under {}",
        summary.examples,
        summary.shards.len(),
        args.output_dir.display()
    );
    Ok(())
}
