use std::path::{Path, PathBuf};

use burn::config::Config;
use image::GrayImage;
use prost::Message;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use tracing::{debug, info};

use super::{
    ClassificationItem, DatasetError, Example, RECORD_EXTENSION, SegmentationItem,
    raster::Raster,
    record::{Compression, RecordWriter},
};

#[derive(Config, Debug)]
pub struct SegmentationRecordsConfig {
    pub image_dir: PathBuf,
    /// Holds one label image per input image, under the same file name.
    pub label_dir: PathBuf,
    pub output_dir: PathBuf,
    #[config(default = "String::from(\"teknofest\")")]
    pub name: String,
    /// Label pixel values, one mask channel each.
    #[config(default = "vec![1, 2]")]
    pub class_values: Vec<u8>,
    #[config(default = 200)]
    pub max_files: usize,
    #[config(default = "String::from(\"png\")")]
    pub extension: String,
    #[config(default = "Compression::None")]
    pub compression: Compression,
    #[config(default = "None")]
    pub seed: Option<u64>,
}

#[derive(Config, Debug)]
pub struct ClassificationRecordsConfig {
    /// Images labelled `1.0`.
    pub positive_dir: PathBuf,
    /// Images labelled `0.0`.
    pub negative_dir: PathBuf,
    pub output_dir: PathBuf,
    #[config(default = "String::from(\"classification\")")]
    pub name: String,
    #[config(default = 200)]
    pub max_files: usize,
    #[config(default = "String::from(\"png\")")]
    pub extension: String,
    #[config(default = "Compression::None")]
    pub compression: Compression,
    #[config(default = "None")]
    pub seed: Option<u64>,
}

/// What a writing run produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordSummary {
    pub shards: Vec<PathBuf>,
    pub examples: usize,
}

/// Number of shards holding `count` examples, `max_files` per shard.
pub fn shard_count(count: usize, max_files: usize) -> usize {
    count / max_files + usize::from(count % max_files != 0)
}

/// `tfrecord_{index}in{total}_{name}.tfrecords`, with a one-based index.
pub fn shard_name(index: usize, total: usize, name: &str) -> String {
    format!("tfrecord_{}in{total}_{name}.{RECORD_EXTENSION}", index + 1)
}

/// Image files of `dir` with the given extension, sorted by name.
fn list_images(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, DatasetError> {
    let entries = std::fs::read_dir(dir).map_err(|err| DatasetError::io(dir, err))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|err| DatasetError::io(dir, err))?.path();
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension));
        if path.is_file() && matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn shuffle<T>(items: &mut [T], seed: Option<u64>) {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    items.shuffle(&mut rng);
}

fn open_image(path: &Path) -> Result<image::DynamicImage, DatasetError> {
    image::open(path).map_err(|source| DatasetError::Image {
        path: path.to_path_buf(),
        source,
    })
}

fn read_rgb(path: &Path) -> Result<Raster<u8>, DatasetError> {
    let image = open_image(path)?.to_rgb8();
    let (width, height) = image.dimensions();
    Ok(Raster {
        height: height as usize,
        width: width as usize,
        channels: 3,
        data: image.into_raw(),
    })
}

/// One channel per class value, plus a background channel
/// (`1 - sum of the others`) when there is more than one class.
pub fn one_hot_mask(label: &GrayImage, class_values: &[u8]) -> Raster<f32> {
    let (width, height) = label.dimensions();
    let classes = class_values.len();
    let channels = if classes > 1 { classes + 1 } else { classes };

    let mut data = Vec::with_capacity(label.as_raw().len() * channels);
    for &value in label.as_raw() {
        let mut foreground = 0.0;
        for &class_value in class_values {
            let hit = if value == class_value { 1.0 } else { 0.0 };
            foreground += hit;
            data.push(hit);
        }
        if classes > 1 {
            data.push(1.0 - foreground);
        }
    }

    Raster {
        height: height as usize,
        width: width as usize,
        channels,
        data,
    }
}

/// Suffix of shards still being written; `RecordSet::discover` ignores them.
const PARTIAL_EXTENSION: &str = "partial";

fn write_shard<I>(path: &Path, examples: I, compression: Compression) -> Result<usize, DatasetError>
where
    I: Iterator<Item = Result<Example, DatasetError>>,
{
    let mut writer = RecordWriter::create(path, compression)?;
    for example in examples {
        writer.write_record(&example?.encode_to_vec())?;
    }
    let written = writer.written();
    writer.finish()?;
    Ok(written)
}

/// Writes `examples` into shards of at most `max_files` records.
///
/// Shards are written under a `.partial` name and renamed once every shard
/// is complete; on failure the partial files are removed.
fn write_shards<I>(
    examples: I,
    count: usize,
    output_dir: &Path,
    name: &str,
    max_files: usize,
    compression: Compression,
) -> Result<RecordSummary, DatasetError>
where
    I: IntoIterator<Item = Result<Example, DatasetError>>,
{
    if max_files == 0 {
        return Err(DatasetError::InvalidConfig(
            "max_files must be positive".to_string(),
        ));
    }

    let total = shard_count(count, max_files);
    info!(
        "Using {total} shard(s) for {count} files, with up to {max_files} samples per shard"
    );
    std::fs::create_dir_all(output_dir).map_err(|err| DatasetError::io(output_dir, err))?;

    let mut examples = examples.into_iter();
    let mut partials = Vec::with_capacity(total);
    let mut written = 0;

    for index in 0..total {
        let file_name = shard_name(index, total, name);
        let partial = output_dir.join(format!("{file_name}.{PARTIAL_EXTENSION}"));
        partials.push((partial.clone(), output_dir.join(file_name)));

        match write_shard(&partial, examples.by_ref().take(max_files), compression) {
            Ok(count) => written += count,
            Err(err) => {
                for (partial, _) in &partials {
                    std::fs::remove_file(partial).ok();
                }
                return Err(err);
            }
        }
        debug!("Wrote shard {}", partial.display());
    }

    let mut shards = Vec::with_capacity(total);
    for (partial, path) in partials {
        std::fs::rename(&partial, &path).map_err(|err| DatasetError::io(&path, err))?;
        shards.push(path);
    }

    info!("Wrote {written} elements to TFRecord");
    Ok(RecordSummary {
        shards,
        examples: written,
    })
}

/// Converts an image folder and its label folder into sharded segmentation
/// records. Images are shuffled before sharding.
pub fn create_segmentation_records(
    config: &SegmentationRecordsConfig,
) -> Result<RecordSummary, DatasetError> {
    let mut pairs = Vec::new();
    for image in list_images(&config.image_dir, &config.extension)? {
        let label = image
            .file_name()
            .map(|file_name| config.label_dir.join(file_name))
            .filter(|label| label.is_file())
            .ok_or_else(|| DatasetError::MissingLabel(image.clone()))?;
        pairs.push((image, label));
    }
    shuffle(&mut pairs, config.seed);

    let examples = pairs.iter().map(|(image_path, label_path)| {
        let image = read_rgb(image_path)?;
        let label = open_image(label_path)?.to_luma8();
        let mask = one_hot_mask(&label, &config.class_values);

        if (mask.height, mask.width) != (image.height, image.width) {
            return Err(DatasetError::InvalidConfig(format!(
                "label {} does not match the size of its image",
                label_path.display()
            )));
        }
        Ok(SegmentationItem { image, mask }.to_example())
    });

    write_shards(
        examples,
        pairs.len(),
        &config.output_dir,
        &config.name,
        config.max_files,
        config.compression,
    )
}

/// Converts two image folders (stroke / no stroke) into sharded
/// classification records.
pub fn create_classification_records(
    config: &ClassificationRecordsConfig,
) -> Result<RecordSummary, DatasetError> {
    let mut items: Vec<(PathBuf, f32)> = list_images(&config.positive_dir, &config.extension)?
        .into_iter()
        .map(|path| (path, 1.0))
        .chain(
            list_images(&config.negative_dir, &config.extension)?
                .into_iter()
                .map(|path| (path, 0.0)),
        )
        .collect();
    shuffle(&mut items, config.seed);

    let examples = items.iter().map(|(path, label)| {
        Ok(ClassificationItem {
            image: read_rgb(path)?,
            label: *label,
        }
        .to_example())
    });

    write_shards(
        examples,
        items.len(),
        &config.output_dir,
        &config.name,
        config.max_files,
        config.compression,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{RecordSet, SegmentationRecordDataset};
    use burn::data::dataset::Dataset;
    use image::{Luma, Rgb, RgbImage};

    #[test]
    fn shard_arithmetic() {
        assert_eq!(shard_count(400, 200), 2);
        assert_eq!(shard_count(401, 200), 3);
        assert_eq!(shard_count(5, 200), 1);
        assert_eq!(shard_count(0, 200), 0);
        assert_eq!(shard_name(0, 3, "train"), "tfrecord_1in3_train.tfrecords");
    }

    #[test]
    fn one_hot_adds_background_for_multiclass() {
        let label = GrayImage::from_raw(3, 1, vec![0, 1, 2]).unwrap();
        let mask = one_hot_mask(&label, &[1, 2]);

        assert_eq!(mask.channels, 3);
        assert_eq!(
            mask.data,
            vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0]
        );
    }

    #[test]
    fn binary_labels_have_no_background() {
        let label = GrayImage::from_raw(2, 1, vec![0, 255]).unwrap();
        let mask = one_hot_mask(&label, &[255]);

        assert_eq!(mask.channels, 1);
        assert_eq!(mask.data, vec![0.0, 1.0]);
    }

    #[test]
    fn writes_readable_shards() {
        let root = tempfile::tempdir().unwrap();
        let (images, labels, out) = (
            root.path().join("data"),
            root.path().join("label"),
            root.path().join("records"),
        );
        std::fs::create_dir_all(&images).unwrap();
        std::fs::create_dir_all(&labels).unwrap();

        for i in 0..5u8 {
            let file = format!("{i}.png");
            RgbImage::from_pixel(4, 3, Rgb([i, i, i]))
                .save(images.join(&file))
                .unwrap();
            GrayImage::from_pixel(4, 3, Luma([i % 3]))
                .save(labels.join(&file))
                .unwrap();
        }

        let config = SegmentationRecordsConfig::new(images, labels, out.clone())
            .with_name("train".to_string())
            .with_max_files(2)
            .with_seed(Some(1));
        let summary = create_segmentation_records(&config).unwrap();

        assert_eq!(summary.examples, 5);
        assert_eq!(summary.shards.len(), 3);
        assert!(out.join("tfrecord_3in3_train.tfrecords").is_file());

        let dataset: SegmentationRecordDataset =
            RecordSet::discover(&out, Some(0)).unwrap().open().unwrap();
        assert_eq!(dataset.len(), 5);

        let item = dataset.get(0).unwrap();
        assert_eq!((item.image.height, item.image.width), (3, 4));
        assert_eq!(item.mask.channels, 3);
        assert!(
            item.mask
                .data
                .chunks(3)
                .all(|pixel| (pixel.iter().sum::<f32>() - 1.0).abs() < 1e-6)
        );
    }

    #[test]
    fn failed_run_leaves_no_shards() {
        let root = tempfile::tempdir().unwrap();
        let (images, labels, out) = (
            root.path().join("data"),
            root.path().join("label"),
            root.path().join("records"),
        );
        std::fs::create_dir_all(&images).unwrap();
        std::fs::create_dir_all(&labels).unwrap();

        for i in 0..4u8 {
            let file = format!("{i}.png");
            RgbImage::from_pixel(4, 3, Rgb([i, i, i]))
                .save(images.join(&file))
                .unwrap();
            // One label does not match its image.
            let (width, height) = if i == 2 { (2, 2) } else { (4, 3) };
            GrayImage::from_pixel(width, height, Luma([1]))
                .save(labels.join(&file))
                .unwrap();
        }

        let config = SegmentationRecordsConfig::new(images, labels, out.clone())
            .with_max_files(1)
            .with_seed(Some(3));
        assert!(matches!(
            create_segmentation_records(&config),
            Err(DatasetError::InvalidConfig(_))
        ));

        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);
        assert!(matches!(
            RecordSet::discover(&out, None),
            Err(DatasetError::NoRecords(_))
        ));
    }

    #[test]
    fn missing_label_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let images = root.path().join("data");
        std::fs::create_dir_all(&images).unwrap();
        RgbImage::new(2, 2).save(images.join("a.png")).unwrap();

        let config = SegmentationRecordsConfig::new(
            images,
            root.path().join("label"),
            root.path().join("out"),
        );
        assert!(matches!(
            create_segmentation_records(&config),
            Err(DatasetError::MissingLabel(_))
        ));
    }
}
