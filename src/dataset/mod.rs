pub mod augment;
pub mod classification;
pub mod example;
pub mod raster;
pub mod record;
pub mod segmentation;
pub mod writer;

use std::{
    io,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use burn::data::dataset::Dataset;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use augment::{AugmentationConfig, AugmentationPipeline, Transform};
pub use classification::{ClassificationBatch, ClassificationBatcher, ClassificationItem};
pub use example::{Example, RawTensor, TensorValues, parse_tensor, serialize_tensor};
pub use raster::{BorderMode, Raster};
pub use record::{Compression, RecordError, RecordReader, RecordSource, RecordWriter};
pub use segmentation::{SegmentationBatch, SegmentationBatcher, SegmentationItem};
pub use writer::{
    ClassificationRecordsConfig, RecordSummary, SegmentationRecordsConfig,
    create_classification_records, create_segmentation_records,
};

pub const RECORD_EXTENSION: &str = "tfrecords";

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("cannot decode image {}: {source}", .path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("no label found for {}", .0.display())]
    MissingLabel(PathBuf),
    #[error("no .tfrecords files in {}", .0.display())]
    NoRecords(PathBuf),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DatasetError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        DatasetError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Items that can be decoded from a `tf.train.Example`.
pub trait RecordItem: Sized {
    fn from_example(example: &Example) -> Result<Self, RecordError>;
}

/// The shards of one split, in shuffled order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordSet {
    pub files: Vec<PathBuf>,
    pub compression: Compression,
}

impl RecordSet {
    /// Lists the record files of `dir` and shuffles them; with a seed the
    /// order is reproducible.
    pub fn discover(dir: &Path, seed: Option<u64>) -> Result<Self, DatasetError> {
        let entries = std::fs::read_dir(dir).map_err(|err| DatasetError::io(dir, err))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| DatasetError::io(dir, err))?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == RECORD_EXTENSION) {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(DatasetError::NoRecords(dir.to_path_buf()));
        }

        files.sort();
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        files.shuffle(&mut rng);
        debug!("Found {} record files in {}", files.len(), dir.display());

        Ok(Self {
            files,
            compression: Compression::None,
        })
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Opens every shard and decodes each record once; records that do not
    /// decode are logged and left out of the dataset.
    pub fn open<T: RecordItem>(&self) -> Result<RecordDataset<T>, DatasetError> {
        let source = RecordSource::open(&self.files, self.compression)?;

        let mut indices = Vec::with_capacity(source.len());
        for index in 0..source.len() {
            match decode::<T>(&source, index) {
                Some(Ok(_)) => indices.push(index),
                Some(Err(err)) => warn!("Dropping record {index}: {err}"),
                None => {}
            }
        }
        let dropped = source.len() - indices.len();
        if dropped > 0 {
            info!("Dropped {dropped} of {} records", source.len());
        }

        Ok(RecordDataset {
            source,
            indices,
            _item: PhantomData,
        })
    }
}

fn decode<T: RecordItem>(source: &RecordSource, index: usize) -> Option<Result<T, RecordError>> {
    let payload = source.payload(index)?;
    Some(payload.and_then(|payload| T::from_example(&Example::decode_from(&payload)?)))
}

/// A burn [`Dataset`] decoding one record per item.
pub struct RecordDataset<T> {
    source: RecordSource,
    /// Records that decoded when the set was opened.
    indices: Vec<usize>,
    _item: PhantomData<fn() -> T>,
}

pub type SegmentationRecordDataset = RecordDataset<SegmentationItem>;
pub type ClassificationRecordDataset = RecordDataset<ClassificationItem>;

impl<T: RecordItem> Dataset<T> for RecordDataset<T> {
    fn get(&self, index: usize) -> Option<T> {
        let record = *self.indices.get(index)?;
        match decode(&self.source, record)? {
            Ok(item) => Some(item),
            Err(err) => {
                warn!("Record {record} no longer decodes: {err}");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.indices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_shard(path: &Path, items: &[ClassificationItem], compression: Compression) {
        use prost::Message;

        let mut writer = RecordWriter::create(path, compression).unwrap();
        for item in items {
            writer.write_record(&item.to_example().encode_to_vec()).unwrap();
        }
        writer.finish().unwrap();
    }

    fn items() -> Vec<ClassificationItem> {
        (0..3)
            .map(|i| ClassificationItem {
                image: Raster::filled(2, 2, 3, i as u8),
                label: (i % 2) as f32,
            })
            .collect()
    }

    #[test]
    fn discover_filters_and_seeds() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.tfrecords", "b.tfrecords", "c.tfrecords", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let first = RecordSet::discover(dir.path(), Some(5)).unwrap();
        let second = RecordSet::discover(dir.path(), Some(5)).unwrap();
        assert_eq!(first.files.len(), 3);
        assert_eq!(first, second);
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            RecordSet::discover(dir.path(), None),
            Err(DatasetError::NoRecords(_))
        ));
    }

    #[test]
    fn undecodable_records_are_dropped_when_opening() {
        use prost::Message;

        for compression in [Compression::None, Compression::Zlib] {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("mixed.tfrecords");
            let items = items();

            let mut writer = RecordWriter::create(&path, compression).unwrap();
            writer.write_record(&items[0].to_example().encode_to_vec()).unwrap();
            writer.write_record(&Example::default().encode_to_vec()).unwrap();
            writer.write_record(b"\xff\xff\xff").unwrap();
            writer.write_record(&items[1].to_example().encode_to_vec()).unwrap();
            writer.write_record(&items[2].to_example().encode_to_vec()).unwrap();
            writer.finish().unwrap();

            let dataset: ClassificationRecordDataset = RecordSet::discover(dir.path(), None)
                .unwrap()
                .with_compression(compression)
                .open()
                .unwrap();

            assert_eq!(dataset.len(), 3);
            let images: Vec<u8> = dataset.iter().map(|item| item.image.data[0]).collect();
            assert_eq!(images, vec![0, 1, 2]);
        }
    }

    #[test]
    fn datasets_read_plain_and_zlib_shards() {
        for compression in [Compression::None, Compression::Zlib] {
            let dir = tempfile::tempdir().unwrap();
            write_shard(&dir.path().join("1.tfrecords"), &items()[..2], compression);
            write_shard(&dir.path().join("2.tfrecords"), &items()[2..], compression);

            let dataset: ClassificationRecordDataset = RecordSet::discover(dir.path(), Some(0))
                .unwrap()
                .with_compression(compression)
                .open()
                .unwrap();

            assert_eq!(dataset.len(), 3);
            let mut labels: Vec<f32> = dataset.iter().map(|item| item.label).collect();
            labels.sort_by(f32::total_cmp);
            assert_eq!(labels, vec![0.0, 0.0, 1.0]);
        }
    }
}
